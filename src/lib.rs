//! Bank statement reconciliation engine: CSV statement parsing for
//! Macedonian banks, duplicate-safe ingestion, rule evaluation, payment
//! posting with idempotency, and reconciliation KPIs over SQLite.

pub mod analytics;
pub mod bank_csv;
pub mod bank_parsers;
pub mod config;
pub mod db;
pub mod domain;
pub mod error;
pub mod events;
pub mod ingest;
pub mod parser_registry;
pub mod posting;
pub mod rules;

pub use analytics::{reconciliation_analytics, AnalyticsReport};
pub use bank_parsers::{BankParser, ParsedStatement};
pub use config::ReconConfig;
pub use db::{apply_embedded_migrations, open, MigrateResult};
pub use domain::{CanonicalTransaction, ProcessingStatus, TransactionDirection, TransactionSource};
pub use error::{ReconError, ReconResult};
pub use events::{EventSink, LoggingEventSink, ReconciliationEvent};
pub use ingest::{import_statement, ImportContext, ImportSummary};
pub use parser_registry::ParserRegistry;
pub use posting::{post_reconciliation, PostingResult};
pub use rules::{apply_rules, MatchingRule, RuleMatch, TransactionFacts};
