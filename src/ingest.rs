use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;
use sha1::{Digest, Sha1};
use tracing::{info, warn};
use uuid::Uuid;

use crate::bank_parsers::BankParser;
use crate::domain::{CanonicalTransaction, TransactionDirection, TransactionSource};
use crate::error::ReconResult;

/// Explicit per-run context threaded through the import, replacing any
/// notion of an ambient batch id.
#[derive(Debug, Clone)]
pub struct ImportContext {
    pub company_id: String,
    pub bank_code: String,
    pub source: TransactionSource,
    pub source_file: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ImportSummary {
    pub job_id: String,
    pub total: usize,
    pub imported: usize,
    pub duplicates: usize,
    pub failed: usize,
    /// Duplicate hits on a generated reference whose row content differs.
    pub collisions: usize,
    pub transaction_ids: Vec<String>,
    pub errors: Vec<String>,
}

struct ExistingRow {
    transaction_date: String,
    amount_cents: i64,
    description: String,
}

/// Parses the statement and persists every valid, non-duplicate row.
///
/// Duplicate suppression is per account: same reference (transaction or
/// external), or same (date, |amount|, description) triple. Transactions
/// are never deleted or updated here, only inserted.
pub fn import_statement(
    conn: &Connection,
    parser: &dyn BankParser,
    content: &[u8],
    bank_account_id: &str,
    ctx: &ImportContext,
) -> ReconResult<ImportSummary> {
    let parsed = parser.parse(content);

    let job_id = Uuid::new_v4().to_string();
    let started_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    let metadata_json = serde_json::to_string(&json!({
        "bank_code": ctx.bank_code,
        "parser": parser.bank_code(),
        "source_file": ctx.source_file,
    }))?;
    conn.execute(
        r#"
        INSERT INTO import_jobs(id, company_id, bank_code, source_type, source_file,
                                status, started_at, metadata_json)
        VALUES (?1, ?2, ?3, ?4, ?5, 'running', ?6, ?7)
        "#,
        params![
            job_id,
            ctx.company_id,
            ctx.bank_code,
            ctx.source.as_str(),
            ctx.source_file,
            started_at,
            metadata_json
        ],
    )?;

    let total = parsed.transactions.len() + parsed.errors.len();
    let mut summary = ImportSummary {
        job_id: job_id.clone(),
        total,
        imported: 0,
        duplicates: 0,
        failed: parsed.errors.len(),
        collisions: 0,
        transaction_ids: Vec::new(),
        errors: parsed.errors,
    };

    for tx in &parsed.transactions {
        let (reference, generated) = match &tx.reference {
            Some(r) => (r.clone(), false),
            None => (generate_reference(tx, &ctx.bank_code), true),
        };

        let existing: Option<ExistingRow> = conn
            .query_row(
                r#"
                SELECT transaction_date, amount_cents, description
                FROM bank_transactions
                WHERE bank_account_id = ?1
                  AND (transaction_reference = ?2 OR external_reference = ?2
                       OR (transaction_date = ?3 AND amount_cents = ?4 AND description = ?5))
                LIMIT 1
                "#,
                params![
                    bank_account_id,
                    reference,
                    tx.transaction_date.format("%Y-%m-%d").to_string(),
                    tx.magnitude_cents(),
                    tx.description,
                ],
                |row| {
                    Ok(ExistingRow {
                        transaction_date: row.get(0)?,
                        amount_cents: row.get(1)?,
                        description: row.get(2)?,
                    })
                },
            )
            .optional()?;

        if let Some(existing) = existing {
            let same_content = existing.transaction_date
                == tx.transaction_date.format("%Y-%m-%d").to_string()
                && existing.amount_cents == tx.magnitude_cents()
                && existing.description == tx.description;
            if generated && !same_content {
                summary.collisions += 1;
                warn!(
                    reference,
                    bank_account_id,
                    "generated reference collides with a different transaction"
                );
            } else {
                summary.duplicates += 1;
            }
            continue;
        }

        match insert_transaction(conn, tx, &reference, bank_account_id, ctx, &job_id) {
            Ok(id) => {
                summary.imported += 1;
                summary.transaction_ids.push(id);
            }
            Err(err) => {
                summary.failed += 1;
                if summary.errors.len() < 20 {
                    summary.errors.push(format!("persist failed: {err}"));
                }
            }
        }
    }

    let finished_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    let error_message = if summary.errors.is_empty() {
        None
    } else {
        Some(summary.errors.join("\n"))
    };
    conn.execute(
        r#"
        UPDATE import_jobs
        SET status = 'success', finished_at = ?1, total_count = ?2, imported_count = ?3,
            duplicate_count = ?4, failed_count = ?5, collision_count = ?6, error_message = ?7
        WHERE id = ?8
        "#,
        params![
            finished_at,
            summary.total as i64,
            summary.imported as i64,
            summary.duplicates as i64,
            summary.failed as i64,
            summary.collisions as i64,
            error_message,
            job_id
        ],
    )?;

    info!(
        job_id,
        bank = ctx.bank_code,
        imported = summary.imported,
        duplicates = summary.duplicates,
        failed = summary.failed,
        collisions = summary.collisions,
        "statement import finished"
    );
    Ok(summary)
}

/// Fallback identity for rows without a bank reference:
/// BANKCODE-date-cents-sha1(raw)[..8].
pub(crate) fn generate_reference(tx: &CanonicalTransaction, bank_code: &str) -> String {
    let raw = serde_json::to_string(&tx.raw_record).unwrap_or_default();
    let digest = Sha1::digest(raw.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!(
        "{}-{}-{}-{}",
        bank_code.to_uppercase(),
        tx.transaction_date.format("%Y%m%d"),
        tx.magnitude_cents(),
        &hex[..8]
    )
}

fn insert_transaction(
    conn: &Connection,
    tx: &CanonicalTransaction,
    reference: &str,
    bank_account_id: &str,
    ctx: &ImportContext,
    job_id: &str,
) -> ReconResult<String> {
    let id = Uuid::new_v4().to_string();
    let direction = tx.direction();
    // Incoming money names the payer (debtor); outgoing names the payee.
    let (debtor_name, creditor_name) = match direction {
        TransactionDirection::Credit => (tx.counterparty_name.clone(), None),
        TransactionDirection::Debit => (None, tx.counterparty_name.clone()),
    };
    let (debtor_account, creditor_account) = match direction {
        TransactionDirection::Credit => (tx.counterparty_account.clone(), None),
        TransactionDirection::Debit => (None, tx.counterparty_account.clone()),
    };
    let raw_record = serde_json::to_string(&tx.raw_record)?;

    conn.execute(
        r#"
        INSERT INTO bank_transactions(
            id, company_id, bank_account_id, transaction_reference, external_reference,
            amount_cents, direction, currency, transaction_date, booking_date, value_date,
            description, remittance_info, debtor_name, debtor_account, creditor_name,
            creditor_account, source, raw_record, import_job_id
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
        "#,
        params![
            id,
            ctx.company_id,
            bank_account_id,
            reference,
            tx.external_reference,
            tx.magnitude_cents(),
            direction.as_str(),
            tx.currency,
            tx.transaction_date.format("%Y-%m-%d").to_string(),
            tx.booking_date.map(|d| d.format("%Y-%m-%d").to_string()),
            tx.value_date.map(|d| d.format("%Y-%m-%d").to_string()),
            tx.description,
            tx.remittance_info,
            debtor_name,
            debtor_account,
            creditor_name,
            creditor_account,
            ctx.source.as_str(),
            raw_record,
            job_id,
        ],
    )?;
    Ok(id)
}
