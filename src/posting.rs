use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info};
use uuid::Uuid;

use crate::domain::TransactionDirection;
use crate::error::ReconResult;
use crate::events::{EventSink, ReconciliationEvent};

/// Payment source type for reconciliation-created payments; together with
/// the company and transaction ids it forms the idempotency key.
const SOURCE_TYPE_BANK_TRANSACTION: &str = "bank_transaction";

const IDEMPOTENCY_INDEX_NAME: &str = "payments_idempotency_unique";

#[derive(Debug, Clone, Serialize)]
pub struct PaymentRef {
    pub payment_id: String,
    pub payment_number: String,
    pub amount_cents: i64,
    pub base_amount_cents: i64,
}

/// Outcome of a posting attempt. Validation failures and storage errors are
/// data, not `Err`; the caller decides what to do with them.
#[derive(Debug)]
pub enum PostingResult {
    Success(PaymentRef),
    AlreadyPosted(PaymentRef),
    Error(String),
}

impl PostingResult {
    pub fn to_response(&self) -> Value {
        match self {
            Self::Success(payment) => json!({
                "ok": true,
                "status": "success",
                "payment": payment,
            }),
            Self::AlreadyPosted(payment) => json!({
                "ok": true,
                "status": "already_posted",
                "payment": payment,
            }),
            Self::Error(message) => json!({
                "ok": false,
                "status": "error",
                "message": message,
            }),
        }
    }
}

struct ReconRow {
    company_id: String,
    bank_transaction_id: String,
    invoice_id: Option<String>,
    confidence: Option<f64>,
}

struct TxRow {
    amount_cents: i64,
    direction: TransactionDirection,
    currency: String,
    transaction_date: String,
}

struct InvoiceRow {
    customer_id: Option<String>,
    currency: String,
    exchange_rate: f64,
    total_cents: i64,
    due_cents: i64,
    paid_status: String,
}

/// Posts a matched reconciliation as a payment. Idempotent: the unique
/// index on (company_id, source_type, source_id) is the source of truth,
/// and a replay returns `AlreadyPosted` with the existing payment.
///
/// State machine: pending -> matched, terminal. Validation failures leave
/// no side effects; a mid-flight storage failure rolls everything back.
pub fn post_reconciliation(
    conn: &mut Connection,
    reconciliation_id: &str,
    sink: &dyn EventSink,
) -> ReconResult<PostingResult> {
    let Some(recon) = load_reconciliation(conn, reconciliation_id)? else {
        return Ok(PostingResult::Error(format!(
            "Reconciliation {reconciliation_id} not found"
        )));
    };

    let Some(tx) = load_transaction(conn, &recon.bank_transaction_id)? else {
        return Ok(PostingResult::Error(
            "Reconciliation has no associated bank transaction".to_string(),
        ));
    };
    if tx.direction != TransactionDirection::Credit {
        return Ok(PostingResult::Error(
            "Cannot create payment from debit transaction".to_string(),
        ));
    }

    let Some(invoice_id) = recon.invoice_id.clone() else {
        return Ok(PostingResult::Error(
            "Reconciliation has no matched invoice".to_string(),
        ));
    };
    let Some(invoice) = load_invoice(conn, &invoice_id)? else {
        return Ok(PostingResult::Error("Matched invoice not found".to_string()));
    };

    if !tx.currency.is_empty()
        && !invoice.currency.is_empty()
        && tx.currency != invoice.currency
    {
        return Ok(PostingResult::Error(format!(
            "Currency mismatch: transaction {} vs invoice {}",
            tx.currency, invoice.currency
        )));
    }

    // Replays resolve before the fully-paid check: once posted, the answer
    // stays AlreadyPosted even though the posting settled the invoice.
    if let Some(existing) =
        find_existing_payment(conn, &recon.company_id, &recon.bank_transaction_id)?
    {
        return Ok(PostingResult::AlreadyPosted(existing));
    }

    if invoice.paid_status == "paid" {
        return Ok(PostingResult::Error(
            "Invoice is already fully paid".to_string(),
        ));
    }

    sink.emit(&ReconciliationEvent::Matched {
        reconciliation_id: reconciliation_id.to_string(),
        bank_transaction_id: recon.bank_transaction_id.clone(),
        invoice_id: invoice_id.clone(),
    });

    match post_in_transaction(conn, reconciliation_id, &recon, &tx, &invoice_id, &invoice) {
        Ok(outcome) => {
            if let PostingResult::Success(payment) = &outcome {
                sink.emit(&ReconciliationEvent::Posted {
                    reconciliation_id: reconciliation_id.to_string(),
                    payment_id: payment.payment_id.clone(),
                    payment_number: payment.payment_number.clone(),
                    amount_cents: payment.amount_cents,
                });
                info!(
                    reconciliation_id,
                    payment_id = payment.payment_id,
                    payment_number = payment.payment_number,
                    amount_cents = payment.amount_cents,
                    "payment posted"
                );
            }
            Ok(outcome)
        }
        Err(err) => {
            // A concurrent post may have slipped in between our check and
            // the insert; the unique index catches it.
            if is_unique_violation(&err) {
                if let Some(existing) =
                    find_existing_payment(conn, &recon.company_id, &recon.bank_transaction_id)?
                {
                    info!(
                        reconciliation_id,
                        payment_id = existing.payment_id,
                        "concurrent duplicate caught by idempotency constraint"
                    );
                    return Ok(PostingResult::AlreadyPosted(existing));
                }
            }
            error!(reconciliation_id, error = %err, "posting failed, rolled back");
            Ok(PostingResult::Error(format!("Database error: {err}")))
        }
    }
}

fn post_in_transaction(
    conn: &mut Connection,
    reconciliation_id: &str,
    recon: &ReconRow,
    tx: &TxRow,
    invoice_id: &str,
    invoice: &InvoiceRow,
) -> Result<PostingResult, rusqlite::Error> {
    let dbtx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);

    // Re-check under the write lock; another connection may have posted
    // while we were validating.
    let existing: Option<PaymentRef> = dbtx
        .query_row(
            "SELECT id, payment_number, amount_cents, base_amount_cents FROM payments
             WHERE company_id = ?1 AND source_type = ?2 AND source_id = ?3",
            params![
                recon.company_id,
                SOURCE_TYPE_BANK_TRANSACTION,
                recon.bank_transaction_id
            ],
            payment_ref_from_row,
        )
        .optional()?;
    if let Some(existing) = existing {
        return Ok(PostingResult::AlreadyPosted(existing));
    }

    let sequence_number: i64 = dbtx.query_row(
        "SELECT COALESCE(MAX(sequence_number), 0) + 1 FROM payments WHERE company_id = ?1",
        params![recon.company_id],
        |row| row.get(0),
    )?;
    let payment_number = format!("PAY-{sequence_number:06}");
    let payment_id = Uuid::new_v4().to_string();
    let amount_cents = tx.amount_cents.abs();
    let base_amount_cents = (amount_cents as f64 * invoice.exchange_rate).round() as i64;

    dbtx.execute(
        r#"
        INSERT INTO payments(id, company_id, sequence_number, payment_number, invoice_id,
                             customer_id, amount_cents, base_amount_cents, currency,
                             exchange_rate, payment_date, source_type, source_id)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
        "#,
        params![
            payment_id,
            recon.company_id,
            sequence_number,
            payment_number,
            invoice_id,
            invoice.customer_id,
            amount_cents,
            base_amount_cents,
            invoice.currency,
            invoice.exchange_rate,
            tx.transaction_date,
            SOURCE_TYPE_BANK_TRANSACTION,
            recon.bank_transaction_id,
        ],
    )?;

    let new_due = (invoice.due_cents - amount_cents).max(0);
    let paid_status = if new_due == 0 {
        "paid"
    } else if new_due < invoice.total_cents {
        "partial"
    } else {
        "unpaid"
    };
    dbtx.execute(
        "UPDATE invoices SET due_cents = ?1, paid_status = ?2 WHERE id = ?3",
        params![new_due, paid_status, invoice_id],
    )?;

    dbtx.execute(
        "UPDATE reconciliations
         SET payment_id = ?1, status = 'matched', matched_at = ?2
         WHERE id = ?3",
        params![payment_id, now, reconciliation_id],
    )?;

    dbtx.execute(
        "UPDATE bank_transactions
         SET matched_invoice_id = ?1, matched_payment_id = ?2, matched_at = ?3,
             match_confidence = ?4, processing_status = 'processed', processed_at = ?3
         WHERE id = ?5",
        params![
            invoice_id,
            payment_id,
            now,
            recon.confidence,
            recon.bank_transaction_id
        ],
    )?;

    dbtx.commit()?;

    Ok(PostingResult::Success(PaymentRef {
        payment_id,
        payment_number,
        amount_cents,
        base_amount_cents,
    }))
}

fn payment_ref_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PaymentRef> {
    Ok(PaymentRef {
        payment_id: row.get(0)?,
        payment_number: row.get(1)?,
        amount_cents: row.get(2)?,
        base_amount_cents: row.get(3)?,
    })
}

fn find_existing_payment(
    conn: &Connection,
    company_id: &str,
    bank_transaction_id: &str,
) -> ReconResult<Option<PaymentRef>> {
    let existing = conn
        .query_row(
            "SELECT id, payment_number, amount_cents, base_amount_cents FROM payments
             WHERE company_id = ?1 AND source_type = ?2 AND source_id = ?3",
            params![company_id, SOURCE_TYPE_BANK_TRANSACTION, bank_transaction_id],
            payment_ref_from_row,
        )
        .optional()?;
    Ok(existing)
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(code, message) => {
            code.code == rusqlite::ErrorCode::ConstraintViolation
                && message
                    .as_deref()
                    .map(|m| m.contains("payments.") || m.contains(IDEMPOTENCY_INDEX_NAME))
                    .unwrap_or(true)
        }
        _ => false,
    }
}

fn load_reconciliation(
    conn: &Connection,
    reconciliation_id: &str,
) -> ReconResult<Option<ReconRow>> {
    let row = conn
        .query_row(
            "SELECT company_id, bank_transaction_id, invoice_id, confidence
             FROM reconciliations WHERE id = ?1",
            params![reconciliation_id],
            |row| {
                Ok(ReconRow {
                    company_id: row.get(0)?,
                    bank_transaction_id: row.get(1)?,
                    invoice_id: row.get(2)?,
                    confidence: row.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

fn load_transaction(conn: &Connection, transaction_id: &str) -> ReconResult<Option<TxRow>> {
    let row = conn
        .query_row(
            "SELECT amount_cents, direction, currency, transaction_date
             FROM bank_transactions WHERE id = ?1",
            params![transaction_id],
            |row| {
                let direction_raw: String = row.get(1)?;
                Ok(TxRow {
                    amount_cents: row.get(0)?,
                    direction: direction_raw
                        .parse()
                        .unwrap_or(TransactionDirection::Debit),
                    currency: row.get(2)?,
                    transaction_date: row.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

fn load_invoice(conn: &Connection, invoice_id: &str) -> ReconResult<Option<InvoiceRow>> {
    let row = conn
        .query_row(
            "SELECT customer_id, currency, exchange_rate, total_cents, due_cents, paid_status
             FROM invoices WHERE id = ?1",
            params![invoice_id],
            |row| {
                Ok(InvoiceRow {
                    customer_id: row.get(0)?,
                    currency: row.get(1)?,
                    exchange_rate: row.get(2)?,
                    total_cents: row.get(3)?,
                    due_cents: row.get(4)?,
                    paid_status: row.get(5)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::events::test_support::RecordingEventSink;
    use crate::events::LoggingEventSink;
    use std::path::PathBuf;

    fn temp_db_path() -> PathBuf {
        let unique = format!(
            "bankrecon_posting_test_{}_{}.db",
            std::process::id(),
            Uuid::new_v4()
        );
        std::env::temp_dir().join(unique)
    }

    struct Seed {
        reconciliation_id: String,
    }

    fn seed(
        conn: &Connection,
        amount_cents: i64,
        direction: &str,
        tx_currency: &str,
        invoice_due_cents: i64,
        invoice_currency: &str,
        exchange_rate: f64,
        paid_status: &str,
    ) -> Seed {
        conn.execute(
            "INSERT INTO bank_accounts(id, company_id, bank_code) VALUES ('acct-1', 'co-1', 'nlb')",
            [],
        )
        .expect("seed account");
        conn.execute(
            "INSERT INTO bank_transactions(id, company_id, bank_account_id, amount_cents,
                 direction, currency, transaction_date, description)
             VALUES ('tx-1', 'co-1', 'acct-1', ?1, ?2, ?3, '2026-01-15', 'Фактура 2026-001')",
            params![amount_cents, direction, tx_currency],
        )
        .expect("seed transaction");
        conn.execute(
            "INSERT INTO invoices(id, company_id, customer_id, invoice_number, currency,
                 exchange_rate, total_cents, due_cents, paid_status)
             VALUES ('inv-1', 'co-1', 'cust-1', 'INV-2026-001', ?1, ?2, ?3, ?4, ?5)",
            params![
                invoice_currency,
                exchange_rate,
                invoice_due_cents,
                invoice_due_cents,
                paid_status
            ],
        )
        .expect("seed invoice");
        conn.execute(
            "INSERT INTO reconciliations(id, company_id, bank_transaction_id, invoice_id,
                 status, match_type, confidence)
             VALUES ('rec-1', 'co-1', 'tx-1', 'inv-1', 'pending', 'auto', 92.5)",
            [],
        )
        .expect("seed reconciliation");
        Seed {
            reconciliation_id: "rec-1".to_string(),
        }
    }

    #[test]
    fn responses_use_fixed_status_strings() {
        let payment = PaymentRef {
            payment_id: "pay-1".to_string(),
            payment_number: "PAY-000001".to_string(),
            amount_cents: 150_000,
            base_amount_cents: 150_000,
        };
        let success = PostingResult::Success(payment.clone()).to_response();
        assert_eq!(success["status"], "success");
        assert_eq!(success["ok"], true);
        assert_eq!(success["payment"]["payment_number"], "PAY-000001");

        let replay = PostingResult::AlreadyPosted(payment).to_response();
        assert_eq!(replay["status"], "already_posted");
        assert_eq!(replay["ok"], true);

        let error = PostingResult::Error("boom".to_string()).to_response();
        assert_eq!(error["status"], "error");
        assert_eq!(error["ok"], false);
        assert_eq!(error["message"], "boom");
    }

    #[test]
    fn successful_post_creates_payment_and_settles_invoice() {
        let db_path = temp_db_path();
        db::apply_embedded_migrations(&db_path).expect("migrate");
        let mut conn = db::open(&db_path).expect("open");
        let s = seed(&conn, 150_000, "credit", "MKD", 150_000, "MKD", 1.0, "unpaid");
        let sink = RecordingEventSink::default();

        let result =
            post_reconciliation(&mut conn, &s.reconciliation_id, &sink).expect("post");
        let PostingResult::Success(payment) = result else {
            panic!("expected success, got {result:?}");
        };
        assert_eq!(payment.amount_cents, 150_000);
        assert_eq!(payment.base_amount_cents, 150_000);
        assert_eq!(payment.payment_number, "PAY-000001");

        let (due, paid_status): (i64, String) = conn
            .query_row(
                "SELECT due_cents, paid_status FROM invoices WHERE id = 'inv-1'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .expect("invoice state");
        assert_eq!(due, 0);
        assert_eq!(paid_status, "paid");

        let (recon_status, recon_payment): (String, Option<String>) = conn
            .query_row(
                "SELECT status, payment_id FROM reconciliations WHERE id = 'rec-1'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .expect("recon state");
        assert_eq!(recon_status, "matched");
        assert_eq!(recon_payment.as_deref(), Some(payment.payment_id.as_str()));

        let (tx_status, confidence): (String, Option<f64>) = conn
            .query_row(
                "SELECT processing_status, match_confidence FROM bank_transactions WHERE id = 'tx-1'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .expect("tx state");
        assert_eq!(tx_status, "processed");
        assert_eq!(confidence, Some(92.5));

        let events = sink.events.lock().expect("events");
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], ReconciliationEvent::Matched { .. }));
        assert!(matches!(events[1], ReconciliationEvent::Posted { .. }));

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn double_post_returns_already_posted() {
        let db_path = temp_db_path();
        db::apply_embedded_migrations(&db_path).expect("migrate");
        let mut conn = db::open(&db_path).expect("open");
        let s = seed(&conn, 150_000, "credit", "MKD", 150_000, "MKD", 1.0, "unpaid");
        let sink = RecordingEventSink::default();

        let first = post_reconciliation(&mut conn, &s.reconciliation_id, &sink).expect("first");
        let PostingResult::Success(payment) = first else {
            panic!("expected success");
        };

        let second = post_reconciliation(&mut conn, &s.reconciliation_id, &sink).expect("second");
        let PostingResult::AlreadyPosted(existing) = second else {
            panic!("expected already posted, got {second:?}");
        };
        assert_eq!(existing.payment_id, payment.payment_id);

        let payment_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM payments", [], |r| r.get(0))
            .expect("payment count");
        assert_eq!(payment_count, 1);

        // The replay emitted no further events.
        assert_eq!(sink.events.lock().expect("events").len(), 2);

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn debit_transactions_cannot_post() {
        let db_path = temp_db_path();
        db::apply_embedded_migrations(&db_path).expect("migrate");
        let mut conn = db::open(&db_path).expect("open");
        let s = seed(&conn, 150_000, "debit", "MKD", 150_000, "MKD", 1.0, "unpaid");

        let result =
            post_reconciliation(&mut conn, &s.reconciliation_id, &LoggingEventSink).expect("post");
        let PostingResult::Error(message) = result else {
            panic!("expected error");
        };
        assert!(message.contains("debit"));
        let payment_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM payments", [], |r| r.get(0))
            .expect("payment count");
        assert_eq!(payment_count, 0);

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn currency_mismatch_is_rejected() {
        let db_path = temp_db_path();
        db::apply_embedded_migrations(&db_path).expect("migrate");
        let mut conn = db::open(&db_path).expect("open");
        let s = seed(&conn, 150_000, "credit", "EUR", 150_000, "MKD", 1.0, "unpaid");

        let result =
            post_reconciliation(&mut conn, &s.reconciliation_id, &LoggingEventSink).expect("post");
        let PostingResult::Error(message) = result else {
            panic!("expected error");
        };
        assert!(message.contains("Currency mismatch"));

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn fully_paid_invoice_is_rejected() {
        let db_path = temp_db_path();
        db::apply_embedded_migrations(&db_path).expect("migrate");
        let mut conn = db::open(&db_path).expect("open");
        let s = seed(&conn, 150_000, "credit", "MKD", 0, "MKD", 1.0, "paid");

        let result =
            post_reconciliation(&mut conn, &s.reconciliation_id, &LoggingEventSink).expect("post");
        assert!(matches!(result, PostingResult::Error(ref m) if m.contains("fully paid")));

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn missing_invoice_reference_is_rejected() {
        let db_path = temp_db_path();
        db::apply_embedded_migrations(&db_path).expect("migrate");
        let mut conn = db::open(&db_path).expect("open");
        seed(&conn, 150_000, "credit", "MKD", 150_000, "MKD", 1.0, "unpaid");
        conn.execute("UPDATE reconciliations SET invoice_id = NULL WHERE id = 'rec-1'", [])
            .expect("clear invoice");

        let result =
            post_reconciliation(&mut conn, "rec-1", &LoggingEventSink).expect("post");
        assert!(matches!(result, PostingResult::Error(ref m) if m.contains("no matched invoice")));

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn partial_payment_reduces_due_amount() {
        let db_path = temp_db_path();
        db::apply_embedded_migrations(&db_path).expect("migrate");
        let mut conn = db::open(&db_path).expect("open");
        let s = seed(&conn, 150_000, "credit", "MKD", 500_000, "MKD", 1.0, "unpaid");

        let result =
            post_reconciliation(&mut conn, &s.reconciliation_id, &LoggingEventSink).expect("post");
        assert!(matches!(result, PostingResult::Success(_)));

        let (due, paid_status): (i64, String) = conn
            .query_row(
                "SELECT due_cents, paid_status FROM invoices WHERE id = 'inv-1'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .expect("invoice state");
        assert_eq!(due, 350_000);
        assert_eq!(paid_status, "partial");

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn base_amount_uses_invoice_exchange_rate() {
        let db_path = temp_db_path();
        db::apply_embedded_migrations(&db_path).expect("migrate");
        let mut conn = db::open(&db_path).expect("open");
        let s = seed(&conn, 10_000, "credit", "EUR", 10_000, "EUR", 61.5, "unpaid");

        let result =
            post_reconciliation(&mut conn, &s.reconciliation_id, &LoggingEventSink).expect("post");
        let PostingResult::Success(payment) = result else {
            panic!("expected success");
        };
        assert_eq!(payment.base_amount_cents, 615_000);

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn concurrent_posts_yield_one_payment() {
        let db_path = temp_db_path();
        db::apply_embedded_migrations(&db_path).expect("migrate");
        {
            let conn = db::open(&db_path).expect("open for seed");
            seed(&conn, 150_000, "credit", "MKD", 150_000, "MKD", 1.0, "unpaid");
        }

        let mut handles = Vec::new();
        for _ in 0..2 {
            let path = db_path.clone();
            handles.push(std::thread::spawn(move || {
                let mut conn = db::open(&path).expect("open in thread");
                post_reconciliation(&mut conn, "rec-1", &LoggingEventSink).expect("post")
            }));
        }
        let outcomes: Vec<PostingResult> =
            handles.into_iter().map(|h| h.join().expect("join")).collect();

        let successes = outcomes
            .iter()
            .filter(|o| matches!(o, PostingResult::Success(_)))
            .count();
        let replays = outcomes
            .iter()
            .filter(|o| matches!(o, PostingResult::AlreadyPosted(_)))
            .count();
        assert_eq!(successes, 1, "{outcomes:?}");
        assert_eq!(replays, 1, "{outcomes:?}");

        let conn = db::open(&db_path).expect("open for verify");
        let payment_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM payments", [], |r| r.get(0))
            .expect("payment count");
        assert_eq!(payment_count, 1);
        let due: i64 = conn
            .query_row("SELECT due_cents FROM invoices WHERE id = 'inv-1'", [], |r| r.get(0))
            .expect("due");
        assert_eq!(due, 0);

        let _ = std::fs::remove_file(&db_path);
    }
}
