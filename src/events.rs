use serde::Serialize;
use tracing::info;

/// Lifecycle notifications emitted by the posting service. `Matched` fires
/// when posting begins on a validated reconciliation, `Posted` after the
/// payment transaction has committed.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ReconciliationEvent {
    Matched {
        reconciliation_id: String,
        bank_transaction_id: String,
        invoice_id: String,
    },
    Posted {
        reconciliation_id: String,
        payment_id: String,
        payment_number: String,
        amount_cents: i64,
    },
}

/// Fire-and-forget delivery; a sink must not fail the posting path.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &ReconciliationEvent);
}

/// Default sink: structured log lines.
pub struct LoggingEventSink;

impl EventSink for LoggingEventSink {
    fn emit(&self, event: &ReconciliationEvent) {
        match event {
            ReconciliationEvent::Matched {
                reconciliation_id,
                bank_transaction_id,
                invoice_id,
            } => info!(
                reconciliation_id,
                bank_transaction_id, invoice_id, "reconciliation matched"
            ),
            ReconciliationEvent::Posted {
                reconciliation_id,
                payment_id,
                payment_number,
                amount_cents,
            } => info!(
                reconciliation_id,
                payment_id, payment_number, amount_cents, "reconciliation posted"
            ),
        }
    }
}
