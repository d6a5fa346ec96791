use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::ReconError;

/// Whether money moved into or out of the account. Stored alongside a
/// non-negative magnitude; signed amounts exist only at the parser boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionDirection {
    Credit,
    Debit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Unprocessed,
    Processed,
    Failed,
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionSource {
    CsvImport,
    Api,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationStatus {
    Pending,
    Matched,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Auto,
    Manual,
    Rule,
}

/// How a match was found, for the analytics breakdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    Amount,
    Reference,
    Customer,
    Rule,
}

/// Actions a matching rule may request. Validated when rule rows are loaded,
/// not at evaluation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Categorize,
    MatchCustomer,
    MatchExpense,
    AutoMatch,
    Ignore,
}

macro_rules! enum_strings {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = ReconError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ReconError::InvalidInput(format!(
                        concat!("unknown ", stringify!($ty), ": {}"),
                        other
                    ))),
                }
            }
        }
    };
}

enum_strings!(TransactionDirection { Credit => "credit", Debit => "debit" });
enum_strings!(ProcessingStatus {
    Unprocessed => "unprocessed",
    Processed => "processed",
    Failed => "failed",
    Ignored => "ignored",
});
enum_strings!(TransactionSource {
    CsvImport => "csv_import",
    Api => "api",
    Manual => "manual",
});
enum_strings!(ReconciliationStatus { Pending => "pending", Matched => "matched" });
enum_strings!(MatchType { Auto => "auto", Manual => "manual", Rule => "rule" });
enum_strings!(MatchMethod {
    Amount => "amount",
    Reference => "reference",
    Customer => "customer",
    Rule => "rule",
});
enum_strings!(RuleAction {
    Categorize => "categorize",
    MatchCustomer => "match_customer",
    MatchExpense => "match_expense",
    AutoMatch => "auto_match",
    Ignore => "ignore",
});

/// One statement line in the engine's canonical shape, as produced by any
/// bank parser. Amount is signed cents; the sign carries the direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalTransaction {
    pub transaction_date: NaiveDate,
    pub booking_date: Option<NaiveDate>,
    pub value_date: Option<NaiveDate>,
    pub amount_cents: i64,
    pub currency: String,
    pub description: String,
    pub remittance_info: Option<String>,
    pub reference: Option<String>,
    pub external_reference: Option<String>,
    pub counterparty_name: Option<String>,
    pub counterparty_account: Option<String>,
    /// Original header -> cell values, kept for audit.
    pub raw_record: BTreeMap<String, String>,
}

impl CanonicalTransaction {
    pub fn direction(&self) -> TransactionDirection {
        if self.amount_cents >= 0 {
            TransactionDirection::Credit
        } else {
            TransactionDirection::Debit
        }
    }

    pub fn magnitude_cents(&self) -> i64 {
        self.amount_cents.abs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_round_trips() {
        assert_eq!(
            "credit".parse::<TransactionDirection>().unwrap(),
            TransactionDirection::Credit
        );
        assert_eq!(ProcessingStatus::Ignored.as_str(), "ignored");
        assert_eq!(
            "match_customer".parse::<RuleAction>().unwrap(),
            RuleAction::MatchCustomer
        );
        assert!("bogus".parse::<MatchType>().is_err());
    }

    #[test]
    fn direction_follows_sign() {
        let mut tx = CanonicalTransaction {
            transaction_date: NaiveDate::from_ymd_opt(2026, 1, 15).unwrap(),
            booking_date: None,
            value_date: None,
            amount_cents: 12_345,
            currency: "MKD".to_string(),
            description: "test".to_string(),
            remittance_info: None,
            reference: None,
            external_reference: None,
            counterparty_name: None,
            counterparty_account: None,
            raw_record: BTreeMap::new(),
        };
        assert_eq!(tx.direction(), TransactionDirection::Credit);
        tx.amount_cents = -500;
        assert_eq!(tx.direction(), TransactionDirection::Debit);
        assert_eq!(tx.magnitude_cents(), 500);

        // Dates serialize as plain ISO strings.
        let as_json = serde_json::to_value(&tx).unwrap();
        assert_eq!(as_json["transaction_date"], "2026-01-15");
        assert_eq!(as_json["booking_date"], serde_json::Value::Null);
    }
}
