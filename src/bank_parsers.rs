use encoding_rs::{Encoding, WINDOWS_1251};
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

use crate::bank_csv::{
    detect_delimiter, normalize_encoding, parse_amount_cents, parse_date_or_today, read_rows,
    resolve_alias_mapping, resolve_substring_mapping, row_get, AliasSpec,
};
use crate::domain::CanonicalTransaction;

const DEFAULT_CURRENCY: &str = "MKD";

/// Parser output. Row failures never abort the statement; they land in
/// `errors` with their line number.
#[derive(Debug, Default)]
pub struct ParsedStatement {
    pub transactions: Vec<CanonicalTransaction>,
    pub errors: Vec<String>,
}

pub trait BankParser: Send + Sync {
    fn bank_code(&self) -> &'static str;
    fn bank_name(&self) -> &'static str;
    /// Default delimiter; the generic parser re-detects per statement.
    fn delimiter(&self) -> u8;
    /// Encoding label for diagnostics.
    fn encoding(&self) -> &'static str;
    fn can_parse(&self, content: &[u8]) -> bool;
    fn parse(&self, content: &[u8]) -> ParsedStatement;
}

/// A fixed-format bank export described by data: delimiter, encoding and
/// header aliases. All three Macedonian banks fit this shape.
pub struct BankCsvSpec {
    code: &'static str,
    name: &'static str,
    delimiter: u8,
    declared_encoding: Option<&'static Encoding>,
    encoding_label: &'static str,
    aliases: &'static [AliasSpec],
    required: &'static [&'static str],
    any_of: &'static [&'static [&'static str]],
}

const NLB_ALIASES: &[AliasSpec] = &[
    AliasSpec { field: "date", aliases: &["Датум"] },
    AliasSpec { field: "amount", aliases: &["Износ"] },
    AliasSpec { field: "credit", aliases: &["Кредит"] },
    AliasSpec { field: "debit", aliases: &["Дебит"] },
    AliasSpec { field: "currency", aliases: &["Валута"] },
    AliasSpec { field: "description", aliases: &["Опис"] },
    AliasSpec { field: "reference", aliases: &["Референца"] },
    AliasSpec { field: "counterparty_name", aliases: &["Партнер"] },
    AliasSpec { field: "counterparty_account", aliases: &["Сметка"] },
];

const STOPANSKA_ALIASES: &[AliasSpec] = &[
    AliasSpec { field: "date", aliases: &["Датум"] },
    AliasSpec { field: "amount", aliases: &["Износ"] },
    AliasSpec { field: "currency", aliases: &["Валута"] },
    AliasSpec { field: "description", aliases: &["Опис"] },
    AliasSpec { field: "reference", aliases: &["Референца"] },
    AliasSpec { field: "counterparty_name", aliases: &["Партнер"] },
];

const KOMERCIJALNA_ALIASES: &[AliasSpec] = &[
    AliasSpec { field: "date", aliases: &["Датум"] },
    AliasSpec { field: "debit", aliases: &["Задолжување"] },
    AliasSpec { field: "credit", aliases: &["Одобрување"] },
    AliasSpec { field: "description", aliases: &["Опис"] },
    AliasSpec { field: "reference", aliases: &["Број на документ"] },
    AliasSpec { field: "counterparty_name", aliases: &["Назив"] },
];

pub fn nlb_parser() -> BankCsvSpec {
    BankCsvSpec {
        code: "nlb",
        name: "NLB Banka",
        delimiter: b';',
        declared_encoding: Some(WINDOWS_1251),
        encoding_label: "windows-1251",
        aliases: NLB_ALIASES,
        required: &["date"],
        any_of: &[&["amount", "credit", "debit"]],
    }
}

pub fn stopanska_parser() -> BankCsvSpec {
    BankCsvSpec {
        code: "stopanska",
        name: "Stopanska Banka",
        delimiter: b',',
        declared_encoding: None,
        encoding_label: "utf-8",
        aliases: STOPANSKA_ALIASES,
        required: &["date", "amount"],
        any_of: &[],
    }
}

pub fn komercijalna_parser() -> BankCsvSpec {
    BankCsvSpec {
        code: "komercijalna",
        name: "Komercijalna Banka",
        delimiter: b'\t',
        declared_encoding: Some(WINDOWS_1251),
        encoding_label: "windows-1251",
        aliases: KOMERCIJALNA_ALIASES,
        required: &["date"],
        any_of: &[&["credit", "debit"]],
    }
}

impl BankCsvSpec {
    fn find_header(
        &self,
        rows: &[Vec<String>],
    ) -> Option<(usize, HashMap<&'static str, usize>)> {
        'rows: for (idx, row) in rows.iter().enumerate() {
            let mapping = resolve_alias_mapping(row, self.aliases);
            for req in self.required {
                if !mapping.contains_key(req) {
                    continue 'rows;
                }
            }
            for group in self.any_of {
                if !group.iter().any(|f| mapping.contains_key(f)) {
                    continue 'rows;
                }
            }
            return Some((idx, mapping));
        }
        None
    }
}

impl BankParser for BankCsvSpec {
    fn bank_code(&self) -> &'static str {
        self.code
    }

    fn bank_name(&self) -> &'static str {
        self.name
    }

    fn delimiter(&self) -> u8 {
        self.delimiter
    }

    fn encoding(&self) -> &'static str {
        self.encoding_label
    }

    fn can_parse(&self, content: &[u8]) -> bool {
        if content.is_empty() {
            return false;
        }
        let text = normalize_encoding(content, self.declared_encoding);
        if text.trim().is_empty() {
            return false;
        }
        match read_rows(&text, self.delimiter) {
            Ok(rows) => self.find_header(&rows).is_some(),
            Err(_) => false,
        }
    }

    fn parse(&self, content: &[u8]) -> ParsedStatement {
        let text = normalize_encoding(content, self.declared_encoding);
        let rows = match read_rows(&text, self.delimiter) {
            Ok(rows) => rows,
            Err(err) => {
                warn!(bank = self.code, error = %err, "statement is not readable csv");
                return ParsedStatement::default();
            }
        };
        let Some((header_idx, mapping)) = self.find_header(&rows) else {
            warn!(bank = self.code, "statement header not found");
            return ParsedStatement::default();
        };

        map_data_rows(self.code, &rows, header_idx, &mapping)
    }
}

/// Fallback parser: detects delimiter and encoding, maps headers by
/// substring against a multilingual synonym table, and always attempts an
/// interpretation of whatever it is given.
pub struct GenericCsvParser;

const GENERIC_ALIASES: &[AliasSpec] = &[
    AliasSpec {
        field: "date",
        aliases: &["date", "datum", "датум", "data", "tarih", "transactiondate"],
    },
    AliasSpec {
        field: "amount",
        aliases: &["amount", "iznos", "износ", "suma", "сума", "tutar", "value", "total"],
    },
    AliasSpec {
        field: "credit",
        aliases: &["credit", "kredit", "кредит", "прилив", "одобрување", "inflow", "deposit"],
    },
    AliasSpec {
        field: "debit",
        aliases: &["debit", "дебит", "одлив", "задолжување", "outflow", "withdrawal"],
    },
    AliasSpec {
        field: "description",
        aliases: &["description", "opis", "опис", "açıklama", "purpose", "цел", "details", "note"],
    },
    AliasSpec {
        field: "reference",
        aliases: &["reference", "referenca", "референца", "ref", "broj", "број", "number", "id"],
    },
    AliasSpec {
        field: "counterparty_name",
        aliases: &[
            "counterparty",
            "partner",
            "партнер",
            "name",
            "naziv",
            "назив",
            "sender",
            "receiver",
            "примач",
            "испраќач",
        ],
    },
    AliasSpec {
        field: "counterparty_account",
        aliases: &["account", "smetka", "сметка", "iban", "partneraccount"],
    },
    AliasSpec {
        field: "currency",
        aliases: &["currency", "valuta", "валута", "curr", "ccy"],
    },
];

impl BankParser for GenericCsvParser {
    fn bank_code(&self) -> &'static str {
        "generic"
    }

    fn bank_name(&self) -> &'static str {
        "Generic Bank"
    }

    fn delimiter(&self) -> u8 {
        b','
    }

    fn encoding(&self) -> &'static str {
        "auto"
    }

    fn can_parse(&self, content: &[u8]) -> bool {
        let text = normalize_encoding(content, None);
        if text.trim().is_empty() {
            return false;
        }
        let delimiter = detect_delimiter(&text);
        match read_rows(&text, delimiter) {
            Ok(rows) => rows.first().map(|header| header.len() >= 2).unwrap_or(false),
            Err(_) => false,
        }
    }

    fn parse(&self, content: &[u8]) -> ParsedStatement {
        let text = normalize_encoding(content, None);
        let delimiter = detect_delimiter(&text);
        let rows = match read_rows(&text, delimiter) {
            Ok(rows) => rows,
            Err(err) => {
                warn!(bank = "generic", error = %err, "statement is not readable csv");
                return ParsedStatement::default();
            }
        };
        if rows.is_empty() {
            return ParsedStatement::default();
        }
        let mapping = resolve_substring_mapping(&rows[0], GENERIC_ALIASES);
        map_data_rows("generic", &rows, 0, &mapping)
    }
}

fn map_data_rows(
    bank_code: &str,
    rows: &[Vec<String>],
    header_idx: usize,
    mapping: &HashMap<&'static str, usize>,
) -> ParsedStatement {
    let header = &rows[header_idx];
    let mut out = ParsedStatement::default();

    for (offset, row) in rows[(header_idx + 1)..].iter().enumerate() {
        let line_no = header_idx + 2 + offset;
        if row.iter().all(|c| c.is_empty()) {
            continue;
        }
        let res: Result<Option<CanonicalTransaction>, String> = (|| {
            let amount_cents = resolve_amount(row, mapping)?;
            let date_raw = row_get(row, mapping.get("date").copied());
            if amount_cents == 0 || date_raw.is_empty() {
                // Not a money movement (summary/footer rows, balances).
                return Ok(None);
            }
            let transaction_date =
                parse_date_or_today(&date_raw, &format!("{bank_code} line {line_no}"));

            let currency = {
                let v = row_get(row, mapping.get("currency").copied());
                if v.is_empty() {
                    DEFAULT_CURRENCY.to_string()
                } else {
                    v
                }
            };
            let reference = non_empty(row_get(row, mapping.get("reference").copied()));

            let mut raw_record = BTreeMap::new();
            for (idx, cell) in row.iter().enumerate() {
                let key = header
                    .get(idx)
                    .filter(|h| !h.is_empty())
                    .cloned()
                    .unwrap_or_else(|| format!("column_{idx}"));
                raw_record.insert(key, cell.clone());
            }

            Ok(Some(CanonicalTransaction {
                transaction_date,
                booking_date: Some(transaction_date),
                value_date: Some(transaction_date),
                amount_cents,
                currency,
                description: row_get(row, mapping.get("description").copied()),
                remittance_info: None,
                reference: reference.clone(),
                external_reference: reference,
                counterparty_name: non_empty(row_get(row, mapping.get("counterparty_name").copied())),
                counterparty_account: non_empty(row_get(
                    row,
                    mapping.get("counterparty_account").copied(),
                )),
                raw_record,
            }))
        })();

        match res {
            Ok(Some(tx)) => out.transactions.push(tx),
            Ok(None) => {}
            Err(err) => out.errors.push(format!("line {line_no}: {err}")),
        }
    }

    out
}

/// Single amount column wins; otherwise split credit/debit columns combine
/// into a signed value (credit positive, debit negative).
fn resolve_amount(row: &[String], mapping: &HashMap<&'static str, usize>) -> Result<i64, String> {
    let amount_raw = row_get(row, mapping.get("amount").copied());
    if !amount_raw.is_empty() {
        return parse_amount_cents(&amount_raw);
    }

    let credit_raw = row_get(row, mapping.get("credit").copied());
    let debit_raw = row_get(row, mapping.get("debit").copied());
    if credit_raw.is_empty() && debit_raw.is_empty() {
        return Ok(0);
    }
    let credit = if credit_raw.is_empty() { 0 } else { parse_amount_cents(&credit_raw)? };
    let debit = if debit_raw.is_empty() { 0 } else { parse_amount_cents(&debit_raw)? };
    Ok(if credit > 0 { credit } else { -debit })
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}
