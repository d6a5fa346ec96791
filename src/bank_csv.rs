use chrono::{NaiveDate, NaiveDateTime, Utc};
use encoding_rs::{Encoding, UTF_8, WINDOWS_1251, WINDOWS_1252};
use std::collections::HashMap;
use tracing::warn;

/// Single-byte fallbacks probed when the payload is not valid UTF-8 and the
/// parser declared nothing. Order mirrors what Macedonian bank exports
/// actually are in the wild.
const ENCODING_CANDIDATES: &[&Encoding] = &[WINDOWS_1251, WINDOWS_1252];

const DELIMITER_CANDIDATES: &[u8] = &[b';', b',', b'\t', b'|'];

const DATE_FORMATS: &[&str] = &["%d.%m.%Y", "%d/%m/%Y", "%Y-%m-%d", "%d-%m-%Y"];

/// Maps one canonical field to the header spellings banks use for it.
#[derive(Debug)]
pub struct AliasSpec {
    pub field: &'static str,
    pub aliases: &'static [&'static str],
}

/// Decodes raw statement bytes to text. BOM-tagged payloads follow their
/// BOM; valid UTF-8 passes through; otherwise the parser's declared encoding
/// wins, then the probe list. Unmappable bytes become replacement
/// characters rather than failing the whole file.
pub fn normalize_encoding(bytes: &[u8], declared: Option<&'static Encoding>) -> String {
    if let Some((encoding, _bom_len)) = Encoding::for_bom(bytes) {
        let (text, _, _) = encoding.decode(bytes);
        return strip_bom_char(&text);
    }
    if let Ok(text) = std::str::from_utf8(bytes) {
        return strip_bom_char(text);
    }
    if let Some(encoding) = declared {
        let (text, _, _) = encoding.decode(bytes);
        return strip_bom_char(&text);
    }
    for encoding in ENCODING_CANDIDATES {
        let (text, _, had_errors) = encoding.decode(bytes);
        if !had_errors {
            return strip_bom_char(&text);
        }
    }
    // Single-byte decoders never fail, so this is unreachable in practice.
    let (text, _, _) = UTF_8.decode(bytes);
    strip_bom_char(&text)
}

fn strip_bom_char(text: &str) -> String {
    text.trim_start_matches('\u{feff}').to_string()
}

/// Lower-cases and keeps only letters and digits, so that "Датум ", "датум"
/// and "Opis / Опис" all collapse to stable keys.
pub fn normalize_column_name(name: &str) -> String {
    name.trim()
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// Picks the delimiter with the highest count on the first line. Ties keep
/// the earlier candidate; an empty line falls back to comma.
pub fn detect_delimiter(text: &str) -> u8 {
    let first_line = text.lines().next().unwrap_or_default();
    let mut best = b',';
    let mut best_count = 0usize;
    for &candidate in DELIMITER_CANDIDATES {
        let count = first_line.bytes().filter(|&b| b == candidate).count();
        if count > best_count {
            best = candidate;
            best_count = count;
        }
    }
    best
}

/// Parses a statement amount into signed cents.
///
/// Both European ("1.234,56") and US ("1,234.56") conventions are accepted;
/// with both separators present the last one wins as the decimal point. A
/// lone comma followed by at most two digits is a decimal comma, any other
/// lone comma is a thousands separator.
pub fn parse_amount_cents(raw: &str) -> Result<i64, String> {
    let filtered: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '.' | ',' | '-'))
        .collect();
    if filtered.is_empty() {
        return Err(format!("no numeric content in amount: {raw:?}"));
    }

    let has_comma = filtered.contains(',');
    let has_period = filtered.contains('.');
    let canonical = if has_comma && has_period {
        let last_comma = filtered.rfind(',').unwrap_or(0);
        let last_period = filtered.rfind('.').unwrap_or(0);
        if last_comma > last_period {
            filtered.replace('.', "").replace(',', ".")
        } else {
            filtered.replace(',', "")
        }
    } else if has_comma {
        let after_last = &filtered[filtered.rfind(',').map(|i| i + 1).unwrap_or(0)..];
        let lone_comma = filtered.matches(',').count() == 1;
        if lone_comma && after_last.len() <= 2 {
            filtered.replace(',', ".")
        } else {
            filtered.replace(',', "")
        }
    } else {
        filtered
    };

    let value = canonical
        .parse::<f64>()
        .map_err(|_| format!("unparsable amount: {raw:?}"))?;
    if !value.is_finite() {
        return Err(format!("amount out of range: {raw:?}"));
    }
    Ok((value * 100.0).round() as i64)
}

/// Tries the known statement date formats in order, with and without a time
/// suffix. Returns `None` when nothing matches.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let text = raw.trim();
    if text.is_empty() {
        return None;
    }
    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(text, fmt) {
            return Some(date);
        }
        for suffix in [" %H:%M:%S", " %H:%M"] {
            let with_time = format!("{fmt}{suffix}");
            if let Ok(dt) = NaiveDateTime::parse_from_str(text, &with_time) {
                return Some(dt.date());
            }
        }
    }
    None
}

/// Unparsable dates do not kill a row; they fall back to today with a
/// warning so the import remains auditable through `raw_record`.
pub fn parse_date_or_today(raw: &str, context: &str) -> NaiveDate {
    match parse_date(raw) {
        Some(date) => date,
        None => {
            warn!(value = raw, context, "unparsable date, defaulting to today");
            Utc::now().date_naive()
        }
    }
}

/// Reads every record with the given delimiter. Flexible record lengths;
/// cells come back trimmed.
pub fn read_rows(text: &str, delimiter: u8) -> Result<Vec<Vec<String>>, String> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter)
        .from_reader(text.as_bytes());

    let mut rows = Vec::new();
    for rec in reader.records() {
        let rec = rec.map_err(|e| format!("csv read failed: {e}"))?;
        rows.push(rec.iter().map(|c| c.trim().to_string()).collect());
    }
    Ok(rows)
}

/// Exact-match alias resolution: a header cell maps to a field when its
/// normalized form equals a normalized alias. First header occurrence wins.
pub fn resolve_alias_mapping(
    header: &[String],
    specs: &[AliasSpec],
) -> HashMap<&'static str, usize> {
    let mut normalized: HashMap<String, usize> = HashMap::new();
    for (idx, cell) in header.iter().enumerate() {
        let key = normalize_column_name(cell);
        if !key.is_empty() {
            normalized.entry(key).or_insert(idx);
        }
    }

    let mut mapping = HashMap::new();
    for spec in specs {
        for alias in spec.aliases {
            if let Some(idx) = normalized.get(&normalize_column_name(alias)) {
                mapping.insert(spec.field, *idx);
                break;
            }
        }
    }
    mapping
}

/// Substring alias resolution for the generic parser: a header cell maps to
/// a field when its normalized form contains a normalized alias.
pub fn resolve_substring_mapping(
    header: &[String],
    specs: &[AliasSpec],
) -> HashMap<&'static str, usize> {
    let mut mapping = HashMap::new();
    for spec in specs {
        'cells: for (idx, cell) in header.iter().enumerate() {
            let key = normalize_column_name(cell);
            if key.is_empty() {
                continue;
            }
            for alias in spec.aliases {
                if key.contains(&normalize_column_name(alias)) {
                    mapping.insert(spec.field, idx);
                    break 'cells;
                }
            }
        }
    }
    mapping
}

pub fn row_get(row: &[String], idx: Option<usize>) -> String {
    idx.and_then(|i| row.get(i).cloned()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amount_formats_disambiguate() {
        assert_eq!(parse_amount_cents("1,234.56").unwrap(), 123_456);
        assert_eq!(parse_amount_cents("1.234,56").unwrap(), 123_456);
        assert_eq!(parse_amount_cents("1234,56").unwrap(), 123_456);
        assert_eq!(parse_amount_cents("1234.56").unwrap(), 123_456);
        assert_eq!(parse_amount_cents("-500").unwrap(), -50_000);
        assert_eq!(parse_amount_cents("1,234").unwrap(), 123_400);
        assert_eq!(parse_amount_cents("15,5").unwrap(), 1_550);
        assert_eq!(parse_amount_cents("1.234.567,89").unwrap(), 123_456_789);
        assert_eq!(parse_amount_cents("500,00 МКД").unwrap(), 50_000);
        assert!(parse_amount_cents("").is_err());
        assert!(parse_amount_cents("n/a").is_err());
    }

    #[test]
    fn date_formats_in_order() {
        let expected = NaiveDate::from_ymd_opt(2026, 1, 15).unwrap();
        assert_eq!(parse_date("15.01.2026"), Some(expected));
        assert_eq!(parse_date("15/01/2026"), Some(expected));
        assert_eq!(parse_date("2026-01-15"), Some(expected));
        assert_eq!(parse_date("15-01-2026"), Some(expected));
        assert_eq!(parse_date("2026-01-15 10:30:00"), Some(expected));
        assert_eq!(parse_date("15.01.2026 10:30"), Some(expected));
        assert_eq!(parse_date("not a date"), None);
        assert_eq!(parse_date(""), None);
    }

    #[test]
    fn unparsable_date_defaults_to_today() {
        let today = Utc::now().date_naive();
        assert_eq!(parse_date_or_today("garbage", "test"), today);
    }

    #[test]
    fn delimiter_detection_counts_first_line() {
        assert_eq!(detect_delimiter("a;b;c\n1,2,3"), b';');
        assert_eq!(detect_delimiter("a,b,c"), b',');
        assert_eq!(detect_delimiter("a\tb\tc"), b'\t');
        assert_eq!(detect_delimiter("a|b|c"), b'|');
        assert_eq!(detect_delimiter(""), b',');
    }

    #[test]
    fn column_names_normalize_across_scripts() {
        assert_eq!(normalize_column_name("  Датум  "), "датум");
        assert_eq!(normalize_column_name("Број на документ"), "бројнадокумент");
        assert_eq!(normalize_column_name("Amount (EUR)"), "amounteur");
        assert_eq!(normalize_column_name("\u{feff}Datum"), "datum");
    }

    #[test]
    fn windows_1251_payload_decodes() {
        let (encoded, _, _) = WINDOWS_1251.encode("Датум;Износ");
        let decoded = normalize_encoding(&encoded, Some(WINDOWS_1251));
        assert_eq!(decoded, "Датум;Износ");
        // Undeclared falls back to the probe list.
        let probed = normalize_encoding(&encoded, None);
        assert_eq!(probed, "Датум;Износ");
    }

    #[test]
    fn utf8_bom_is_stripped() {
        let bytes = b"\xef\xbb\xbfDatum,Iznos";
        assert_eq!(normalize_encoding(bytes, None), "Datum,Iznos");
    }

    #[test]
    fn substring_mapping_matches_partial_headers() {
        let specs: &[AliasSpec] = &[AliasSpec {
            field: "date",
            aliases: &["датум", "datum", "date"],
        }];
        let header = vec!["Датум на валута".to_string(), "Опис".to_string()];
        let mapping = resolve_substring_mapping(&header, specs);
        assert_eq!(mapping.get("date"), Some(&0));
    }
}
