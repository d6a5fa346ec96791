use chrono::{Duration, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

use crate::config::ReconConfig;
use crate::error::ReconResult;

const TREND_WINDOW_DAYS: i64 = 30;

#[derive(Debug, Serialize)]
pub struct Period {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct DailyTrendPoint {
    pub date: String,
    pub matched: i64,
    pub unmatched: i64,
}

#[derive(Debug, Default, Serialize, PartialEq, Eq)]
pub struct MatchByMethod {
    pub amount: i64,
    pub reference: i64,
    pub customer: i64,
    pub rule: i64,
}

/// Read-side KPI report over non-duplicate transactions in the period.
#[derive(Debug, Serialize)]
pub struct AnalyticsReport {
    pub period: Period,
    pub total_transactions: i64,
    pub auto_matched: i64,
    pub manual_matched: i64,
    pub auto_match_rate: f64,
    pub pending: i64,
    pub avg_confidence: f64,
    pub total_amount_matched_cents: i64,
    pub total_amount_pending_cents: i64,
    pub avg_time_to_reconcile_seconds: i64,
    /// Per bank (lowercase, spaces as underscores): share of transactions
    /// that did not fail parsing.
    pub parse_accuracy: BTreeMap<String, f64>,
    pub match_by_method: MatchByMethod,
    /// Matched/unmatched per day over the last 30 days of the window, gap
    /// days zero-filled.
    pub daily_trend: Vec<DailyTrendPoint>,
}

/// Computes the reconciliation KPIs for a company. The period defaults to
/// the last 30 days ending today. Auto vs manual follows the configured
/// confidence threshold: `auto` means match_type auto at or above it (plus
/// direct transaction matches at or above it without a reconciliation row),
/// everything else confirmed counts as manual.
pub fn reconciliation_analytics(
    conn: &Connection,
    company_id: &str,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
    cfg: &ReconConfig,
) -> ReconResult<AnalyticsReport> {
    let to = to.unwrap_or_else(|| Utc::now().date_naive());
    let from = from.unwrap_or(to - Duration::days(TREND_WINDOW_DAYS));
    let from_s = from.format("%Y-%m-%d").to_string();
    let to_s = to.format("%Y-%m-%d").to_string();
    let threshold = cfg.auto_match_confidence_threshold;

    let total_transactions: i64 = conn.query_row(
        "SELECT COUNT(*) FROM bank_transactions
         WHERE company_id = ?1 AND is_duplicate = 0
           AND transaction_date BETWEEN ?2 AND ?3",
        params![company_id, from_s, to_s],
        |r| r.get(0),
    )?;

    let matched_recon_by_type = |match_type: &str, min_confidence: Option<f64>| -> ReconResult<i64> {
        let count: i64 = match min_confidence {
            Some(min) => conn.query_row(
                "SELECT COUNT(*) FROM reconciliations r
                 JOIN bank_transactions t ON t.id = r.bank_transaction_id
                 WHERE r.company_id = ?1 AND r.status = 'matched' AND r.match_type = ?2
                   AND r.confidence >= ?3 AND t.transaction_date BETWEEN ?4 AND ?5",
                params![company_id, match_type, min, from_s, to_s],
                |r| r.get(0),
            )?,
            None => conn.query_row(
                "SELECT COUNT(*) FROM reconciliations r
                 JOIN bank_transactions t ON t.id = r.bank_transaction_id
                 WHERE r.company_id = ?1 AND r.status = 'matched' AND r.match_type = ?2
                   AND t.transaction_date BETWEEN ?3 AND ?4",
                params![company_id, match_type, from_s, to_s],
                |r| r.get(0),
            )?,
        };
        Ok(count)
    };

    let auto_recon = matched_recon_by_type("auto", Some(threshold))?;
    let manual_recon = matched_recon_by_type("manual", None)?;
    let rule_recon = matched_recon_by_type("rule", None)?;

    // Transactions matched directly, with no reconciliation row at all.
    let direct_auto: i64 = conn.query_row(
        "SELECT COUNT(*) FROM bank_transactions t
         WHERE t.company_id = ?1 AND t.is_duplicate = 0
           AND t.transaction_date BETWEEN ?2 AND ?3
           AND t.matched_invoice_id IS NOT NULL AND t.match_confidence >= ?4
           AND NOT EXISTS (SELECT 1 FROM reconciliations r WHERE r.bank_transaction_id = t.id)",
        params![company_id, from_s, to_s, threshold],
        |r| r.get(0),
    )?;
    let direct_manual: i64 = conn.query_row(
        "SELECT COUNT(*) FROM bank_transactions t
         WHERE t.company_id = ?1 AND t.is_duplicate = 0
           AND t.transaction_date BETWEEN ?2 AND ?3
           AND t.matched_invoice_id IS NOT NULL
           AND (t.match_confidence < ?4 OR t.match_confidence IS NULL)
           AND NOT EXISTS (SELECT 1 FROM reconciliations r WHERE r.bank_transaction_id = t.id)",
        params![company_id, from_s, to_s, threshold],
        |r| r.get(0),
    )?;

    let auto_matched = auto_recon + direct_auto;
    let manual_matched = manual_recon + rule_recon + direct_manual;
    let auto_match_rate = if total_transactions > 0 {
        round4(auto_matched as f64 / total_transactions as f64)
    } else {
        0.0
    };
    let pending = (total_transactions - auto_matched - manual_matched).max(0);

    // Reconciliation-recorded confidences first, transaction-stored second.
    let avg_confidence: f64 = {
        let from_recons: Option<f64> = conn
            .query_row(
                "SELECT AVG(r.confidence) FROM reconciliations r
                 JOIN bank_transactions t ON t.id = r.bank_transaction_id
                 WHERE r.company_id = ?1 AND r.status = 'matched' AND r.confidence IS NOT NULL
                   AND t.transaction_date BETWEEN ?2 AND ?3",
                params![company_id, from_s, to_s],
                |r| r.get(0),
            )
            .optional()?
            .flatten();
        let from_transactions: Option<f64> = conn
            .query_row(
                "SELECT AVG(match_confidence) FROM bank_transactions
                 WHERE company_id = ?1 AND is_duplicate = 0
                   AND transaction_date BETWEEN ?2 AND ?3
                   AND matched_invoice_id IS NOT NULL AND match_confidence IS NOT NULL",
                params![company_id, from_s, to_s],
                |r| r.get(0),
            )
            .optional()?
            .flatten();
        round2(from_recons.or(from_transactions).unwrap_or(0.0))
    };

    let total_amount_matched_cents: i64 = conn.query_row(
        "SELECT COALESCE(SUM(amount_cents), 0) FROM bank_transactions
         WHERE company_id = ?1 AND is_duplicate = 0
           AND transaction_date BETWEEN ?2 AND ?3 AND matched_invoice_id IS NOT NULL",
        params![company_id, from_s, to_s],
        |r| r.get(0),
    )?;
    let total_amount_pending_cents: i64 = conn.query_row(
        "SELECT COALESCE(SUM(amount_cents), 0) FROM bank_transactions
         WHERE company_id = ?1 AND is_duplicate = 0
           AND transaction_date BETWEEN ?2 AND ?3 AND matched_invoice_id IS NULL",
        params![company_id, from_s, to_s],
        |r| r.get(0),
    )?;

    let avg_time_to_reconcile_seconds = avg_time_to_reconcile(conn, company_id, &from_s, &to_s)?;
    let parse_accuracy = parse_accuracy(conn, company_id, &from_s, &to_s)?;
    let match_by_method = match_by_method(conn, company_id, &from_s, &to_s)?;
    let daily_trend = daily_trend(conn, company_id, from, to)?;

    Ok(AnalyticsReport {
        period: Period { from: from_s, to: to_s },
        total_transactions,
        auto_matched,
        manual_matched,
        auto_match_rate,
        pending,
        avg_confidence,
        total_amount_matched_cents,
        total_amount_pending_cents,
        avg_time_to_reconcile_seconds,
        parse_accuracy,
        match_by_method,
        daily_trend,
    })
}

fn avg_time_to_reconcile(
    conn: &Connection,
    company_id: &str,
    from_s: &str,
    to_s: &str,
) -> ReconResult<i64> {
    let from_recons: Option<f64> = conn
        .query_row(
            "SELECT AVG(strftime('%s', r.matched_at) - strftime('%s', t.created_at))
             FROM reconciliations r
             JOIN bank_transactions t ON t.id = r.bank_transaction_id
             WHERE r.company_id = ?1 AND r.status = 'matched' AND r.matched_at IS NOT NULL
               AND t.transaction_date BETWEEN ?2 AND ?3",
            params![company_id, from_s, to_s],
            |r| r.get(0),
        )
        .optional()?
        .flatten();
    if let Some(avg) = from_recons {
        return Ok(avg.round() as i64);
    }

    let from_transactions: Option<f64> = conn
        .query_row(
            "SELECT AVG(strftime('%s', matched_at) - strftime('%s', created_at))
             FROM bank_transactions
             WHERE company_id = ?1 AND is_duplicate = 0
               AND transaction_date BETWEEN ?2 AND ?3 AND matched_at IS NOT NULL",
            params![company_id, from_s, to_s],
            |r| r.get(0),
        )
        .optional()?
        .flatten();
    Ok(from_transactions.unwrap_or(0.0).round() as i64)
}

fn parse_accuracy(
    conn: &Connection,
    company_id: &str,
    from_s: &str,
    to_s: &str,
) -> ReconResult<BTreeMap<String, f64>> {
    let mut stmt = conn.prepare(
        "SELECT a.bank_name,
                COUNT(*) AS total,
                SUM(CASE WHEN t.processing_status != 'failed' THEN 1 ELSE 0 END) AS successful
         FROM bank_transactions t
         JOIN bank_accounts a ON a.id = t.bank_account_id
         WHERE t.company_id = ?1 AND t.is_duplicate = 0
           AND t.transaction_date BETWEEN ?2 AND ?3
         GROUP BY a.bank_name",
    )?;
    let rows = stmt.query_map(params![company_id, from_s, to_s], |row| {
        Ok((
            row.get::<_, Option<String>>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, i64>(2)?,
        ))
    })?;

    let mut accuracy = BTreeMap::new();
    for row in rows {
        let (bank_name, total, successful) = row?;
        let key = bank_name
            .unwrap_or_else(|| "unknown".to_string())
            .to_lowercase()
            .replace(' ', "_");
        let share = if total > 0 {
            round2(successful as f64 / total as f64)
        } else {
            0.0
        };
        accuracy.insert(key, share);
    }
    Ok(accuracy)
}

fn match_by_method(
    conn: &Connection,
    company_id: &str,
    from_s: &str,
    to_s: &str,
) -> ReconResult<MatchByMethod> {
    let mut stmt = conn.prepare(
        "SELECT r.match_type, r.match_details
         FROM reconciliations r
         JOIN bank_transactions t ON t.id = r.bank_transaction_id
         WHERE r.company_id = ?1 AND r.status = 'matched'
           AND t.transaction_date BETWEEN ?2 AND ?3",
    )?;
    let rows = stmt.query_map(params![company_id, from_s, to_s], |row| {
        Ok((
            row.get::<_, Option<String>>(0)?,
            row.get::<_, Option<String>>(1)?,
        ))
    })?;

    let mut methods = MatchByMethod::default();
    for row in rows {
        let (match_type, match_details) = row?;

        let detail_method = match_details
            .as_deref()
            .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok())
            .and_then(|v| v.get("method").and_then(|m| m.as_str().map(str::to_lowercase)));
        if let Some(method) = detail_method {
            match method.as_str() {
                "amount" => {
                    methods.amount += 1;
                    continue;
                }
                "reference" => {
                    methods.reference += 1;
                    continue;
                }
                "customer" => {
                    methods.customer += 1;
                    continue;
                }
                "rule" => {
                    methods.rule += 1;
                    continue;
                }
                _ => {}
            }
        }

        match match_type.as_deref() {
            Some("rule") => methods.rule += 1,
            Some("auto") => methods.amount += 1,
            Some("manual") => methods.customer += 1,
            _ => {}
        }
    }

    // Direct transaction matches without a reconciliation row count as
    // amount-based.
    let direct: i64 = conn.query_row(
        "SELECT COUNT(*) FROM bank_transactions t
         WHERE t.company_id = ?1 AND t.is_duplicate = 0
           AND t.transaction_date BETWEEN ?2 AND ?3
           AND t.matched_invoice_id IS NOT NULL
           AND NOT EXISTS (SELECT 1 FROM reconciliations r WHERE r.bank_transaction_id = t.id)",
        params![company_id, from_s, to_s],
        |r| r.get(0),
    )?;
    methods.amount += direct;

    Ok(methods)
}

fn daily_trend(
    conn: &Connection,
    company_id: &str,
    from: NaiveDate,
    to: NaiveDate,
) -> ReconResult<Vec<DailyTrendPoint>> {
    let trend_from = std::cmp::max(to - Duration::days(TREND_WINDOW_DAYS - 1), from);
    let trend_from_s = trend_from.format("%Y-%m-%d").to_string();
    let to_s = to.format("%Y-%m-%d").to_string();

    let mut stmt = conn.prepare(
        "SELECT transaction_date,
                SUM(CASE WHEN matched_invoice_id IS NOT NULL THEN 1 ELSE 0 END) AS matched,
                SUM(CASE WHEN matched_invoice_id IS NULL THEN 1 ELSE 0 END) AS unmatched
         FROM bank_transactions
         WHERE company_id = ?1 AND is_duplicate = 0
           AND transaction_date BETWEEN ?2 AND ?3
         GROUP BY transaction_date
         ORDER BY transaction_date",
    )?;
    let rows = stmt.query_map(params![company_id, trend_from_s, to_s], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, i64>(2)?,
        ))
    })?;

    let mut by_date: HashMap<String, (i64, i64)> = HashMap::new();
    for row in rows {
        let (date, matched, unmatched) = row?;
        by_date.insert(date, (matched, unmatched));
    }

    let mut trend = Vec::new();
    let mut current = trend_from;
    while current <= to {
        let date = current.format("%Y-%m-%d").to_string();
        let (matched, unmatched) = by_date.get(&date).copied().unwrap_or((0, 0));
        trend.push(DailyTrendPoint {
            date,
            matched,
            unmatched,
        });
        current += Duration::days(1);
    }
    Ok(trend)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}
