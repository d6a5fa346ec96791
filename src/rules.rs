use regex::RegexBuilder;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use tracing::{debug, warn};

use crate::config::ReconConfig;
use crate::domain::{RuleAction, TransactionDirection};
use crate::error::ReconResult;

/// Fields a rule condition may inspect. Anything else evaluates to false.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConditionField {
    Description,
    RemittanceInfo,
    DebtorName,
    CreditorName,
    Amount,
    TransactionType,
    Currency,
}

impl FromStr for ConditionField {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "description" => Ok(Self::Description),
            "remittance_info" => Ok(Self::RemittanceInfo),
            "debtor_name" => Ok(Self::DebtorName),
            "creditor_name" => Ok(Self::CreditorName),
            "amount" => Ok(Self::Amount),
            "transaction_type" => Ok(Self::TransactionType),
            "currency" => Ok(Self::Currency),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConditionOperator {
    Contains,
    Equals,
    GreaterThan,
    LessThan,
    StartsWith,
    EndsWith,
    Regex,
}

impl FromStr for ConditionOperator {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "contains" => Ok(Self::Contains),
            "equals" => Ok(Self::Equals),
            "greater_than" => Ok(Self::GreaterThan),
            "less_than" => Ok(Self::LessThan),
            "starts_with" => Ok(Self::StartsWith),
            "ends_with" => Ok(Self::EndsWith),
            "regex" => Ok(Self::Regex),
            _ => Err(()),
        }
    }
}

const AMOUNT_EPSILON: f64 = 0.01;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleCondition {
    pub field: String,
    pub operator: String,
    pub value: Value,
}

#[derive(Debug, Clone)]
pub struct MatchingRule {
    pub id: String,
    pub name: String,
    pub priority: i64,
    pub conditions: Vec<RuleCondition>,
    pub actions: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleMatch {
    pub rule_id: String,
    pub rule_name: String,
    pub priority: i64,
    pub actions: Value,
}

/// The transaction attributes rules can see. Amount is the absolute value
/// in major units; the sign lives in `direction`.
#[derive(Debug, Clone)]
pub struct TransactionFacts {
    pub description: String,
    pub remittance_info: String,
    pub debtor_name: String,
    pub creditor_name: String,
    pub amount: f64,
    pub direction: TransactionDirection,
    pub currency: String,
}

impl TransactionFacts {
    pub fn load(conn: &Connection, transaction_id: &str) -> ReconResult<Self> {
        let facts = conn.query_row(
            r#"
            SELECT description, remittance_info, debtor_name, creditor_name,
                   amount_cents, direction, currency
            FROM bank_transactions WHERE id = ?1
            "#,
            params![transaction_id],
            |row| {
                let amount_cents: i64 = row.get(4)?;
                let direction_raw: String = row.get(5)?;
                Ok(TransactionFacts {
                    description: row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                    remittance_info: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    debtor_name: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    creditor_name: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                    amount: amount_cents.abs() as f64 / 100.0,
                    direction: direction_raw
                        .parse()
                        .unwrap_or(TransactionDirection::Credit),
                    currency: row.get(6)?,
                })
            },
        )?;
        Ok(facts)
    }
}

/// Returns every active rule whose conditions all hold, highest priority
/// first. No short-circuit and no action merging; that is the caller's
/// policy.
pub fn apply_rules(
    conn: &Connection,
    company_id: &str,
    facts: &TransactionFacts,
    cfg: &ReconConfig,
) -> ReconResult<Vec<RuleMatch>> {
    let rules = load_active_rules(conn, company_id)?;
    let mut matches = Vec::new();
    for rule in rules {
        if rule_matches(&rule, facts, cfg) {
            debug!(rule_id = rule.id, rule_name = rule.name, "rule matched");
            matches.push(RuleMatch {
                rule_id: rule.id,
                rule_name: rule.name,
                priority: rule.priority,
                actions: rule.actions,
            });
        }
    }
    Ok(matches)
}

pub fn load_active_rules(conn: &Connection, company_id: &str) -> ReconResult<Vec<MatchingRule>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT id, name, priority, conditions, actions
        FROM matching_rules
        WHERE company_id = ?1 AND active = 1
        ORDER BY priority DESC, id ASC
        "#,
    )?;
    let rows = stmt.query_map(params![company_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
        ))
    })?;

    let mut rules = Vec::new();
    for row in rows {
        let (id, name, priority, conditions_json, actions_json) = row?;
        let conditions = match serde_json::from_str::<Vec<RuleCondition>>(&conditions_json) {
            Ok(conditions) => conditions,
            Err(err) => {
                warn!(rule_id = id, error = %err, "rule conditions are not a valid array");
                Vec::new()
            }
        };
        let actions = parse_actions(&id, &actions_json);
        rules.push(MatchingRule {
            id,
            name,
            priority,
            conditions,
            actions,
        });
    }
    Ok(rules)
}

/// Actions are validated at the boundary. The stored shape is a list of
/// `{type, params}` entries; a plain object keyed by action type is
/// accepted as well. Unknown action types are dropped with a warning,
/// known ones pass through untouched.
fn parse_actions(rule_id: &str, actions_json: &str) -> Value {
    let parsed: Value = match serde_json::from_str(actions_json) {
        Ok(v) => v,
        Err(err) => {
            warn!(rule_id, error = %err, "rule actions are not valid json");
            return Value::Array(Vec::new());
        }
    };
    match parsed {
        Value::Array(entries) => {
            let mut kept = Vec::new();
            for entry in entries {
                match entry.get("type").and_then(Value::as_str) {
                    Some(t) if t.parse::<RuleAction>().is_ok() => kept.push(entry),
                    Some(t) => warn!(rule_id, action = t, "unknown rule action dropped"),
                    None => warn!(rule_id, "rule action entry without a type dropped"),
                }
            }
            Value::Array(kept)
        }
        Value::Object(map) => {
            let mut kept = serde_json::Map::new();
            for (key, value) in map {
                if key.parse::<RuleAction>().is_ok() {
                    kept.insert(key, value);
                } else {
                    warn!(rule_id, action = key, "unknown rule action dropped");
                }
            }
            Value::Object(kept)
        }
        other => {
            warn!(rule_id, json = %other, "rule actions are neither a list nor an object");
            Value::Array(Vec::new())
        }
    }
}

/// All conditions must hold; an empty condition list never matches.
pub fn rule_matches(rule: &MatchingRule, facts: &TransactionFacts, cfg: &ReconConfig) -> bool {
    if rule.conditions.is_empty() {
        return false;
    }
    rule.conditions
        .iter()
        .all(|cond| evaluate_condition(cond, facts, cfg))
}

fn evaluate_condition(cond: &RuleCondition, facts: &TransactionFacts, cfg: &ReconConfig) -> bool {
    let Ok(field) = cond.field.parse::<ConditionField>() else {
        warn!(field = cond.field, "unknown condition field");
        return false;
    };
    let Ok(operator) = cond.operator.parse::<ConditionOperator>() else {
        warn!(operator = cond.operator, "unknown condition operator");
        return false;
    };

    if field == ConditionField::Amount {
        return evaluate_numeric(operator, facts.amount, &cond.value);
    }

    let actual = match field {
        ConditionField::Description => facts.description.as_str(),
        ConditionField::RemittanceInfo => facts.remittance_info.as_str(),
        ConditionField::DebtorName => facts.debtor_name.as_str(),
        ConditionField::CreditorName => facts.creditor_name.as_str(),
        ConditionField::TransactionType => facts.direction.as_str(),
        ConditionField::Currency => facts.currency.as_str(),
        ConditionField::Amount => unreachable!(),
    };
    evaluate_string(operator, actual, &cond.value, cfg)
}

fn evaluate_numeric(operator: ConditionOperator, actual: f64, expected: &Value) -> bool {
    let Some(expected) = value_as_f64(expected) else {
        warn!("numeric condition value is not a number");
        return false;
    };
    match operator {
        ConditionOperator::Equals => (actual - expected).abs() <= AMOUNT_EPSILON,
        ConditionOperator::GreaterThan => actual > expected,
        ConditionOperator::LessThan => actual < expected,
        _ => {
            warn!(?operator, "operator not applicable to amount");
            false
        }
    }
}

fn evaluate_string(
    operator: ConditionOperator,
    actual: &str,
    expected: &Value,
    cfg: &ReconConfig,
) -> bool {
    let expected = match expected {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => {
            warn!("condition value is not comparable to a string");
            return false;
        }
    };
    let actual_lower = actual.to_lowercase();
    let expected_lower = expected.to_lowercase();

    match operator {
        ConditionOperator::Contains => actual_lower.contains(&expected_lower),
        ConditionOperator::Equals => actual_lower == expected_lower,
        ConditionOperator::StartsWith => actual_lower.starts_with(&expected_lower),
        ConditionOperator::EndsWith => actual_lower.ends_with(&expected_lower),
        ConditionOperator::GreaterThan | ConditionOperator::LessThan => {
            let (Ok(a), Ok(b)) = (actual.trim().parse::<f64>(), expected.trim().parse::<f64>())
            else {
                return false;
            };
            if operator == ConditionOperator::GreaterThan {
                a > b
            } else {
                a < b
            }
        }
        ConditionOperator::Regex => evaluate_regex(actual, &expected, cfg),
    }
}

/// Untrusted patterns get three layers of defense: a length cap, a
/// repeated-wildcard rejection, and the engine's compiled-size budget.
/// Every failure is a non-match, never an error.
fn evaluate_regex(actual: &str, pattern: &str, cfg: &ReconConfig) -> bool {
    if pattern.len() > cfg.max_regex_pattern_len {
        warn!(len = pattern.len(), "regex pattern exceeds length cap");
        return false;
    }
    if has_repeated_wildcards(pattern) {
        warn!(pattern, "regex pattern rejected by wildcard heuristic");
        return false;
    }
    let compiled = RegexBuilder::new(pattern)
        .case_insensitive(true)
        .size_limit(cfg.regex_size_limit)
        .build();
    match compiled {
        Ok(re) => re.is_match(actual),
        Err(err) => {
            warn!(pattern, error = %err, "regex pattern failed to compile");
            false
        }
    }
}

/// Three or more consecutive `.*` or `.+` groups.
fn has_repeated_wildcards(pattern: &str) -> bool {
    pattern.contains(".*.*.*") || pattern.contains(".+.+.+")
}

fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}
