// src/services/approval/domain.rs

//! Rule domains: prefix-notation filters over a JSON record snapshot.
//!
//! `["&", ["state", "=", "confirmed"], "!", ["amount", ">", 100]]` reads as
//! `state = confirmed AND NOT amount > 100`. Consecutive terms without an
//! operator are AND-ed.

use rust_decimal::Decimal;
use serde_json::Value;
use std::cmp::Ordering;
use std::str::FromStr;

use crate::errors::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    In,
    NotIn,
    Like,
    ILike,
    EqLike,
}

impl FromStr for Operator {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "=" | "==" => Operator::Eq,
            "!=" | "<>" => Operator::Ne,
            ">" => Operator::Gt,
            ">=" => Operator::Ge,
            "<" => Operator::Lt,
            "<=" => Operator::Le,
            "in" => Operator::In,
            "not in" => Operator::NotIn,
            "like" => Operator::Like,
            "ilike" => Operator::ILike,
            "=like" => Operator::EqLike,
            other => {
                return Err(AppError::Validation(format!(
                    "unknown domain operator '{}'",
                    other
                )));
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Domain {
    All,
    Term {
        path: String,
        op: Operator,
        value: Value,
    },
    Not(Box<Domain>),
    And(Box<Domain>, Box<Domain>),
    Or(Box<Domain>, Box<Domain>),
}

impl Domain {
    /// Parses a domain; `null` and `[]` match everything.
    pub fn parse(raw: Option<&Value>) -> AppResult<Domain> {
        let items = match raw {
            None | Some(Value::Null) => return Ok(Domain::All),
            Some(Value::Array(items)) => items,
            Some(other) => {
                return Err(AppError::Validation(format!(
                    "domain must be a list, got {}",
                    other
                )));
            }
        };

        // prefix notation evaluates naturally right to left
        let mut stack: Vec<Domain> = Vec::new();
        for item in items.iter().rev() {
            match item {
                Value::String(op) if op == "!" => {
                    let operand = pop(&mut stack, op)?;
                    stack.push(Domain::Not(Box::new(operand)));
                }
                Value::String(op) if op == "&" || op == "|" => {
                    let left = pop(&mut stack, op)?;
                    let right = pop(&mut stack, op)?;
                    stack.push(if op == "&" {
                        Domain::And(Box::new(left), Box::new(right))
                    } else {
                        Domain::Or(Box::new(left), Box::new(right))
                    });
                }
                Value::Array(term) => stack.push(parse_term(term)?),
                other => {
                    return Err(AppError::Validation(format!(
                        "unexpected domain element {}",
                        other
                    )));
                }
            }
        }

        let mut domain = match stack.pop() {
            Some(first) => first,
            None => return Ok(Domain::All),
        };
        while let Some(next) = stack.pop() {
            domain = Domain::And(Box::new(domain), Box::new(next));
        }
        Ok(domain)
    }

    pub fn matches(&self, record: &Value) -> bool {
        match self {
            Domain::All => true,
            Domain::Not(inner) => !inner.matches(record),
            Domain::And(a, b) => a.matches(record) && b.matches(record),
            Domain::Or(a, b) => a.matches(record) || b.matches(record),
            Domain::Term { path, op, value } => {
                let field = lookup(record, path);
                evaluate(field, *op, value)
            }
        }
    }
}

fn pop(stack: &mut Vec<Domain>, op: &str) -> AppResult<Domain> {
    stack
        .pop()
        .ok_or_else(|| AppError::Validation(format!("operator '{}' is missing operands", op)))
}

fn parse_term(term: &[Value]) -> AppResult<Domain> {
    match term {
        [Value::String(path), Value::String(op), value] => Ok(Domain::Term {
            path: path.clone(),
            op: op.parse()?,
            value: value.clone(),
        }),
        _ => Err(AppError::Validation(format!(
            "domain term must be [field, operator, value], got {}",
            Value::Array(term.to_vec())
        ))),
    }
}

pub(super) fn lookup<'a>(record: &'a Value, path: &str) -> &'a Value {
    path.split('.')
        .try_fold(record, |current, key| current.get(key))
        .unwrap_or(&Value::Null)
}

fn as_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => Decimal::from_str(&n.to_string())
            .or_else(|_| Decimal::from_scientific(&n.to_string()))
            .ok(),
        Value::String(s) => Decimal::from_str(s.trim()).ok(),
        _ => None,
    }
}

fn equals(field: &Value, value: &Value) -> bool {
    match (field, value) {
        // unset fields compare equal to false
        (Value::Null, Value::Bool(false)) | (Value::Bool(false), Value::Null) => true,
        (Value::Array(items), v) if !v.is_array() => items.iter().any(|item| equals(item, v)),
        _ => match (as_decimal(field), as_decimal(value)) {
            (Some(a), Some(b)) => a == b,
            _ => field == value,
        },
    }
}

fn compare(field: &Value, value: &Value) -> Option<Ordering> {
    if let (Some(a), Some(b)) = (as_decimal(field), as_decimal(value)) {
        return Some(a.cmp(&b));
    }
    match (field, value) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn evaluate(field: &Value, op: Operator, value: &Value) -> bool {
    match op {
        Operator::Eq => equals(field, value),
        Operator::Ne => !equals(field, value),
        Operator::Gt => compare(field, value) == Some(Ordering::Greater),
        Operator::Ge => matches!(compare(field, value), Some(Ordering::Greater | Ordering::Equal)),
        Operator::Lt => compare(field, value) == Some(Ordering::Less),
        Operator::Le => matches!(compare(field, value), Some(Ordering::Less | Ordering::Equal)),
        Operator::In => member(field, value),
        Operator::NotIn => !member(field, value),
        Operator::Like => text(field).zip(text(value)).is_some_and(|(f, v)| f.contains(&v)),
        Operator::ILike => text(field)
            .zip(text(value))
            .is_some_and(|(f, v)| f.to_lowercase().contains(&v.to_lowercase())),
        Operator::EqLike => text(field)
            .zip(text(value))
            .is_some_and(|(f, pattern)| like_pattern(&f, &pattern)),
    }
}

fn member(field: &Value, value: &Value) -> bool {
    match value {
        Value::Array(options) => options.iter().any(|option| equals(field, option)),
        single => equals(field, single),
    }
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// SQL `LIKE` matching with `%` and `_` wildcards.
fn like_pattern(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    // matched[j]: pattern[..j] matches the text consumed so far
    let mut matched = vec![false; pattern.len() + 1];
    matched[0] = true;
    for j in 1..=pattern.len() {
        matched[j] = matched[j - 1] && pattern[j - 1] == '%';
    }
    for c in text {
        let mut next = vec![false; pattern.len() + 1];
        for j in 1..=pattern.len() {
            next[j] = match pattern[j - 1] {
                '%' => next[j - 1] || matched[j],
                '_' => matched[j - 1],
                p => matched[j - 1] && p == c,
            };
        }
        matched = next;
    }
    matched[pattern.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(raw: Value) -> Domain {
        Domain::parse(Some(&raw)).unwrap()
    }

    #[test]
    fn empty_domain_matches_everything() {
        assert_eq!(Domain::parse(None).unwrap(), Domain::All);
        assert!(parse(json!([])).matches(&json!({"state": "draft"})));
    }

    #[test]
    fn prefix_operators_and_implicit_and() {
        let record = json!({"state": "confirmed", "amounts": {"amount_total": "150.00"}});

        let domain = parse(json!(["|", ["state", "=", "draft"], ["amounts.amount_total", ">", 100]]));
        assert!(domain.matches(&record));

        let domain = parse(json!([["state", "=", "confirmed"], "!", ["amounts.amount_total", ">=", 150]]));
        assert!(!domain.matches(&record));

        let domain = parse(json!(["&", "!", ["state", "in", ["draft", "cancelled"]], ["state", "like", "firm"]]));
        assert!(domain.matches(&record));
    }

    #[test]
    fn missing_fields_are_false() {
        let record = json!({"payment_token_id": null});
        assert!(parse(json!([["payment_token_id", "=", false]])).matches(&record));
        assert!(parse(json!([["partner.name", "=", false]])).matches(&record));
        assert!(!parse(json!([["partner.name", "ilike", "acme"]])).matches(&record));
    }

    #[test]
    fn like_variants() {
        let record = json!({"name": "SUB-00A1"});
        assert!(parse(json!([["name", "ilike", "sub-"]])).matches(&record));
        assert!(!parse(json!([["name", "like", "sub-"]])).matches(&record));
        assert!(parse(json!([["name", "=like", "SUB-__A%"]])).matches(&record));
        assert!(!parse(json!([["name", "=like", "SUB-_A%"]])).matches(&record));
    }

    #[test]
    fn malformed_domains_are_rejected() {
        assert!(Domain::parse(Some(&json!(["&", ["a", "=", 1]]))).is_err());
        assert!(Domain::parse(Some(&json!([["a", "~", 1]]))).is_err());
        assert!(Domain::parse(Some(&json!([["a", "="]]))).is_err());
        assert!(Domain::parse(Some(&json!({"a": 1}))).is_err());
    }
}
