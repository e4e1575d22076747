//! Conditions guarding expression evaluation.
//!
//! ```text
//! $status NOT_NULL
//! $status EQUALS CP && $refusal NULL
//! $code IN 00, 01 || $source NOT_NULL
//! ```
//!
//! `&&` binds tighter than `||`. There are no parentheses.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

use crate::error::ConfigError;
use crate::runtime::context::EvaluationContext;
use crate::value::Value;

static CLAUSE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\$([A-Za-z_][A-Za-z0-9_]*)\s+(NOT_NULL|NULL|NOT_EQUALS|EQUALS|IN)(?:\s+(.*))?$").unwrap()
});

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Null(String),
    NotNull(String),
    Equals(String, String),
    NotEquals(String, String),
    In(String, Vec<String>),
    And(Vec<Condition>),
    Or(Vec<Condition>),
}

impl Condition {
    /// Parse a condition string.
    ///
    /// # Example
    ///
    /// ```
    /// use v2fhir::expression::Condition;
    ///
    /// let cond = Condition::parse("$code IN 00, 01 && $refusal NULL").unwrap();
    /// assert!(matches!(cond, Condition::And(_)));
    /// ```
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let mut alternatives = Vec::new();
        for alternative in raw.split("||") {
            let mut conjuncts = Vec::new();
            for part in alternative.split("&&") {
                conjuncts.push(parse_clause(raw, part.trim())?);
            }
            alternatives.push(collapse(conjuncts, Condition::And));
        }

        Ok(collapse(alternatives, Condition::Or))
    }

    /// Test the condition against `context`.
    ///
    /// A variable counts as null when it is unbound, bound to the empty result,
    /// bound to `null`, an empty string or an empty list.
    pub fn evaluate(&self, context: &EvaluationContext) -> bool {
        match self {
            Condition::Null(var) => lookup(context, var).is_none(),
            Condition::NotNull(var) => lookup(context, var).is_some(),
            Condition::Equals(var, expected) => text(context, var).as_deref() == Some(expected.as_str()),
            Condition::NotEquals(var, expected) => text(context, var).as_deref() != Some(expected.as_str()),
            Condition::In(var, options) => match text(context, var) {
                Some(actual) => options.iter().any(|o| *o == actual),
                None => false,
            },
            Condition::And(all) => all.iter().all(|c| c.evaluate(context)),
            Condition::Or(any) => any.iter().any(|c| c.evaluate(context)),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Null(var) => write!(f, "${} NULL", var),
            Condition::NotNull(var) => write!(f, "${} NOT_NULL", var),
            Condition::Equals(var, v) => write!(f, "${} EQUALS {}", var, v),
            Condition::NotEquals(var, v) => write!(f, "${} NOT_EQUALS {}", var, v),
            Condition::In(var, options) => write!(f, "${} IN {}", var, options.join(", ")),
            Condition::And(all) => write_joined(f, all, " && "),
            Condition::Or(any) => write_joined(f, any, " || "),
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, parts: &[Condition], separator: &str) -> fmt::Result {
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            f.write_str(separator)?;
        }
        write!(f, "{}", part)?;
    }
    Ok(())
}

fn parse_clause(raw: &str, part: &str) -> Result<Condition, ConfigError> {
    let caps = CLAUSE_REGEX
        .captures(part)
        .ok_or_else(|| invalid(raw, format!("cannot parse '{}'", part)))?;

    let var = caps[1].to_string();
    let operand = caps.get(3).map(|m| m.as_str().trim()).unwrap_or("");

    match &caps[2] {
        "NULL" | "NOT_NULL" if !operand.is_empty() => {
            Err(invalid(raw, format!("'{}' takes no operand", &caps[2])))
        }
        "NULL" => Ok(Condition::Null(var)),
        "NOT_NULL" => Ok(Condition::NotNull(var)),
        _ if operand.is_empty() => Err(invalid(raw, format!("'{}' needs an operand", &caps[2]))),
        "EQUALS" => Ok(Condition::Equals(var, unquote(operand))),
        "NOT_EQUALS" => Ok(Condition::NotEquals(var, unquote(operand))),
        _ => {
            let list = operand
                .strip_prefix('[')
                .and_then(|s| s.strip_suffix(']'))
                .unwrap_or(operand);
            let options = list
                .split(',')
                .map(|s| unquote(s.trim()))
                .filter(|s| !s.is_empty())
                .collect();
            Ok(Condition::In(var, options))
        }
    }
}

fn collapse(mut parts: Vec<Condition>, combine: fn(Vec<Condition>) -> Condition) -> Condition {
    if parts.len() == 1 {
        parts.remove(0)
    } else {
        combine(parts)
    }
}

fn unquote(s: &str) -> String {
    for quote in ['\'', '"'] {
        if let Some(inner) = s.strip_prefix(quote).and_then(|s| s.strip_suffix(quote)) {
            return inner.to_string();
        }
    }
    s.to_string()
}

fn invalid(raw: &str, reason: String) -> ConfigError {
    ConfigError::InvalidCondition {
        condition: raw.to_string(),
        reason,
    }
}

fn lookup<'a>(context: &'a EvaluationContext, var: &str) -> Option<&'a Value> {
    match context.value(var)? {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::List(items) if items.is_empty() => None,
        value => Some(value),
    }
}

fn text(context: &EvaluationContext, var: &str) -> Option<String> {
    lookup(context, var).and_then(Value::as_text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::EvaluationResult;

    fn ctx() -> EvaluationContext {
        EvaluationContext::new()
            .with("status", EvaluationResult::new("CP"))
            .with("dose", EvaluationResult::new(2))
            .with("blank", EvaluationResult::new(""))
            .with("NULL", EvaluationResult::empty())
    }

    #[test]
    fn test_null_checks() {
        let ctx = ctx();
        assert!(Condition::parse("$missing NULL").unwrap().evaluate(&ctx));
        assert!(Condition::parse("$NULL NULL").unwrap().evaluate(&ctx));
        assert!(Condition::parse("$blank NULL").unwrap().evaluate(&ctx));
        assert!(Condition::parse("$status NOT_NULL").unwrap().evaluate(&ctx));
    }

    #[test]
    fn test_equality_uses_string_form() {
        let ctx = ctx();
        assert!(Condition::parse("$status EQUALS CP").unwrap().evaluate(&ctx));
        assert!(Condition::parse("$status EQUALS 'CP'").unwrap().evaluate(&ctx));
        assert!(Condition::parse("$dose EQUALS 2").unwrap().evaluate(&ctx));
        assert!(Condition::parse("$status NOT_EQUALS RE").unwrap().evaluate(&ctx));
        assert!(Condition::parse("$missing NOT_EQUALS RE").unwrap().evaluate(&ctx));
    }

    #[test]
    fn test_in_list() {
        let ctx = ctx();
        assert!(Condition::parse("$status IN RE, CP").unwrap().evaluate(&ctx));
        assert!(Condition::parse("$status IN [RE, CP]").unwrap().evaluate(&ctx));
        assert!(!Condition::parse("$status IN RE, NA").unwrap().evaluate(&ctx));
        assert!(!Condition::parse("$missing IN RE").unwrap().evaluate(&ctx));
    }

    #[test]
    fn test_and_binds_tighter_than_or() {
        let ctx = ctx();
        // false && false || true
        let cond = Condition::parse("$status NULL && $dose NULL || $status EQUALS CP").unwrap();
        assert!(matches!(cond, Condition::Or(ref parts) if parts.len() == 2));
        assert!(cond.evaluate(&ctx));

        let cond = Condition::parse("$status NOT_NULL && $missing NOT_NULL").unwrap();
        assert!(!cond.evaluate(&ctx));
    }

    #[test]
    fn test_display_round_trips_text() {
        let cond = Condition::parse("$a NULL && $b IN x, y").unwrap();
        assert_eq!(cond.to_string(), "$a NULL && $b IN x, y");
    }

    #[test]
    fn test_parse_from_many_threads() {
        let handles: Vec<_> = (0..4)
            .map(|i| {
                std::thread::spawn(move || {
                    (0..50)
                        .map(|_| Condition::parse(&format!("$dose EQUALS {} || $status NULL", i)).map(|c| c.to_string()))
                        .collect::<Result<Vec<_>, _>>()
                })
            })
            .collect();

        for (i, handle) in handles.into_iter().enumerate() {
            let parsed = handle.join().unwrap().unwrap();
            assert_eq!(parsed.len(), 50);
            assert!(parsed.iter().all(|c| *c == format!("$dose EQUALS {} || $status NULL", i)));
        }
    }

    #[test]
    fn test_invalid_conditions() {
        for raw in ["status NULL", "$status MAYBE", "$status EQUALS", "$a NULL &&", "$a NULL x"] {
            assert!(
                matches!(Condition::parse(raw), Err(ConfigError::InvalidCondition { .. })),
                "expected '{}' to be rejected",
                raw
            );
        }
    }
}
