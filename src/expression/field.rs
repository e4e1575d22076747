use std::fmt;

use super::{Expression, ExpressionAttributes};
use crate::error::EvaluationError;
use crate::extraction::{navigate, FieldPath, InputDataExtractor, PathSegment};
use crate::runtime::context::EvaluationContext;
use crate::runtime::evaluator::extract_field;
use crate::value::EvaluationResult;

/// Reads a value from the message, the base or a context variable.
///
/// `RXA.5.1 | RXA.5.4` tries each alternative in order; the first non-empty
/// one wins.
#[derive(Debug, Clone)]
pub struct FieldPathExpression {
    raw: String,
    paths: Vec<FieldPath>,
    attributes: ExpressionAttributes,
}

impl FieldPathExpression {
    pub fn new(spec: &str) -> Self {
        let paths = spec
            .split('|')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(FieldPath::from_dotted)
            .collect();

        Self {
            raw: spec.trim().to_string(),
            paths,
            attributes: ExpressionAttributes::default(),
        }
    }

    pub fn with_attributes(mut self, attributes: ExpressionAttributes) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn paths(&self) -> &[FieldPath] {
        &self.paths
    }
}

impl fmt::Display for FieldPathExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "field({})", self.raw)
    }
}

impl Expression for FieldPathExpression {
    fn evaluate(
        &self,
        data: &dyn InputDataExtractor,
        context: &EvaluationContext,
        base: &EvaluationResult,
    ) -> Result<EvaluationResult, EvaluationError> {
        self.attributes.apply(self, data, context, base, |local| {
            for path in &self.paths {
                let found = resolve_path(data, local, base, path)?;
                if !found.is_empty() {
                    return Ok(found);
                }
            }
            Ok(EvaluationResult::empty())
        })
    }

    fn is_evaluate_later(&self) -> bool {
        self.attributes.evaluate_later
    }
}

/// Resolve one path. `$var` paths read from the context; everything else goes
/// to the data extractor.
pub(crate) fn resolve_path(
    data: &dyn InputDataExtractor,
    context: &EvaluationContext,
    base: &EvaluationResult,
    path: &FieldPath,
) -> Result<EvaluationResult, EvaluationError> {
    let Some(name) = path.variable() else {
        return data.get_field(path, base);
    };

    // Resources attached to the variable's result were already collected by
    // whoever bound it.
    let mut current = EvaluationResult::from_option(context.value(name).cloned());
    for segment in path.tail() {
        if current.is_empty() {
            break;
        }
        current = match segment {
            PathSegment::Field(key) => extract_field(key, &current)?,
            PathSegment::Index(_) => EvaluationResult::from_option(
                current
                    .value()
                    .and_then(|v| navigate(v, std::slice::from_ref(segment))),
            ),
        };
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::JsonMessageData;
    use crate::value::Value;
    use serde_json::json;

    fn data() -> JsonMessageData {
        JsonMessageData::new("VXU_V04")
            .with_segment("RXA", json!(["0", "1", "20130531", "", ["", "", "", "998", "No vaccine"]]))
    }

    #[test]
    fn test_first_non_empty_alternative_wins() {
        let expr = FieldPathExpression::new("RXA.5.1 | RXA.5.4");
        assert_eq!(expr.paths().len(), 2);

        let result = expr
            .evaluate(&data(), &EvaluationContext::new(), &EvaluationResult::empty())
            .unwrap();
        assert_eq!(result.value(), Some(&Value::from("998")));
    }

    #[test]
    fn test_variable_path() {
        let ctx = EvaluationContext::new().with(
            "code",
            EvaluationResult::new(Value::from(json!({"system": "CVX", "values": ["48", "49"]}))),
        );

        let system = FieldPathExpression::new("$code.system")
            .evaluate(&data(), &ctx, &EvaluationResult::empty())
            .unwrap();
        assert_eq!(system.value(), Some(&Value::from("CVX")));

        let second = FieldPathExpression::new("$code.values.2")
            .evaluate(&data(), &ctx, &EvaluationResult::empty())
            .unwrap();
        assert_eq!(second.value(), Some(&Value::from("49")));

        let unbound = FieldPathExpression::new("$other.system")
            .evaluate(&data(), &ctx, &EvaluationResult::empty())
            .unwrap();
        assert!(unbound.is_empty());
    }

    #[test]
    fn test_variable_path_into_scalar_is_defect() {
        let ctx = EvaluationContext::new().with("code", EvaluationResult::new("48"));

        let result = FieldPathExpression::new("$code.system").evaluate(
            &data(),
            &ctx,
            &EvaluationResult::empty(),
        );
        assert!(matches!(result, Err(EvaluationError::IllegalArgument(_))));
    }
}
