use std::fmt;
use std::sync::Arc;

use super::{Expression, ExpressionAttributes, ExpressionMap};
use crate::error::EvaluationError;
use crate::extraction::InputDataExtractor;
use crate::runtime::context::EvaluationContext;
use crate::transform_registry::{TransformArgs, TransformRegistry};
use crate::value::{EvaluationResult, Value};

/// Calls a registered transform with named argument expressions.
///
/// Arguments that resolve to nothing are passed as `null`. A `null` result is
/// treated as no value.
#[derive(Debug, Clone)]
pub struct ScriptExpression {
    transform: String,
    args: ExpressionMap,
    registry: Arc<TransformRegistry>,
    attributes: ExpressionAttributes,
}

impl ScriptExpression {
    pub fn new(transform: impl Into<String>, args: ExpressionMap, registry: Arc<TransformRegistry>) -> Self {
        Self {
            transform: transform.into(),
            args,
            registry,
            attributes: ExpressionAttributes::default(),
        }
    }

    pub fn with_attributes(mut self, attributes: ExpressionAttributes) -> Self {
        self.attributes = attributes;
        self
    }
}

impl fmt::Display for ScriptExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.args.keys().map(String::as_str).collect();
        write!(f, "{}({})", self.transform, names.join(", "))
    }
}

impl Expression for ScriptExpression {
    fn evaluate(
        &self,
        data: &dyn InputDataExtractor,
        context: &EvaluationContext,
        base: &EvaluationResult,
    ) -> Result<EvaluationResult, EvaluationError> {
        self.attributes.apply(self, data, context, base, |local| {
            let mut args = TransformArgs::new();
            let mut resources = Vec::new();
            for (name, arg) in &self.args {
                let (value, built) = arg.evaluate(data, local, base)?.into_parts();
                resources.extend(built);
                args.insert(name.clone(), value.unwrap_or(Value::Null));
            }

            // A null result discards whatever the arguments built.
            match self.registry.call(&self.transform, &args)? {
                Value::Null => Ok(EvaluationResult::empty()),
                value => Ok(EvaluationResult::new(value).with_additional_resources(resources)),
            }
        })
    }

    fn is_evaluate_later(&self) -> bool {
        self.attributes.evaluate_later || self.args.values().any(|a| a.is_evaluate_later())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureClass;
    use crate::expression::{ExpressionRef, FieldPathExpression, LiteralExpression, NestedResourceExpression};
    use crate::extraction::JsonMessageData;
    use crate::terminology::SystemUrlLookup;
    use serde_json::json;

    fn registry() -> Arc<TransformRegistry> {
        Arc::new(TransformRegistry::with_builtins(Arc::new(SystemUrlLookup::builtin().unwrap())))
    }

    fn args(entries: Vec<(&str, ExpressionRef)>) -> ExpressionMap {
        entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn test_transform_over_fields() {
        let data = JsonMessageData::new("VXU_V04").with_segment("RXA", json!(["0", "1", "20130531"]));
        let expr = ScriptExpression::new(
            "hl7_date",
            args(vec![("value", Arc::new(FieldPathExpression::new("RXA.3")) as ExpressionRef)]),
            registry(),
        );

        let result = expr
            .evaluate(&data, &EvaluationContext::new(), &EvaluationResult::empty())
            .unwrap();
        assert_eq!(result.value(), Some(&Value::from("2013-05-31")));
    }

    #[test]
    fn test_missing_argument_yields_empty() {
        let data = JsonMessageData::new("VXU_V04");
        let expr = ScriptExpression::new(
            "uppercase",
            args(vec![("value", Arc::new(FieldPathExpression::new("RXA.9")) as ExpressionRef)]),
            registry(),
        );

        let result = expr
            .evaluate(&data, &EvaluationContext::new(), &EvaluationResult::empty())
            .unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_null_result_drops_argument_resources() {
        let data = JsonMessageData::new("VXU_V04")
            .with_segment("ORC", json!(["RE", "", "", "", "", "", "", "", "", "", "", ["MD67895", "Pediatric"]]));
        let practitioner = args(vec![("name", Arc::new(FieldPathExpression::new("2")) as ExpressionRef)]);
        let nested = NestedResourceExpression::new("Practitioner", Arc::new(practitioner))
            .with_path("ORC.12")
            .standalone();

        // `uppercase` only reads `value`, so it returns null here.
        let expr = ScriptExpression::new(
            "uppercase",
            args(vec![("other", Arc::new(nested) as ExpressionRef)]),
            registry(),
        );

        let result = expr
            .evaluate(&data, &EvaluationContext::new(), &EvaluationResult::empty())
            .unwrap();
        assert!(result.is_empty());
        assert!(result.additional_resources().is_empty());
    }

    #[test]
    fn test_unknown_transform_is_unhandled() {
        let data = JsonMessageData::new("VXU_V04");
        let expr = ScriptExpression::new(
            "no_such_transform",
            args(vec![("value", Arc::new(LiteralExpression::new("x")) as ExpressionRef)]),
            registry(),
        );

        let err = expr
            .evaluate(&data, &EvaluationContext::new(), &EvaluationResult::empty())
            .unwrap_err();
        assert_eq!(err.class(), FailureClass::Unhandled);
    }
}
