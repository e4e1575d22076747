use std::fmt;
use std::sync::Arc;

use super::field::resolve_path;
use super::{Expression, ExpressionAttributes, ExpressionMap};
use crate::error::EvaluationError;
use crate::extraction::{FieldPath, InputDataExtractor};
use crate::runtime::context::EvaluationContext;
use crate::runtime::evaluator;
use crate::value::{EvaluationResult, ResourceValue, Value};

/// Evaluates another template and yields its values as a structured value.
///
/// With `standalone`, every nested result becomes an auxiliary resource of its
/// own and the expression yields its `Type/id` reference instead.
#[derive(Debug, Clone)]
pub struct NestedResourceExpression {
    resource_type: String,
    template: Arc<ExpressionMap>,
    path: Option<FieldPath>,
    standalone: bool,
    attributes: ExpressionAttributes,
}

impl NestedResourceExpression {
    pub fn new(resource_type: impl Into<String>, template: Arc<ExpressionMap>) -> Self {
        Self {
            resource_type: resource_type.into(),
            template,
            path: None,
            standalone: false,
            attributes: ExpressionAttributes::default(),
        }
    }

    /// Evaluate the nested template against the value at `path` instead of the
    /// current base.
    pub fn with_path(mut self, path: &str) -> Self {
        self.path = Some(FieldPath::from_dotted(path));
        self
    }

    pub fn standalone(mut self) -> Self {
        self.standalone = true;
        self
    }

    pub fn with_attributes(mut self, attributes: ExpressionAttributes) -> Self {
        self.attributes = attributes;
        self
    }

    fn bases(
        &self,
        data: &dyn InputDataExtractor,
        context: &EvaluationContext,
        base: &EvaluationResult,
    ) -> Result<Vec<EvaluationResult>, EvaluationError> {
        let Some(path) = &self.path else {
            return Ok(vec![base.clone()]);
        };

        Ok(match resolve_path(data, context, base, path)?.into_value() {
            None => Vec::new(),
            Some(Value::List(items)) if items.iter().all(is_structured) => {
                items.into_iter().map(EvaluationResult::new).collect()
            }
            Some(value) => vec![EvaluationResult::new(value)],
        })
    }

    fn evaluate_one(
        &self,
        data: &dyn InputDataExtractor,
        context: &EvaluationContext,
        base: &EvaluationResult,
    ) -> Result<Option<(Value, Vec<ResourceValue>)>, EvaluationError> {
        let Some(result) = evaluator::evaluate(data, context, base, &self.template)? else {
            return Ok(None);
        };

        let (values, mut resources, pending) = result.into_parts();
        if let Some(pending) = pending {
            tracing::warn!(
                resource_type = %self.resource_type,
                deferred = pending.len(),
                "Deferred expressions in a nested template are not resolved"
            );
        }
        if values.is_empty() {
            return Ok(None);
        }

        if self.standalone {
            let resource = ResourceValue::with_generated_id(&self.resource_type, values);
            let reference = resource.reference();
            tracing::debug!(reference = %reference, "Built standalone resource");
            resources.push(resource);
            Ok(Some((Value::String(reference), resources)))
        } else {
            Ok(Some((Value::Map(values), resources)))
        }
    }
}

fn is_structured(value: &Value) -> bool {
    matches!(value, Value::Map(_) | Value::Resource(_) | Value::Object(_))
}

impl fmt::Display for NestedResourceExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(f, "resource({} from {})", self.resource_type, path),
            None => write!(f, "resource({})", self.resource_type),
        }
    }
}

impl Expression for NestedResourceExpression {
    fn evaluate(
        &self,
        data: &dyn InputDataExtractor,
        context: &EvaluationContext,
        base: &EvaluationResult,
    ) -> Result<EvaluationResult, EvaluationError> {
        self.attributes.apply(self, data, context, base, |local| {
            let bases = self.bases(data, local, base)?;
            let many = self.path.is_some() && bases.len() > 1;

            let mut values = Vec::new();
            let mut resources = Vec::new();
            for nested_base in &bases {
                if let Some((value, built)) = self.evaluate_one(data, local, nested_base)? {
                    values.push(value);
                    resources.extend(built);
                }
            }

            let value = match values.len() {
                0 => return Ok(EvaluationResult::empty()),
                1 if !many => values.remove(0),
                _ => Value::List(values),
            };
            Ok(EvaluationResult::new(value).with_additional_resources(resources))
        })
    }

    fn is_evaluate_later(&self) -> bool {
        self.attributes.evaluate_later
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::{ExpressionRef, FieldPathExpression, LiteralExpression};
    use crate::extraction::JsonMessageData;
    use serde_json::json;

    fn data() -> JsonMessageData {
        JsonMessageData::new("VXU_V04")
            .with_segment("ORC", orc())
            .with_segment("OBX", json!(["1", "CE", ["64994-7", "Eligibility", "LN"]]))
            .with_segment("OBX", json!(["2", "CE", ["30956-7", "Vaccine type", "LN"]]))
    }

    /// ORC with only ORC.1 and ORC.12 (ordering provider) populated.
    fn orc() -> serde_json::Value {
        let mut fields = vec![json!(""); 12];
        fields[0] = json!("RE");
        fields[11] = json!(["MD67895", "Pediatric", "MARY"]);
        serde_json::Value::Array(fields)
    }

    fn field(path: &str) -> ExpressionRef {
        Arc::new(FieldPathExpression::new(path))
    }

    fn template(entries: Vec<(&str, ExpressionRef)>) -> Arc<ExpressionMap> {
        Arc::new(entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }

    #[test]
    fn test_nested_datatype_from_path() {
        let name = template(vec![
            ("family", field("2")),
            ("given", field("3")),
        ]);
        let expr = NestedResourceExpression::new("HumanName", name).with_path("ORC.12");

        let result = expr
            .evaluate(&data(), &EvaluationContext::new(), &EvaluationResult::empty())
            .unwrap();
        assert_eq!(
            result.value().unwrap().to_json().unwrap(),
            json!({"family": "Pediatric", "given": "MARY"})
        );
        assert!(result.additional_resources().is_empty());
    }

    #[test]
    fn test_standalone_builds_auxiliary_resource() {
        let practitioner = template(vec![
            ("identifier", field("1")),
            ("resourceKind", Arc::new(LiteralExpression::new("person")) as ExpressionRef),
        ]);
        let expr = NestedResourceExpression::new("Practitioner", practitioner)
            .with_path("ORC.12")
            .standalone();

        let result = expr
            .evaluate(&data(), &EvaluationContext::new(), &EvaluationResult::empty())
            .unwrap();

        let built = result.additional_resources();
        assert_eq!(built.len(), 1);
        assert_eq!(built[0].resource_type(), "Practitioner");
        assert_eq!(built[0].get("identifier"), Some(&Value::from("MD67895")));
        assert_eq!(result.value(), Some(&Value::String(built[0].reference())));
    }

    #[test]
    fn test_one_result_per_segment_repetition() {
        let obs = template(vec![("code", field("3.1"))]);
        let ctx = EvaluationContext::new().with("observations", data().get_segment("OBX").unwrap());
        let expr = NestedResourceExpression::new("Observation", obs).with_path("$observations");

        let result = expr.evaluate(&data(), &ctx, &EvaluationResult::empty()).unwrap();
        assert_eq!(
            result.value().unwrap().to_json().unwrap(),
            json!([{"code": "64994-7"}, {"code": "30956-7"}])
        );
    }

    #[test]
    fn test_missing_path_is_empty() {
        let obs = template(vec![("code", field("3.1"))]);
        let expr = NestedResourceExpression::new("Observation", obs).with_path("PV1.3");

        let result = expr
            .evaluate(&data(), &EvaluationContext::new(), &EvaluationResult::empty())
            .unwrap();
        assert!(result.is_empty());
    }
}
