use std::fmt;

use super::{Expression, ExpressionAttributes};
use crate::error::EvaluationError;
use crate::extraction::InputDataExtractor;
use crate::runtime::context::EvaluationContext;
use crate::value::{EvaluationResult, Value};

/// Turns the resource(s) bound to a context variable into reference strings.
///
/// Deferred by default: the referenced resources are usually built later in
/// the same message.
#[derive(Debug, Clone)]
pub struct ReferenceExpression {
    variable: String,
    attributes: ExpressionAttributes,
}

impl ReferenceExpression {
    pub fn new(variable: &str) -> Self {
        Self {
            variable: variable.trim_start_matches('$').to_string(),
            attributes: ExpressionAttributes::new().deferred(),
        }
    }

    /// Replace the attributes. A reference stays deferred unless `evaluate_later`
    /// is cleared explicitly.
    pub fn with_attributes(mut self, attributes: ExpressionAttributes) -> Self {
        self.attributes = attributes;
        self
    }

    fn reference(&self, value: &Value) -> Result<Value, EvaluationError> {
        match value {
            Value::Resource(resource) => Ok(Value::String(resource.reference())),
            Value::String(reference) if reference.contains('/') => Ok(Value::String(reference.clone())),
            other => Err(EvaluationError::IllegalArgument(format!(
                "Variable '{}' is not a resource: {}",
                self.variable, other
            ))),
        }
    }
}

impl fmt::Display for ReferenceExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reference(${})", self.variable)
    }
}

impl Expression for ReferenceExpression {
    fn evaluate(
        &self,
        data: &dyn InputDataExtractor,
        context: &EvaluationContext,
        base: &EvaluationResult,
    ) -> Result<EvaluationResult, EvaluationError> {
        self.attributes.apply(self, data, context, base, |local| {
            let value = match local.value(&self.variable) {
                None | Some(Value::Null) => return Ok(EvaluationResult::empty()),
                Some(Value::List(items)) => Value::List(
                    items
                        .iter()
                        .map(|item| self.reference(item))
                        .collect::<Result<Vec<_>, _>>()?,
                ),
                Some(single) => self.reference(single)?,
            };
            Ok(EvaluationResult::new(value))
        })
    }

    fn is_evaluate_later(&self) -> bool {
        self.attributes.evaluate_later
    }
}
