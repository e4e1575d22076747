use std::fmt;

use super::{Expression, ExpressionAttributes};
use crate::error::EvaluationError;
use crate::extraction::InputDataExtractor;
use crate::runtime::context::EvaluationContext;
use crate::value::{EvaluationResult, Value};

/// A constant value.
#[derive(Debug, Clone)]
pub struct LiteralExpression {
    value: Value,
    attributes: ExpressionAttributes,
}

impl LiteralExpression {
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            attributes: ExpressionAttributes::default(),
        }
    }

    pub fn with_attributes(mut self, attributes: ExpressionAttributes) -> Self {
        self.attributes = attributes;
        self
    }
}

impl fmt::Display for LiteralExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "literal({})", self.value)
    }
}

impl Expression for LiteralExpression {
    fn evaluate(
        &self,
        data: &dyn InputDataExtractor,
        context: &EvaluationContext,
        base: &EvaluationResult,
    ) -> Result<EvaluationResult, EvaluationError> {
        self.attributes.apply(self, data, context, base, |_| {
            Ok(EvaluationResult::new(self.value.clone()))
        })
    }

    fn is_evaluate_later(&self) -> bool {
        self.attributes.evaluate_later
    }
}
