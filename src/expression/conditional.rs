use std::fmt;

use super::{Condition, Expression, ExpressionAttributes, ExpressionRef};
use crate::error::EvaluationError;
use crate::extraction::InputDataExtractor;
use crate::runtime::context::EvaluationContext;
use crate::value::EvaluationResult;

/// Chooses between two expressions based on a condition.
#[derive(Debug, Clone)]
pub struct ConditionalExpression {
    when: Condition,
    then: ExpressionRef,
    otherwise: Option<ExpressionRef>,
    attributes: ExpressionAttributes,
}

impl ConditionalExpression {
    pub fn new(when: Condition, then: ExpressionRef, otherwise: Option<ExpressionRef>) -> Self {
        Self {
            when,
            then,
            otherwise,
            attributes: ExpressionAttributes::default(),
        }
    }

    pub fn with_attributes(mut self, attributes: ExpressionAttributes) -> Self {
        self.attributes = attributes;
        self
    }
}

impl fmt::Display for ConditionalExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "if({}) then {}", self.when, self.then)?;
        if let Some(otherwise) = &self.otherwise {
            write!(f, " else {}", otherwise)?;
        }
        Ok(())
    }
}

impl Expression for ConditionalExpression {
    fn evaluate(
        &self,
        data: &dyn InputDataExtractor,
        context: &EvaluationContext,
        base: &EvaluationResult,
    ) -> Result<EvaluationResult, EvaluationError> {
        self.attributes.apply(self, data, context, base, |local| {
            if self.when.evaluate(local) {
                self.then.evaluate(data, local, base)
            } else if let Some(otherwise) = &self.otherwise {
                otherwise.evaluate(data, local, base)
            } else {
                Ok(EvaluationResult::empty())
            }
        })
    }

    /// Deferred when either branch is, so a branch never runs before the data it
    /// waits for exists.
    fn is_evaluate_later(&self) -> bool {
        self.attributes.evaluate_later
            || self.then.is_evaluate_later()
            || self.otherwise.as_ref().is_some_and(|o| o.is_evaluate_later())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::LiteralExpression;
    use crate::extraction::JsonMessageData;
    use crate::value::Value;
    use std::sync::Arc;

    fn conditional() -> ConditionalExpression {
        ConditionalExpression::new(
            Condition::parse("$status EQUALS RE").unwrap(),
            Arc::new(LiteralExpression::new("not-done")),
            Some(Arc::new(LiteralExpression::new("completed"))),
        )
    }

    #[test]
    fn test_branches() {
        let data = JsonMessageData::new("VXU_V04");
        let refused = EvaluationContext::new().with("status", EvaluationResult::new("RE"));

        let result = conditional()
            .evaluate(&data, &refused, &EvaluationResult::empty())
            .unwrap();
        assert_eq!(result.value(), Some(&Value::from("not-done")));

        let result = conditional()
            .evaluate(&data, &EvaluationContext::new(), &EvaluationResult::empty())
            .unwrap();
        assert_eq!(result.value(), Some(&Value::from("completed")));
    }

    #[test]
    fn test_deferred_branch_defers_conditional() {
        let deferred = LiteralExpression::new("x").with_attributes(ExpressionAttributes::new().deferred());
        let expr = ConditionalExpression::new(
            Condition::parse("$a NULL").unwrap(),
            Arc::new(deferred),
            None,
        );
        assert!(expr.is_evaluate_later());
        assert!(!conditional().is_evaluate_later());
    }
}
