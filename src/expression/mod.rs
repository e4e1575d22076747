//! Expressions: the units of mapping logic a template is made of.
//!
//! A template is an ordered map from output key to [`Expression`]. The engine in
//! [`crate::runtime::evaluator`] only relies on the [`Expression`] trait; the
//! concrete kinds in this module are what the YAML template loader builds.

pub mod condition;
mod conditional;
mod field;
mod literal;
mod nested;
mod reference;
mod script;

use indexmap::IndexMap;
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use crate::error::EvaluationError;
use crate::extraction::InputDataExtractor;
use crate::runtime::context::EvaluationContext;
use crate::value::{EvaluationResult, Value};

pub use condition::Condition;
pub use conditional::ConditionalExpression;
pub use field::FieldPathExpression;
pub use literal::LiteralExpression;
pub use nested::NestedResourceExpression;
pub use reference::ReferenceExpression;
pub use script::ScriptExpression;

/// One unit of mapping logic.
///
/// Implementations must be shareable across threads; the same template is
/// evaluated concurrently for different messages.
pub trait Expression: fmt::Debug + fmt::Display + Send + Sync {
    /// Compute a value from the input data, the context and the current base.
    fn evaluate(
        &self,
        data: &dyn InputDataExtractor,
        context: &EvaluationContext,
        base: &EvaluationResult,
    ) -> Result<EvaluationResult, EvaluationError>;

    /// Whether this expression must wait until the whole resource graph exists.
    fn is_evaluate_later(&self) -> bool {
        false
    }
}

pub type ExpressionRef = Arc<dyn Expression>;

/// Output key to expression, in template order.
pub type ExpressionMap = IndexMap<String, ExpressionRef>;

/// Behaviour shared by every expression kind.
#[derive(Debug, Clone, Default)]
pub struct ExpressionAttributes {
    pub required: bool,
    pub evaluate_later: bool,
    pub generate_list: bool,
    pub condition: Option<Condition>,
    pub vars: ExpressionMap,
}

impl ExpressionAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn deferred(mut self) -> Self {
        self.evaluate_later = true;
        self
    }

    pub fn as_list(mut self) -> Self {
        self.generate_list = true;
        self
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_var(mut self, name: impl Into<String>, expression: ExpressionRef) -> Self {
        self.vars.insert(name.into(), expression);
        self
    }

    /// Run `body` with this expression's attributes applied.
    ///
    /// Variables are bound into a local copy of `context`, then the condition is
    /// checked against it. A false condition yields the empty result and skips
    /// the required check. Otherwise `body` runs with the local context and its
    /// result is checked against `required`.
    ///
    /// # Arguments
    ///
    /// * `expression` - The expression being evaluated, used in error messages
    /// * `data` - The input data extractor
    /// * `context` - The caller's context, never modified
    /// * `base` - The current base value, passed to variable expressions
    /// * `body` - The kind-specific evaluation
    pub fn apply<F>(
        &self,
        expression: &dyn fmt::Display,
        data: &dyn InputDataExtractor,
        context: &EvaluationContext,
        base: &EvaluationResult,
        body: F,
    ) -> Result<EvaluationResult, EvaluationError>
    where
        F: FnOnce(&EvaluationContext) -> Result<EvaluationResult, EvaluationError>,
    {
        let local: Cow<'_, EvaluationContext> = if self.vars.is_empty() {
            Cow::Borrowed(context)
        } else {
            let mut local = context.clone();
            for (name, var) in &self.vars {
                let bound = var.evaluate(data, &local, base)?;
                local.insert(name.clone(), bound);
            }
            Cow::Owned(local)
        };

        if let Some(condition) = &self.condition {
            if !condition.evaluate(&local) {
                tracing::trace!(expression = %expression, condition = %condition, "Condition not met");
                return Ok(EvaluationResult::empty());
            }
        }

        let result = body(&*local)?;

        let missing = matches!(result.value(), None | Some(Value::Null));
        if self.required && missing {
            return Err(EvaluationError::RequiredConstraintFailure(format!(
                "{} resolved to no value",
                expression
            )));
        }

        if self.generate_list && !missing && !result.value().is_some_and(Value::is_list) {
            let (value, resources) = result.into_parts();
            let items: Vec<Value> = value.into_iter().collect();
            return Ok(EvaluationResult::new(Value::List(items)).with_additional_resources(resources));
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::JsonMessageData;

    fn data() -> JsonMessageData {
        JsonMessageData::new("VXU_V04")
    }

    #[test]
    fn test_required_empty_fails() {
        let expr = LiteralExpression::new(Value::Null)
            .with_attributes(ExpressionAttributes::new().required());

        let result = expr.evaluate(&data(), &EvaluationContext::new(), &EvaluationResult::empty());
        assert!(matches!(result, Err(EvaluationError::RequiredConstraintFailure(_))));
    }

    #[test]
    fn test_false_condition_skips_required_check() {
        let condition = Condition::parse("$status NOT_NULL").unwrap();
        let expr = LiteralExpression::new(Value::Null)
            .with_attributes(ExpressionAttributes::new().required().when(condition));

        let result = expr
            .evaluate(&data(), &EvaluationContext::new(), &EvaluationResult::empty())
            .unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_vars_visible_to_condition_only_locally() {
        let var: ExpressionRef = Arc::new(LiteralExpression::new("CP"));
        let condition = Condition::parse("$status EQUALS CP").unwrap();
        let expr = LiteralExpression::new("completed")
            .with_attributes(ExpressionAttributes::new().with_var("status", var).when(condition));

        let ctx = EvaluationContext::new();
        let result = expr.evaluate(&data(), &ctx, &EvaluationResult::empty()).unwrap();

        assert_eq!(result.value(), Some(&Value::from("completed")));
        assert!(!ctx.contains("status"));
    }

    #[test]
    fn test_generate_list_wraps_scalar() {
        let expr = LiteralExpression::new("a").with_attributes(ExpressionAttributes::new().as_list());

        let result = expr
            .evaluate(&data(), &EvaluationContext::new(), &EvaluationResult::empty())
            .unwrap();
        assert_eq!(result.value(), Some(&Value::List(vec![Value::from("a")])));
    }
}
