//! Deferred expressions awaiting the full resource graph.

use crate::error::EvaluationError;
use crate::expression::ExpressionMap;
use crate::extraction::InputDataExtractor;
use crate::runtime::context::EvaluationContext;
use crate::runtime::evaluator::{classify, resolve_expressions, with_null_binding, ResourceEvaluationResult};
use crate::value::EvaluationResult;

/// Expressions deferred during the first pass, together with the context the
/// resource was evaluated with.
#[derive(Debug, Clone)]
pub struct PendingExpressionState {
    expressions: ExpressionMap,
    context: EvaluationContext,
}

impl PendingExpressionState {
    pub fn new(expressions: ExpressionMap, context: EvaluationContext) -> Self {
        Self {
            expressions,
            context,
        }
    }

    pub fn expressions(&self) -> &ExpressionMap {
        &self.expressions
    }

    /// The caller's context at first-pass time.
    pub fn context(&self) -> &EvaluationContext {
        &self.context
    }

    pub fn len(&self) -> usize {
        self.expressions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.expressions.is_empty()
    }

    /// A copy whose captured bindings for `names` are taken from `bindings`;
    /// names `bindings` does not hold are unbound.
    ///
    /// The converter uses this to point captured resource bindings at the
    /// resources that survived, so nothing refers to a discarded one.
    pub fn rebound(&self, names: &[String], bindings: &EvaluationContext) -> Self {
        let mut context = self.context.clone();
        for name in names {
            match bindings.get(name) {
                Some(value) => context.insert(name.clone(), value.clone()),
                None => {
                    context.remove(name);
                }
            }
        }
        Self::new(self.expressions.clone(), context)
    }

    /// Evaluate the deferred expressions.
    ///
    /// `graph` holds every resource built in the first pass. The captured
    /// context is laid over it, so bindings the resource was first evaluated
    /// with win over graph entries of the same name. Nothing is deferred again
    /// and there is no base value.
    ///
    /// # Returns
    ///
    /// * `Ok(Some(result))` - Values to merge into the resource
    /// * `Ok(None)` - A deferred expression failed in a way that discards the resource
    /// * `Err(error)` - Unhandled failure
    pub fn resolve(
        &self,
        data: &dyn InputDataExtractor,
        graph: &EvaluationContext,
    ) -> Result<Option<ResourceEvaluationResult>, EvaluationError> {
        let local = with_null_binding(&graph.overlaid_with(&self.context));
        let base = EvaluationResult::empty();

        let outcome = resolve_expressions(data, &local, &base, &self.expressions);
        Ok(classify(outcome)?.map(|(values, resources)| ResourceEvaluationResult::new(values, resources, None)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::{ExpressionAttributes, ExpressionRef, ReferenceExpression};
    use crate::extraction::JsonMessageData;
    use crate::runtime::evaluator;
    use crate::value::{ResourceValue, Value};
    use indexmap::IndexMap;
    use std::sync::Arc;

    fn template() -> ExpressionMap {
        let mut template = ExpressionMap::new();
        template.insert(
            "patient".to_string(),
            Arc::new(ReferenceExpression::new("Patient")) as ExpressionRef,
        );
        template
    }

    fn patient(id: &str) -> EvaluationResult {
        EvaluationResult::new(ResourceValue::new("Patient", id, IndexMap::new()))
    }

    #[test]
    fn test_resolve_against_graph() {
        let data = JsonMessageData::new("VXU_V04");
        let first = evaluator::evaluate(&data, &EvaluationContext::new(), &EvaluationResult::empty(), &template())
            .unwrap()
            .unwrap();
        let pending = first.pending_expressions().unwrap();

        let graph = EvaluationContext::new().with("Patient", patient("p1"));
        let resolved = pending.resolve(&data, &graph).unwrap().unwrap();

        assert_eq!(resolved.resolved_values()["patient"], Value::from("Patient/p1"));
        assert!(resolved.pending_expressions().is_none());
    }

    #[test]
    fn test_captured_context_wins() {
        let data = JsonMessageData::new("VXU_V04");
        let captured = EvaluationContext::new().with("Patient", patient("captured"));
        let pending = PendingExpressionState::new(template(), captured);

        let graph = EvaluationContext::new().with("Patient", patient("graph"));
        let resolved = pending.resolve(&data, &graph).unwrap().unwrap();

        assert_eq!(resolved.resolved_values()["patient"], Value::from("Patient/captured"));
    }

    #[test]
    fn test_rebound_replaces_and_unbinds_captured_resources() {
        let data = JsonMessageData::new("VXU_V04");
        let captured = EvaluationContext::new()
            .with("Patient", patient("stale"))
            .with("source", EvaluationResult::new("registry"));
        let pending = PendingExpressionState::new(template(), captured);
        let names = vec!["Patient".to_string(), "Encounter".to_string()];

        let graph = EvaluationContext::new().with("Patient", patient("current"));
        let rebound = pending.rebound(&names, &graph);
        assert_eq!(rebound.context().value("source"), Some(&Value::from("registry")));
        let resolved = rebound.resolve(&data, &graph).unwrap().unwrap();
        assert_eq!(resolved.resolved_values()["patient"], Value::from("Patient/current"));

        let unbound = pending.rebound(&names, &EvaluationContext::new());
        assert!(!unbound.context().contains("Patient"));
        let resolved = unbound.resolve(&data, &EvaluationContext::new()).unwrap().unwrap();
        assert!(resolved.resolved_values().is_empty());
    }

    #[test]
    fn test_required_failure_discards() {
        let data = JsonMessageData::new("VXU_V04");
        let mut expressions = ExpressionMap::new();
        expressions.insert(
            "patient".to_string(),
            Arc::new(
                ReferenceExpression::new("Patient")
                    .with_attributes(ExpressionAttributes::new().deferred().required()),
            ) as ExpressionRef,
        );
        let pending = PendingExpressionState::new(expressions, EvaluationContext::new());

        assert!(pending.resolve(&data, &EvaluationContext::new()).unwrap().is_none());
    }
}
