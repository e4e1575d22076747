//! The expression evaluation engine.
//!
//! Given a template (an ordered map of output key to expression), the input
//! data, a context and a base value, the engine produces the resolved key/value
//! pairs of one resource plus any auxiliary resources built along the way.
//! Expressions marked as deferred are captured in a [`PendingExpressionState`]
//! for a second pass once the whole resource graph exists.
//!
//! Failures are classified (see [`FailureClass`]): constraint and defect
//! failures skip the resource and are logged, everything else is returned.

use indexmap::map::Entry;
use indexmap::IndexMap;
use std::sync::Arc;

use crate::error::{EvaluationError, FailureClass};
use crate::expression::{ExpressionMap, ExpressionRef};
use crate::extraction::InputDataExtractor;
use crate::runtime::context::{EvaluationContext, KEY_NAME_SUFFIX, NULL_VAR_NAME};
use crate::runtime::pending::PendingExpressionState;
use crate::value::{EvaluationResult, ResourceValue, Value};

/// Resolved values, auxiliary resources and (maybe) deferred work for one resource.
#[derive(Debug, Clone)]
pub struct ResourceEvaluationResult {
    resolved_values: IndexMap<String, Value>,
    additional_resources: Vec<ResourceValue>,
    pending_expressions: Option<PendingExpressionState>,
}

impl ResourceEvaluationResult {
    pub fn new(
        resolved_values: IndexMap<String, Value>,
        additional_resources: Vec<ResourceValue>,
        pending_expressions: Option<PendingExpressionState>,
    ) -> Self {
        Self {
            resolved_values,
            additional_resources,
            pending_expressions,
        }
    }

    /// Output key to value, in template order. Never contains `null` values.
    pub fn resolved_values(&self) -> &IndexMap<String, Value> {
        &self.resolved_values
    }

    pub fn additional_resources(&self) -> &[ResourceValue] {
        &self.additional_resources
    }

    /// Present only if at least one expression was deferred.
    pub fn pending_expressions(&self) -> Option<&PendingExpressionState> {
        self.pending_expressions.as_ref()
    }

    pub fn into_parts(
        self,
    ) -> (
        IndexMap<String, Value>,
        Vec<ResourceValue>,
        Option<PendingExpressionState>,
    ) {
        (
            self.resolved_values,
            self.additional_resources,
            self.pending_expressions,
        )
    }
}

/// Evaluate a template against `base`, deferring expressions that ask for it.
///
/// # Arguments
///
/// * `data` - The input data extractor
/// * `context` - Caller context; copied, never modified
/// * `base` - The value relative paths resolve against
/// * `expressions` - The template
///
/// # Returns
///
/// * `Ok(Some(result))` - The resource's resolved values
/// * `Ok(None)` - A required constraint failed, or the template or data was
///   malformed; the reason has been logged
/// * `Err(error)` - Any other failure
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use v2fhir::expression::{ExpressionMap, LiteralExpression};
/// use v2fhir::extraction::JsonMessageData;
/// use v2fhir::runtime::evaluator;
/// use v2fhir::{EvaluationContext, EvaluationResult, Value};
///
/// let mut template = ExpressionMap::new();
/// template.insert("status".to_string(), Arc::new(LiteralExpression::new("completed")));
///
/// let data = JsonMessageData::new("VXU_V04");
/// let result = evaluator::evaluate(&data, &EvaluationContext::new(), &EvaluationResult::empty(), &template)
///     .unwrap()
///     .unwrap();
/// assert_eq!(result.resolved_values()["status"], Value::from("completed"));
/// assert!(result.pending_expressions().is_none());
/// ```
pub fn evaluate(
    data: &dyn InputDataExtractor,
    context: &EvaluationContext,
    base: &EvaluationResult,
    expressions: &ExpressionMap,
) -> Result<Option<ResourceEvaluationResult>, EvaluationError> {
    let local = with_null_binding(context);

    let mut deferred = ExpressionMap::new();
    let mut immediate: Vec<(&String, &ExpressionRef)> = Vec::new();
    for (key, expression) in expressions {
        if expression.is_evaluate_later() {
            deferred.insert(key.clone(), Arc::clone(expression));
        } else {
            immediate.push((key, expression));
        }
    }

    let outcome = resolve_expressions(data, &local, base, immediate);
    let Some((values, resources)) = classify(outcome)? else {
        return Ok(None);
    };

    let pending = if deferred.is_empty() {
        None
    } else {
        tracing::debug!(deferred = deferred.len(), "Deferring expressions to the second pass");
        Some(PendingExpressionState::new(deferred, context.clone()))
    };

    Ok(Some(ResourceEvaluationResult::new(values, resources, pending)))
}

/// Evaluate every expression of a template inline, with no base and no deferral.
///
/// Used for message-level values. The result never carries pending state.
pub fn evaluate_message(
    data: &dyn InputDataExtractor,
    context: &EvaluationContext,
    expressions: &ExpressionMap,
) -> Result<Option<ResourceEvaluationResult>, EvaluationError> {
    let local = with_null_binding(context);
    let base = EvaluationResult::empty();

    let outcome = resolve_expressions(data, &local, &base, expressions);
    Ok(classify(outcome)?.map(|(values, resources)| ResourceEvaluationResult::new(values, resources, None)))
}

/// Read one key out of a structured result.
///
/// Resources and maps are looked up directly; opaque objects through their
/// JSON form. An empty input gives an empty result. Scalars and lists cannot
/// be viewed as a map and are rejected with `IllegalArgument`.
pub fn extract_field(path: &str, resource: &EvaluationResult) -> Result<EvaluationResult, EvaluationError> {
    let found = match resource.value() {
        None | Some(Value::Null) => return Ok(EvaluationResult::empty()),
        Some(Value::Resource(r)) => r.get(path).cloned(),
        Some(Value::Map(map)) => map.get(path).cloned(),
        Some(Value::Object(object)) => {
            let json = object.to_json().map_err(|e| {
                EvaluationError::IllegalArgument(format!("Cannot convert {:?} to a map: {}", object, e))
            })?;
            match json {
                serde_json::Value::Object(mut map) => map.remove(path).map(Value::from),
                other => {
                    return Err(EvaluationError::IllegalArgument(format!(
                        "Cannot look up '{}' in non-map value {}",
                        path, other
                    )))
                }
            }
        }
        Some(other) => {
            return Err(EvaluationError::IllegalArgument(format!(
                "Cannot look up '{}' in non-map value {}",
                path, other
            )))
        }
    };
    Ok(EvaluationResult::from_option(found))
}

/// Output key for a template key.
///
/// Leading underscores are dropped and the key is cut at its first remaining
/// underscore, so `identifier_1` and `identifier_2` both write `identifier`.
/// `<key>_KEY_NAME_SUFFIX` (any case, any number of underscores) writes
/// `<key><suffix>` instead.
pub fn effective_key(key: &str, suffix: Option<&str>) -> String {
    let trimmed = key.trim_start_matches('_');
    match trimmed.split_once('_') {
        None => trimmed.to_string(),
        Some((name, rest)) => {
            if rest.trim_start_matches('_').eq_ignore_ascii_case(KEY_NAME_SUFFIX) {
                format!("{}{}", name, suffix.unwrap_or(""))
            } else {
                name.to_string()
            }
        }
    }
}

pub(crate) fn with_null_binding(context: &EvaluationContext) -> EvaluationContext {
    let mut local = context.clone();
    local.insert(NULL_VAR_NAME, EvaluationResult::empty());
    local
}

/// Evaluate expressions in order, merging each result under its effective key.
pub(crate) fn resolve_expressions<'a, I>(
    data: &dyn InputDataExtractor,
    context: &EvaluationContext,
    base: &EvaluationResult,
    expressions: I,
) -> Result<(IndexMap<String, Value>, Vec<ResourceValue>), EvaluationError>
where
    I: IntoIterator<Item = (&'a String, &'a ExpressionRef)>,
{
    let suffix = context.key_name_suffix();
    let mut values = IndexMap::new();
    let mut resources = Vec::new();

    for (key, expression) in expressions {
        tracing::debug!(key = %key, expression = %expression, "Evaluating expression");
        let result = expression.evaluate(data, context, base)?;
        tracing::debug!(key = %key, result = ?result.value(), "Evaluated expression");

        // Resources behind an empty or null result are referenced by nothing.
        let (value, additional) = result.into_parts();
        if let Some(value) = value.filter(|v| !v.is_null()) {
            merge_value(&mut values, effective_key(key, suffix.as_deref()), value);
            resources.extend(additional);
        }
    }

    values.retain(|_, value| !value.is_null());
    Ok((values, resources))
}

/// Insert, or extend an existing list. A non-list existing value is kept and
/// the new value dropped.
pub(crate) fn merge_value(values: &mut IndexMap<String, Value>, key: String, value: Value) {
    match values.entry(key) {
        Entry::Vacant(slot) => {
            slot.insert(value);
        }
        Entry::Occupied(mut slot) => match slot.get_mut() {
            Value::List(existing) => match value {
                Value::List(items) => existing.extend(items),
                item => existing.push(item),
            },
            _ => {
                tracing::debug!(key = %slot.key(), "Key already has a non-list value; new value dropped");
            }
        },
    }
}

/// Turn skip-class failures into `None`, logging why.
pub(crate) fn classify<T>(outcome: Result<T, EvaluationError>) -> Result<Option<T>, EvaluationError> {
    match outcome {
        Ok(value) => Ok(Some(value)),
        Err(err) => match err.class() {
            FailureClass::ConstraintNotMet => {
                tracing::warn!("Resource constraint condition not satisfied");
                tracing::debug!(error = %err, "Resource skipped");
                Ok(None)
            }
            FailureClass::Defect => {
                tracing::error!(error = %err, "Exception during resource evaluation");
                Ok(None)
            }
            FailureClass::Unhandled => Err(err),
        },
    }
}
