//! Evaluation context for template evaluation.
//!
//! Holds the named intermediate values visible to expressions: resources built
//! earlier in the message, caller-supplied settings such as the key-name suffix,
//! and variables bound by expressions for their own sub-expressions.

use indexmap::IndexMap;

use crate::value::{EvaluationResult, Value};

/// Variable bound to the empty result on every engine call, so conditions can
/// compare against it explicitly.
pub const NULL_VAR_NAME: &str = "NULL";

/// Variable holding the suffix appended to `<key>_KEY_NAME_SUFFIX` output keys.
pub const KEY_NAME_SUFFIX: &str = "KEY_NAME_SUFFIX";

/// Ordered mapping from variable name to evaluation result.
///
/// Engine calls take a context by reference and work on their own copy, so a
/// context handed to the engine is never modified by it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvaluationContext {
    values: IndexMap<String, EvaluationResult>,
}

impl EvaluationContext {
    /// Create an empty evaluation context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style binding.
    ///
    /// # Example
    /// ```
    /// use v2fhir::{EvaluationContext, EvaluationResult};
    ///
    /// let ctx = EvaluationContext::new()
    ///     .with("KEY_NAME_SUFFIX", EvaluationResult::new("1"));
    /// assert_eq!(ctx.key_name_suffix(), Some("1".to_string()));
    /// ```
    pub fn with(mut self, name: impl Into<String>, value: EvaluationResult) -> Self {
        self.insert(name, value);
        self
    }

    /// Bind a variable, replacing any previous binding of the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: EvaluationResult) {
        self.values.insert(name.into(), value);
    }

    /// Unbind a variable, keeping the order of the others.
    pub fn remove(&mut self, name: &str) -> Option<EvaluationResult> {
        self.values.shift_remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&EvaluationResult> {
        self.values.get(name)
    }

    /// The value bound to `name`, if it is bound to a non-empty result.
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.get(name).and_then(EvaluationResult::value)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &EvaluationResult)> {
        self.values.iter()
    }

    /// Suffix for `<key>_KEY_NAME_SUFFIX` keys, from the `KEY_NAME_SUFFIX` variable.
    pub fn key_name_suffix(&self) -> Option<String> {
        self.value(KEY_NAME_SUFFIX).and_then(Value::as_text)
    }

    /// A copy of `self` with every binding of `overrides` applied on top.
    pub fn overlaid_with(&self, overrides: &EvaluationContext) -> EvaluationContext {
        let mut merged = self.clone();
        for (name, value) in overrides.iter() {
            merged.insert(name.clone(), value.clone());
        }
        merged
    }
}

impl FromIterator<(String, EvaluationResult)> for EvaluationContext {
    fn from_iter<I: IntoIterator<Item = (String, EvaluationResult)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}
