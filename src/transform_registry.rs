//! Transform registry system for registering and calling transformation functions.
//!
//! Script expressions in templates name a transform and pass it named arguments;
//! this registry maps those names to functions.

use chrono::{NaiveDate, NaiveDateTime};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::terminology::{v2_system_url, SystemUrlLookup};
use crate::value::Value;

/// Error type for transform operations
#[derive(Debug, Clone, Error)]
pub enum TransformError {
    #[error("Transform not found: {0}")]
    NotFound(String),
    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),
    #[error("Execution error: {0}")]
    ExecutionError(String),
}

/// Named, ordered transform arguments.
pub type TransformArgs = IndexMap<String, Value>;

/// Trait for transformation functions
///
/// Arguments that resolved to nothing are passed as [`Value::Null`]. Returning
/// `Value::Null` means "no value"; the engine drops null entries.
pub trait TransformFn: Send + Sync {
    /// Execute the transformation with given arguments
    fn execute(&self, args: &TransformArgs) -> Result<Value, TransformError>;
}

/// Simple function-based implementation of TransformFn
impl<F> TransformFn for F
where
    F: Fn(&TransformArgs) -> Result<Value, TransformError> + Send + Sync,
{
    fn execute(&self, args: &TransformArgs) -> Result<Value, TransformError> {
        self(args)
    }
}

/// Registry for storing and calling transformation functions
pub struct TransformRegistry {
    transforms: HashMap<String, Box<dyn TransformFn>>,
}

impl TransformRegistry {
    /// Create a new empty transform registry
    pub fn new() -> Self {
        Self {
            transforms: HashMap::new(),
        }
    }

    /// Create a registry with the builtin transforms.
    ///
    /// | name | arguments | result |
    /// |---|---|---|
    /// | `uppercase`, `lowercase` | `value` | case-converted string |
    /// | `join` | any, plus optional `separator` | non-null arguments joined in order |
    /// | `hl7_date` | `value` | HL7 timestamp as ISO 8601 |
    /// | `system_url` | `code` | canonical URI, or `urn:id:<code>` when unmapped |
    /// | `v2_system_url` | `table` | `http://terminology.hl7.org/CodeSystem/v2-<table>` |
    pub fn with_builtins(lookup: Arc<SystemUrlLookup>) -> Self {
        let mut registry = Self::new();

        registry.register("uppercase", Box::new(|args: &TransformArgs| -> Result<Value, TransformError> {
            Ok(text_arg(args, "value").map(|s| Value::String(s.to_uppercase())).unwrap_or(Value::Null))
        }));

        registry.register("lowercase", Box::new(|args: &TransformArgs| -> Result<Value, TransformError> {
            Ok(text_arg(args, "value").map(|s| Value::String(s.to_lowercase())).unwrap_or(Value::Null))
        }));

        registry.register("join", Box::new(join));

        registry.register("hl7_date", Box::new(|args: &TransformArgs| -> Result<Value, TransformError> {
            Ok(text_arg(args, "value").map(|s| hl7_date(&s)).unwrap_or(Value::Null))
        }));

        registry.register("system_url", Box::new(move |args: &TransformArgs| -> Result<Value, TransformError> {
            let code = text_arg(args, "code");
            Ok(match code {
                Some(code) => match lookup.resolve(Some(&code)) {
                    Some(url) => Value::from(url),
                    None => Value::String(format!("urn:id:{}", code)),
                },
                None => Value::Null,
            })
        }));

        registry.register("v2_system_url", Box::new(|args: &TransformArgs| -> Result<Value, TransformError> {
            let table = text_arg(args, "table");
            Ok(v2_system_url(table.as_deref()).map(Value::String).unwrap_or(Value::Null))
        }));

        registry
    }

    /// Register a transformation function
    ///
    /// # Example
    ///
    /// ```
    /// use v2fhir::transform_registry::{TransformArgs, TransformError, TransformRegistry};
    /// use v2fhir::Value;
    ///
    /// let mut registry = TransformRegistry::new();
    /// registry.register("constant", Box::new(|_args: &TransformArgs| -> Result<Value, TransformError> {
    ///     Ok(Value::from("x"))
    /// }));
    /// assert!(registry.has_transform("constant"));
    /// ```
    pub fn register(&mut self, name: impl Into<String>, func: Box<dyn TransformFn>) {
        self.transforms.insert(name.into(), func);
    }

    /// Call a registered transformation function
    ///
    /// # Arguments
    ///
    /// * `name` - Name of the registered transform
    /// * `args` - Arguments to pass to the transform
    ///
    /// # Returns
    ///
    /// * `Ok(Value)` - Transform succeeded
    /// * `Err(TransformError)` - Transform is unknown or failed
    pub fn call(&self, name: &str, args: &TransformArgs) -> Result<Value, TransformError> {
        let transform = self
            .transforms
            .get(name)
            .ok_or_else(|| TransformError::NotFound(name.to_string()))?;

        transform.execute(args)
    }

    /// Check if a transform is registered
    pub fn has_transform(&self, name: &str) -> bool {
        self.transforms.contains_key(name)
    }

    /// Get sorted list of all registered transform names
    pub fn list_transforms(&self) -> Vec<String> {
        let mut names: Vec<String> = self.transforms.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for TransformRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TransformRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformRegistry")
            .field("transforms", &self.list_transforms())
            .finish()
    }
}

fn text_arg(args: &TransformArgs, name: &str) -> Option<String> {
    args.get(name).and_then(Value::as_text)
}

fn join(args: &TransformArgs) -> Result<Value, TransformError> {
    let separator = match args.get("separator") {
        None | Some(Value::Null) => String::new(),
        Some(value) => value.as_text().ok_or_else(|| {
            TransformError::InvalidArgs("'separator' must be a scalar".to_string())
        })?,
    };

    let mut parts = Vec::new();
    for (name, value) in args {
        if name == "separator" {
            continue;
        }
        match value {
            Value::List(items) => parts.extend(items.iter().filter_map(Value::as_text)),
            other => parts.extend(other.as_text()),
        }
    }

    if parts.is_empty() {
        Ok(Value::Null)
    } else {
        Ok(Value::String(parts.join(&separator)))
    }
}

/// Convert an HL7 DTM (`YYYY[MM[DD[HHMM[SS]]]]`) to ISO 8601.
///
/// Unparseable input yields `Value::Null`.
fn hl7_date(raw: &str) -> Value {
    // Drop fractional seconds and timezone offsets.
    let digits: String = raw.chars().take_while(|c| c.is_ascii_digit()).collect();

    let converted = match digits.len() {
        4 => Some(digits.clone()),
        6 => Some(format!("{}-{}", &digits[0..4], &digits[4..6])),
        8 => NaiveDate::parse_from_str(&digits, "%Y%m%d")
            .ok()
            .map(|d| d.format("%Y-%m-%d").to_string()),
        12 => NaiveDateTime::parse_from_str(&format!("{}00", digits), "%Y%m%d%H%M%S")
            .ok()
            .map(|d| d.format("%Y-%m-%dT%H:%M:%S").to_string()),
        14 => NaiveDateTime::parse_from_str(&digits, "%Y%m%d%H%M%S")
            .ok()
            .map(|d| d.format("%Y-%m-%dT%H:%M:%S").to_string()),
        _ => None,
    };

    match converted {
        Some(iso) => Value::String(iso),
        None => {
            tracing::warn!(value = raw, "Unparseable HL7 date");
            Value::Null
        }
    }
}
