//! Field addressing and the input data extractor capability.
//!
//! The engine never parses raw messages itself. It asks an [`InputDataExtractor`]
//! for fields and segments using [`FieldPath`]s such as `RXA.5.1` (segment RXA,
//! field 5, component 1) or `5.1` (field 5, component 1 of the current base value).

use indexmap::IndexMap;
use std::fmt;

use crate::error::{ConfigError, EvaluationError};
use crate::value::{EvaluationResult, Value};

/// Key under which a segment repetition stores its segment name.
pub const SEGMENT_KEY: &str = "segment";
/// Key under which a segment repetition stores its fields.
pub const FIELDS_KEY: &str = "fields";

/// Represents a path to a field in structured data
///
/// # Examples
///
/// - HL7: `PID.5.1` - segment PID, field 5, component 1
/// - Relative: `10.2` - field 10, component 2 of the base value
/// - Variable: `$practitioner.name` - key `name` of context variable `practitioner`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    /// The raw path string
    pub raw: String,
    /// Parsed path segments
    pub segments: Vec<PathSegment>,
}

/// A segment in a field path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    /// A named field (e.g., "PID", "family", "$var")
    Field(String),
    /// A 1-based field or component index (e.g., 5, [5])
    Index(usize),
}

impl FieldPath {
    /// Parse a field path with a given delimiter
    ///
    /// # Example
    ///
    /// ```
    /// use v2fhir::extraction::{FieldPath, PathSegment};
    ///
    /// let path = FieldPath::parse("RXA.5.1", ".");
    /// assert_eq!(path.segments.len(), 3);
    /// assert_eq!(path.segments[1], PathSegment::Index(5));
    /// ```
    pub fn parse(path: &str, delimiter: &str) -> Self {
        let segments = path
            .split(delimiter)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                let digits = if s.starts_with('[') && s.ends_with(']') {
                    &s[1..s.len() - 1]
                } else {
                    s
                };
                match digits.parse::<usize>() {
                    Ok(index) => PathSegment::Index(index),
                    Err(_) => PathSegment::Field(s.to_string()),
                }
            })
            .collect();

        Self {
            raw: path.trim().to_string(),
            segments,
        }
    }

    /// Create a field path from a dotted string (common format)
    pub fn from_dotted(path: &str) -> Self {
        Self::parse(path, ".")
    }

    /// Name of the context variable this path starts from, without the `$`.
    pub fn variable(&self) -> Option<&str> {
        match self.segments.first() {
            Some(PathSegment::Field(name)) => name.strip_prefix('$'),
            _ => None,
        }
    }

    /// Name of the segment this path starts from, if it starts with one.
    pub fn segment_name(&self) -> Option<&str> {
        match self.segments.first() {
            Some(PathSegment::Field(name)) if is_segment_name(name) => Some(name),
            _ => None,
        }
    }

    /// Everything after the first segment.
    pub fn tail(&self) -> &[PathSegment] {
        self.segments.get(1..).unwrap_or(&[])
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// HL7 segment ids are three upper-case letters or digits, starting with a letter.
fn is_segment_name(name: &str) -> bool {
    name.len() == 3
        && name.starts_with(|c: char| c.is_ascii_uppercase())
        && name.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
}

/// Walk `segments` down from `value`.
///
/// Indices are 1-based. Index 1 of a scalar is the scalar itself, which is how a
/// simple HL7 field answers a query for its first component. Empty strings and
/// nulls read as absent.
pub fn navigate(value: &Value, segments: &[PathSegment]) -> Option<Value> {
    let mut current = value;
    for segment in segments {
        current = match (segment, current) {
            (PathSegment::Index(index), Value::List(items)) => items.get(index.checked_sub(1)?)?,
            (PathSegment::Index(1), scalar) if !matches!(scalar, Value::Map(_) | Value::Resource(_)) => {
                scalar
            }
            (PathSegment::Field(name), container) => container.get(name)?,
            _ => return None,
        };
    }

    match current {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        other => Some(other.clone()),
    }
}

/// Capability the engine uses to read the input message.
///
/// Implementations answer path queries against a parsed message. The engine
/// treats them as opaque; everything format-specific lives behind this trait.
pub trait InputDataExtractor: Send + Sync {
    /// Name of the message structure (e.g. `VXU_V04`).
    fn name(&self) -> &str;

    /// Extract the value at `path`.
    ///
    /// Paths that start with an index are resolved relative to `base`. Paths that
    /// start with a segment name are resolved relative to `base` when it is a
    /// repetition of that segment, and against the message otherwise.
    fn get_field(
        &self,
        path: &FieldPath,
        base: &EvaluationResult,
    ) -> Result<EvaluationResult, EvaluationError>;

    /// All repetitions of a segment as a list, or an empty result when the
    /// message has none.
    fn get_segment(&self, name: &str) -> Result<EvaluationResult, EvaluationError>;
}

/// A message that has already been tokenised into JSON.
///
/// ```json
/// {
///   "messageType": "VXU_V04",
///   "segments": {
///     "PID": [["1", "", ["12345", "", "", "", "MR"]]],
///     "RXA": [["0", "1", "20130531"]]
///   }
/// }
/// ```
///
/// Each segment maps to a list of repetitions; each repetition is the list of its
/// fields starting at field 1. A field is a string, a list of components, or a
/// list of lists for sub-components.
#[derive(Debug, Clone)]
pub struct JsonMessageData {
    message_type: String,
    segments: IndexMap<String, Vec<Value>>,
}

impl JsonMessageData {
    pub fn new(message_type: impl Into<String>) -> Self {
        Self {
            message_type: message_type.into(),
            segments: IndexMap::new(),
        }
    }

    /// Append one repetition of a segment.
    pub fn with_segment(mut self, name: impl Into<String>, fields: serde_json::Value) -> Self {
        let name = name.into();
        let repetition = segment_value(&name, Value::from(fields));
        self.segments.entry(name).or_default().push(repetition);
        self
    }

    pub fn from_json(json: &serde_json::Value) -> Result<Self, ConfigError> {
        let message_type = json
            .get("messageType")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ConfigError::Invalid("Message missing 'messageType'".to_string()))?;

        let segments = json
            .get("segments")
            .and_then(|v| v.as_object())
            .ok_or_else(|| ConfigError::Invalid("Message missing 'segments' object".to_string()))?;

        let mut data = Self::new(message_type);
        for (name, repetitions) in segments {
            let repetitions = repetitions.as_array().ok_or_else(|| {
                ConfigError::Invalid(format!("Segment '{}' must be a list of repetitions", name))
            })?;
            for fields in repetitions {
                if !fields.is_array() {
                    return Err(ConfigError::Invalid(format!(
                        "Repetition of segment '{}' must be a list of fields",
                        name
                    )));
                }
                data = data.with_segment(name.clone(), fields.clone());
            }
        }
        Ok(data)
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        Self::from_json(&value)
    }

    /// Number of repetitions of a segment.
    pub fn segment_count(&self, name: &str) -> usize {
        self.segments.get(name).map(Vec::len).unwrap_or(0)
    }
}

/// Build the value representing one segment repetition.
pub fn segment_value(name: &str, fields: Value) -> Value {
    let mut map = IndexMap::new();
    map.insert(SEGMENT_KEY.to_string(), Value::from(name));
    map.insert(FIELDS_KEY.to_string(), fields);
    Value::Map(map)
}

/// The segment name and fields of a segment repetition value.
pub fn as_segment(value: &Value) -> Option<(&str, &Value)> {
    let name = value.get(SEGMENT_KEY)?.as_str()?;
    let fields = value.get(FIELDS_KEY)?;
    Some((name, fields))
}

impl InputDataExtractor for JsonMessageData {
    fn name(&self) -> &str {
        &self.message_type
    }

    fn get_field(
        &self,
        path: &FieldPath,
        base: &EvaluationResult,
    ) -> Result<EvaluationResult, EvaluationError> {
        if path.variable().is_some() {
            return Err(EvaluationError::IllegalArgument(format!(
                "Variable path '{}' cannot be resolved against the message",
                path
            )));
        }

        let base_segment = base.value().and_then(as_segment);

        let found = match (path.segments.first(), path.segment_name()) {
            (None, _) => None,
            (Some(PathSegment::Index(_)), _) => match (base_segment, base.value()) {
                (Some((_, fields)), _) => navigate(fields, &path.segments),
                (None, Some(value)) => navigate(value, &path.segments),
                (None, None) => None,
            },
            (Some(_), Some(segment)) => {
                let repetition = match base_segment {
                    Some((name, _)) if name == segment => base.value(),
                    _ => self.segments.get(segment).and_then(|reps| reps.first()),
                };
                match repetition {
                    Some(rep) if path.tail().is_empty() => Some(rep.clone()),
                    Some(rep) => as_segment(rep).and_then(|(_, fields)| navigate(fields, path.tail())),
                    None => None,
                }
            }
            (Some(PathSegment::Field(_)), None) => {
                base.value().and_then(|value| navigate(value, &path.segments))
            }
        };

        tracing::trace!(path = %path, found = found.is_some(), "Extracted field");
        Ok(EvaluationResult::from_option(found))
    }

    fn get_segment(&self, name: &str) -> Result<EvaluationResult, EvaluationError> {
        Ok(match self.segments.get(name) {
            Some(reps) if !reps.is_empty() => EvaluationResult::new(Value::List(reps.clone())),
            _ => EvaluationResult::empty(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vaccination() -> JsonMessageData {
        JsonMessageData::new("VXU_V04")
            .with_segment("PID", json!(["1", "", ["12345", "", "", "", "MR"]]))
            .with_segment(
                "RXA",
                json!(["0", "1", "20130531", "20130531", ["48", "HIB PRP-T", "CVX"], "0.5"]),
            )
            .with_segment("OBX", json!(["1", "CE"]))
            .with_segment("OBX", json!(["2", "NM"]))
    }

    #[test]
    fn test_field_path_parse() {
        let path = FieldPath::parse("RXA.5.1", ".");

        assert_eq!(path.segments.len(), 3);
        assert_eq!(path.segments[0], PathSegment::Field("RXA".to_string()));
        assert_eq!(path.segments[1], PathSegment::Index(5));
        assert_eq!(path.segments[2], PathSegment::Index(1));
        assert_eq!(path.segment_name(), Some("RXA"));
    }

    #[test]
    fn test_field_path_with_bracket_index() {
        let path = FieldPath::parse("items.[2].name", ".");

        assert_eq!(path.segments.len(), 3);
        assert_eq!(path.segments[1], PathSegment::Index(2));
        assert_eq!(path.segment_name(), None);
    }

    #[test]
    fn test_field_path_variable() {
        let path = FieldPath::from_dotted("$practitioner.name");

        assert_eq!(path.variable(), Some("practitioner"));
        assert_eq!(path.tail(), &[PathSegment::Field("name".to_string())]);
    }

    #[test]
    fn test_get_field_from_message() {
        let data = vaccination();
        let base = EvaluationResult::empty();

        let code = data.get_field(&FieldPath::from_dotted("RXA.5.1"), &base).unwrap();
        assert_eq!(code.value(), Some(&Value::from("48")));

        let mrn = data.get_field(&FieldPath::from_dotted("PID.3.1"), &base).unwrap();
        assert_eq!(mrn.value(), Some(&Value::from("12345")));

        // Component 1 of a simple field is the field itself.
        let dose = data.get_field(&FieldPath::from_dotted("RXA.6.1"), &base).unwrap();
        assert_eq!(dose.value(), Some(&Value::from("0.5")));
    }

    #[test]
    fn test_empty_and_missing_fields_are_absent() {
        let data = vaccination();
        let base = EvaluationResult::empty();

        assert!(data.get_field(&FieldPath::from_dotted("PID.2"), &base).unwrap().is_empty());
        assert!(data.get_field(&FieldPath::from_dotted("PID.30"), &base).unwrap().is_empty());
        assert!(data.get_field(&FieldPath::from_dotted("ORC.1"), &base).unwrap().is_empty());
    }

    #[test]
    fn test_get_field_relative_to_base_segment() {
        let data = vaccination();
        let obx = data.get_segment("OBX").unwrap();
        let Some(Value::List(reps)) = obx.value() else {
            panic!("expected repetitions");
        };
        let second = EvaluationResult::new(reps[1].clone());

        let relative = data.get_field(&FieldPath::from_dotted("2"), &second).unwrap();
        assert_eq!(relative.value(), Some(&Value::from("NM")));

        // Same segment name resolves against the base repetition, not the first one.
        let named = data.get_field(&FieldPath::from_dotted("OBX.1"), &second).unwrap();
        assert_eq!(named.value(), Some(&Value::from("2")));
    }

    #[test]
    fn test_variable_path_is_rejected() {
        let data = vaccination();
        let result = data.get_field(&FieldPath::from_dotted("$x.a"), &EvaluationResult::empty());
        assert!(matches!(result, Err(EvaluationError::IllegalArgument(_))));
    }

    #[test]
    fn test_from_json() {
        let data = JsonMessageData::from_json(&json!({
            "messageType": "ADT_A01",
            "segments": {"PID": [["1"], ["2"]]}
        }))
        .unwrap();

        assert_eq!(data.name(), "ADT_A01");
        assert_eq!(data.segment_count("PID"), 2);
        assert_eq!(data.segment_count("PV1"), 0);
        assert!(data.get_segment("PV1").unwrap().is_empty());
    }

    #[test]
    fn test_from_json_rejects_bad_shape() {
        let result = JsonMessageData::from_json(&json!({
            "messageType": "ADT_A01",
            "segments": {"PID": ["1"]}
        }));
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }
}
