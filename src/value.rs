//! Values produced by expression evaluation.
//!
//! An expression hands the engine an [`EvaluationResult`]: an optional [`Value`]
//! plus any [`ResourceValue`]s that were built as a side effect of computing it
//! (for example a Practitioner constructed while resolving an ordering provider).

use indexmap::IndexMap;
use serde::{Serialize, Serializer};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// A value computed by an expression.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(IndexMap<String, Value>),
    Resource(ResourceValue),
    Object(OpaqueValue),
}

impl Value {
    /// Wrap any serializable object. Field lookups on it go through its JSON form.
    pub fn object<T>(object: T) -> Self
    where
        T: ObjectValue + 'static,
    {
        Value::Object(OpaqueValue::new(object))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_list(&self) -> bool {
        matches!(self, Value::List(_))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// String form of a scalar value; `None` for null and structured values.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Value::String(s) => Some(s.clone()),
            Value::Int(i) => Some(i.to_string()),
            Value::Float(f) => Some(f.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Look up a key in a map or resource value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(map) => map.get(key),
            Value::Resource(resource) => resource.get(key),
            _ => None,
        }
    }

    /// Convert to plain JSON.
    pub fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(fl) => write!(f, "{}", fl),
            Value::String(s) => write!(f, "{}", s),
            Value::List(l) => write!(f, "{:?}", l),
            Value::Map(m) => write!(f, "{:?}", m),
            Value::Resource(r) => write!(f, "{}", r.reference()),
            Value::Object(o) => write!(f, "{:?}", o),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(f) = n.as_f64() {
                    Value::Float(f)
                } else {
                    Value::Null
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(arr) => Value::List(arr.into_iter().map(Value::from).collect()),
            serde_json::Value::Object(obj) => {
                Value::Map(obj.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::List(value)
    }
}

impl From<IndexMap<String, Value>> for Value {
    fn from(value: IndexMap<String, Value>) -> Self {
        Value::Map(value)
    }
}

impl From<ResourceValue> for Value {
    fn from(value: ResourceValue) -> Self {
        Value::Resource(value)
    }
}

/// An object the engine knows nothing about except that it can be viewed as JSON.
///
/// Implemented for every `Serialize` type, so domain structs produced by custom
/// expressions can be handed to the engine without first flattening them.
pub trait ObjectValue: fmt::Debug + Send + Sync {
    fn to_json(&self) -> Result<serde_json::Value, serde_json::Error>;
}

impl<T> ObjectValue for T
where
    T: Serialize + fmt::Debug + Send + Sync,
{
    fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// Shared handle to an [`ObjectValue`].
#[derive(Clone)]
pub struct OpaqueValue(Arc<dyn ObjectValue>);

impl OpaqueValue {
    pub fn new<T>(object: T) -> Self
    where
        T: ObjectValue + 'static,
    {
        Self(Arc::new(object))
    }

    pub fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        self.0.to_json()
    }
}

impl fmt::Debug for OpaqueValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl PartialEq for OpaqueValue {
    fn eq(&self, other: &Self) -> bool {
        if Arc::ptr_eq(&self.0, &other.0) {
            return true;
        }
        match (self.to_json(), other.to_json()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

impl Serialize for OpaqueValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let json = self.to_json().map_err(serde::ser::Error::custom)?;
        json.serialize(serializer)
    }
}

/// A built resource: its type, id and resolved fields.
///
/// Serializes as a flat FHIR-style JSON object with `resourceType` and `id`
/// followed by the fields in template order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceValue {
    #[serde(rename = "resourceType")]
    resource_type: String,
    id: String,
    #[serde(flatten)]
    fields: IndexMap<String, Value>,
}

impl ResourceValue {
    pub fn new(
        resource_type: impl Into<String>,
        id: impl Into<String>,
        fields: IndexMap<String, Value>,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
            fields,
        }
    }

    /// Create a resource with a random UUID as its id.
    pub fn with_generated_id(resource_type: impl Into<String>, fields: IndexMap<String, Value>) -> Self {
        Self::new(resource_type, Uuid::new_v4().to_string(), fields)
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn fields(&self) -> &IndexMap<String, Value> {
        &self.fields
    }

    pub fn fields_mut(&mut self) -> &mut IndexMap<String, Value> {
        &mut self.fields
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Relative reference string, e.g. `Practitioner/4f1c...`.
    pub fn reference(&self) -> String {
        format!("{}/{}", self.resource_type, self.id)
    }

    pub fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// The outcome of evaluating one expression.
///
/// An empty result carries no value and means "no contribution": the engine
/// writes no key for it. A present value may still be [`Value::Null`]; the
/// engine prunes such entries after merging.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvaluationResult {
    value: Option<Value>,
    additional_resources: Vec<ResourceValue>,
}

impl EvaluationResult {
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: Some(value.into()),
            additional_resources: Vec::new(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// `None` becomes the empty result.
    pub fn from_option(value: Option<Value>) -> Self {
        Self {
            value,
            additional_resources: Vec::new(),
        }
    }

    /// Attach resources that were built while computing this value.
    ///
    /// An empty result contributes nothing, so the resources are dropped.
    pub fn with_additional_resources(mut self, resources: Vec<ResourceValue>) -> Self {
        if self.value.is_some() {
            self.additional_resources.extend(resources);
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_none()
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn into_value(self) -> Option<Value> {
        self.value
    }

    pub fn additional_resources(&self) -> &[ResourceValue] {
        &self.additional_resources
    }

    pub fn into_parts(self) -> (Option<Value>, Vec<ResourceValue>) {
        (self.value, self.additional_resources)
    }
}

impl From<Value> for EvaluationResult {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Serialize)]
    struct Quantity {
        value: f64,
        unit: String,
    }

    #[test]
    fn test_value_from_json() {
        let value = Value::from(json!({"code": "48", "count": 2, "tags": ["a", null]}));

        assert_eq!(value.get("code"), Some(&Value::String("48".to_string())));
        assert_eq!(value.get("count"), Some(&Value::Int(2)));
        assert_eq!(
            value.get("tags"),
            Some(&Value::List(vec![Value::from("a"), Value::Null]))
        );
    }

    #[test]
    fn test_as_text() {
        assert_eq!(Value::Int(7).as_text(), Some("7".to_string()));
        assert_eq!(Value::from("x").as_text(), Some("x".to_string()));
        assert_eq!(Value::Null.as_text(), None);
        assert_eq!(Value::List(vec![]).as_text(), None);
    }

    #[test]
    fn test_resource_serializes_flat() {
        let mut fields = IndexMap::new();
        fields.insert("lotNumber".to_string(), Value::from("33k2a"));
        let resource = ResourceValue::new("Immunization", "abc", fields);

        let json = resource.to_json().unwrap();
        assert_eq!(
            json,
            json!({"resourceType": "Immunization", "id": "abc", "lotNumber": "33k2a"})
        );
        assert_eq!(resource.reference(), "Immunization/abc");
    }

    #[test]
    fn test_generated_ids_differ() {
        let a = ResourceValue::with_generated_id("Practitioner", IndexMap::new());
        let b = ResourceValue::with_generated_id("Practitioner", IndexMap::new());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_opaque_value_json_view() {
        let value = Value::object(Quantity {
            value: 0.5,
            unit: "ML".to_string(),
        });

        assert_eq!(value.to_json().unwrap(), json!({"value": 0.5, "unit": "ML"}));
    }

    #[test]
    fn test_empty_result() {
        let result = EvaluationResult::empty();
        assert!(result.is_empty());
        assert!(result.additional_resources().is_empty());

        let null_result = EvaluationResult::new(Value::Null);
        assert!(!null_result.is_empty());
    }

    #[test]
    fn test_empty_result_drops_additional_resources() {
        let practitioner = ResourceValue::with_generated_id("Practitioner", IndexMap::new());

        let empty = EvaluationResult::empty().with_additional_resources(vec![practitioner.clone()]);
        assert!(empty.additional_resources().is_empty());

        let present = EvaluationResult::new(practitioner.reference())
            .with_additional_resources(vec![practitioner]);
        assert_eq!(present.additional_resources().len(), 1);
    }
}
