//! # v2fhir: HL7 v2 to FHIR conversion through declarative templates
//!
//! v2fhir builds FHIR-style resources from HL7 v2 messages. Mapping logic lives
//! in YAML templates; the library evaluates them.
//!
//! ## Features
//!
//! - **Expression evaluation engine**: evaluates a template (ordered output key to
//!   expression map) into one resource's values, with deferred expressions
//!   resolved in a second pass once the whole resource graph exists
//! - **Expression kinds**: literals, field paths, nested templates, conditionals,
//!   references and registered transforms, all sharing `required`, `condition`,
//!   `vars` and `evaluateLater` attributes
//! - **Terminology lookup**: code-table names (`CVX`, `LN`, `HL70163`) to canonical
//!   code system URIs
//! - **Message converter**: builds every configured resource of a message in
//!   dependency order
//!
//! ## Example: template
//!
//! ```yaml
//! immunization:
//!   resourceType: Immunization
//!   expressions:
//!     status:
//!       kind: literal
//!       value: completed
//!     occurrenceDateTime:
//!       kind: transform
//!       function: hl7_date
//!       args:
//!         value: RXA.3
//!       required: true
//!     patient:
//!       kind: reference
//!       variable: Patient
//! ```
//!
//! ## Example: evaluating a template directly
//!
//! ```
//! use std::sync::Arc;
//! use serde_json::json;
//! use v2fhir::expression::{ExpressionMap, FieldPathExpression};
//! use v2fhir::extraction::JsonMessageData;
//! use v2fhir::runtime::evaluator;
//! use v2fhir::{EvaluationContext, EvaluationResult, Value};
//!
//! let data = JsonMessageData::new("VXU_V04")
//!     .with_segment("RXA", json!(["0", "1", "20130531", "", ["48", "HIB PRP-T", "CVX"]]));
//!
//! let mut template = ExpressionMap::new();
//! template.insert("code".to_string(), Arc::new(FieldPathExpression::new("RXA.5.1")));
//!
//! let result = evaluator::evaluate(&data, &EvaluationContext::new(), &EvaluationResult::empty(), &template)
//!     .unwrap()
//!     .unwrap();
//! assert_eq!(result.resolved_values()["code"], Value::from("48"));
//! ```

// Core modules
pub mod error;
pub mod value;
pub mod extraction;
pub mod terminology;
pub mod transform_registry;
pub mod expression;

// Evaluation engine and message conversion
pub mod runtime;

// Re-export key types
pub use error::{ConfigError, ConversionError, EvaluationError, FailureClass};
pub use value::{EvaluationResult, ResourceValue, Value};
pub use extraction::{FieldPath, InputDataExtractor, JsonMessageData};
pub use terminology::SystemUrlLookup;
pub use transform_registry::{TransformError, TransformRegistry};
pub use expression::{Expression, ExpressionMap};

// Re-export runtime types
pub use runtime::{
    ConvertedMessage, ConverterConfig, EvaluationContext, MessageConverter,
    PendingExpressionState, ResourceEvaluationResult, TemplateSet,
};
