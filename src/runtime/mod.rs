//! Runtime for template evaluation and message conversion.
//!
//! The evaluator turns one template into one resource's values; the message
//! converter drives it over every configured resource of a message in
//! dependency order.

pub mod config_loader;
pub mod context;
pub mod evaluator;
pub mod message_converter;
pub mod pending;
pub mod template_loader;

// Re-export key types
pub use config_loader::{compute_extraction_order, ConverterConfig, ResourceConfig};
pub use context::{EvaluationContext, KEY_NAME_SUFFIX, NULL_VAR_NAME};
pub use evaluator::{evaluate, evaluate_message, extract_field, ResourceEvaluationResult};
pub use message_converter::{ConversionPhase, ConvertedMessage, MessageConverter, SkippedResource};
pub use pending::PendingExpressionState;
pub use template_loader::{Template, TemplateSet};
