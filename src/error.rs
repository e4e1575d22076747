//! Error types for template evaluation, configuration loading and message conversion.

use thiserror::Error;

use crate::transform_registry::TransformError;

/// How the evaluation engine reacts to an [`EvaluationError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// A mandatory condition on the input was not met. The resource is skipped.
    ConstraintNotMet,
    /// The template or the input is malformed. The resource is skipped and the
    /// failure is logged as an error.
    Defect,
    /// Not handled by the engine; returned to the caller.
    Unhandled,
}

/// Errors raised while evaluating expressions.
#[derive(Debug, Error)]
pub enum EvaluationError {
    /// A required expression resolved to nothing.
    #[error("Required constraint not satisfied: {0}")]
    RequiredConstraintFailure(String),

    /// The data source could not produce the requested data.
    #[error("Data extraction failed: {0}")]
    DataExtraction(String),

    #[error("Illegal argument: {0}")]
    IllegalArgument(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// A transform function failed.
    #[error("Transform error: {0}")]
    Transform(#[from] TransformError),
}

impl EvaluationError {
    /// Classify this error for the engine's skip-or-propagate decision.
    pub fn class(&self) -> FailureClass {
        match self {
            EvaluationError::RequiredConstraintFailure(_) => FailureClass::ConstraintNotMet,
            EvaluationError::DataExtraction(_)
            | EvaluationError::IllegalArgument(_)
            | EvaluationError::IllegalState(_) => FailureClass::Defect,
            EvaluationError::Transform(_) => FailureClass::Unhandled,
        }
    }
}

/// Errors raised while loading converter configuration, templates or the
/// terminology table.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("'{name}' depends on undefined '{dependency}'")]
    UndefinedDependency { name: String, dependency: String },

    #[error("Circular dependency detected involving: {0:?}")]
    CircularDependency(Vec<String>),

    #[error("Unknown template '{0}'")]
    UnknownTemplate(String),

    #[error("Unknown transform '{0}'")]
    UnknownTransform(String),

    #[error("Invalid condition '{condition}': {reason}")]
    InvalidCondition { condition: String, reason: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors raised by the message converter.
#[derive(Debug, Error)]
pub enum ConversionError {
    /// A resource marked as required produced no instance.
    #[error("Required resource '{0}' could not be built from the message")]
    MissingRequiredResource(String),

    #[error("No template registered for resource '{resource}' (template '{template}')")]
    MissingTemplate { resource: String, template: String },

    #[error(transparent)]
    Evaluation(#[from] EvaluationError),
}
