//! Message converter: builds every configured resource from one message.
//!
//! Conversion runs in two phases. While **collecting**, resources are evaluated
//! in extraction order (dependencies first) and each built resource is bound
//! into the context under its configured name. Expressions that asked to be
//! deferred are kept aside. While **resolving deferred** expressions, each
//! resource's pending state is evaluated against the full resource graph and
//! merged back in. A resource whose deferred expressions fail is discarded
//! together with the auxiliary resources it built, and is unbound from the
//! graph before the survivors resolve again.

use indexmap::IndexMap;
use serde::Serialize;
use std::fmt;

use crate::error::{ConfigError, ConversionError};
use crate::extraction::InputDataExtractor;
use crate::runtime::config_loader::{ConverterConfig, ResourceConfig};
use crate::runtime::context::EvaluationContext;
use crate::runtime::evaluator::{self, classify, merge_value, ResourceEvaluationResult};
use crate::runtime::pending::PendingExpressionState;
use crate::runtime::template_loader::TemplateSet;
use crate::value::{EvaluationResult, ResourceValue, Value};

/// Where the converter is in a conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionPhase {
    Collecting,
    ResolvingDeferred,
}

impl fmt::Display for ConversionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversionPhase::Collecting => write!(f, "collecting"),
            ConversionPhase::ResolvingDeferred => write!(f, "resolving deferred"),
        }
    }
}

/// A resource instance that was not built, and the phase that dropped it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedResource {
    pub name: String,
    pub phase: ConversionPhase,
}

/// The result of converting one message.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConvertedMessage {
    resources: Vec<ResourceValue>,
    skipped: Vec<SkippedResource>,
}

impl ConvertedMessage {
    /// Primary resources in extraction order, then auxiliary resources in the
    /// order they were built.
    pub fn resources(&self) -> &[ResourceValue] {
        &self.resources
    }

    pub fn skipped(&self) -> &[SkippedResource] {
        &self.skipped
    }

    /// Resources of one FHIR type.
    pub fn resources_of_type<'a>(&'a self, resource_type: &'a str) -> impl Iterator<Item = &'a ResourceValue> {
        self.resources
            .iter()
            .filter(move |r| r.resource_type() == resource_type)
    }

    /// The resources as a JSON array.
    pub fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(&self.resources)
    }
}

struct BuiltResource {
    name: String,
    resource: ResourceValue,
    /// Resources built while evaluating this one; emitted only if it survives.
    auxiliary: Vec<ResourceValue>,
    pending: Option<PendingExpressionState>,
}

/// Converts messages according to a [`ConverterConfig`] and a [`TemplateSet`].
///
/// A converter holds no per-message state and can be shared between threads.
///
/// # Example Flow
/// 1. Load the converter config (resources, segments, dependencies)
/// 2. Load the templates the config names
/// 3. `convert` each message; resources come back in extraction order
#[derive(Debug, Clone)]
pub struct MessageConverter {
    config: ConverterConfig,
    templates: TemplateSet,
}

impl MessageConverter {
    /// Create a converter, checking that every configured template exists.
    pub fn new(config: ConverterConfig, templates: TemplateSet) -> Result<Self, ConfigError> {
        for resource in &config.resources {
            if !templates.contains(&resource.template) {
                return Err(ConfigError::UnknownTemplate(resource.template.clone()));
            }
        }
        Ok(Self { config, templates })
    }

    pub fn config(&self) -> &ConverterConfig {
        &self.config
    }

    pub fn templates(&self) -> &TemplateSet {
        &self.templates
    }

    /// Convert one message.
    ///
    /// # Arguments
    /// * `data` - The parsed message
    /// * `context` - Caller-supplied bindings (e.g. `KEY_NAME_SUFFIX`), visible to
    ///   every template
    ///
    /// # Returns
    /// The built resources and the instances that were skipped
    ///
    /// # Errors
    /// * `MissingRequiredResource` - A required resource produced no instance
    /// * `Evaluation` - An unhandled evaluation failure
    pub fn convert(
        &self,
        data: &dyn InputDataExtractor,
        context: &EvaluationContext,
    ) -> Result<ConvertedMessage, ConversionError> {
        tracing::info!(message_type = data.name(), "Converting message");

        let mut graph = context.clone();
        let mut built: Vec<BuiltResource> = Vec::new();
        let mut skipped: Vec<SkippedResource> = Vec::new();

        let mut phase = ConversionPhase::Collecting;
        for resource_config in self.config.ordered_resources() {
            let template = self.templates.get(&resource_config.template).ok_or_else(|| {
                ConversionError::MissingTemplate {
                    resource: resource_config.name.clone(),
                    template: resource_config.template.clone(),
                }
            })?;

            let mut instances: Vec<ResourceValue> = Vec::new();
            for base in self.bases(data, resource_config)? {
                let Some(result) = evaluator::evaluate(data, &graph, &base, &template.expressions)? else {
                    skipped.push(SkippedResource {
                        name: resource_config.name.clone(),
                        phase,
                    });
                    continue;
                };

                let (values, auxiliary, pending) = result.into_parts();
                let resource = ResourceValue::with_generated_id(&resource_config.resource_type, values);
                tracing::debug!(
                    resource = %resource.reference(),
                    deferred = pending.as_ref().map(PendingExpressionState::len).unwrap_or(0),
                    auxiliary = auxiliary.len(),
                    "Built resource"
                );

                instances.push(resource.clone());
                built.push(BuiltResource {
                    name: resource_config.name.clone(),
                    resource,
                    auxiliary,
                    pending,
                });
            }

            if instances.is_empty() {
                if resource_config.required {
                    return Err(ConversionError::MissingRequiredResource(resource_config.name.clone()));
                }
                continue;
            }

            graph.insert(resource_config.name.clone(), binding(resource_config, instances));
        }

        phase = ConversionPhase::ResolvingDeferred;
        tracing::debug!(phase = %phase, resources = built.len(), "Collected resources");

        // A resource discarded here is unbound and every surviving resource's
        // deferred expressions are resolved again, until nothing more is discarded.
        let names: Vec<String> = self.config.resources.iter().map(|r| r.name.clone()).collect();
        let mut discarded = vec![false; built.len()];
        let resolutions = loop {
            let graph = self.bind_resources(context, &built, &discarded);
            let mut resolutions: Vec<Option<ResourceEvaluationResult>> = Vec::with_capacity(built.len());
            let mut changed = false;

            for (index, entry) in built.iter().enumerate() {
                let resolution = match (&entry.pending, discarded[index]) {
                    (Some(pending), false) => {
                        let resolved = pending.rebound(&names, &graph).resolve(data, &graph)?;
                        if resolved.is_none() {
                            tracing::warn!(resource = %entry.resource.reference(), "Deferred expressions failed; resource discarded");
                            skipped.push(SkippedResource {
                                name: entry.name.clone(),
                                phase,
                            });
                            discarded[index] = true;
                            changed = true;
                        }
                        resolved
                    }
                    _ => None,
                };
                resolutions.push(resolution);
            }

            if !changed {
                break resolutions;
            }
        };

        let mut primary: Vec<(String, ResourceValue)> = Vec::new();
        let mut auxiliary: Vec<ResourceValue> = Vec::new();
        for ((entry, resolution), dropped) in built.into_iter().zip(resolutions).zip(discarded) {
            if dropped {
                continue;
            }
            let BuiltResource {
                name,
                mut resource,
                auxiliary: built_auxiliary,
                ..
            } = entry;

            auxiliary.extend(built_auxiliary);
            if let Some(result) = resolution {
                let (values, resources, _) = result.into_parts();
                for (key, value) in values {
                    merge_value(resource.fields_mut(), key, value);
                }
                auxiliary.extend(resources);
            }
            primary.push((name, resource));
        }

        for resource_config in &self.config.resources {
            if resource_config.required && !primary.iter().any(|(name, _)| *name == resource_config.name) {
                return Err(ConversionError::MissingRequiredResource(resource_config.name.clone()));
            }
        }

        let mut resources: Vec<ResourceValue> = primary.into_iter().map(|(_, r)| r).collect();
        resources.extend(auxiliary);

        tracing::info!(
            resources = resources.len(),
            skipped = skipped.len(),
            "Converted message"
        );
        Ok(ConvertedMessage { resources, skipped })
    }

    /// The caller's context with every resource that has not been discarded
    /// bound under its name.
    fn bind_resources(
        &self,
        context: &EvaluationContext,
        built: &[BuiltResource],
        discarded: &[bool],
    ) -> EvaluationContext {
        let mut graph = context.clone();
        for resource_config in self.config.ordered_resources() {
            let instances: Vec<ResourceValue> = built
                .iter()
                .zip(discarded)
                .filter(|(entry, dropped)| !**dropped && entry.name == resource_config.name)
                .map(|(entry, _)| entry.resource.clone())
                .collect();
            if !instances.is_empty() {
                graph.insert(resource_config.name.clone(), binding(resource_config, instances));
            }
        }
        graph
    }

    /// The bases a resource is evaluated against: repetitions of its segment
    /// (only the first unless it repeats), or one empty base when it has none.
    fn bases(
        &self,
        data: &dyn InputDataExtractor,
        resource: &ResourceConfig,
    ) -> Result<Vec<EvaluationResult>, ConversionError> {
        let Some(segment) = &resource.segment else {
            return Ok(vec![EvaluationResult::empty()]);
        };

        let repetitions = match classify(data.get_segment(segment))? {
            Some(result) => match result.into_value() {
                Some(Value::List(items)) => items,
                Some(single) => vec![single],
                None => Vec::new(),
            },
            None => Vec::new(),
        };

        let limit = if resource.repeats { repetitions.len() } else { 1 };
        Ok(repetitions
            .into_iter()
            .take(limit)
            .map(EvaluationResult::new)
            .collect())
    }

    /// Resource names with the number of instances the config allows, for
    /// display.
    pub fn describe(&self) -> IndexMap<String, String> {
        self.config
            .ordered_resources()
            .map(|r| {
                let source = match (&r.segment, r.repeats) {
                    (Some(segment), true) => format!("{} (each {})", r.template, segment),
                    (Some(segment), false) => format!("{} (first {})", r.template, segment),
                    (None, _) => r.template.clone(),
                };
                (r.name.clone(), source)
            })
            .collect()
    }
}

/// How a resource's instances are bound: a list when it repeats, otherwise
/// the single instance.
fn binding(resource: &ResourceConfig, instances: Vec<ResourceValue>) -> EvaluationResult {
    let value = if resource.repeats {
        Value::List(instances.into_iter().map(Value::Resource).collect())
    } else {
        instances.into_iter().next().map(Value::Resource).unwrap_or(Value::Null)
    };
    EvaluationResult::new(value)
}
