//! Converter configuration loader and topological sort.
//!
//! Loads the message converter configuration from YAML and computes the
//! resource extraction order using topological sort (Kahn's algorithm).

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::Path;

use crate::error::ConfigError;

/// One resource the converter builds from a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceConfig {
    /// Name the built resource is bound to in the context (e.g. `Patient`)
    pub name: String,

    /// FHIR resource type of the output
    pub resource_type: String,

    /// Name of the template evaluated for this resource
    pub template: String,

    /// Segment whose repetitions are the bases for evaluation
    #[serde(default)]
    pub segment: Option<String>,

    /// Build one resource per segment repetition instead of only the first
    #[serde(default)]
    pub repeats: bool,

    /// Fail the conversion when no instance can be built
    #[serde(default)]
    pub required: bool,

    /// Resources that must be built first
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// Converter configuration defining resources and extraction order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConverterConfig {
    /// Message structure this configuration handles (e.g. `VXU_V04`)
    pub message_type: String,

    /// Resource configurations in declaration order
    pub resources: Vec<ResourceConfig>,

    /// Resource extraction order (topologically sorted by dependencies)
    #[serde(skip)]
    pub extraction_order: Vec<String>,
}

impl ConverterConfig {
    /// Load converter configuration from a YAML file.
    ///
    /// # Arguments
    /// * `path` - Path to the converter YAML
    ///
    /// # Returns
    /// Parsed configuration with computed extraction order
    ///
    /// # Errors
    /// Returns error if the file doesn't exist, has invalid format, or its
    /// dependencies are undefined or circular
    ///
    /// # Example
    /// ```ignore
    /// use v2fhir::runtime::ConverterConfig;
    ///
    /// let config = ConverterConfig::load_from_file("config/immunization/converter.yaml")?;
    /// println!("Extraction order: {:?}", config.extraction_order);
    /// ```
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;

        Self::from_yaml_str(&contents)
    }

    /// Parse converter configuration from a YAML string.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: ConverterConfig = serde_yaml::from_str(yaml)?;
        Self::from_resources(config.message_type, config.resources)
    }

    /// Create converter config from resource definitions built in code.
    ///
    /// # Arguments
    /// * `message_type` - Message structure name
    /// * `resources` - Resource configurations
    ///
    /// # Returns
    /// Converter config with computed extraction order
    pub fn from_resources(
        message_type: impl Into<String>,
        resources: Vec<ResourceConfig>,
    ) -> Result<Self, ConfigError> {
        let mut dependencies: IndexMap<String, Vec<String>> = IndexMap::new();
        for resource in &resources {
            if dependencies
                .insert(resource.name.clone(), resource.dependencies.clone())
                .is_some()
            {
                return Err(ConfigError::Invalid(format!(
                    "Resource '{}' is defined more than once",
                    resource.name
                )));
            }
        }

        let extraction_order = compute_extraction_order(&dependencies)?;

        Ok(Self {
            message_type: message_type.into(),
            resources,
            extraction_order,
        })
    }

    /// Get resource configuration by name.
    pub fn get_resource(&self, name: &str) -> Option<&ResourceConfig> {
        self.resources.iter().find(|r| r.name == name)
    }

    /// Check if a resource is defined.
    pub fn has_resource(&self, name: &str) -> bool {
        self.get_resource(name).is_some()
    }

    /// Resource configurations in extraction order.
    pub fn ordered_resources(&self) -> impl Iterator<Item = &ResourceConfig> {
        self.extraction_order
            .iter()
            .filter_map(move |name| self.get_resource(name))
    }
}

/// Compute an extraction order using topological sort (Kahn's algorithm).
///
/// Names are sorted such that dependencies always come before their
/// dependents. Among names that are ready at the same time, declaration order
/// wins, so the result is deterministic.
///
/// # Algorithm
/// 1. Build dependency graph from the name -> dependencies map
/// 2. Find names with no dependencies (in-degree = 0)
/// 3. Process names level-by-level, removing edges as we go
/// 4. If any names remain unprocessed, there's a cycle
///
/// # Arguments
/// * `dependencies` - Name -> names it depends on, in declaration order
///
/// # Returns
/// * `Ok(order)` - Names in extraction order
/// * `Err(ConfigError)` - Undefined dependency or circular dependency
///
/// # Example
/// ```
/// use indexmap::IndexMap;
/// use v2fhir::runtime::compute_extraction_order;
///
/// let mut deps = IndexMap::new();
/// deps.insert("Immunization".to_string(), vec!["Patient".to_string()]);
/// deps.insert("Patient".to_string(), vec![]);
///
/// let order = compute_extraction_order(&deps).unwrap();
/// assert_eq!(order, vec!["Patient", "Immunization"]);
/// ```
pub fn compute_extraction_order(
    dependencies: &IndexMap<String, Vec<String>>,
) -> Result<Vec<String>, ConfigError> {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut graph: HashMap<&str, Vec<&str>> = HashMap::new();

    for name in dependencies.keys() {
        in_degree.insert(name, 0);
        graph.insert(name, Vec::new());
    }

    for (name, deps) in dependencies {
        for dep in deps {
            if !dependencies.contains_key(dep) {
                return Err(ConfigError::UndefinedDependency {
                    name: name.clone(),
                    dependency: dep.clone(),
                });
            }
        }

        if let Some(degree) = in_degree.get_mut(name.as_str()) {
            *degree += deps.len();
        }
        for dep in deps {
            if let Some(dependents) = graph.get_mut(dep.as_str()) {
                dependents.push(name);
            }
        }
    }

    // Kahn's algorithm: start from names with no dependencies
    let mut queue: VecDeque<&str> = dependencies
        .keys()
        .map(String::as_str)
        .filter(|name| in_degree.get(name) == Some(&0))
        .collect();

    let mut sorted: Vec<String> = Vec::new();

    while let Some(name) = queue.pop_front() {
        sorted.push(name.to_string());

        if let Some(dependents) = graph.get(name) {
            for dependent in dependents {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(dependent);
                    }
                }
            }
        }
    }

    if sorted.len() != dependencies.len() {
        let unprocessed: Vec<String> = dependencies
            .keys()
            .filter(|name| !sorted.contains(name))
            .cloned()
            .collect();

        return Err(ConfigError::CircularDependency(unprocessed));
    }

    Ok(sorted)
}
