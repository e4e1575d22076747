//! YAML template loader.
//!
//! Templates are declared in YAML, one or more per file, keyed by name:
//!
//! ```yaml
//! immunization:
//!   resourceType: Immunization
//!   expressions:
//!     status:
//!       kind: literal
//!       value: completed
//!     vaccineCode:
//!       kind: resource
//!       template: codeable_concept
//!       path: RXA.5
//!       required: true
//!     lotNumber: RXA.15
//!     patient:
//!       kind: reference
//!       variable: Patient
//! ```
//!
//! A bare string is shorthand for a `field` expression. Templates referenced by
//! `resource` expressions are built before the templates that use them; unknown
//! templates, unknown transforms, bad conditions and reference cycles are
//! rejected at load time.

use indexmap::IndexMap;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::ConfigError;
use crate::expression::{
    Condition, ConditionalExpression, ExpressionAttributes, ExpressionMap, ExpressionRef,
    FieldPathExpression, LiteralExpression, NestedResourceExpression, ReferenceExpression,
    ScriptExpression,
};
use crate::runtime::config_loader::compute_extraction_order;
use crate::transform_registry::TransformRegistry;
use crate::value::Value;

/// An expression as written in YAML.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ExpressionSpec {
    /// Shorthand for `{kind: field, path: ...}`
    Path(String),
    Full(ExpressionDecl),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExpressionDecl {
    #[serde(flatten)]
    pub kind: ExpressionKindDecl,
    #[serde(flatten)]
    pub attributes: AttributeDecl,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExpressionKindDecl {
    Literal {
        value: serde_json::Value,
    },
    Field {
        path: String,
    },
    Resource {
        template: String,
        #[serde(default)]
        path: Option<String>,
        #[serde(default)]
        standalone: bool,
    },
    Conditional {
        when: String,
        then: Box<ExpressionSpec>,
        #[serde(default)]
        otherwise: Option<Box<ExpressionSpec>>,
    },
    Reference {
        variable: String,
    },
    Transform {
        function: String,
        #[serde(default)]
        args: IndexMap<String, ExpressionSpec>,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeDecl {
    #[serde(default)]
    pub required: bool,
    /// Unset means the kind's default (only references defer by default)
    #[serde(default)]
    pub evaluate_later: Option<bool>,
    #[serde(default)]
    pub generate_list: bool,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub vars: IndexMap<String, ExpressionSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateDecl {
    pub resource_type: String,
    pub expressions: IndexMap<String, ExpressionSpec>,
}

/// A built template.
#[derive(Debug, Clone)]
pub struct Template {
    pub name: String,
    pub resource_type: String,
    pub expressions: Arc<ExpressionMap>,
}

/// All templates available to a converter, by name.
#[derive(Debug, Clone, Default)]
pub struct TemplateSet {
    templates: IndexMap<String, Template>,
}

impl TemplateSet {
    /// Parse and build the templates in one YAML document.
    pub fn from_yaml_str(yaml: &str, registry: Arc<TransformRegistry>) -> Result<Self, ConfigError> {
        let decls: IndexMap<String, TemplateDecl> = serde_yaml::from_str(yaml)?;
        Self::from_decls(decls, registry)
    }

    /// Load all templates from a directory
    ///
    /// # Arguments
    ///
    /// * `dir` - Path to directory containing YAML template files
    /// * `registry` - Transforms available to `transform` expressions
    ///
    /// # Returns
    ///
    /// The built template set. Files are read in name order; a template name
    /// defined in two files is an error.
    ///
    /// # Example
    ///
    /// ```ignore
    /// use v2fhir::runtime::TemplateSet;
    ///
    /// let templates = TemplateSet::load_templates("config/immunization/templates", registry)?;
    /// ```
    pub fn load_templates<P: AsRef<Path>>(
        dir: P,
        registry: Arc<TransformRegistry>,
    ) -> Result<Self, ConfigError> {
        let dir_path = dir.as_ref();

        if !dir_path.is_dir() {
            return Err(ConfigError::Invalid(format!(
                "Path is not a directory: {}",
                dir_path.display()
            )));
        }

        let read_dir = fs::read_dir(dir_path).map_err(|source| io_error(dir_path, source))?;

        let mut files: Vec<PathBuf> = Vec::new();
        for entry in read_dir {
            let path = entry.map_err(|source| io_error(dir_path, source))?.path();
            // Only process .yaml and .yml files
            if let Some(ext) = path.extension() {
                if ext == "yaml" || ext == "yml" {
                    files.push(path);
                }
            }
        }
        files.sort();

        let mut decls: IndexMap<String, TemplateDecl> = IndexMap::new();
        for path in &files {
            let contents = fs::read_to_string(path).map_err(|source| io_error(path, source))?;
            let file_decls: IndexMap<String, TemplateDecl> = serde_yaml::from_str(&contents)?;
            for (name, decl) in file_decls {
                if decls.contains_key(&name) {
                    return Err(ConfigError::Invalid(format!(
                        "Template '{}' defined again in {}",
                        name,
                        path.display()
                    )));
                }
                decls.insert(name, decl);
            }
        }

        tracing::debug!(files = files.len(), templates = decls.len(), "Loaded template declarations");
        Self::from_decls(decls, registry)
    }

    /// Build templates from parsed declarations.
    pub fn from_decls(
        decls: IndexMap<String, TemplateDecl>,
        registry: Arc<TransformRegistry>,
    ) -> Result<Self, ConfigError> {
        let mut dependencies: IndexMap<String, Vec<String>> = IndexMap::new();
        for (name, decl) in &decls {
            let mut used = Vec::new();
            for spec in decl.expressions.values() {
                collect_templates(spec, &mut used);
            }
            for dependency in &used {
                if !decls.contains_key(dependency) {
                    return Err(ConfigError::UnknownTemplate(dependency.clone()));
                }
            }
            dependencies.insert(name.clone(), used);
        }

        let order = compute_extraction_order(&dependencies)?;

        let mut builder = Builder {
            built: IndexMap::new(),
            registry,
        };
        for name in order {
            let Some(decl) = decls.get(&name) else {
                continue;
            };
            let mut expressions = ExpressionMap::new();
            for (key, spec) in &decl.expressions {
                expressions.insert(key.clone(), builder.build(spec)?);
            }
            builder.built.insert(
                name.clone(),
                Template {
                    name,
                    resource_type: decl.resource_type.clone(),
                    expressions: Arc::new(expressions),
                },
            );
        }

        // Keep declaration order for callers.
        let mut templates = IndexMap::new();
        for name in decls.keys() {
            if let Some(template) = builder.built.swap_remove(name) {
                templates.insert(name.clone(), template);
            }
        }
        Ok(Self { templates })
    }

    pub fn get(&self, name: &str) -> Option<&Template> {
        self.templates.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.templates.keys()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

fn io_error(path: &Path, source: std::io::Error) -> ConfigError {
    ConfigError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Names of templates used by `spec`, in first-use order.
fn collect_templates(spec: &ExpressionSpec, used: &mut Vec<String>) {
    let ExpressionSpec::Full(decl) = spec else {
        return;
    };
    for var in decl.attributes.vars.values() {
        collect_templates(var, used);
    }
    match &decl.kind {
        ExpressionKindDecl::Resource { template, .. } => {
            if !used.contains(template) {
                used.push(template.clone());
            }
        }
        ExpressionKindDecl::Conditional {
            then, otherwise, ..
        } => {
            collect_templates(then, used);
            if let Some(otherwise) = otherwise {
                collect_templates(otherwise, used);
            }
        }
        ExpressionKindDecl::Transform { args, .. } => {
            for arg in args.values() {
                collect_templates(arg, used);
            }
        }
        ExpressionKindDecl::Literal { .. }
        | ExpressionKindDecl::Field { .. }
        | ExpressionKindDecl::Reference { .. } => {}
    }
}

struct Builder {
    built: IndexMap<String, Template>,
    registry: Arc<TransformRegistry>,
}

impl Builder {
    fn build(&self, spec: &ExpressionSpec) -> Result<ExpressionRef, ConfigError> {
        let decl = match spec {
            ExpressionSpec::Path(path) => return Ok(Arc::new(FieldPathExpression::new(path))),
            ExpressionSpec::Full(decl) => decl,
        };

        let deferred_by_default = matches!(decl.kind, ExpressionKindDecl::Reference { .. });
        let attributes = self.attributes(&decl.attributes, deferred_by_default)?;

        let expression: ExpressionRef = match &decl.kind {
            ExpressionKindDecl::Literal { value } => Arc::new(
                LiteralExpression::new(Value::from(value.clone())).with_attributes(attributes),
            ),
            ExpressionKindDecl::Field { path } => {
                Arc::new(FieldPathExpression::new(path).with_attributes(attributes))
            }
            ExpressionKindDecl::Resource {
                template,
                path,
                standalone,
            } => {
                let nested = self
                    .built
                    .get(template)
                    .ok_or_else(|| ConfigError::UnknownTemplate(template.clone()))?;
                let mut expression = NestedResourceExpression::new(
                    nested.resource_type.clone(),
                    Arc::clone(&nested.expressions),
                );
                if let Some(path) = path {
                    expression = expression.with_path(path);
                }
                if *standalone {
                    expression = expression.standalone();
                }
                Arc::new(expression.with_attributes(attributes))
            }
            ExpressionKindDecl::Conditional {
                when,
                then,
                otherwise,
            } => {
                let otherwise = match otherwise {
                    Some(spec) => Some(self.build(spec)?),
                    None => None,
                };
                Arc::new(
                    ConditionalExpression::new(Condition::parse(when)?, self.build(then)?, otherwise)
                        .with_attributes(attributes),
                )
            }
            ExpressionKindDecl::Reference { variable } => {
                Arc::new(ReferenceExpression::new(variable).with_attributes(attributes))
            }
            ExpressionKindDecl::Transform { function, args } => {
                if !self.registry.has_transform(function) {
                    return Err(ConfigError::UnknownTransform(function.clone()));
                }
                let mut built_args = ExpressionMap::new();
                for (name, arg) in args {
                    built_args.insert(name.clone(), self.build(arg)?);
                }
                Arc::new(
                    ScriptExpression::new(function.clone(), built_args, Arc::clone(&self.registry))
                        .with_attributes(attributes),
                )
            }
        };

        Ok(expression)
    }

    fn attributes(
        &self,
        decl: &AttributeDecl,
        deferred_by_default: bool,
    ) -> Result<ExpressionAttributes, ConfigError> {
        let mut attributes = ExpressionAttributes::new();
        attributes.required = decl.required;
        attributes.evaluate_later = decl.evaluate_later.unwrap_or(deferred_by_default);
        attributes.generate_list = decl.generate_list;
        if let Some(condition) = &decl.condition {
            attributes.condition = Some(Condition::parse(condition)?);
        }
        for (name, var) in &decl.vars {
            attributes.vars.insert(name.clone(), self.build(var)?);
        }
        Ok(attributes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terminology::SystemUrlLookup;
    use std::fs::File;
    use std::io::Write;
    use tempfile::TempDir;

    fn registry() -> Arc<TransformRegistry> {
        Arc::new(TransformRegistry::with_builtins(Arc::new(SystemUrlLookup::builtin().unwrap())))
    }

    const TEMPLATES_YAML: &str = r#"
immunization:
  resourceType: Immunization
  expressions:
    status:
      kind: literal
      value: completed
    vaccineCode:
      kind: resource
      template: codeable_concept
      path: RXA.5
      required: true
    lotNumber: RXA.15
    patient:
      kind: reference
      variable: Patient
codeable_concept:
  resourceType: CodeableConcept
  expressions:
    code: "1"
    system:
      kind: transform
      function: system_url
      args:
        code: "3"
"#;

    #[test]
    fn test_parse_and_build() {
        let set = TemplateSet::from_yaml_str(TEMPLATES_YAML, registry()).unwrap();

        assert_eq!(set.len(), 2);
        let names: Vec<&String> = set.names().collect();
        assert_eq!(names, vec!["immunization", "codeable_concept"]);

        let immunization = set.get("immunization").unwrap();
        assert_eq!(immunization.resource_type, "Immunization");
        let keys: Vec<&String> = immunization.expressions.keys().collect();
        assert_eq!(keys, vec!["status", "vaccineCode", "lotNumber", "patient"]);

        assert!(immunization.expressions["patient"].is_evaluate_later());
        assert!(!immunization.expressions["lotNumber"].is_evaluate_later());
    }

    #[test]
    fn test_attribute_overrides() {
        let yaml = r#"
t:
  resourceType: Basic
  expressions:
    subject:
      kind: reference
      variable: Patient
      evaluateLater: false
    note:
      kind: field
      path: NTE.3
      condition: "$kind EQUALS note"
      generateList: true
      vars:
        kind: NTE.2
"#;
        let set = TemplateSet::from_yaml_str(yaml, registry()).unwrap();
        let t = set.get("t").unwrap();
        assert!(!t.expressions["subject"].is_evaluate_later());
        assert!(!t.expressions["note"].is_evaluate_later());
    }

    #[test]
    fn test_unknown_template_rejected() {
        let yaml = r#"
a:
  resourceType: Basic
  expressions:
    x:
      kind: resource
      template: missing
"#;
        let result = TemplateSet::from_yaml_str(yaml, registry());
        assert!(matches!(result, Err(ConfigError::UnknownTemplate(ref name)) if name == "missing"));
    }

    #[test]
    fn test_unknown_transform_rejected() {
        let yaml = r#"
a:
  resourceType: Basic
  expressions:
    x:
      kind: transform
      function: frobnicate
"#;
        let result = TemplateSet::from_yaml_str(yaml, registry());
        assert!(matches!(result, Err(ConfigError::UnknownTransform(_))));
    }

    #[test]
    fn test_template_cycle_rejected() {
        let yaml = r#"
a:
  resourceType: Basic
  expressions:
    b: {kind: resource, template: b}
b:
  resourceType: Basic
  expressions:
    a: {kind: resource, template: a}
"#;
        let result = TemplateSet::from_yaml_str(yaml, registry());
        assert!(matches!(result, Err(ConfigError::CircularDependency(_))));
    }

    #[test]
    fn test_bad_condition_rejected() {
        let yaml = r#"
a:
  resourceType: Basic
  expressions:
    x: {kind: field, path: PID.3, condition: "status is set"}
"#;
        let result = TemplateSet::from_yaml_str(yaml, registry());
        assert!(matches!(result, Err(ConfigError::InvalidCondition { .. })));
    }

    #[test]
    fn test_load_templates_from_directory() {
        let temp_dir = TempDir::new().unwrap();

        let mut file = File::create(temp_dir.path().join("immunization.yaml")).unwrap();
        file.write_all(TEMPLATES_YAML.as_bytes()).unwrap();

        let mut other = File::create(temp_dir.path().join("patient.yml")).unwrap();
        other
            .write_all(b"patient:\n  resourceType: Patient\n  expressions:\n    gender: PID.8\n")
            .unwrap();

        File::create(temp_dir.path().join("README.txt")).unwrap();

        let set = TemplateSet::load_templates(temp_dir.path(), registry()).unwrap();
        assert_eq!(set.len(), 3);
        assert!(set.contains("patient"));
    }

    #[test]
    fn test_duplicate_template_across_files_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let body = b"patient:\n  resourceType: Patient\n  expressions:\n    gender: PID.8\n";
        File::create(temp_dir.path().join("a.yaml")).unwrap().write_all(body).unwrap();
        File::create(temp_dir.path().join("b.yaml")).unwrap().write_all(body).unwrap();

        let result = TemplateSet::load_templates(temp_dir.path(), registry());
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_templates_missing_dir() {
        let result = TemplateSet::load_templates("/nonexistent/templates", registry());
        assert!(result.is_err());
    }
}
