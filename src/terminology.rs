//! Code-table name to canonical code system URI lookup.
//!
//! HL7 v2 messages name code systems by table ids (`CVX`, `LN`, `HL70163`);
//! FHIR codings need canonical URIs. The table is static, embedded at build
//! time, and built at most once per process.

use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ConfigError;

/// Prefix of the HL7-defined v2 table code systems.
pub const HL7V2_SYSTEM_PREFIX: &str = "http://terminology.hl7.org/CodeSystem/v2-";

static CODING_SYSTEM_MAPPING: &str = include_str!("../resources/coding_system_mapping.yaml");

static GLOBAL_LOOKUP: OnceCell<Arc<SystemUrlLookup>> = OnceCell::new();

/// Read-only map from code-table name to canonical URI.
///
/// Components that need lookups take an `Arc<SystemUrlLookup>`; the shared
/// process-wide instance from [`SystemUrlLookup::global`] is only the default.
#[derive(Debug, Clone, Default)]
pub struct SystemUrlLookup {
    system_urls: HashMap<String, String>,
}

impl SystemUrlLookup {
    /// Build a table from `name: uri` YAML.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let map: HashMap<String, String> = serde_yaml::from_str(yaml)?;
        Ok(Self::from_map(map))
    }

    pub fn from_map(map: HashMap<String, String>) -> Self {
        let system_urls = map
            .into_iter()
            .map(|(name, url)| (name.to_uppercase(), url))
            .collect();
        Self { system_urls }
    }

    /// The table shipped with the crate.
    pub fn builtin() -> Result<Self, ConfigError> {
        Self::from_yaml_str(CODING_SYSTEM_MAPPING)
    }

    /// Build the shared table now instead of on first use.
    ///
    /// Safe to call from any number of threads; the table is built exactly once.
    pub fn init() -> Result<(), ConfigError> {
        Self::global().map(|_| ())
    }

    /// The shared process-wide table, built on first access.
    pub fn global() -> Result<Arc<Self>, ConfigError> {
        GLOBAL_LOOKUP
            .get_or_try_init(|| {
                let lookup = Self::builtin()?;
                tracing::debug!(entries = lookup.len(), "Loaded coding system mapping");
                Ok(Arc::new(lookup))
            })
            .cloned()
    }

    /// Canonical URI for a code-table name, matched case-insensitively.
    ///
    /// `None` input and unmapped names both resolve to `None`.
    pub fn resolve(&self, value: Option<&str>) -> Option<&str> {
        let value = value?;
        self.system_urls
            .get(&value.to_uppercase())
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.system_urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.system_urls.is_empty()
    }
}

/// URI of an HL7 v2 table code system, built from the table number without a lookup.
pub fn v2_system_url(value: Option<&str>) -> Option<String> {
    value.map(|v| format!("{}{}", HL7V2_SYSTEM_PREFIX, v))
}
