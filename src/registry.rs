//! Tool registry: risk level, base scopes and input schema per tool.
//!
//! Loaded once from a TOML `[[tools]]` array and read-only afterwards.
//! [`ToolRegistry::search`] is the discovery surface and never returns
//! schemas.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::policy::RiskLevel;

/// Registry entry for one tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRecord {
    /// Unique tool name.
    pub name: String,
    /// One-line description shown in search results.
    #[serde(default)]
    pub description: String,
    /// Raw risk string; parsed by the policy engine so unknown values fail
    /// closed.
    pub risk_level: String,
    /// Scopes an approval must cover, before argument-derived ones.
    #[serde(default)]
    pub required_scopes: Vec<String>,
    /// JSON schema of the tool's input.
    #[serde(default = "empty_object")]
    pub input_schema: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// What discovery reveals about a tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolSummary {
    /// Tool name.
    pub name: String,
    /// Description.
    pub description: String,
    /// Whether calling it is anything but safe.
    pub sensitive: bool,
}

/// Registry load failures.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The TOML could not be parsed.
    #[error("failed to parse tool registry: {0}")]
    Parse(#[from] toml::de::Error),
    /// The same name appeared twice.
    #[error("duplicate tool name: {0}")]
    Duplicate(String),
}

#[derive(Deserialize)]
struct RegistryFile {
    #[serde(default)]
    tools: Vec<ToolRecord>,
}

/// Name-indexed set of [`ToolRecord`]s.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, ToolRecord>,
}

impl ToolRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a `[[tools]]` TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] on malformed TOML or duplicate names.
    pub fn from_toml(raw: &str) -> Result<Self, RegistryError> {
        let file: RegistryFile = toml::from_str(raw)?;
        let mut registry = Self::new();
        for record in file.tools {
            if registry.is_registered(&record.name) {
                return Err(RegistryError::Duplicate(record.name));
            }
            registry.register(record);
        }
        Ok(registry)
    }

    /// Add or replace a tool.
    pub fn register(&mut self, record: ToolRecord) {
        self.tools.insert(record.name.clone(), record);
    }

    /// Look up a tool.
    pub fn get(&self, name: &str) -> Option<&ToolRecord> {
        self.tools.get(name)
    }

    /// Whether `name` is registered.
    pub fn is_registered(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Case-insensitive substring match on name or description. An empty
    /// query lists everything.
    pub fn search(&self, query: &str) -> Vec<ToolSummary> {
        let needle = query.trim().to_lowercase();
        self.tools
            .values()
            .filter(|t| {
                needle.is_empty()
                    || t.name.to_lowercase().contains(&needle)
                    || t.description.to_lowercase().contains(&needle)
            })
            .map(|t| ToolSummary {
                name: t.name.clone(),
                description: t.description.clone(),
                sensitive: RiskLevel::parse(&t.risk_level) != Some(RiskLevel::Safe),
            })
            .collect()
    }
}
