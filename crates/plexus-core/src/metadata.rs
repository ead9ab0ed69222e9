//! Plugin metadata record
//!
//! The metadata document is bundled alongside every artifact (same basename,
//! `.json` extension) and is also exported by the artifact itself through the
//! metadata ABI symbol.

use crate::capability::PluginCapabilities;
use crate::error::{ErrorKind, PluginError, Result};
use crate::version::Version;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Startup priority; higher priorities initialise first among peers of equal depth
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PluginPriority {
    /// Lowest priority
    Lowest = 0,
    /// Low priority
    Low = 1,
    /// Default priority
    #[default]
    Normal = 2,
    /// High priority
    High = 3,
    /// Highest priority
    Highest = 4,
    /// Infrastructure plugins that others expect to be up first
    Critical = 5,
}

impl fmt::Display for PluginPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PluginPriority::Lowest => "lowest",
            PluginPriority::Low => "low",
            PluginPriority::Normal => "normal",
            PluginPriority::High => "high",
            PluginPriority::Highest => "highest",
            PluginPriority::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Plugin metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginMetadata {
    /// Globally unique plugin id, reverse-DNS recommended
    pub id: String,

    /// Display name
    pub name: String,

    /// Plugin description
    #[serde(default)]
    pub description: String,

    /// Plugin version
    pub version: Version,

    /// Plugin author
    #[serde(default)]
    pub author: String,

    /// License identifier
    #[serde(default)]
    pub license: String,

    /// Homepage or repository URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,

    /// Free-form category
    #[serde(default)]
    pub category: String,

    /// Search tags
    #[serde(default)]
    pub tags: BTreeSet<String>,

    /// Required plugin ids
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Plugin ids used when present
    #[serde(default)]
    pub optional_dependencies: Vec<String>,

    /// Advertised capabilities
    #[serde(default)]
    pub capabilities: PluginCapabilities,

    /// Startup priority
    #[serde(default)]
    pub priority: PluginPriority,

    /// Minimum supported host version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_host_version: Option<Version>,

    /// Maximum supported host version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_host_version: Option<Version>,

    /// Arbitrary extra data
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_data: BTreeMap<String, serde_json::Value>,
}

impl PluginMetadata {
    /// Start building metadata for a plugin id
    pub fn builder(id: impl Into<String>) -> PluginMetadataBuilder {
        PluginMetadataBuilder::new(id)
    }

    /// Parse a metadata document
    pub fn from_json(document: &str) -> Result<Self> {
        let metadata: PluginMetadata = serde_json::from_str(document).map_err(|e| {
            PluginError::invalid_format(format!("Invalid plugin metadata document: {e}"))
        })?;
        metadata.validate()?;
        Ok(metadata)
    }

    /// Parse a metadata document from a JSON value
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let metadata: PluginMetadata = serde_json::from_value(value).map_err(|e| {
            PluginError::invalid_format(format!("Invalid plugin metadata document: {e}"))
        })?;
        metadata.validate()?;
        Ok(metadata)
    }

    /// Serialise to a pretty-printed document
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Structural validation
    pub fn validate(&self) -> Result<()> {
        validate_plugin_id(&self.id)?;

        if self.name.trim().is_empty() {
            return Err(PluginError::invalid_format("Plugin name cannot be empty")
                .with_plugin(self.id.clone()));
        }

        if self.dependencies.iter().any(|d| d == &self.id)
            || self.optional_dependencies.iter().any(|d| d == &self.id)
        {
            return Err(PluginError::circular_dependency(&[self.id.clone(), self.id.clone()])
                .with_plugin(self.id.clone()));
        }

        for dep in self.dependencies.iter().chain(&self.optional_dependencies) {
            validate_plugin_id(dep)?;
        }

        if let (Some(min), Some(max)) = (&self.min_host_version, &self.max_host_version) {
            if min > max {
                return Err(PluginError::invalid_format(format!(
                    "min_host_version {min} is greater than max_host_version {max}"
                ))
                .with_plugin(self.id.clone()));
            }
        }

        Ok(())
    }

    /// Check the host version against the declared bounds
    pub fn check_host_compatibility(&self, host: &Version) -> Result<()> {
        if let Some(min) = &self.min_host_version {
            if host < min {
                return Err(PluginError::new(
                    ErrorKind::VersionMismatch,
                    format!("Plugin {} requires host >= {min}, host is {host}", self.id),
                )
                .with_plugin(self.id.clone()));
            }
        }
        if let Some(max) = &self.max_host_version {
            if host > max {
                return Err(PluginError::new(
                    ErrorKind::VersionMismatch,
                    format!("Plugin {} requires host <= {max}, host is {host}", self.id),
                )
                .with_plugin(self.id.clone()));
            }
        }
        Ok(())
    }

    /// Whether the plugin advertises every capability in `caps`
    pub fn has_capability(&self, caps: PluginCapabilities) -> bool {
        self.capabilities.contains(caps)
    }

    /// Required and optional dependencies together
    pub fn all_dependencies(&self) -> impl Iterator<Item = &String> {
        self.dependencies.iter().chain(self.optional_dependencies.iter())
    }
}

/// Check that a plugin id is non-empty and made of `[A-Za-z0-9._-]`
pub fn validate_plugin_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(PluginError::invalid_argument("Plugin id cannot be empty"));
    }
    if id.starts_with('.') || id.ends_with('.') || id.contains("..") {
        return Err(PluginError::invalid_argument(format!(
            "Plugin id '{id}' has an empty segment"
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(PluginError::invalid_argument(format!(
            "Plugin id '{id}' contains invalid characters"
        )));
    }
    Ok(())
}

/// Builder for [`PluginMetadata`]
#[derive(Debug, Clone)]
pub struct PluginMetadataBuilder {
    metadata: PluginMetadata,
}

impl PluginMetadataBuilder {
    /// New builder; the display name defaults to the id
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            metadata: PluginMetadata {
                name: id.clone(),
                id,
                description: String::new(),
                version: Version::new(0, 1, 0),
                author: String::new(),
                license: String::new(),
                homepage: None,
                category: String::new(),
                tags: BTreeSet::new(),
                dependencies: Vec::new(),
                optional_dependencies: Vec::new(),
                capabilities: PluginCapabilities::empty(),
                priority: PluginPriority::Normal,
                min_host_version: None,
                max_host_version: None,
                custom_data: BTreeMap::new(),
            },
        }
    }

    /// Display name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.metadata.name = name.into();
        self
    }

    /// Description
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.metadata.description = description.into();
        self
    }

    /// Version
    pub fn version(mut self, version: Version) -> Self {
        self.metadata.version = version;
        self
    }

    /// Author
    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.metadata.author = author.into();
        self
    }

    /// License
    pub fn license(mut self, license: impl Into<String>) -> Self {
        self.metadata.license = license.into();
        self
    }

    /// Homepage
    pub fn homepage(mut self, homepage: impl Into<String>) -> Self {
        self.metadata.homepage = Some(homepage.into());
        self
    }

    /// Category
    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.metadata.category = category.into();
        self
    }

    /// Add a tag
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.metadata.tags.insert(tag.into());
        self
    }

    /// Add a required dependency
    pub fn dependency(mut self, plugin_id: impl Into<String>) -> Self {
        self.metadata.dependencies.push(plugin_id.into());
        self
    }

    /// Add an optional dependency
    pub fn optional_dependency(mut self, plugin_id: impl Into<String>) -> Self {
        self.metadata.optional_dependencies.push(plugin_id.into());
        self
    }

    /// Add capabilities
    pub fn capabilities(mut self, caps: PluginCapabilities) -> Self {
        self.metadata.capabilities.insert(caps);
        self
    }

    /// Priority
    pub fn priority(mut self, priority: PluginPriority) -> Self {
        self.metadata.priority = priority;
        self
    }

    /// Minimum host version
    pub fn min_host_version(mut self, version: Version) -> Self {
        self.metadata.min_host_version = Some(version);
        self
    }

    /// Maximum host version
    pub fn max_host_version(mut self, version: Version) -> Self {
        self.metadata.max_host_version = Some(version);
        self
    }

    /// Custom key/value
    pub fn custom(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.custom_data.insert(key.into(), value);
        self
    }

    /// Validate and build
    pub fn build(self) -> Result<PluginMetadata> {
        self.metadata.validate()?;
        Ok(self.metadata)
    }
}
