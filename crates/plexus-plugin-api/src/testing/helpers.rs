//! Test helpers for plugin and host tests

use crate::context::{PluginContext, PluginDirectory};
use plexus_bus::{BusConfig, MessageBus};
use plexus_contracts::ContractRegistry;
use plexus_core::{PluginMetadata, PluginState, Result};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

/// Platform extension for native plugin artifacts
pub fn artifact_extension() -> &'static str {
    std::env::consts::DLL_EXTENSION
}

/// File stem used for a plugin's artifact
pub fn artifact_stem(plugin_id: &str) -> String {
    plugin_id.replace('.', "_")
}

/// Write a placeholder artifact plus its bundled metadata document into
/// `dir` and return the artifact path.
///
/// The artifact bytes are not a real shared object; hosts load it through a
/// static factory registered under the same plugin id.
pub fn write_artifact(dir: &Path, metadata: &PluginMetadata) -> Result<PathBuf> {
    write_artifact_with_stem(dir, &artifact_stem(&metadata.id), metadata)
}

/// [`write_artifact`] with an explicit file stem
pub fn write_artifact_with_stem(dir: &Path, stem: &str, metadata: &PluginMetadata) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let artifact = dir.join(format!("{stem}.{}", artifact_extension()));
    std::fs::write(
        &artifact,
        format!("plexus-test-artifact {} {}\n", metadata.id, metadata.version),
    )?;
    std::fs::write(dir.join(format!("{stem}.json")), metadata.to_json()?)?;
    Ok(artifact)
}

#[derive(Debug, Default)]
struct NoDirectory;

impl PluginDirectory for NoDirectory {
    fn plugin_state(&self, _plugin_id: &str) -> Option<PluginState> {
        None
    }

    fn plugin_metadata(&self, _plugin_id: &str) -> Option<PluginMetadata> {
        None
    }

    fn plugin_ids(&self) -> Vec<String> {
        Vec::new()
    }
}

/// A context wired to a private bus and contract registry, for exercising a
/// plugin without a host
#[derive(Debug)]
pub struct TestContext {
    /// The bus the context publishes on
    pub bus: Arc<MessageBus>,
    /// The contract registry the context registers into
    pub contracts: Arc<ContractRegistry>,
    /// The context to hand to `initialize`
    pub context: PluginContext,
}

impl TestContext {
    /// Build a live context for `plugin_id`
    pub fn new(plugin_id: &str) -> Result<Self> {
        let bus = Arc::new(MessageBus::new(BusConfig::default())?);
        let contracts = Arc::new(ContractRegistry::new());
        let directory: Weak<dyn PluginDirectory> = Weak::<NoDirectory>::new();
        let context = PluginContext::new(
            plugin_id,
            0,
            serde_json::Value::Null,
            bus.clone(),
            contracts.clone(),
            directory,
        );
        Ok(Self {
            bus,
            contracts,
            context,
        })
    }
}
