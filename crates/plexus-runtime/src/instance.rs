//! A live plugin object together with the artifact it came from

use plexus_core::PluginMetadata;
use plexus_plugin_api::Plugin;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::debug;

/// Private copy of an artifact, removed when the instance goes away
#[derive(Debug)]
pub(crate) struct StagedCopy {
    path: PathBuf,
}

impl StagedCopy {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagedCopy {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), error = %e, "Staged artifact not removed");
        }
    }
}

/// One instantiated plugin.
///
/// Fields drop in declaration order: the plugin object goes first, then the
/// library that holds its code, then the staged copy of the artifact.
pub struct PluginInstance {
    plugin: RwLock<Box<dyn Plugin>>,
    metadata: PluginMetadata,
    generation: u64,
    source_path: PathBuf,
    library: Option<libloading::Library>,
    staged: Option<StagedCopy>,
}

impl fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginInstance")
            .field("plugin_id", &self.metadata.id)
            .field("version", &self.metadata.version)
            .field("generation", &self.generation)
            .field("source_path", &self.source_path)
            .field("native", &self.library.is_some())
            .finish()
    }
}

impl PluginInstance {
    pub(crate) fn new(
        plugin: Box<dyn Plugin>,
        metadata: PluginMetadata,
        generation: u64,
        source_path: PathBuf,
        library: Option<libloading::Library>,
        staged: Option<StagedCopy>,
    ) -> Self {
        Self {
            plugin: RwLock::new(plugin),
            metadata,
            generation,
            source_path,
            library,
            staged,
        }
    }

    /// The plugin object
    pub fn plugin(&self) -> &RwLock<Box<dyn Plugin>> {
        &self.plugin
    }

    /// Metadata validated at load time
    pub fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    /// Instance generation within its record
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Artifact the instance was loaded from
    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    /// Private copy the native library was opened from
    pub fn staged_path(&self) -> Option<&Path> {
        self.staged.as_ref().map(StagedCopy::path)
    }

    /// Whether the code came from a shared library
    pub fn is_native(&self) -> bool {
        self.library.is_some()
    }
}
