//! Plugin loader
//!
//! Turns an artifact path into a [`PluginInstance`]. Before anything is
//! instantiated the loader checks that the file exists and carries the
//! platform's shared-library extension, parses the bundled metadata document
//! (same basename, `.json`), checks the host-version constraints, and hands
//! the artifact to the installed [`ArtifactVerifier`].
//!
//! Two instantiation paths exist:
//!
//! - **Static**: a factory registered with [`PluginLoader::register_static`]
//!   under the plugin id builds the object. The artifact on disk still
//!   supplies and validates the metadata.
//! - **Native**: the artifact is copied to a uniquely named file in the
//!   staging directory and opened with `libloading`, so a new build of the
//!   same path can be opened while the old one is still mapped.

use crate::config::RuntimeConfig;
use crate::instance::{PluginInstance, StagedCopy};
use dashmap::DashMap;
use parking_lot::RwLock;
use plexus_core::{ErrorKind, PluginError, PluginMetadata, Result, ResultExt};
use plexus_plugin_api::abi::{self, PluginCreateFn, PluginMetadataFn};
use plexus_plugin_api::{Plugin, PluginFactory};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Checks an artifact's origin and integrity before it is instantiated
pub trait ArtifactVerifier: Send + Sync + fmt::Debug {
    /// Accept or reject the artifact
    fn verify(&self, artifact: &Path, metadata: &PluginMetadata) -> Result<()>;
}

/// Information about a discovered plugin (before loading)
#[derive(Debug, Clone)]
pub struct DiscoveredPlugin {
    /// Plugin id from the bundled metadata
    pub id: String,

    /// Path to the artifact
    pub path: PathBuf,

    /// Parsed metadata document
    pub metadata: PluginMetadata,
}

/// Plugin loader
pub struct PluginLoader {
    config: RuntimeConfig,
    factories: DashMap<String, PluginFactory>,
    verifier: RwLock<Option<Arc<dyn ArtifactVerifier>>>,
}

impl fmt::Debug for PluginLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginLoader")
            .field("search_paths", &self.config.search_paths)
            .field("static_plugins", &self.factories.len())
            .field("verifier", &self.verifier.read().is_some())
            .finish()
    }
}

/// Sibling metadata document of an artifact
pub fn metadata_path(artifact: &Path) -> PathBuf {
    artifact.with_extension("json")
}

/// Whether a path has the platform's shared-library extension
pub fn is_artifact(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case(std::env::consts::DLL_EXTENSION))
        .unwrap_or(false)
}

impl PluginLoader {
    /// Create a loader
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            factories: DashMap::new(),
            verifier: RwLock::new(None),
        }
    }

    /// Configuration in effect
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Register a factory for a statically linked plugin
    pub fn register_static(&self, plugin_id: impl Into<String>, factory: PluginFactory) {
        let plugin_id = plugin_id.into();
        debug!(plugin = %plugin_id, "Static plugin factory registered");
        self.factories.insert(plugin_id, factory);
    }

    /// Remove a static factory
    pub fn unregister_static(&self, plugin_id: &str) -> bool {
        self.factories.remove(plugin_id).is_some()
    }

    /// Whether a static factory exists for the id
    pub fn has_static(&self, plugin_id: &str) -> bool {
        self.factories.contains_key(plugin_id)
    }

    /// Install the verifier every artifact passes through
    pub fn set_verifier(&self, verifier: Arc<dyn ArtifactVerifier>) {
        *self.verifier.write() = Some(verifier);
    }

    /// Read and validate the bundled metadata of an artifact
    pub fn read_metadata(&self, artifact: &Path) -> Result<PluginMetadata> {
        if !artifact.is_file() {
            return Err(PluginError::new(
                ErrorKind::FileNotFound,
                format!("Plugin artifact not found: {}", artifact.display()),
            ));
        }
        if !is_artifact(artifact) {
            return Err(PluginError::invalid_format(format!(
                "Unrecognized artifact extension: {} (expected .{})",
                artifact.display(),
                std::env::consts::DLL_EXTENSION
            )));
        }

        let document_path = metadata_path(artifact);
        let document = std::fs::read_to_string(&document_path).map_err(|e| {
            PluginError::new(
                ErrorKind::InvalidFormat,
                format!("Missing metadata document {}: {e}", document_path.display()),
            )
        })?;
        let metadata = PluginMetadata::from_json(&document)
            .with_context(format!("metadata {}", document_path.display()))?;
        metadata
            .check_host_compatibility(&self.config.host_version)
            .with_plugin(&metadata.id)?;
        Ok(metadata)
    }

    /// Scan directories for artifacts with a readable metadata document.
    ///
    /// The first occurrence of a plugin id wins; later duplicates are skipped
    /// with a warning.
    pub fn discover(&self, search_paths: &[PathBuf]) -> Vec<DiscoveredPlugin> {
        let mut found: Vec<DiscoveredPlugin> = Vec::new();

        for dir in search_paths {
            let entries = match std::fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(e) => {
                    debug!(path = %dir.display(), error = %e, "Search path skipped");
                    continue;
                }
            };

            let mut paths: Vec<PathBuf> = entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| is_artifact(p))
                .collect();
            paths.sort();

            for path in paths {
                match self.read_metadata(&path) {
                    Ok(metadata) => {
                        if found.iter().any(|d| d.id == metadata.id) {
                            warn!(plugin = %metadata.id, path = %path.display(), "Duplicate plugin artifact ignored");
                            continue;
                        }
                        found.push(DiscoveredPlugin {
                            id: metadata.id.clone(),
                            path,
                            metadata,
                        });
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Artifact skipped during discovery");
                    }
                }
            }
        }

        debug!(count = found.len(), "Plugin discovery finished");
        found
    }

    /// Discover in the configured search paths
    pub fn discover_configured(&self) -> Vec<DiscoveredPlugin> {
        self.discover(&self.config.search_paths)
    }

    /// Locate a plugin's artifact in the given search paths
    pub fn find(&self, plugin_id: &str, search_paths: &[PathBuf]) -> Result<DiscoveredPlugin> {
        self.discover(search_paths)
            .into_iter()
            .find(|d| d.id == plugin_id)
            .ok_or_else(|| PluginError::plugin_not_found(plugin_id))
    }

    /// Load an artifact into a new instance of the given generation
    pub fn load(&self, artifact: &Path, generation: u64) -> Result<PluginInstance> {
        let metadata = self.read_metadata(artifact)?;
        self.verify(artifact, &metadata)?;

        let instance = if let Some(factory) = self.factories.get(&metadata.id).map(|f| f.clone()) {
            let plugin = factory().with_plugin(&metadata.id)?;
            check_identity(plugin.as_ref(), &metadata)?;
            PluginInstance::new(plugin, metadata, generation, artifact.to_path_buf(), None, None)
        } else {
            let staged = self.stage(artifact, &metadata)?;
            let (library, plugin, exported) = native::open(staged.path()).with_plugin(&metadata.id)?;
            if let Some(exported) = exported {
                let exported = PluginMetadata::from_json(&exported).with_plugin(&metadata.id)?;
                if exported.id != metadata.id || exported.version != metadata.version {
                    return Err(PluginError::invalid_format(format!(
                        "Artifact exports {} {} but its metadata document declares {} {}",
                        exported.id, exported.version, metadata.id, metadata.version
                    ))
                    .with_plugin(metadata.id.as_str()));
                }
            }
            check_identity(plugin.as_ref(), &metadata)?;
            PluginInstance::new(
                plugin,
                metadata,
                generation,
                artifact.to_path_buf(),
                Some(library),
                Some(staged),
            )
        };

        info!(
            plugin = %instance.metadata().id,
            version = %instance.metadata().version,
            generation,
            native = instance.is_native(),
            "Plugin artifact loaded"
        );
        Ok(instance)
    }

    fn verify(&self, artifact: &Path, metadata: &PluginMetadata) -> Result<()> {
        let verifier = self.verifier.read().clone();
        match verifier {
            Some(verifier) => verifier.verify(artifact, metadata).with_plugin(&metadata.id),
            None if self.config.require_verification => Err(PluginError::security(
                "Artifact verification is required but no verifier is installed",
            )
            .with_plugin(metadata.id.as_str())),
            None => Ok(()),
        }
    }

    fn stage(&self, artifact: &Path, metadata: &PluginMetadata) -> Result<StagedCopy> {
        stage_copy(artifact, &self.config.staging_dir(), &metadata.id)
    }
}

/// Copy an artifact under a unique name in `dir`
fn stage_copy(artifact: &Path, dir: &Path, plugin_id: &str) -> Result<StagedCopy> {
    std::fs::create_dir_all(dir)
        .map_err(PluginError::from)
        .with_plugin(plugin_id)?;
    let stem = artifact
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("plugin");
    let target = dir.join(format!(
        "{stem}-{}.{}",
        Uuid::new_v4().simple(),
        std::env::consts::DLL_EXTENSION
    ));
    std::fs::copy(artifact, &target)
        .map_err(PluginError::from)
        .with_plugin(plugin_id)?;
    debug!(plugin = plugin_id, staged = %target.display(), "Artifact staged");
    Ok(StagedCopy::new(target))
}

fn check_identity(plugin: &dyn Plugin, metadata: &PluginMetadata) -> Result<()> {
    if plugin.id() != metadata.id {
        return Err(PluginError::invalid_format(format!(
            "Instance reports id {} but its metadata document declares {}",
            plugin.id(),
            metadata.id
        ))
        .with_plugin(metadata.id.as_str()));
    }
    Ok(())
}

#[allow(unsafe_code)]
mod native {
    use super::*;
    use std::ffi::CStr;

    /// Open a staged library and instantiate its plugin.
    ///
    /// Returns the library, the plugin object and the metadata document the
    /// library exports, if it exports one.
    pub(super) fn open(path: &Path) -> Result<(libloading::Library, Box<dyn Plugin>, Option<String>)> {
        // SAFETY: opening a library runs its initialisers. Artifacts reach
        // this point only after metadata validation and verification.
        let library = unsafe { libloading::Library::new(path) }.map_err(|e| {
            PluginError::new(
                ErrorKind::LoadFailed,
                format!("Failed to open {}: {e}", path.display()),
            )
        })?;

        // SAFETY: the symbol type is fixed by the plugin ABI version encoded
        // in its name; the returned string is static and NUL-terminated.
        let exported = unsafe {
            match library.get::<PluginMetadataFn>(abi::PLUGIN_METADATA_SYMBOL) {
                Ok(symbol) => {
                    let ptr = symbol();
                    if ptr.is_null() {
                        None
                    } else {
                        Some(CStr::from_ptr(ptr).to_string_lossy().into_owned())
                    }
                }
                Err(_) => None,
            }
        };

        // SAFETY: as above; the factory hands over a heap allocation made by
        // `Box::into_raw`, which is reclaimed exactly once here.
        let plugin = unsafe {
            let create = library.get::<PluginCreateFn>(abi::PLUGIN_CREATE_SYMBOL).map_err(|e| {
                PluginError::new(
                    ErrorKind::SymbolNotFound,
                    format!(
                        "Missing entry point '{}' in {}: {e}",
                        abi::symbol_name(abi::PLUGIN_CREATE_SYMBOL),
                        path.display()
                    ),
                )
            })?;
            let raw = create();
            if raw.is_null() {
                return Err(PluginError::new(
                    ErrorKind::LoadFailed,
                    format!("Factory in {} returned no plugin", path.display()),
                ));
            }
            *Box::from_raw(raw)
        };

        Ok((library, plugin, exported))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plexus_core::Version;
    use plexus_plugin_api::testing::{write_artifact, MockPlugin};

    fn loader() -> PluginLoader {
        PluginLoader::new(RuntimeConfig::default())
    }

    #[test]
    fn test_missing_artifact() {
        let err = loader().read_metadata(Path::new("/nonexistent/plugin.so")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileNotFound);
    }

    #[test]
    fn test_wrong_extension_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugin.txt");
        std::fs::write(&path, b"x").unwrap();
        let err = loader().read_metadata(&path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidFormat);
    }

    #[test]
    fn test_host_version_constraint() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = PluginMetadata::builder("com.example.future")
            .min_host_version(Version::new(99, 0, 0))
            .build()
            .unwrap();
        let artifact = write_artifact(dir.path(), &metadata).unwrap();
        let err = loader().read_metadata(&artifact).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::VersionMismatch);
        assert!(loader().discover(&[dir.path().to_path_buf()]).is_empty());
    }

    #[test]
    fn test_static_load_and_discovery() {
        let dir = tempfile::tempdir().unwrap();
        let builder = MockPlugin::builder("com.example.alpha");
        let artifact = write_artifact(dir.path(), builder.metadata()).unwrap();

        let loader = loader();
        loader.register_static("com.example.alpha", builder.factory());

        let found = loader.discover(&[dir.path().to_path_buf()]);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].path, artifact);

        let instance = loader.load(&artifact, 3).unwrap();
        assert_eq!(instance.metadata().id, "com.example.alpha");
        assert_eq!(instance.generation(), 3);
        assert!(!instance.is_native());
    }

    #[test]
    fn test_identity_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = PluginMetadata::builder("com.example.declared").build().unwrap();
        let artifact = write_artifact(dir.path(), &metadata).unwrap();

        let loader = loader();
        loader.register_static(
            "com.example.declared",
            MockPlugin::builder("com.example.other").factory(),
        );
        let err = loader.load(&artifact, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidFormat);
    }

    #[test]
    fn test_native_load_of_non_library_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let metadata = PluginMetadata::builder("com.example.native").build().unwrap();
        let artifact = write_artifact(dir.path(), &metadata).unwrap();

        let loader = PluginLoader::new(RuntimeConfig {
            staging_dir: Some(staging.path().to_path_buf()),
            ..Default::default()
        });
        let err = loader.load(&artifact, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LoadFailed);
        assert_eq!(std::fs::read_dir(staging.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_stage_copy_names_plugin_on_failure() {
        let staging = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        let artifact = source.path().join(format!("plugin.{}", std::env::consts::DLL_EXTENSION));

        let err = stage_copy(&artifact, staging.path(), "com.example.gone").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileNotFound);
        assert_eq!(err.plugin_id(), Some("com.example.gone"));

        std::fs::write(&artifact, b"bytes").unwrap();
        let staged = stage_copy(&artifact, staging.path(), "com.example.gone").unwrap();
        assert_eq!(std::fs::read(staged.path()).unwrap(), b"bytes");
        assert_ne!(staged.path(), artifact.as_path());
    }

    #[derive(Debug)]
    struct RejectAll;

    impl ArtifactVerifier for RejectAll {
        fn verify(&self, _artifact: &Path, _metadata: &PluginMetadata) -> Result<()> {
            Err(PluginError::signature_invalid("rejected"))
        }
    }

    #[test]
    fn test_verifier_runs_before_instantiation() {
        let dir = tempfile::tempdir().unwrap();
        let builder = MockPlugin::builder("com.example.signed");
        let probe = plexus_plugin_api::testing::MockProbe::default();
        let artifact = write_artifact(dir.path(), builder.metadata()).unwrap();

        let loader = loader();
        loader.register_static("com.example.signed", builder.probe(probe.clone()).factory());
        loader.set_verifier(Arc::new(RejectAll));

        let err = loader.load(&artifact, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SignatureInvalid);
        assert_eq!(probe.instances_created(), 0);
    }
}
