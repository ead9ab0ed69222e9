//! Unified plugin manager
//!
//! Coordinates the local [`PluginManager`] and the [`RemotePipeline`]:
//! a load request is resolved against local search paths and remote
//! repositories in the order its [`LoadStrategy`] prescribes, the chosen
//! artifact is handed to the local manager, and the artifact's origin is
//! recorded on the plugin record.

use crate::events::{LifecycleForwarder, PluginLifecycleEvent};
use crate::options::{LoadStrategy, UnifiedLoadOptions};
use parking_lot::Mutex;
use plexus_bus::{BusStatisticsSnapshot, Message, MessageBus, SubscriptionHandle};
use plexus_config::{validate_config, HostConfig};
use plexus_contracts::ContractRegistry;
use plexus_core::{ErrorKind, PluginError, Result, Version};
use plexus_recovery::{
    CircuitBreaker, CircuitBreakerMetrics, RecoveryExecutor, RecoveryPolicy, RecoveryStrategy,
};
use plexus_remote::{AcquiredArtifact, InstalledPlugin, PipelineMetricsSnapshot, RemotePipeline};
use plexus_runtime::{
    ArtifactWatcher, DiscoveredPlugin, LoadOptions, LoadReport, ObserverId, PluginHandle,
    PluginInfo, PluginManager, PluginSource, RegistrySnapshot, RuntimeMetricsSnapshot,
};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Prefix of the per-plugin circuit breaker operations guarding remote acquisition
pub const REMOTE_ACQUIRE: &str = "remote.acquire";

/// Point-in-time view of the whole host
#[derive(Debug, Clone, Serialize)]
pub struct HostStatus {
    /// Registered plugins
    pub plugins: RegistrySnapshot,
    /// Local runtime counters
    pub runtime: RuntimeMetricsSnapshot,
    /// Remote pipeline counters
    pub pipeline: PipelineMetricsSnapshot,
    /// Bus counters
    pub bus: BusStatisticsSnapshot,
    /// Circuit breakers by operation
    pub breakers: Vec<(String, CircuitBreakerMetrics)>,
}

/// Where a load request was satisfied
pub(crate) enum Located {
    Local(DiscoveredPlugin),
    Remote(AcquiredArtifact),
}

/// Source recorded for a remotely acquired artifact
pub(crate) fn remote_source(artifact: &AcquiredArtifact) -> PluginSource {
    let repository = artifact.repository.clone();
    if artifact.from_cache {
        PluginSource::Cache { repository }
    } else {
        PluginSource::Remote { repository }
    }
}

/// One API over local and remote plugins
pub struct UnifiedManager {
    pub(crate) config: HostConfig,
    pub(crate) local: Arc<PluginManager>,
    pub(crate) pipeline: Arc<RemotePipeline>,
    bus: Arc<MessageBus>,
    recovery: RecoveryExecutor,
    observer: Mutex<Option<ObserverId>>,
    watcher: Mutex<Option<ArtifactWatcher>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    pub(crate) cancel: CancellationToken,
    shut_down: AtomicBool,
}

impl fmt::Debug for UnifiedManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnifiedManager")
            .field("local", &self.local)
            .field("pipeline", &self.pipeline)
            .field("tasks", &self.tasks.lock().len())
            .field("shut_down", &self.shut_down.load(Ordering::Relaxed))
            .finish()
    }
}

impl UnifiedManager {
    /// Build the host from its configuration
    ///
    /// Creates the bus, contract registry, local manager and remote pipeline,
    /// then registers the configured repositories. Background work is not
    /// started until [`start`](Self::start).
    pub fn new(config: HostConfig) -> Result<Self> {
        validate_config(&config)?;
        let bus = Arc::new(MessageBus::new(config.bus.clone())?);
        let contracts = Arc::new(ContractRegistry::new());
        let local = Arc::new(PluginManager::new(config.runtime.clone(), bus, contracts)?);
        let pipeline = Arc::new(RemotePipeline::open(config.remote.clone())?);
        Self::from_parts(config, local, pipeline)
    }

    /// Build the host over existing components
    pub fn from_parts(
        config: HostConfig,
        local: Arc<PluginManager>,
        pipeline: Arc<RemotePipeline>,
    ) -> Result<Self> {
        for repository in &config.repositories {
            match pipeline.add_repository(repository.clone()) {
                Ok(()) => {}
                Err(e) if e.is(ErrorKind::AlreadyExists) => {
                    debug!(repository = %repository.id, "Repository already registered");
                }
                Err(e) => return Err(e),
            }
        }

        let bus = Arc::clone(local.bus());
        let observer = local
            .registry()
            .add_observer(Arc::new(LifecycleForwarder::new(Arc::clone(&bus))));
        let recovery = RecoveryExecutor::new()
            .with_circuit_breaker(CircuitBreaker::new(config.recovery.circuit_breaker.clone()));

        info!(
            search_paths = local.config().search_paths.len(),
            repositories = pipeline.repositories().all().len(),
            update_policy = ?config.remote.updates.policy,
            "Plexus host ready"
        );
        Ok(Self {
            config,
            local,
            pipeline,
            bus,
            recovery,
            observer: Mutex::new(Some(observer)),
            watcher: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Host configuration
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Local plugin manager
    pub fn local(&self) -> &Arc<PluginManager> {
        &self.local
    }

    /// Remote acquisition pipeline
    pub fn pipeline(&self) -> &Arc<RemotePipeline> {
        &self.pipeline
    }

    /// Communication bus shared with every plugin
    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    /// Service contract registry
    pub fn contracts(&self) -> &Arc<ContractRegistry> {
        self.local.contracts()
    }

    /// Recovery executor guarding remote acquisition
    pub fn recovery(&self) -> &RecoveryExecutor {
        &self.recovery
    }

    /// Start background work: cache sweeps, catalog refreshes, update checks
    /// and, when configured, the artifact watcher
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(PluginError::invalid_state("Host has been shut down"));
        }
        let mut tasks = self.pipeline.start_maintenance(self.cancel.child_token());
        tasks.push(self.start_auto_update(self.cancel.child_token()));

        if self.config.runtime.hot_reload.watch {
            let mut watcher = ArtifactWatcher::new(Arc::clone(&self.local));
            watcher.start()?;
            tasks.push(watcher.run()?);
            *self.watcher.lock() = Some(watcher);
        }

        let started = tasks.len();
        self.tasks.lock().extend(tasks);
        info!(tasks = started, "Background tasks started");
        Ok(())
    }

    /// Load a plugin according to `options.strategy`
    pub async fn load_plugin(&self, plugin_id: &str, options: UnifiedLoadOptions) -> Result<PluginHandle> {
        if self.local.registry().contains(plugin_id) {
            return Err(PluginError::new(
                ErrorKind::AlreadyLoaded,
                format!("Plugin {plugin_id} is already loaded"),
            )
            .with_plugin(plugin_id));
        }
        let located = self.locate(plugin_id, &options).await?;
        self.load_located(located, &options).await
    }

    /// Acquire a plugin from the remote repositories, load it and record it
    /// in the installed ledger
    ///
    /// Installing the version that is already running only refreshes the
    /// ledger; installing another version switches the running plugin to it.
    pub async fn install_plugin(&self, plugin_id: &str, version: Option<&Version>) -> Result<PluginHandle> {
        let artifact = self.acquire_remote(plugin_id, version).await?;
        match self.local.get_plugin(plugin_id) {
            Some(handle) if handle.version() == artifact.version => {
                self.pipeline.record_install(&artifact)?;
                debug!(plugin = plugin_id, version = %artifact.version, "Plugin already installed");
                Ok(handle)
            }
            Some(handle) => {
                self.apply_artifact(&artifact, handle.version(), false).await?;
                self.local
                    .get_plugin(plugin_id)
                    .ok_or_else(|| PluginError::plugin_not_found(plugin_id))
            }
            None => {
                let options = UnifiedLoadOptions::with_strategy(LoadStrategy::RemoteOnly);
                self.load_located(Located::Remote(artifact), &options).await
            }
        }
    }

    /// Unload a plugin and drop it from the ledger and the cache
    pub async fn uninstall_plugin(&self, plugin_id: &str) -> Result<Option<InstalledPlugin>> {
        if self.local.registry().contains(plugin_id) {
            self.local.unload_plugin(plugin_id).await?;
        }
        self.pipeline.uninstall(plugin_id)
    }

    /// Unload a plugin, keeping it installed
    pub async fn unload_plugin(&self, plugin_id: &str) -> Result<()> {
        self.local.unload_plugin(plugin_id).await
    }

    /// Discover and load everything in the local search paths
    pub async fn load_all(&self) -> Result<LoadReport> {
        self.local.load_all().await
    }

    /// Handle of a registered plugin
    pub fn get_plugin(&self, plugin_id: &str) -> Option<PluginHandle> {
        self.local.get_plugin(plugin_id)
    }

    /// Views of all registered plugins
    pub fn list_plugins(&self) -> Vec<PluginInfo> {
        self.local.list_plugins()
    }

    /// Run a command on a running plugin
    pub async fn execute_command(
        &self,
        plugin_id: &str,
        command: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value> {
        self.local.execute_command(plugin_id, command, params).await
    }

    /// Receive every plugin state change as a typed event
    pub fn subscribe_lifecycle<F>(&self, subscriber: &str, handler: F) -> Result<SubscriptionHandle>
    where
        F: Fn(PluginLifecycleEvent) + Send + Sync + 'static,
    {
        self.bus
            .events()
            .subscribe::<PluginLifecycleEvent, _>(subscriber, move |event, _: &Message| {
                handler(event);
                Ok(())
            })
    }

    /// Snapshot of registry, counters and breakers
    pub fn status(&self) -> HostStatus {
        HostStatus {
            plugins: self.local.snapshot(),
            runtime: self.local.metrics(),
            pipeline: self.pipeline.metrics(),
            bus: self.bus.statistics(),
            breakers: self
                .recovery
                .circuit_breaker()
                .map(|b| b.all_metrics())
                .unwrap_or_default(),
        }
    }

    /// Stop background work, unload every plugin and close the bus
    ///
    /// Calling it again has no effect.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        if let Some(mut watcher) = self.watcher.lock().take() {
            watcher.stop();
        }
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "Background task ended abnormally");
                }
            }
        }

        self.local.shutdown().await;
        if let Err(e) = self.pipeline.cache().flush() {
            warn!(error = %e, "Cache index flush failed");
        }
        if let Some(id) = self.observer.lock().take() {
            self.local.registry().remove_observer(id);
        }
        self.bus.shutdown();
        info!("Plexus host shut down");
    }

    async fn locate(&self, plugin_id: &str, options: &UnifiedLoadOptions) -> Result<Located> {
        let version = options.version.as_ref();
        match options.strategy {
            LoadStrategy::LocalOnly => self.find_local(plugin_id, version).map(Located::Local),
            LoadStrategy::RemoteOnly => self
                .acquire_remote(plugin_id, version)
                .await
                .map(Located::Remote),
            LoadStrategy::PreferLocal => match self.find_local(plugin_id, version) {
                Ok(found) => Ok(Located::Local(found)),
                Err(local) => {
                    debug!(plugin = plugin_id, error = %local, "No local copy, trying remote");
                    self.acquire_remote(plugin_id, version)
                        .await
                        .map(Located::Remote)
                        .map_err(|e| e.with_context(format!("local: {}", local.message())))
                }
            },
            LoadStrategy::PreferRemote => match self.acquire_remote(plugin_id, version).await {
                Ok(artifact) => Ok(Located::Remote(artifact)),
                Err(e) if e.is(ErrorKind::OperationCancelled) => Err(e),
                Err(remote) => {
                    warn!(plugin = plugin_id, error = %remote, "Remote acquisition failed, trying local copy");
                    self.find_local(plugin_id, version)
                        .map(Located::Local)
                        .map_err(|_| remote)
                }
            },
            LoadStrategy::BestVersion => self.locate_best(plugin_id, version).await,
        }
    }

    async fn locate_best(&self, plugin_id: &str, version: Option<&Version>) -> Result<Located> {
        let local = self.find_local(plugin_id, version).ok();
        let remote = match self.pipeline.resolve(plugin_id, version).await {
            Ok((_, entry)) => Some(*entry.version()),
            Err(e) => {
                debug!(plugin = plugin_id, error = %e, "No remote candidate");
                None
            }
        };

        match (local, remote) {
            (Some(found), Some(newer)) if newer > found.metadata.version => {
                match self.acquire_remote(plugin_id, Some(&newer)).await {
                    Ok(artifact) => Ok(Located::Remote(artifact)),
                    Err(e) => {
                        warn!(
                            plugin = plugin_id,
                            remote = %newer,
                            local = %found.metadata.version,
                            error = %e,
                            "Newer remote version unavailable, using local copy"
                        );
                        Ok(Located::Local(found))
                    }
                }
            }
            (Some(found), _) => Ok(Located::Local(found)),
            (None, Some(newer)) => self
                .acquire_remote(plugin_id, Some(&newer))
                .await
                .map(Located::Remote),
            (None, None) => Err(PluginError::plugin_not_found(plugin_id)),
        }
    }

    /// A local artifact for the plugin, matching `version` when given
    pub(crate) fn find_local(&self, plugin_id: &str, version: Option<&Version>) -> Result<DiscoveredPlugin> {
        let found = self
            .local
            .loader()
            .find(plugin_id, &self.local.config().search_paths)?;
        match version {
            Some(wanted) if found.metadata.version != *wanted => {
                Err(PluginError::plugin_not_found(plugin_id).with_details(format!(
                    "local copy is {}, wanted {wanted}",
                    found.metadata.version
                )))
            }
            _ => Ok(found),
        }
    }

    /// Run the pipeline under the configured retry policy and circuit breaker
    ///
    /// Each plugin id gets its own breaker, named `remote.acquire:<id>`.
    pub(crate) async fn acquire_remote(
        &self,
        plugin_id: &str,
        version: Option<&Version>,
    ) -> Result<AcquiredArtifact> {
        let policy = RecoveryPolicy::new(RecoveryStrategy::Retry(self.config.recovery.retry.clone()));
        let pipeline = &*self.pipeline;
        let cancel = &self.cancel;
        let operation = format!("{REMOTE_ACQUIRE}:{plugin_id}");
        let recovered = self
            .recovery
            .execute(&operation, &policy, move || {
                pipeline.acquire(plugin_id, version, cancel)
            })
            .await?;
        recovered
            .into_value()
            .ok_or_else(|| PluginError::plugin_not_found(plugin_id))
    }

    pub(crate) async fn load_located(
        &self,
        located: Located,
        options: &UnifiedLoadOptions,
    ) -> Result<PluginHandle> {
        let (path, source, acquired) = match located {
            Located::Local(found) => (found.path, PluginSource::Local, None),
            Located::Remote(artifact) => (artifact.path.clone(), remote_source(&artifact), Some(artifact)),
        };
        let load = LoadOptions {
            config: options.config.clone(),
            initialize: options.initialize,
            source: source.clone(),
            hot_reload: options.hot_reload,
        };
        let handle = self.local.load_from_path(&path, load).await?;

        if let Some(artifact) = &acquired {
            if options.record_install {
                self.pipeline.record_install(artifact)?;
            }
        }
        info!(
            plugin = %handle.id(),
            version = %handle.version(),
            source = %source,
            strategy = %options.strategy,
            "Plugin ready"
        );
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plexus_remote::RemoteConfig;
    use plexus_runtime::RuntimeConfig;

    fn config(dir: &std::path::Path) -> HostConfig {
        HostConfig {
            runtime: RuntimeConfig {
                staging_dir: Some(dir.join("staging")),
                ..RuntimeConfig::default()
            }
            .with_search_path(dir.join("plugins")),
            remote: RemoteConfig::default().with_cache_dir(dir.join("cache")),
            ..HostConfig::default()
        }
    }

    #[tokio::test]
    async fn test_unknown_plugin_local_only() {
        let dir = tempfile::tempdir().unwrap();
        let manager = UnifiedManager::new(config(dir.path())).unwrap();

        let err = manager
            .load_plugin(
                "com.example.missing",
                UnifiedLoadOptions::with_strategy(LoadStrategy::LocalOnly),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PluginNotFound);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_twice() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(UnifiedManager::new(config(dir.path())).unwrap());
        manager.start().unwrap();
        manager.shutdown().await;
        manager.shutdown().await;
        assert!(manager.start().is_err());
    }

    #[tokio::test]
    async fn test_status_includes_every_component() {
        let dir = tempfile::tempdir().unwrap();
        let manager = UnifiedManager::new(config(dir.path())).unwrap();
        let status = manager.status();
        assert!(status.plugins.plugins.is_empty());
        assert_eq!(status.pipeline.network_fetches, 0);
        assert!(serde_json::to_value(&status).is_ok());
        manager.shutdown().await;
    }
}
