//! Local plugin manager
//!
//! Drives plugins through the lifecycle state machine: locating artifacts,
//! loading them through the [`PluginLoader`], initializing them with a
//! [`PluginContext`], and tearing them down again. Every operation that
//! changes a plugin's state holds that plugin's record lock for its whole
//! duration.

use crate::config::RuntimeConfig;
use crate::instance::PluginInstance;
use crate::loader::PluginLoader;
use crate::metrics::{RuntimeMetrics, RuntimeMetricsSnapshot};
use crate::registry::{
    PluginHandle, PluginInfo, PluginRecord, PluginRegistry, PluginSource, RegistrySnapshot,
};
use crate::resolver::DependencyResolver;
use plexus_bus::{BusConfig, Message, MessageBus, MessageHandler};
use plexus_contracts::ContractRegistry;
use plexus_core::{
    ErrorKind, PluginCapabilities, PluginError, PluginMetadata, PluginState, Result, ResultExt,
};
use plexus_plugin_api::{HealthStatus, PluginContext, PluginDirectory, PluginFactory};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Options for a single load
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Configuration document handed to the plugin
    pub config: Option<serde_json::Value>,
    /// Initialize after loading
    pub initialize: bool,
    /// Where the artifact came from
    pub source: PluginSource,
    /// Override the runtime's hot reload default
    pub hot_reload: Option<bool>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            config: None,
            initialize: true,
            source: PluginSource::Local,
            hot_reload: None,
        }
    }
}

impl LoadOptions {
    /// Load without initializing
    pub fn load_only() -> Self {
        Self {
            initialize: false,
            ..Self::default()
        }
    }

    /// Set the configuration document
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the artifact source
    pub fn with_source(mut self, source: PluginSource) -> Self {
        self.source = source;
        self
    }
}

/// Outcome of [`PluginManager::load_all`]
#[derive(Debug, Default, Clone, Serialize)]
pub struct LoadReport {
    /// Plugins that reached `Running`, in initialization order
    pub loaded: Vec<String>,
    /// Plugins that did not, with the reason
    pub failed: BTreeMap<String, PluginError>,
}

impl LoadReport {
    /// Whether every discovered plugin is running
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Local plugin manager
pub struct PluginManager {
    config: RuntimeConfig,
    loader: Arc<PluginLoader>,
    registry: Arc<PluginRegistry>,
    bus: Arc<MessageBus>,
    contracts: Arc<ContractRegistry>,
    metrics: Arc<RuntimeMetrics>,
    resolver: DependencyResolver,
}

impl fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginManager")
            .field("search_paths", &self.config.search_paths)
            .field("plugins", &self.registry.len())
            .field("contracts", &self.contracts.len())
            .finish()
    }
}

impl PluginManager {
    /// Create a manager over shared host services
    pub fn new(
        config: RuntimeConfig,
        bus: Arc<MessageBus>,
        contracts: Arc<ContractRegistry>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            loader: Arc::new(PluginLoader::new(config.clone())),
            config,
            registry: Arc::new(PluginRegistry::new()),
            bus,
            contracts,
            metrics: Arc::new(RuntimeMetrics::new()),
            resolver: DependencyResolver::new(),
        })
    }

    /// Create a manager with its own bus and contract registry
    pub fn standalone(config: RuntimeConfig) -> Result<Self> {
        let bus = Arc::new(MessageBus::new(BusConfig::default())?);
        Self::new(config, bus, Arc::new(ContractRegistry::new()))
    }

    /// Runtime configuration
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The loader
    pub fn loader(&self) -> &Arc<PluginLoader> {
        &self.loader
    }

    /// The registry
    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// The bus
    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    /// The contract registry
    pub fn contracts(&self) -> &Arc<ContractRegistry> {
        &self.contracts
    }

    /// Register an in-process factory for a plugin id
    pub fn register_static(&self, plugin_id: impl Into<String>, factory: PluginFactory) {
        self.loader.register_static(plugin_id, factory);
    }

    /// Locate a plugin in the configured search paths, load and initialize it
    pub async fn load_plugin(&self, plugin_id: &str) -> Result<PluginHandle> {
        self.load_plugin_with(plugin_id, LoadOptions::default()).await
    }

    /// Locate a plugin in the configured search paths and load it
    pub async fn load_plugin_with(
        &self,
        plugin_id: &str,
        options: LoadOptions,
    ) -> Result<PluginHandle> {
        if self.registry.contains(plugin_id) {
            return Err(PluginError::new(
                ErrorKind::AlreadyLoaded,
                format!("Plugin {plugin_id} is already loaded"),
            )
            .with_plugin(plugin_id));
        }
        let discovered = self.loader.find(plugin_id, &self.config.search_paths)?;
        self.load_from_path(&discovered.path, options).await
    }

    /// Load the artifact at `path`
    pub async fn load_from_path(&self, path: &Path, options: LoadOptions) -> Result<PluginHandle> {
        let started = Instant::now();
        let metadata = match self.loader.read_metadata(path) {
            Ok(metadata) => metadata,
            Err(e) => {
                self.metrics.record_load_failure();
                return Err(e);
            }
        };
        let plugin_id = metadata.id.clone();

        let record = PluginRecord::new(metadata.clone(), path);
        record.set_source(options.source.clone());
        record.set_config(options.config.clone().unwrap_or(serde_json::Value::Null));
        let record = self.registry.register(record)?;
        let guard = record.lock().await;
        self.registry.transition(&record, PluginState::Loading)?;

        let loaded = self
            .check_load_dependencies(&metadata)
            .and_then(|_| self.loader.load(path, record.next_generation()));
        let instance = match loaded {
            Ok(instance) => instance,
            Err(e) => {
                self.metrics.record_load_failure();
                if let Err(te) = self.registry.transition(&record, PluginState::Unloaded) {
                    warn!(plugin = %plugin_id, error = %te, "Failed load left record in place");
                }
                self.registry.unregister(&plugin_id);
                warn!(plugin = %plugin_id, error = %e, "Plugin load failed");
                return Err(e);
            }
        };

        record.set_instance(Some(Arc::new(instance)));
        self.registry.transition(&record, PluginState::Loaded)?;
        self.metrics.record_load(&plugin_id, started.elapsed());

        let hot_reload = options.hot_reload.unwrap_or(self.config.hot_reload.enabled);
        if hot_reload && metadata.has_capability(PluginCapabilities::HOT_RELOAD) {
            record.set_hot_reload(true);
        }

        if options.initialize {
            self.initialize_locked(&record).await?;
        }
        drop(guard);

        info!(
            plugin = %plugin_id,
            version = %metadata.version,
            state = %record.state(),
            source = %record.source(),
            "Plugin loaded"
        );
        self.registry
            .get(&plugin_id)
            .ok_or_else(|| PluginError::plugin_not_found(plugin_id.as_str()))
    }

    fn check_load_dependencies(&self, metadata: &PluginMetadata) -> Result<()> {
        for dep in &metadata.dependencies {
            let present = self
                .registry
                .plugin_state(dep)
                .is_some_and(|s| s.satisfies_dependency());
            if !present {
                return Err(PluginError::dependency_missing(&metadata.id, dep));
            }
        }
        Ok(())
    }

    /// Initialize a loaded (or stopped) plugin
    pub async fn initialize_plugin(&self, plugin_id: &str) -> Result<()> {
        let record = self.registry.require(plugin_id)?;
        let _guard = record.lock().await;
        self.initialize_locked(&record).await
    }

    async fn initialize_locked(&self, record: &Arc<PluginRecord>) -> Result<()> {
        let plugin_id = record.id().to_string();
        let state = record.state();
        if !matches!(state, PluginState::Loaded | PluginState::Stopped) {
            return Err(PluginError::new(
                ErrorKind::StateError,
                format!("Plugin {plugin_id} is {state}; only loaded or stopped plugins can be initialized"),
            )
            .with_plugin(plugin_id.as_str()));
        }

        self.check_dependencies(record)?;

        // A stopped instance has already been shut down; start from a fresh one.
        if state == PluginState::Stopped {
            let fresh = self.loader.load(&record.artifact_path(), record.next_generation())?;
            record.set_instance(Some(Arc::new(fresh)));
        }
        let instance = record.instance().ok_or_else(|| {
            PluginError::new(ErrorKind::NotLoaded, "Plugin has no instance")
                .with_plugin(plugin_id.as_str())
        })?;

        self.registry.transition(record, PluginState::Initializing)?;
        match self.bring_up(record, &instance).await {
            Ok(services) => {
                record.set_provided_services(services);
                record.set_last_error(None);
                self.metrics.record_initialization(true);
                self.registry.transition(record, PluginState::Running)
            }
            Err(e) => {
                self.release_host_registrations(&plugin_id);
                record.set_context(None);
                record.set_last_error(Some(e.clone()));
                self.metrics.record_initialization(false);
                self.registry.transition(record, PluginState::Error)?;
                warn!(plugin = %plugin_id, error = %e, "Plugin initialization failed");
                Err(e)
            }
        }
    }

    /// Every declared dependency must be running or paused
    pub(crate) fn check_dependencies(&self, record: &PluginRecord) -> Result<()> {
        for dep in &record.metadata().dependencies {
            let dep_state = self.registry.plugin_state(dep);
            if !dep_state.is_some_and(|s| s.is_active()) {
                return Err(PluginError::dependency_missing(record.id(), dep).with_context(format!(
                    "dependency state: {}",
                    dep_state.map(|s| s.as_str()).unwrap_or("absent")
                )));
            }
        }
        Ok(())
    }

    async fn bring_up(
        &self,
        record: &PluginRecord,
        instance: &Arc<PluginInstance>,
    ) -> Result<Vec<String>> {
        let plugin_id = record.id();
        let ctx = self.context_for(record, instance.generation(), record.config(), false);
        record.set_context(Some(ctx.clone()));

        {
            let mut plugin = instance.plugin().write().await;
            let initialized =
                tokio::time::timeout(self.config.initialize_timeout, plugin.initialize(ctx)).await;
            match initialized {
                Ok(result) => result.with_plugin(plugin_id)?,
                Err(_) => {
                    return Err(PluginError::timeout(format!(
                        "initialize() did not finish within {:?}",
                        self.config.initialize_timeout
                    ))
                    .with_plugin(plugin_id))
                }
            }
        }

        let plugin = instance.plugin().read().await;
        for contract in plugin.service_contracts() {
            if self.contracts.get(&contract.service_name, &contract.version).is_none() {
                self.contracts.register(plugin_id, contract)?;
            }
        }
        let events = plugin.supported_events();
        drop(plugin);
        route_events(&self.bus, plugin_id, instance, &events, false)?;

        Ok(self
            .contracts
            .contracts_of(plugin_id)
            .iter()
            .map(|c| c.service_name.clone())
            .collect())
    }

    pub(crate) fn context_for(
        &self,
        record: &PluginRecord,
        generation: u64,
        config: serde_json::Value,
        staged: bool,
    ) -> PluginContext {
        let directory: Weak<PluginRegistry> = Arc::downgrade(&self.registry);
        let directory: Weak<dyn PluginDirectory> = directory;
        if staged {
            PluginContext::staged(
                record.id(),
                generation,
                config,
                self.bus.clone(),
                self.contracts.clone(),
                directory,
            )
        } else {
            PluginContext::new(
                record.id(),
                generation,
                config,
                self.bus.clone(),
                self.contracts.clone(),
                directory,
            )
        }
    }

    pub(crate) fn release_host_registrations(&self, plugin_id: &str) {
        let services = self.contracts.unregister_provider(plugin_id);
        let (subscriptions, endpoints) = self.bus.release_plugin(plugin_id);
        debug!(
            plugin = %plugin_id,
            services = services.len(),
            subscriptions,
            endpoints,
            "Host registrations released"
        );
    }

    /// Pause a running plugin; the plugin must support it
    pub async fn pause_plugin(&self, plugin_id: &str) -> Result<()> {
        let record = self.registry.require(plugin_id)?;
        let _guard = record.lock().await;
        require_state(&record, PluginState::Running)?;
        let instance = live_instance(&record)?;
        instance.plugin().write().await.pause().await.with_plugin(plugin_id)?;
        self.registry.transition(&record, PluginState::Paused)
    }

    /// Resume a paused plugin
    pub async fn resume_plugin(&self, plugin_id: &str) -> Result<()> {
        let record = self.registry.require(plugin_id)?;
        let _guard = record.lock().await;
        require_state(&record, PluginState::Paused)?;
        let instance = live_instance(&record)?;
        instance.plugin().write().await.resume().await.with_plugin(plugin_id)?;
        self.registry.transition(&record, PluginState::Running)
    }

    /// Stop a plugin. Stopping a stopped plugin is a no-op; failures inside
    /// the shutdown sequence are logged and the plugin still ends `Stopped`.
    pub async fn stop_plugin(&self, plugin_id: &str) -> Result<()> {
        let record = self.registry.require(plugin_id)?;
        let _guard = record.lock().await;
        self.stop_locked(&record).await
    }

    async fn stop_locked(&self, record: &PluginRecord) -> Result<()> {
        let plugin_id = record.id();
        match record.state() {
            PluginState::Stopped => return Ok(()),
            PluginState::Running | PluginState::Paused | PluginState::Error => {}
            state => {
                return Err(PluginError::new(
                    ErrorKind::StateError,
                    format!("Plugin {plugin_id} is {state} and cannot be stopped"),
                )
                .with_plugin(plugin_id))
            }
        }
        self.registry.transition(record, PluginState::Stopping)?;

        let timeout = self.config.shutdown_timeout;
        match record.instance() {
            Some(instance) => {
                let mut plugin = instance.plugin().write().await;
                match tokio::time::timeout(timeout, plugin.prepare_shutdown()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(plugin = %plugin_id, error = %e, "prepare_shutdown failed"),
                    Err(_) => warn!(plugin = %plugin_id, "prepare_shutdown timed out"),
                }
                self.release_host_registrations(plugin_id);
                if tokio::time::timeout(timeout, plugin.shutdown()).await.is_err() {
                    warn!(plugin = %plugin_id, "shutdown timed out");
                }
            }
            None => self.release_host_registrations(plugin_id),
        }

        record.set_context(None);
        record.set_provided_services(Vec::new());
        self.metrics.record_stop();
        self.registry.transition(record, PluginState::Stopped)
    }

    /// Stop, then initialize a fresh instance of the same artifact
    pub async fn restart_plugin(&self, plugin_id: &str) -> Result<()> {
        let record = self.registry.require(plugin_id)?;
        let _guard = record.lock().await;
        self.stop_locked(&record).await?;
        self.initialize_locked(&record).await
    }

    /// Stop a plugin if needed, release its artifact and remove its record
    pub async fn unload_plugin(&self, plugin_id: &str) -> Result<()> {
        let record = self.registry.require(plugin_id)?;
        let _guard = record.lock().await;

        if matches!(
            record.state(),
            PluginState::Running | PluginState::Paused | PluginState::Error
        ) {
            self.stop_locked(&record).await?;
        }
        let state = record.state();
        if !matches!(state, PluginState::Stopped | PluginState::Loaded) {
            return Err(PluginError::new(
                ErrorKind::StateError,
                format!("Plugin {plugin_id} is {state} and cannot be unloaded"),
            )
            .with_plugin(plugin_id));
        }

        self.registry.transition(&record, PluginState::Unloaded)?;
        let instance = record.set_instance(None);
        self.registry.unregister(plugin_id);
        self.metrics.record_unload(plugin_id);
        drop(instance);

        info!(plugin = %plugin_id, "Plugin unloaded");
        Ok(())
    }

    /// Put a plugin into `Error`, keeping it for inspection
    pub async fn force_error(&self, plugin_id: &str, error: PluginError) -> Result<()> {
        let record = self.registry.require(plugin_id)?;
        let _guard = record.lock().await;
        warn!(plugin = %plugin_id, error = %error, "Plugin forced into error state");
        record.set_last_error(Some(error.with_plugin(plugin_id)));
        self.registry.transition(&record, PluginState::Error)
    }

    /// Load and initialize every plugin found in the configured search paths
    pub async fn load_all(&self) -> Result<LoadReport> {
        let paths = self.config.search_paths.clone();
        self.load_all_from(&paths).await
    }

    /// Load and initialize every plugin found in `search_paths`, in
    /// dependency order. A dependency cycle aborts before anything loads.
    pub async fn load_all_from(&self, search_paths: &[PathBuf]) -> Result<LoadReport> {
        let mut report = LoadReport::default();
        let satisfied = |id: &str| {
            self.registry
                .plugin_state(id)
                .is_some_and(|s| s.satisfies_dependency())
        };

        let mut candidates: Vec<_> = self
            .loader
            .discover(search_paths)
            .into_iter()
            .filter(|d| !self.registry.contains(&d.id))
            .collect();

        // Drop plugins whose required dependencies can never be met, then
        // anything that depended on them.
        loop {
            let ids: HashSet<String> = candidates.iter().map(|d| d.id.clone()).collect();
            let (keep, unmet): (Vec<_>, Vec<_>) = candidates.into_iter().partition(|d| {
                d.metadata
                    .dependencies
                    .iter()
                    .all(|dep| ids.contains(dep) || satisfied(dep.as_str()))
            });
            candidates = keep;
            if unmet.is_empty() {
                break;
            }
            for d in unmet {
                let missing = d
                    .metadata
                    .dependencies
                    .iter()
                    .find(|dep| !ids.contains(*dep) && !satisfied(dep.as_str()))
                    .cloned()
                    .unwrap_or_default();
                warn!(plugin = %d.id, dependency = %missing, "Skipping plugin with missing dependency");
                report
                    .failed
                    .insert(d.id.clone(), PluginError::dependency_missing(&d.id, &missing));
            }
        }

        let metadata: Vec<PluginMetadata> = candidates.iter().map(|d| d.metadata.clone()).collect();
        let order = self.resolver.resolve(&metadata, satisfied)?;
        let mut paths: HashMap<String, PathBuf> =
            candidates.into_iter().map(|d| (d.id, d.path)).collect();

        for id in &order {
            let Some(path) = paths.remove(id) else { continue };
            if let Err(e) = self.load_from_path(&path, LoadOptions::load_only()).await {
                report.failed.insert(id.clone(), e);
            }
        }

        for id in &order {
            if report.failed.contains_key(id) {
                continue;
            }
            match self.initialize_plugin(id).await {
                Ok(()) => report.loaded.push(id.clone()),
                Err(e) => {
                    report.failed.insert(id.clone(), e);
                }
            }
        }

        info!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            "Plugin batch loaded"
        );
        Ok(report)
    }

    /// Handle to a registered plugin
    pub fn get_plugin(&self, plugin_id: &str) -> Option<PluginHandle> {
        self.registry.get(plugin_id)
    }

    /// Views of all registered plugins
    pub fn list_plugins(&self) -> Vec<PluginInfo> {
        self.registry.enumerate()
    }

    /// Run a command on a running plugin
    pub async fn execute_command(
        &self,
        plugin_id: &str,
        command: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let handle = self
            .registry
            .get(plugin_id)
            .ok_or_else(|| PluginError::plugin_not_found(plugin_id))?;
        handle.execute_command(command, params).await
    }

    /// Validate and apply a configuration document to a plugin
    pub async fn configure_plugin(&self, plugin_id: &str, config: serde_json::Value) -> Result<()> {
        let record = self.registry.require(plugin_id)?;
        let _guard = record.lock().await;
        let instance = live_instance(&record)?;
        {
            let mut plugin = instance.plugin().write().await;
            plugin
                .validate_configuration(&config)
                .map_err(|e| {
                    PluginError::new(ErrorKind::ConfigurationError, e.message()).with_plugin(plugin_id)
                })?;
            plugin.configure(config.clone()).await.with_plugin(plugin_id)?;
        }
        record.set_config(config);
        info!(plugin = %plugin_id, "Plugin configuration applied");
        Ok(())
    }

    /// Enable hot reload for a plugin that advertises it
    pub fn enable_hot_reload(&self, plugin_id: &str) -> Result<()> {
        self.registry.enable_hot_reload(plugin_id)
    }

    /// Disable hot reload
    pub fn disable_hot_reload(&self, plugin_id: &str) -> Result<()> {
        self.registry.disable_hot_reload(plugin_id)
    }

    /// Health of one plugin
    pub async fn health_check(&self, plugin_id: &str) -> Result<HealthStatus> {
        let handle = self
            .registry
            .get(plugin_id)
            .ok_or_else(|| PluginError::plugin_not_found(plugin_id))?;
        Ok(handle.health_check().await)
    }

    /// Health of every running or paused plugin
    pub async fn health_check_all(&self) -> BTreeMap<String, HealthStatus> {
        let mut out = BTreeMap::new();
        for record in self.registry.records() {
            if !record.state().is_active() {
                continue;
            }
            if let Some(handle) = self.registry.get(record.id()) {
                out.insert(record.id().to_string(), handle.health_check().await);
            }
        }
        out
    }

    /// Registry snapshot
    pub fn snapshot(&self) -> RegistrySnapshot {
        self.registry.snapshot()
    }

    /// Runtime counters
    pub fn metrics(&self) -> RuntimeMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub(crate) fn runtime_metrics(&self) -> &RuntimeMetrics {
        &self.metrics
    }

    /// Unload every plugin, dependents first
    pub async fn shutdown(&self) {
        let metadata: Vec<PluginMetadata> =
            self.registry.records().iter().map(|r| r.metadata()).collect();
        let order = self
            .resolver
            .resolve(&metadata, |_| true)
            .unwrap_or_else(|_| self.registry.ids());
        for id in order.iter().rev() {
            if let Err(e) = self.unload_plugin(id).await {
                warn!(plugin = %id, error = %e, "Plugin unload failed during shutdown");
            }
        }
        info!("Plugin manager shut down");
    }
}

pub(crate) fn require_state(record: &PluginRecord, expected: PluginState) -> Result<()> {
    let state = record.state();
    if state != expected {
        return Err(PluginError::new(
            ErrorKind::StateError,
            format!("Plugin {} is {state}, expected {expected}", record.id()),
        )
        .with_plugin(record.id()));
    }
    Ok(())
}

pub(crate) fn live_instance(record: &PluginRecord) -> Result<Arc<PluginInstance>> {
    record.instance().ok_or_else(|| {
        PluginError::new(ErrorKind::NotLoaded, format!("Plugin {} has no instance", record.id()))
            .with_plugin(record.id())
    })
}

/// Subscribe a plugin instance to the message types it routes to
/// `handle_event`. Handlers run on the bus delivery thread and drive the
/// plugin through the runtime captured here; a staged instance gets inactive
/// subscriptions that its cutover activates.
pub(crate) fn route_events(
    bus: &MessageBus,
    plugin_id: &str,
    instance: &Arc<PluginInstance>,
    events: &[String],
    staged: bool,
) -> Result<()> {
    if events.is_empty() {
        return Ok(());
    }
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        warn!(plugin = %plugin_id, "No async runtime; plugin events are not routed");
        return Ok(());
    };

    let subscriptions = bus.subscriptions();
    for event in events {
        let target = Arc::downgrade(instance);
        let runtime = runtime.clone();
        let handler: MessageHandler = Arc::new(move |message: &Message| -> Result<()> {
            let Some(instance) = target.upgrade() else {
                return Ok(());
            };
            runtime.block_on(async {
                let mut plugin = instance.plugin().write().await;
                plugin.handle_event(message).await
            })
        });
        if staged {
            subscriptions.subscribe_staged(plugin_id, event.as_str(), handler, None, instance.generation())?;
        } else {
            subscriptions.subscribe_generation(plugin_id, event.as_str(), handler, None, instance.generation())?;
        }
    }
    debug!(plugin = %plugin_id, events = ?events, staged, "Plugin events routed");
    Ok(())
}
