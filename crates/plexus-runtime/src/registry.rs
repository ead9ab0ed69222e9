//! Plugin registry
//!
//! The registry exclusively owns plugin records. The map sits behind a
//! reader/writer lock; each record carries its own async lock that
//! serializes lifecycle transitions for that plugin, so transitions on
//! different plugins proceed in parallel while registry-wide scans only take
//! the read side of the map lock.
//!
//! Every state change goes through [`PluginRegistry::transition`], which
//! enforces the lifecycle table and notifies lifecycle observers.

use crate::instance::PluginInstance;
use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use plexus_core::{
    ErrorKind, PluginCapabilities, PluginError, PluginMetadata, PluginState, Result, Version,
};
use plexus_plugin_api::{HealthStatus, PluginContext, PluginDirectory};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where a plugin's artifact came from
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PluginSource {
    /// A local search path
    #[default]
    Local,
    /// A remote repository, freshly downloaded
    Remote {
        /// Repository id
        repository: String,
    },
    /// A valid entry of the remote content cache
    Cache {
        /// Repository the entry was fetched from
        repository: String,
    },
}

impl fmt::Display for PluginSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginSource::Local => write!(f, "local"),
            PluginSource::Remote { repository } => write!(f, "remote:{repository}"),
            PluginSource::Cache { repository } => write!(f, "cache:{repository}"),
        }
    }
}

/// A state change of one plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    /// Plugin id
    pub plugin_id: String,
    /// Previous state
    pub from: PluginState,
    /// New state
    pub to: PluginState,
    /// When the change happened
    pub timestamp: DateTime<Utc>,
}

/// Receives every lifecycle event of the registry it is attached to.
///
/// Observers run synchronously on the thread performing the transition and
/// must not call back into lifecycle operations.
pub trait LifecycleObserver: Send + Sync {
    /// Called after a transition
    fn on_lifecycle_event(&self, event: &LifecycleEvent);
}

impl<F> LifecycleObserver for F
where
    F: Fn(&LifecycleEvent) + Send + Sync,
{
    fn on_lifecycle_event(&self, event: &LifecycleEvent) {
        self(event)
    }
}

/// Token returned by [`PluginRegistry::add_observer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Registry entry for one plugin id
pub struct PluginRecord {
    id: String,
    metadata: RwLock<PluginMetadata>,
    artifact_path: RwLock<PathBuf>,
    state: RwLock<PluginState>,
    instance: ArcSwapOption<PluginInstance>,
    transition_lock: tokio::sync::Mutex<()>,
    loaded_at: DateTime<Utc>,
    last_activity: RwLock<DateTime<Utc>>,
    hot_reload_enabled: AtomicBool,
    provided_services: RwLock<Vec<String>>,
    last_error: RwLock<Option<PluginError>>,
    source: RwLock<PluginSource>,
    config: RwLock<serde_json::Value>,
    context: Mutex<Option<PluginContext>>,
    generations: AtomicU64,
}

impl fmt::Debug for PluginRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRecord")
            .field("id", &self.id)
            .field("version", &self.version())
            .field("state", &self.state())
            .field("artifact_path", &*self.artifact_path.read())
            .field("loaded_at", &self.loaded_at)
            .finish()
    }
}

impl PluginRecord {
    /// New record in the `Unloaded` state
    pub fn new(metadata: PluginMetadata, artifact_path: impl Into<PathBuf>) -> Self {
        let now = Utc::now();
        Self {
            id: metadata.id.clone(),
            metadata: RwLock::new(metadata),
            artifact_path: RwLock::new(artifact_path.into()),
            state: RwLock::new(PluginState::Unloaded),
            instance: ArcSwapOption::empty(),
            transition_lock: tokio::sync::Mutex::new(()),
            loaded_at: now,
            last_activity: RwLock::new(now),
            hot_reload_enabled: AtomicBool::new(false),
            provided_services: RwLock::new(Vec::new()),
            last_error: RwLock::new(None),
            source: RwLock::new(PluginSource::Local),
            config: RwLock::new(serde_json::Value::Null),
            context: Mutex::new(None),
            generations: AtomicU64::new(0),
        }
    }

    /// Plugin id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Metadata of the bound artifact
    pub fn metadata(&self) -> PluginMetadata {
        self.metadata.read().clone()
    }

    /// Version of the bound artifact
    pub fn version(&self) -> Version {
        self.metadata.read().version
    }

    /// Path of the bound artifact
    pub fn artifact_path(&self) -> PathBuf {
        self.artifact_path.read().clone()
    }

    /// Current lifecycle state
    pub fn state(&self) -> PluginState {
        *self.state.read()
    }

    /// The live instance, if any
    pub fn instance(&self) -> Option<Arc<PluginInstance>> {
        self.instance.load_full()
    }

    /// When the record was created
    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    /// Last command, call or transition
    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.read()
    }

    /// Whether hot reload is enabled
    pub fn hot_reload_enabled(&self) -> bool {
        self.hot_reload_enabled.load(Ordering::Acquire)
    }

    /// Service names the plugin provides
    pub fn provided_services(&self) -> Vec<String> {
        self.provided_services.read().clone()
    }

    /// Diagnostic captured by the last failure
    pub fn last_error(&self) -> Option<PluginError> {
        self.last_error.read().clone()
    }

    /// Where the artifact came from
    pub fn source(&self) -> PluginSource {
        self.source.read().clone()
    }

    /// Configuration document passed to the plugin
    pub fn config(&self) -> serde_json::Value {
        self.config.read().clone()
    }

    /// Generation of the live instance, 0 when none is bound
    pub fn generation(&self) -> u64 {
        self.instance().map(|i| i.generation()).unwrap_or(0)
    }

    /// Record an artifact source
    pub fn set_source(&self, source: PluginSource) {
        *self.source.write() = source;
    }

    pub(crate) fn touch(&self) {
        *self.last_activity.write() = Utc::now();
    }

    pub(crate) async fn lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.transition_lock.lock().await
    }

    pub(crate) fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn set_instance(&self, instance: Option<Arc<PluginInstance>>) -> Option<Arc<PluginInstance>> {
        if let Some(instance) = &instance {
            *self.metadata.write() = instance.metadata().clone();
            *self.artifact_path.write() = instance.source_path().to_path_buf();
        }
        self.touch();
        self.instance.swap(instance)
    }

    pub(crate) fn set_hot_reload(&self, enabled: bool) {
        self.hot_reload_enabled.store(enabled, Ordering::Release);
    }

    pub(crate) fn set_provided_services(&self, services: Vec<String>) {
        *self.provided_services.write() = services;
    }

    pub(crate) fn set_last_error(&self, error: Option<PluginError>) {
        *self.last_error.write() = error;
    }

    pub(crate) fn set_config(&self, config: serde_json::Value) {
        *self.config.write() = config;
    }

    pub(crate) fn set_context(&self, context: Option<PluginContext>) -> Option<PluginContext> {
        std::mem::replace(&mut *self.context.lock(), context)
    }

    fn info(&self) -> PluginInfo {
        let metadata = self.metadata.read();
        PluginInfo {
            id: self.id.clone(),
            name: metadata.name.clone(),
            version: metadata.version,
            state: self.state(),
            artifact_path: self.artifact_path(),
            loaded_at: self.loaded_at,
            last_activity: self.last_activity(),
            hot_reload_enabled: self.hot_reload_enabled(),
            provided_services: self.provided_services(),
            source: self.source(),
            generation: self.generation(),
            last_error: self.last_error().map(|e| e.to_string()),
        }
    }
}

/// Serializable view of a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Plugin id
    pub id: String,
    /// Display name
    pub name: String,
    /// Bound version
    pub version: Version,
    /// Lifecycle state
    pub state: PluginState,
    /// Bound artifact
    pub artifact_path: PathBuf,
    /// Record creation time
    pub loaded_at: DateTime<Utc>,
    /// Last activity
    pub last_activity: DateTime<Utc>,
    /// Hot reload flag
    pub hot_reload_enabled: bool,
    /// Provided service names
    pub provided_services: Vec<String>,
    /// Artifact source
    pub source: PluginSource,
    /// Instance generation
    pub generation: u64,
    /// Last failure, rendered
    pub last_error: Option<String>,
}

/// Point-in-time copy of the registry
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    /// When the snapshot was taken
    pub taken_at: DateTime<Utc>,
    /// Every record, ordered by id
    pub plugins: Vec<PluginInfo>,
    /// Record count per state name
    pub by_state: BTreeMap<String, usize>,
}

/// Handle to a registered plugin, as returned by lookups.
///
/// The handle does not own the plugin: once the record is unloaded, calls
/// through a stale handle fail with `InvalidState`.
#[derive(Clone, Debug)]
pub struct PluginHandle {
    record: Arc<PluginRecord>,
}

impl PluginHandle {
    /// Plugin id
    pub fn id(&self) -> &str {
        self.record.id()
    }

    /// Current state
    pub fn state(&self) -> PluginState {
        self.record.state()
    }

    /// Current metadata
    pub fn metadata(&self) -> PluginMetadata {
        self.record.metadata()
    }

    /// Current version
    pub fn version(&self) -> Version {
        self.record.version()
    }

    /// The underlying record
    pub fn record(&self) -> &Arc<PluginRecord> {
        &self.record
    }

    fn running_instance(&self) -> Result<Arc<PluginInstance>> {
        let state = self.record.state();
        if state != PluginState::Running {
            return Err(PluginError::new(
                ErrorKind::StateError,
                format!("Plugin {} is {state}, not running", self.id()),
            )
            .with_plugin(self.id()));
        }
        self.record
            .instance()
            .ok_or_else(|| PluginError::new(ErrorKind::NotLoaded, "Plugin has no live instance").with_plugin(self.id()))
    }

    /// Run a command on the plugin
    pub async fn execute_command(&self, command: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        let instance = self.running_instance()?;
        self.record.touch();
        let mut plugin = instance.plugin().write().await;
        plugin.execute_command(command, params).await
    }

    /// Commands the plugin accepts
    pub async fn available_commands(&self) -> Vec<String> {
        match self.record.instance() {
            Some(instance) => instance.plugin().read().await.available_commands(),
            None => Vec::new(),
        }
    }

    /// Call one of the plugin's services directly
    pub async fn call_service(
        &self,
        service: &str,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let instance = self.running_instance()?;
        self.record.touch();
        let mut plugin = instance.plugin().write().await;
        plugin.handle_service_call(service, method, params).await
    }

    /// Ask the plugin for its health
    pub async fn health_check(&self) -> HealthStatus {
        match self.record.instance() {
            Some(instance) => instance.plugin().read().await.health_check().await,
            None => HealthStatus::Unhealthy(format!("plugin is {}", self.state())),
        }
    }
}

/// Plugin registry for managing plugin lifecycle
pub struct PluginRegistry {
    records: RwLock<HashMap<String, Arc<PluginRecord>>>,
    observers: RwLock<Vec<(ObserverId, Arc<dyn LifecycleObserver>)>>,
    next_observer: AtomicU64,
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.records.read().len())
            .field("observers", &self.observers.read().len())
            .finish()
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            observers: RwLock::new(Vec::new()),
            next_observer: AtomicU64::new(1),
        }
    }

    /// Insert a record; a second record for the same id is rejected
    pub fn register(&self, record: PluginRecord) -> Result<Arc<PluginRecord>> {
        let mut records = self.records.write();
        if records.contains_key(record.id()) {
            return Err(PluginError::new(
                ErrorKind::DuplicatePlugin,
                format!("Plugin {} is already registered", record.id()),
            )
            .with_plugin(record.id()));
        }
        let record = Arc::new(record);
        records.insert(record.id().to_string(), record.clone());
        drop(records);

        debug!(plugin = %record.id(), "Plugin record registered");
        Ok(record)
    }

    /// Remove a record
    pub fn unregister(&self, plugin_id: &str) -> Option<Arc<PluginRecord>> {
        let removed = self.records.write().remove(plugin_id);
        if removed.is_some() {
            debug!(plugin = %plugin_id, "Plugin record removed");
        }
        removed
    }

    /// Record by id
    pub fn record(&self, plugin_id: &str) -> Option<Arc<PluginRecord>> {
        self.records.read().get(plugin_id).cloned()
    }

    /// Record by id, or `PluginNotFound`
    pub fn require(&self, plugin_id: &str) -> Result<Arc<PluginRecord>> {
        self.record(plugin_id)
            .ok_or_else(|| PluginError::plugin_not_found(plugin_id))
    }

    /// Handle by id
    pub fn get(&self, plugin_id: &str) -> Option<PluginHandle> {
        self.record(plugin_id).map(|record| PluginHandle { record })
    }

    /// Whether the id is registered
    pub fn contains(&self, plugin_id: &str) -> bool {
        self.records.read().contains_key(plugin_id)
    }

    /// Registered ids, sorted
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.records.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// All records, sorted by id
    pub fn records(&self) -> Vec<Arc<PluginRecord>> {
        let mut records: Vec<Arc<PluginRecord>> = self.records.read().values().cloned().collect();
        records.sort_by(|a, b| a.id().cmp(b.id()));
        records
    }

    /// Views of all records, sorted by id
    pub fn enumerate(&self) -> Vec<PluginInfo> {
        self.records().iter().map(|r| r.info()).collect()
    }

    /// Ids of records in `state`, sorted
    pub fn by_state(&self, state: PluginState) -> Vec<String> {
        self.records()
            .into_iter()
            .filter(|r| r.state() == state)
            .map(|r| r.id().to_string())
            .collect()
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Move a record to `next`. A refused transition leaves the state
    /// unchanged and returns `StateError`.
    pub fn transition(&self, record: &PluginRecord, next: PluginState) -> Result<()> {
        let from = {
            let mut state = record.state.write();
            let from = *state;
            if !from.can_transition_to(next) {
                return Err(PluginError::new(
                    ErrorKind::StateError,
                    format!("Plugin {} cannot move from {from} to {next}", record.id()),
                )
                .with_plugin(record.id()));
            }
            *state = next;
            from
        };
        record.touch();

        info!(plugin = %record.id(), from = %from, to = %next, "Plugin state changed");
        self.notify(&LifecycleEvent {
            plugin_id: record.id().to_string(),
            from,
            to: next,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Enable hot reload; the plugin must advertise the capability
    pub fn enable_hot_reload(&self, plugin_id: &str) -> Result<()> {
        let record = self.require(plugin_id)?;
        if !record.metadata().has_capability(PluginCapabilities::HOT_RELOAD) {
            return Err(PluginError::not_supported(format!(
                "Plugin {plugin_id} does not advertise hot reload"
            ))
            .with_plugin(plugin_id));
        }
        record.set_hot_reload(true);
        info!(plugin = %plugin_id, "Hot reload enabled");
        Ok(())
    }

    /// Disable hot reload
    pub fn disable_hot_reload(&self, plugin_id: &str) -> Result<()> {
        let record = self.require(plugin_id)?;
        record.set_hot_reload(false);
        info!(plugin = %plugin_id, "Hot reload disabled");
        Ok(())
    }

    /// Record bound to an artifact path
    pub fn find_by_artifact(&self, path: &Path) -> Option<Arc<PluginRecord>> {
        self.records().into_iter().find(|r| r.artifact_path() == path)
    }

    /// Point-in-time copy
    pub fn snapshot(&self) -> RegistrySnapshot {
        let plugins = self.enumerate();
        let mut by_state = BTreeMap::new();
        for info in &plugins {
            *by_state.entry(info.state.to_string()).or_insert(0) += 1;
        }
        RegistrySnapshot {
            taken_at: Utc::now(),
            plugins,
            by_state,
        }
    }

    /// Attach a lifecycle observer
    pub fn add_observer(&self, observer: Arc<dyn LifecycleObserver>) -> ObserverId {
        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed));
        self.observers.write().push((id, observer));
        id
    }

    /// Detach a lifecycle observer
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(oid, _)| *oid != id);
        observers.len() != before
    }

    fn notify(&self, event: &LifecycleEvent) {
        let observers: Vec<Arc<dyn LifecycleObserver>> =
            self.observers.read().iter().map(|(_, o)| o.clone()).collect();
        for observer in observers {
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| observer.on_lifecycle_event(event))).is_err() {
                warn!(plugin = %event.plugin_id, "Lifecycle observer panicked");
            }
        }
    }
}

impl PluginDirectory for PluginRegistry {
    fn plugin_state(&self, plugin_id: &str) -> Option<PluginState> {
        self.record(plugin_id).map(|r| r.state())
    }

    fn plugin_metadata(&self, plugin_id: &str) -> Option<PluginMetadata> {
        self.record(plugin_id).map(|r| r.metadata())
    }

    fn plugin_ids(&self) -> Vec<String> {
        self.ids()
    }
}
