//! Hot reload
//!
//! Replaces the artifact bound to a plugin id without touching its
//! dependents. The reload runs in four stages under the plugin's record
//! lock:
//!
//! 1. quiesce: the live instance is paused (when it can be) and asked to flush
//! 2. prepare: the new artifact is loaded under a fresh generation and
//!    initialized with a staged context, so its registrations are buffered
//!    and its subscriptions stay inactive
//! 3. cutover: contracts, endpoints and subscriptions switch to the new
//!    generation and the record's instance slot is swapped
//! 4. drop-old: the previous instance is shut down and released
//!
//! A failure before cutover completes tears the staged instance down and
//! leaves the previous instance live in its previous state.
//!
//! A plugin that is loaded, stopped or otherwise idle skips quiesce and
//! drop-old, and ends up running on the new artifact.

use crate::instance::PluginInstance;
use crate::manager::{live_instance, route_events, PluginManager};
use crate::registry::PluginRecord;
use plexus_contracts::ServiceContract;
use plexus_core::{
    ErrorKind, PluginCapabilities, PluginError, PluginState, Result, ResultExt, Version,
};
use plexus_plugin_api::PluginContext;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Options for [`PluginManager::reload_plugin`]
#[derive(Debug, Clone, Default)]
pub struct ReloadOptions {
    /// Artifact to switch to; defaults to the currently bound path
    pub artifact: Option<PathBuf>,
    /// Reject the reload if a provided contract's minor version would increase
    pub forbid_contract_minor_increase: bool,
    /// Configuration for the new instance; defaults to the current one
    pub config: Option<serde_json::Value>,
}

impl ReloadOptions {
    /// Reload from a different artifact
    pub fn from_artifact(path: impl Into<PathBuf>) -> Self {
        Self {
            artifact: Some(path.into()),
            ..Self::default()
        }
    }
}

/// Result of a completed reload
#[derive(Debug, Clone, Serialize)]
pub struct ReloadOutcome {
    /// Plugin id
    pub plugin_id: String,
    /// Version before the reload
    pub from: Version,
    /// Version after the reload
    pub to: Version,
    /// Generation of the new instance
    pub generation: u64,
    /// Wall time of the reload
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

struct Staged {
    instance: Arc<PluginInstance>,
    context: PluginContext,
    contracts: Vec<ServiceContract>,
}

impl PluginManager {
    /// Hot reload a plugin that advertises the capability
    pub async fn reload_plugin(&self, plugin_id: &str, options: ReloadOptions) -> Result<ReloadOutcome> {
        let record = self.registry().require(plugin_id)?;
        if !record.metadata().has_capability(PluginCapabilities::HOT_RELOAD) {
            return Err(PluginError::not_supported(format!(
                "Plugin {plugin_id} does not advertise hot reload"
            ))
            .with_plugin(plugin_id));
        }

        let _guard = record.lock().await;
        let started = Instant::now();
        let previous = record.state();
        let old = live_instance(&record)?;
        self.registry().transition(&record, PluginState::Reloading)?;
        info!(plugin = %plugin_id, from = %previous, version = %old.metadata().version, "Hot reload started");

        let artifact = options.artifact.clone().unwrap_or_else(|| record.artifact_path());
        let generation = record.next_generation();
        let result = match previous {
            PluginState::Running | PluginState::Paused | PluginState::Error => {
                self.reload_live(&record, &old, previous, &artifact, generation, &options).await
            }
            _ => self.reload_idle(&record, previous, &artifact, generation, &options).await,
        };

        match result {
            Ok(()) => {
                self.runtime_metrics().record_reload(true);
                let outcome = ReloadOutcome {
                    plugin_id: plugin_id.to_string(),
                    from: old.metadata().version,
                    to: record.version(),
                    generation,
                    duration: started.elapsed(),
                };
                drop(old);
                info!(
                    plugin = %plugin_id,
                    from = %outcome.from,
                    to = %outcome.to,
                    generation,
                    state = %record.state(),
                    "Hot reload complete"
                );
                Ok(outcome)
            }
            Err(e) => {
                self.runtime_metrics().record_reload(false);
                record.set_last_error(Some(e.clone()));
                warn!(plugin = %plugin_id, error = %e, "Hot reload failed; previous instance kept");
                Err(e)
            }
        }
    }

    /// Bring a plugin that is not running up on the new artifact. There is
    /// no live instance to quiesce or shut down.
    async fn reload_idle(
        &self,
        record: &PluginRecord,
        previous: PluginState,
        artifact: &std::path::Path,
        generation: u64,
        options: &ReloadOptions,
    ) -> Result<()> {
        if let Err(e) = self.check_dependencies(record) {
            self.return_to(record, previous);
            return Err(e);
        }

        let config = options.config.clone().unwrap_or_else(|| record.config());
        let staged = match self.stage(record, artifact, generation, config.clone(), options).await {
            Ok(staged) => staged,
            Err(e) => {
                self.return_to(record, previous);
                return Err(e);
            }
        };

        if let Err(e) = self.cutover(record, &staged, generation) {
            self.discard(record.id(), generation, &staged.context, &staged.instance, true)
                .await;
            self.return_to(record, previous);
            return Err(e);
        }

        record.set_instance(Some(staged.instance.clone()));
        record.set_context(Some(staged.context));
        record.set_config(config);
        record.set_last_error(None);
        self.registry().transition(record, PluginState::Running)
    }

    async fn reload_live(
        &self,
        record: &PluginRecord,
        old: &Arc<PluginInstance>,
        previous: PluginState,
        artifact: &std::path::Path,
        generation: u64,
        options: &ReloadOptions,
    ) -> Result<()> {
        let plugin_id = record.id();
        let paused = if previous == PluginState::Running {
            self.quiesce(plugin_id, old).await
        } else {
            false
        };

        let config = options.config.clone().unwrap_or_else(|| record.config());
        let staged = match self.stage(record, artifact, generation, config.clone(), options).await {
            Ok(staged) => staged,
            Err(e) => {
                self.restore(record, old, previous, paused).await;
                return Err(e);
            }
        };

        if let Err(e) = self.cutover(record, &staged, generation) {
            self.discard(plugin_id, generation, &staged.context, &staged.instance, true)
                .await;
            self.restore(record, old, previous, paused).await;
            return Err(e);
        }

        record.set_instance(Some(staged.instance.clone()));
        record.set_context(Some(staged.context));
        record.set_config(config);
        record.set_last_error(None);

        {
            let mut plugin = old.plugin().write().await;
            if tokio::time::timeout(self.config().shutdown_timeout, plugin.shutdown())
                .await
                .is_err()
            {
                warn!(plugin = %plugin_id, "Previous instance shutdown timed out");
            }
        }

        self.registry().transition(record, PluginState::Running)
    }

    /// Pause and flush the live instance. Returns whether it paused.
    async fn quiesce(&self, plugin_id: &str, old: &PluginInstance) -> bool {
        let mut plugin = old.plugin().write().await;
        let paused = match plugin.pause().await {
            Ok(()) => true,
            Err(e) if e.is(ErrorKind::NotSupported) => false,
            Err(e) => {
                warn!(plugin = %plugin_id, error = %e, "Pause before reload failed");
                false
            }
        };
        match tokio::time::timeout(self.config().shutdown_timeout, plugin.prepare_shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(plugin = %plugin_id, error = %e, "Flush before reload failed"),
            Err(_) => warn!(plugin = %plugin_id, "Flush before reload timed out"),
        }
        debug!(plugin = %plugin_id, paused, "Previous instance quiesced");
        paused
    }

    async fn stage(
        &self,
        record: &PluginRecord,
        artifact: &std::path::Path,
        generation: u64,
        config: serde_json::Value,
        options: &ReloadOptions,
    ) -> Result<Staged> {
        let plugin_id = record.id();
        let instance = self
            .loader()
            .load(artifact, generation)
            .and_then(|instance| check_same_plugin(record, instance))?;
        let instance = Arc::new(instance);
        let context = self.context_for(record, generation, config, true);

        let initialized = {
            let mut plugin = instance.plugin().write().await;
            match tokio::time::timeout(self.config().initialize_timeout, plugin.initialize(context.clone())).await {
                Ok(result) => result.with_plugin(plugin_id),
                Err(_) => Err(PluginError::timeout(format!(
                    "initialize() did not finish within {:?}",
                    self.config().initialize_timeout
                ))
                .with_plugin(plugin_id)),
            }
        };
        if let Err(e) = initialized {
            self.discard(plugin_id, generation, &context, &instance, false).await;
            return Err(e);
        }

        match self.prepare_registrations(record, &instance, &context, options).await {
            Ok(contracts) => Ok(Staged {
                instance,
                context,
                contracts,
            }),
            Err(e) => {
                self.discard(plugin_id, generation, &context, &instance, true).await;
                Err(e)
            }
        }
    }

    /// Route events for the staged instance and collect the contracts it
    /// will provide
    async fn prepare_registrations(
        &self,
        record: &PluginRecord,
        instance: &Arc<PluginInstance>,
        context: &PluginContext,
        options: &ReloadOptions,
    ) -> Result<Vec<ServiceContract>> {
        let plugin_id = record.id();
        let (declared, events) = {
            let plugin = instance.plugin().read().await;
            (plugin.service_contracts(), plugin.supported_events())
        };
        route_events(self.bus(), plugin_id, instance, &events, true)?;

        let mut contracts = context.staged_contracts();
        for contract in declared {
            let known = contracts
                .iter()
                .any(|c| c.service_name == contract.service_name && c.version == contract.version);
            if !known {
                contracts.push(contract);
            }
        }

        if options.forbid_contract_minor_increase {
            let current = self.contracts().contracts_of(plugin_id);
            for next in &contracts {
                let raised = current.iter().find(|c| {
                    c.service_name == next.service_name
                        && c.version.major == next.version.major
                        && next.version.minor > c.version.minor
                });
                if let Some(current) = raised {
                    return Err(PluginError::incompatible_version(format!(
                        "Service {} would move from {} to {}",
                        next.service_name, current.version, next.version
                    ))
                    .with_plugin(plugin_id));
                }
            }
        }
        Ok(contracts)
    }

    /// Re-point host registrations at the staged generation. Leaves the
    /// previous registrations in place on failure.
    fn cutover(&self, record: &PluginRecord, staged: &Staged, generation: u64) -> Result<()> {
        let plugin_id = record.id();
        let previous_contracts: Vec<ServiceContract> = self
            .contracts()
            .contracts_of(plugin_id)
            .iter()
            .map(|c| (**c).clone())
            .collect();

        let pending = staged.context.go_live();
        self.contracts()
            .replace_provider_contracts(plugin_id, staged.contracts.clone())?;
        if let Err(e) = self.bus().requests().replace_provider(plugin_id, pending.endpoints) {
            if let Err(restore) = self
                .contracts()
                .replace_provider_contracts(plugin_id, previous_contracts)
            {
                warn!(plugin = %plugin_id, error = %restore, "Previous contracts not restored");
            }
            return Err(e);
        }

        let (activated, removed) = self.bus().subscriptions().cutover(plugin_id, generation);
        record.set_provided_services(
            staged
                .contracts
                .iter()
                .map(|c| c.service_name.clone())
                .collect(),
        );
        debug!(
            plugin = %plugin_id,
            generation,
            activated,
            removed,
            contracts = staged.contracts.len(),
            "Registrations cut over"
        );
        Ok(())
    }

    async fn discard(
        &self,
        plugin_id: &str,
        generation: u64,
        context: &PluginContext,
        instance: &Arc<PluginInstance>,
        initialized: bool,
    ) {
        let removed = self.bus().subscriptions().discard_generation(plugin_id, generation);
        context.discard_staged();
        if initialized {
            let mut plugin = instance.plugin().write().await;
            if tokio::time::timeout(self.config().shutdown_timeout, plugin.shutdown())
                .await
                .is_err()
            {
                warn!(plugin = %plugin_id, generation, "Staged instance shutdown timed out");
            }
        }
        debug!(plugin = %plugin_id, generation, subscriptions = removed, "Staged instance discarded");
    }

    /// Put the previous instance back the way it was
    async fn restore(&self, record: &PluginRecord, old: &PluginInstance, previous: PluginState, paused: bool) {
        if paused {
            if let Err(e) = old.plugin().write().await.resume().await {
                warn!(plugin = %record.id(), error = %e, "Resume after failed reload failed");
            }
        }
        self.return_to(record, previous);
    }

    fn return_to(&self, record: &PluginRecord, previous: PluginState) {
        if let Err(e) = self.registry().transition(record, previous) {
            warn!(plugin = %record.id(), error = %e, "State not restored after failed reload");
        }
    }
}

fn check_same_plugin(record: &PluginRecord, instance: PluginInstance) -> Result<PluginInstance> {
    if instance.metadata().id != record.id() {
        return Err(PluginError::invalid_format(format!(
            "Artifact provides {} instead of {}",
            instance.metadata().id,
            record.id()
        ))
        .with_plugin(record.id()));
    }
    Ok(instance)
}
