//! Updates and rollbacks of installed plugins
//!
//! A version switch never touches the running instance until the new
//! artifact sits verified in the cache. The plugin is then hot reloaded
//! onto it, or unloaded and loaded again when it cannot hot reload. If that
//! fails, the freshly downloaded artifact is dropped from the cache and the
//! plugin keeps running the version it had.

use crate::events::{UpdateAvailableEvent, HOST_SENDER};
use crate::manager::{remote_source, UnifiedManager};
use plexus_core::{PluginCapabilities, PluginError, Result, Version};
use plexus_remote::{AcquiredArtifact, UpdateCandidate, UpdatePolicy};
use plexus_runtime::{LoadOptions, PluginRecord, ReloadOptions};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Result of a version switch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateOutcome {
    /// Plugin id
    pub plugin_id: String,
    /// Version before the switch
    pub from: Version,
    /// Version after the switch
    pub to: Version,
    /// Repository the artifact came from
    pub repository: String,
    /// Whether a loaded plugin was moved to the new artifact
    pub reloaded: bool,
}

impl UpdateOutcome {
    /// Whether the version changed
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// Result of one update pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct UpdateReport {
    /// Every newer version found
    pub available: Vec<UpdateCandidate>,
    /// Updates that were applied
    pub applied: Vec<UpdateOutcome>,
    /// Plugins whose update the policy does not allow
    pub skipped: Vec<String>,
    /// Plugins whose update failed
    pub failed: BTreeMap<String, PluginError>,
}

impl UnifiedManager {
    /// Newer published versions of installed plugins
    pub async fn check_updates(&self) -> Vec<UpdateCandidate> {
        self.pipeline.check_updates().await
    }

    /// Move an installed or loaded plugin to `version`, or to the newest
    /// published version
    pub async fn update_plugin(&self, plugin_id: &str, version: Option<&Version>) -> Result<UpdateOutcome> {
        self.switch_version(plugin_id, version, false).await
    }

    /// Move a plugin back to an earlier version, served from the cache when
    /// it is still there
    pub async fn rollback_plugin(&self, plugin_id: &str, version: &Version) -> Result<UpdateOutcome> {
        let current = self.current_version(plugin_id)?;
        if *version >= current {
            return Err(PluginError::invalid_argument(format!(
                "Rollback of {plugin_id} to {version} is not older than {current}"
            )));
        }
        self.switch_version(plugin_id, Some(version), false).await
    }

    /// Apply every update `policy` allows
    ///
    /// When the newest release is beyond the policy, the newest release
    /// within it is used instead. Each finding is published as an
    /// [`UpdateAvailableEvent`].
    pub async fn apply_updates(&self, policy: UpdatePolicy) -> UpdateReport {
        let mut report = UpdateReport {
            available: self.check_updates().await,
            ..UpdateReport::default()
        };

        for candidate in report.available.clone() {
            let plugin_id = candidate.plugin_id.clone();
            let Some(target) = self.allowed_target(&candidate, policy).await else {
                debug!(plugin = %plugin_id, available = %candidate.available, ?policy, "Update not allowed by policy");
                self.announce(&candidate, false);
                report.skipped.push(plugin_id);
                continue;
            };
            let forbid_minor = policy == UpdatePolicy::Minor;
            match self.switch_version(&plugin_id, Some(&target), forbid_minor).await {
                Ok(outcome) => {
                    let applied = UpdateCandidate::new(
                        plugin_id.clone(),
                        outcome.from,
                        outcome.to,
                        outcome.repository.clone(),
                    );
                    if let Some(applied) = applied {
                        self.announce(&applied, true);
                    }
                    report.applied.push(outcome);
                }
                Err(e) => {
                    warn!(plugin = %plugin_id, target = %target, error = %e, "Automatic update failed");
                    report.failed.insert(plugin_id, e);
                }
            }
        }
        report
    }

    /// One pass of the update scheduler under the configured policy
    pub async fn run_update_cycle(&self) -> UpdateReport {
        let policy = self.config.remote.updates.policy;
        if !policy.checks() {
            return UpdateReport::default();
        }
        let refresh = self.pipeline.refresh_due().await;
        if !refresh.failed.is_empty() {
            warn!(failed = ?refresh.failed, "Some catalogs could not be refreshed");
        }
        let report = self.apply_updates(policy).await;
        info!(
            available = report.available.len(),
            applied = report.applied.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "Update check finished"
        );
        report
    }

    /// Spawn the periodic update check
    ///
    /// The task ends immediately when the policy is `Disabled`, otherwise it
    /// runs a cycle every `remote.updates.check_interval` until `cancel`
    /// fires.
    pub fn start_auto_update(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let policy = self.config.remote.updates.policy;
        let period = self.config.remote.updates.check_interval;

        tokio::spawn(async move {
            if !policy.checks() {
                debug!("Automatic update checks disabled");
                return;
            }
            info!(?policy, interval = ?period, "Automatic update checks started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(period) => {
                        let report = manager.run_update_cycle().await;
                        if !report.failed.is_empty() {
                            error!(failed = report.failed.len(), "Automatic updates failed");
                        }
                    }
                }
            }
            debug!("Automatic update checks stopped");
        })
    }

    fn current_version(&self, plugin_id: &str) -> Result<Version> {
        self.local
            .registry()
            .record(plugin_id)
            .map(|r| r.version())
            .or_else(|| self.pipeline.installed().get(plugin_id).map(|i| i.version))
            .ok_or_else(|| {
                PluginError::plugin_not_found(plugin_id).with_details("neither loaded nor installed")
            })
    }

    async fn allowed_target(&self, candidate: &UpdateCandidate, policy: UpdatePolicy) -> Option<Version> {
        if candidate.is_automatic(policy) {
            return Some(candidate.available);
        }
        if matches!(policy, UpdatePolicy::Disabled | UpdatePolicy::CheckOnly) {
            return None;
        }
        self.pipeline
            .available_versions(&candidate.plugin_id)
            .await
            .into_iter()
            .filter(|v| {
                candidate
                    .current
                    .bump_to(v)
                    .is_some_and(|bump| policy.allows(bump))
            })
            .max()
    }

    fn announce(&self, candidate: &UpdateCandidate, applied: bool) {
        let event = UpdateAvailableEvent::new(candidate, applied);
        if let Err(e) = self.bus().events().publish(HOST_SENDER, &event) {
            warn!(plugin = %candidate.plugin_id, error = %e, "Failed to publish update event");
        }
    }

    async fn switch_version(
        &self,
        plugin_id: &str,
        version: Option<&Version>,
        forbid_contract_minor_increase: bool,
    ) -> Result<UpdateOutcome> {
        let current = self.current_version(plugin_id)?;
        let artifact = self.acquire_remote(plugin_id, version).await?;
        if artifact.version == current {
            debug!(plugin = plugin_id, version = %current, "Already at requested version");
            return Ok(UpdateOutcome {
                plugin_id: plugin_id.to_string(),
                from: current,
                to: current,
                repository: artifact.repository,
                reloaded: false,
            });
        }
        self.apply_artifact(&artifact, current, forbid_contract_minor_increase)
            .await
    }

    /// Move the plugin onto an acquired artifact and record the install
    pub(crate) async fn apply_artifact(
        &self,
        artifact: &AcquiredArtifact,
        current: Version,
        forbid_contract_minor_increase: bool,
    ) -> Result<UpdateOutcome> {
        let plugin_id = artifact.plugin_id.as_str();
        let reloaded = match self.local.registry().record(plugin_id) {
            Some(record) => {
                let switched = if record.metadata().has_capability(PluginCapabilities::HOT_RELOAD) {
                    let options = ReloadOptions {
                        forbid_contract_minor_increase,
                        ..ReloadOptions::from_artifact(&artifact.path)
                    };
                    self.local
                        .reload_plugin(plugin_id, options)
                        .await
                        .map(|_| record.set_source(remote_source(artifact)))
                } else {
                    self.replace_cold(&record, artifact).await
                };
                if let Err(e) = switched {
                    self.discard_failed(artifact);
                    warn!(
                        plugin = plugin_id,
                        from = %current,
                        to = %artifact.version,
                        error = %e,
                        "Version switch failed, previous version kept"
                    );
                    return Err(e);
                }
                true
            }
            None => false,
        };

        self.pipeline.record_install(artifact)?;
        info!(
            plugin = plugin_id,
            from = %current,
            to = %artifact.version,
            reloaded,
            "Plugin version switched"
        );
        Ok(UpdateOutcome {
            plugin_id: plugin_id.to_string(),
            from: current,
            to: artifact.version,
            repository: artifact.repository.clone(),
            reloaded,
        })
    }

    /// Unload and load again for plugins without hot reload; the previous
    /// artifact is loaded back when the new one fails
    async fn replace_cold(&self, record: &PluginRecord, artifact: &AcquiredArtifact) -> Result<()> {
        let plugin_id = record.id().to_string();
        let previous_path = record.artifact_path();
        let previous_source = record.source();
        let config = record.config();
        let initialize = record.state().is_active();

        self.local.unload_plugin(&plugin_id).await?;
        let options = |source| LoadOptions {
            config: Some(config.clone()),
            initialize,
            source,
            hot_reload: None,
        };
        match self
            .local
            .load_from_path(&artifact.path, options(remote_source(artifact)))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                if let Err(restore) = self
                    .local
                    .load_from_path(&previous_path, options(previous_source))
                    .await
                {
                    error!(plugin = %plugin_id, error = %restore, "Failed to restore previous version");
                }
                Err(e)
            }
        }
    }

    fn discard_failed(&self, artifact: &AcquiredArtifact) {
        if artifact.from_cache {
            return;
        }
        match self.pipeline.remove_cached(&artifact.plugin_id, &artifact.version) {
            Ok(_) => debug!(plugin = %artifact.plugin_id, version = %artifact.version, "Rejected artifact removed from cache"),
            Err(e) => warn!(plugin = %artifact.plugin_id, error = %e, "Failed to remove rejected artifact"),
        }
    }
}
