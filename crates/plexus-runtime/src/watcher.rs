//! Artifact directory watcher
//!
//! Watches the directories plugins were loaded from. A changed artifact of a
//! plugin with hot reload enabled triggers a reload; a changed
//! `<stem>.config.{json,yaml,yml,toml}` next to an artifact is parsed and
//! applied to that plugin with `configure`.

use crate::hot_reload::ReloadOptions;
use crate::loader::is_artifact;
use crate::manager::PluginManager;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use plexus_core::{PluginError, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What a changed file means to the watcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchTarget {
    /// A plugin artifact
    Artifact(PathBuf),
    /// A plugin configuration file; `stem` is the artifact stem it belongs to
    Config {
        /// Artifact stem
        stem: String,
        /// Configuration file
        path: PathBuf,
    },
}

impl WatchTarget {
    /// Classify a path, or `None` if the watcher ignores it
    pub fn classify(path: &Path) -> Option<Self> {
        if is_artifact(path) {
            return Some(WatchTarget::Artifact(path.to_path_buf()));
        }
        let ext = path.extension().and_then(|s| s.to_str())?;
        if !matches!(ext, "json" | "yaml" | "yml" | "toml") {
            return None;
        }
        let stem = path.file_stem().and_then(|s| s.to_str())?;
        let stem = stem.strip_suffix(".config")?;
        Some(WatchTarget::Config {
            stem: stem.to_string(),
            path: path.to_path_buf(),
        })
    }
}

/// Watches artifact directories and drives reloads
#[derive(Debug)]
pub struct ArtifactWatcher {
    manager: Arc<PluginManager>,
    directories: Vec<PathBuf>,
    debounce: Duration,
    watcher: Option<RecommendedWatcher>,
    rx: Option<mpsc::UnboundedReceiver<notify::Result<Event>>>,
    cancel: CancellationToken,
}

impl ArtifactWatcher {
    /// Watch the manager's search paths with its configured debounce
    pub fn new(manager: Arc<PluginManager>) -> Self {
        let directories = manager.config().search_paths.clone();
        let debounce = manager.config().hot_reload.debounce;
        Self {
            manager,
            directories,
            debounce,
            watcher: None,
            rx: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Watch an additional directory
    pub fn with_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        if !self.directories.contains(&dir) {
            self.directories.push(dir);
        }
        self
    }

    /// Set the debounce window
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Token that stops the event loop when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start watching
    pub fn start(&mut self) -> Result<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )
        .map_err(|e| PluginError::filesystem(format!("Failed to create file watcher: {e}")))?;

        for dir in &self.directories {
            if !dir.is_dir() {
                warn!(dir = %dir.display(), "Watch directory does not exist");
                continue;
            }
            watcher
                .watch(dir, RecursiveMode::NonRecursive)
                .map_err(|e| PluginError::filesystem(format!("Failed to watch {}: {e}", dir.display())))?;
        }

        self.watcher = Some(watcher);
        self.rx = Some(rx);
        info!(directories = ?self.directories, "Artifact watcher started");
        Ok(())
    }

    /// Spawn the event loop; it runs until [`stop`](Self::stop) or the
    /// cancellation token fires
    pub fn run(&mut self) -> Result<JoinHandle<()>> {
        let mut rx = self
            .rx
            .take()
            .ok_or_else(|| PluginError::invalid_state("Watcher not started"))?;
        let manager = Arc::clone(&self.manager);
        let debounce = self.debounce;
        let cancel = self.cancel.clone();

        Ok(tokio::spawn(async move {
            let mut last_handled: HashMap<PathBuf, Instant> = HashMap::new();
            loop {
                let res = tokio::select! {
                    _ = cancel.cancelled() => break,
                    res = rx.recv() => match res {
                        Some(res) => res,
                        None => break,
                    },
                };
                let event = match res {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(error = %e, "File watcher error");
                        continue;
                    }
                };
                if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    continue;
                }
                for path in event.paths {
                    if let Some(at) = last_handled.get(&path) {
                        if at.elapsed() < debounce {
                            continue;
                        }
                    }
                    let Some(target) = WatchTarget::classify(&path) else {
                        continue;
                    };
                    // Let the writer finish before reading the file.
                    tokio::time::sleep(debounce).await;
                    last_handled.insert(path, Instant::now());
                    if let Err(e) = handle_target(&manager, target).await {
                        error!(error = %e, "Failed to handle file change");
                    }
                }
            }
            debug!("Artifact watcher loop ended");
        }))
    }

    /// Stop watching
    pub fn stop(&mut self) {
        self.cancel.cancel();
        self.watcher = None;
        self.rx = None;
        info!("Artifact watcher stopped");
    }
}

/// Apply one classified change
pub async fn handle_target(manager: &PluginManager, target: WatchTarget) -> Result<()> {
    match target {
        WatchTarget::Artifact(path) => {
            let Some(record) = manager.registry().find_by_artifact(&path) else {
                debug!(path = %path.display(), "Changed artifact is not loaded");
                return Ok(());
            };
            if !record.hot_reload_enabled() {
                debug!(plugin = %record.id(), "Hot reload disabled; change ignored");
                return Ok(());
            }
            info!(plugin = %record.id(), path = %path.display(), "Artifact changed, reloading");
            manager
                .reload_plugin(record.id(), ReloadOptions::default())
                .await
                .map(|_| ())
        }
        WatchTarget::Config { stem, path } => {
            let record = manager.registry().records().into_iter().find(|r| {
                r.artifact_path()
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .is_some_and(|s| s == stem)
            });
            let Some(record) = record else {
                debug!(path = %path.display(), "No plugin for configuration file");
                return Ok(());
            };
            let config = load_config(&path).await?;
            info!(plugin = %record.id(), path = %path.display(), "Configuration changed, applying");
            manager.configure_plugin(record.id(), config).await
        }
    }
}

/// Parse a configuration file by extension
pub async fn load_config(path: &Path) -> Result<serde_json::Value> {
    let content = tokio::fs::read_to_string(path).await?;
    let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");
    match extension {
        "json" => Ok(serde_json::from_str(&content)?),
        "yaml" | "yml" => serde_yaml::from_str(&content)
            .map_err(|e| PluginError::invalid_configuration(format!("YAML parse error: {e}"))),
        "toml" => {
            let value: toml::Value = content
                .parse()
                .map_err(|e| PluginError::invalid_configuration(format!("TOML parse error: {e}")))?;
            Ok(serde_json::to_value(value)?)
        }
        other => Err(PluginError::invalid_configuration(format!(
            "Unsupported config format: {other}"
        ))),
    }
}
