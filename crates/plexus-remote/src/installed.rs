//! Ledger of installed plugins (`installed.json`)

use crate::fs::{read_json, write_json};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use plexus_core::{Result, Version};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// File name of the ledger
pub const INSTALLED_FILE: &str = "installed.json";

/// One installed plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledPlugin {
    /// Installed version
    pub version: Version,
    /// Repository the artifact came from
    pub source: String,
    /// When it was installed or last updated
    pub installed_at: DateTime<Utc>,
    /// Artifact the runtime loaded
    pub artifact_path: PathBuf,
}

/// Persistent pid → install record map
#[derive(Debug)]
pub struct InstalledRegistry {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, InstalledPlugin>>,
}

impl InstalledRegistry {
    /// Open the ledger in `dir`
    pub fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(INSTALLED_FILE);
        let entries = read_json(&path)?.unwrap_or_default();
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Record an install, replacing any previous record for the plugin
    pub fn record(&self, plugin_id: &str, plugin: InstalledPlugin) -> Result<Option<InstalledPlugin>> {
        let mut entries = self.entries.lock();
        let previous = entries.insert(plugin_id.to_string(), plugin);
        if let Err(e) = write_json(&self.path, &*entries) {
            // Keep memory and disk in step
            match &previous {
                Some(prev) => entries.insert(plugin_id.to_string(), prev.clone()),
                None => entries.remove(plugin_id),
            };
            return Err(e);
        }
        Ok(previous)
    }

    /// Drop a record
    pub fn remove(&self, plugin_id: &str) -> Result<Option<InstalledPlugin>> {
        let mut entries = self.entries.lock();
        let removed = entries.remove(plugin_id);
        if removed.is_some() {
            write_json(&self.path, &*entries)?;
        }
        Ok(removed)
    }

    /// Record for a plugin
    pub fn get(&self, plugin_id: &str) -> Option<InstalledPlugin> {
        self.entries.lock().get(plugin_id).cloned()
    }

    /// All records
    pub fn all(&self) -> BTreeMap<String, InstalledPlugin> {
        self.entries.lock().clone()
    }
}
