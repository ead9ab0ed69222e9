//! Configuration layer merging
//!
//! Later layers override earlier ones:
//! - base.yaml (defaults)
//! - environment.yaml (env-specific)
//! - secrets.yaml (tokens)
//! - local.yaml (developer overrides)
//!
//! Tables merge key by key. `repositories` merge by `id`, and
//! `runtime.search_paths` keeps the union in first-seen order. Any other
//! array is replaced by the overlay.

use plexus_core::{PluginError, Result};
use serde_json::Value;

/// Merge configuration layers in order
pub fn merge_values(layers: Vec<Value>) -> Result<Value> {
    let mut layers = layers.into_iter();
    let mut result = layers.next().ok_or_else(|| {
        PluginError::invalid_configuration("No configurations to merge")
    })?;
    for overlay in layers {
        merge_into(&mut result, overlay, &[]);
    }
    Ok(result)
}

fn merge_into(base: &mut Value, overlay: Value, path: &[&str]) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => {
                        let mut child = path.to_vec();
                        child.push(key.as_str());
                        merge_into(existing, value, &child);
                    }
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (Value::Array(base), Value::Array(overlay)) if path == ["repositories"] => {
            merge_by_id(base, overlay);
        }
        (Value::Array(base), Value::Array(overlay)) if path == ["runtime", "search_paths"] => {
            for entry in overlay {
                if !base.contains(&entry) {
                    base.push(entry);
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Entries with the same `id` are merged, new ones appended
fn merge_by_id(base: &mut Vec<Value>, overlay: Vec<Value>) {
    for entry in overlay {
        let id = entry.get("id").cloned();
        let existing = id
            .as_ref()
            .and_then(|id| base.iter_mut().find(|b| b.get("id") == Some(id)));
        match existing {
            Some(existing) => merge_into(existing, entry, &[]),
            None => base.push(entry),
        }
    }
}
