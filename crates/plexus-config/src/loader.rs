//! Configuration loading
//!
//! Documents are parsed into a format-neutral tree first so that layers can
//! be merged and environment overrides applied before the typed
//! [`HostConfig`] is produced.

use crate::{ConfigFormat, HostConfig};
use plexus_core::{PluginError, Result};
use regex::Regex;
use serde_json::Value;
use std::env;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Prefix of environment overrides, e.g. `PLEXUS_BUS__MAX_QUEUE_SIZE=500`
pub const ENV_PREFIX: &str = "PLEXUS_";

/// Load configuration from a file
pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<HostConfig> {
    from_value(load_value(path.as_ref())?)
}

/// Load configuration from a string
pub fn load_from_str(content: &str, format: ConfigFormat) -> Result<HostConfig> {
    from_value(parse_value(content, format)?)
}

/// Load a file, optionally apply `PLEXUS_` environment overrides, validate
pub fn load_config<P: AsRef<Path>>(path: P, env_overrides: bool) -> Result<HostConfig> {
    let mut value = load_value(path.as_ref())?;
    if env_overrides {
        apply_env_overrides(&mut value, env::vars());
    }
    let config = from_value(value)?;
    crate::validator::validate_config(&config)?;
    Ok(config)
}

/// Load and merge multiple configuration files
///
/// Files are merged in order, with later files overriding earlier ones:
/// - base.yaml (common defaults)
/// - production.yaml (env-specific)
/// - secrets.yaml (tokens)
pub fn load_and_merge<P: AsRef<Path>>(paths: Vec<P>) -> Result<HostConfig> {
    if paths.is_empty() {
        return Err(PluginError::invalid_configuration(
            "No configuration files provided",
        ));
    }

    let layers = paths
        .iter()
        .map(|p| load_value(p.as_ref()))
        .collect::<Result<Vec<_>>>()?;
    let merged = crate::merger::merge_values(layers)?;
    let config = from_value(merged)?;
    crate::validator::validate_config(&config)?;
    Ok(config)
}

/// Read and parse a file into an untyped tree
pub fn load_value(path: &Path) -> Result<Value> {
    let content = fs::read_to_string(path).map_err(|e| {
        PluginError::invalid_configuration(format!(
            "Failed to read config file {}: {e}",
            path.display()
        ))
    })?;
    let format = ConfigFormat::from_path(path)?;
    debug!(path = %path.display(), ?format, "Loading configuration");
    parse_value(&content, format)
}

/// Expand environment variables and parse into an untyped tree
pub fn parse_value(content: &str, format: ConfigFormat) -> Result<Value> {
    let expanded = expand_env_vars(content)?;
    let value = match format {
        ConfigFormat::Yaml => serde_yaml::from_str::<Value>(&expanded)
            .map_err(|e| PluginError::invalid_configuration(format!("Failed to parse YAML: {e}")))?,
        ConfigFormat::Toml => toml::from_str::<Value>(&expanded)
            .map_err(|e| PluginError::invalid_configuration(format!("Failed to parse TOML: {e}")))?,
        ConfigFormat::Json => serde_json::from_str::<Value>(&expanded)
            .map_err(|e| PluginError::invalid_configuration(format!("Failed to parse JSON: {e}")))?,
    };
    // An empty YAML document is null
    Ok(if value.is_null() {
        Value::Object(Default::default())
    } else {
        value
    })
}

fn from_value(value: Value) -> Result<HostConfig> {
    serde_json::from_value(value)
        .map_err(|e| PluginError::invalid_configuration(format!("Invalid configuration: {e}")))
}

/// Expand `${VAR}` and `${VAR:-default}`
pub fn expand_env_vars(content: &str) -> Result<String> {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(:-([^}]*))?\}")
        .map_err(|e| PluginError::invalid_configuration(format!("Invalid regex: {e}")))?;

    let mut result = String::with_capacity(content.len());
    let mut last_match = 0;

    for cap in re.captures_iter(content) {
        let (Some(full_match), Some(var_name)) = (cap.get(0), cap.get(1)) else {
            continue;
        };
        let var_name = var_name.as_str();
        let value = match env::var(var_name) {
            Ok(val) => val,
            Err(_) => match cap.get(3) {
                Some(default) => default.as_str().to_string(),
                None => {
                    return Err(PluginError::invalid_configuration(format!(
                        "Environment variable '{var_name}' not set and no default provided"
                    )));
                }
            },
        };

        result.push_str(&content[last_match..full_match.start()]);
        result.push_str(&value);
        last_match = full_match.end();
    }

    result.push_str(&content[last_match..]);
    Ok(result)
}

/// Apply `PLEXUS_SECTION__FIELD=value` pairs onto a config tree
///
/// `__` separates path segments, names are lowercased. Values that parse
/// as JSON scalars keep their type; anything else is a string.
pub fn apply_env_overrides<I>(value: &mut Value, vars: I) -> usize
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut applied = 0;
    for (key, raw) in vars {
        let Some(path) = key.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let segments: Vec<String> = path
            .split("__")
            .filter(|s| !s.is_empty())
            .map(str::to_ascii_lowercase)
            .collect();
        if segments.is_empty() {
            continue;
        }
        let parsed = match serde_json::from_str::<Value>(&raw) {
            Ok(v) if !v.is_object() && !v.is_array() => v,
            _ => Value::String(raw.clone()),
        };
        set_path(value, &segments, parsed);
        debug!(key = %key, "Applied environment override");
        applied += 1;
    }
    applied
}

fn set_path(root: &mut Value, path: &[String], leaf: Value) {
    let mut node = root;
    for segment in path {
        if !node.is_object() {
            *node = Value::Object(Default::default());
        }
        let Value::Object(map) = node else { return };
        node = map.entry(segment.clone()).or_insert(Value::Null);
    }
    *node = leaf;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const YAML_CONFIG: &str = r#"
bus:
  max_queue_size: 500
  delivery_timeout: 2s

runtime:
  search_paths: ["/opt/plexus/plugins"]
  initialize_timeout: 10s
  hot_reload:
    watch: true

remote:
  cache:
    directory: /var/cache/plexus
    max_size_bytes: 1048576
  download:
    max_concurrent: 2
  updates:
    policy: patch

repositories:
  - id: main
    url: https://plugins.example.com/api
    priority: 1
"#;

    #[test]
    fn test_load_yaml() {
        let config = load_from_str(YAML_CONFIG, ConfigFormat::Yaml).unwrap();

        assert_eq!(config.bus.max_queue_size, 500);
        assert_eq!(config.bus.delivery_timeout, Duration::from_secs(2));
        assert_eq!(config.runtime.search_paths.len(), 1);
        assert!(config.runtime.hot_reload.watch);
        assert_eq!(config.remote.download.max_concurrent, 2);
        assert_eq!(config.remote.updates.policy, plexus_remote::UpdatePolicy::Patch);
        assert_eq!(config.repositories[0].url.as_str(), "https://plugins.example.com/api");
        // Unset sections keep their defaults
        assert_eq!(config.bus.max_event_history, 1_000);
    }

    #[test]
    fn test_load_toml_and_json() {
        let toml_doc = r#"
[bus]
max_queue_size = 42

[remote.security]
require_signatures = true
"#;
        let config = load_from_str(toml_doc, ConfigFormat::Toml).unwrap();
        assert_eq!(config.bus.max_queue_size, 42);
        assert!(config.remote.security.require_signatures);

        let json_doc = r#"{"recovery": {"retry": {"max_attempts": 5, "initial_delay": "50ms"}}}"#;
        let config = load_from_str(json_doc, ConfigFormat::Json).unwrap();
        assert_eq!(config.recovery.retry.max_attempts, 5);
        assert_eq!(config.recovery.retry.initial_delay, Duration::from_millis(50));
    }

    #[test]
    fn test_empty_document_is_default() {
        let config = load_from_str("", ConfigFormat::Yaml).unwrap();
        assert_eq!(config.bus.max_queue_size, 10_000);
    }

    #[test]
    fn test_invalid_yaml() {
        let result = load_from_str("invalid: [yaml", ConfigFormat::Yaml);
        assert!(result.is_err());
    }

    #[test]
    fn test_env_var_substitution() {
        env::set_var("PLEXUS_TEST_QUEUE", "77");
        let config = load_from_str(
            "bus:\n  max_queue_size: ${PLEXUS_TEST_QUEUE}\n",
            ConfigFormat::Yaml,
        )
        .unwrap();
        assert_eq!(config.bus.max_queue_size, 77);
        env::remove_var("PLEXUS_TEST_QUEUE");
    }

    #[test]
    fn test_env_var_with_default() {
        env::remove_var("PLEXUS_TEST_UNDEFINED");
        let expanded = expand_env_vars("dir: ${PLEXUS_TEST_UNDEFINED:-/tmp/cache}").unwrap();
        assert_eq!(expanded, "dir: /tmp/cache");
    }

    #[test]
    fn test_missing_env_var_no_default() {
        env::remove_var("PLEXUS_TEST_MISSING");
        let err = expand_env_vars("token: ${PLEXUS_TEST_MISSING}").unwrap_err();
        assert!(err.to_string().contains("PLEXUS_TEST_MISSING"));
    }

    #[test]
    fn test_env_overrides() {
        let mut value = parse_value(YAML_CONFIG, ConfigFormat::Yaml).unwrap();
        let applied = apply_env_overrides(
            &mut value,
            vec![
                ("PLEXUS_BUS__MAX_QUEUE_SIZE".to_string(), "900".to_string()),
                ("PLEXUS_REMOTE__CACHE__DIRECTORY".to_string(), "/srv/cache".to_string()),
                ("PLEXUS_REMOTE__FALLBACK_TO_CACHE".to_string(), "true".to_string()),
                ("HOME".to_string(), "/root".to_string()),
            ],
        );
        assert_eq!(applied, 3);

        let config = from_value(value).unwrap();
        assert_eq!(config.bus.max_queue_size, 900);
        assert_eq!(config.remote.cache.directory, std::path::PathBuf::from("/srv/cache"));
        assert!(config.remote.fallback_to_cache);
    }

    #[test]
    fn test_load_and_merge_files() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.yaml");
        let prod = dir.path().join("production.toml");
        fs::write(&base, YAML_CONFIG).unwrap();
        fs::write(
            &prod,
            "[bus]\nmax_queue_size = 2000\n\n[[repositories]]\nid = \"mirror\"\nurl = \"https://mirror.example.com\"\npriority = 5\n",
        )
        .unwrap();

        let config = load_and_merge(vec![&base, &prod]).unwrap();
        assert_eq!(config.bus.max_queue_size, 2000);
        assert_eq!(config.bus.delivery_timeout, Duration::from_secs(2));
        assert_eq!(config.repositories.len(), 2);
    }

    #[test]
    fn test_load_and_merge_requires_files() {
        let paths: Vec<&Path> = Vec::new();
        assert!(load_and_merge(paths).is_err());
    }
}
