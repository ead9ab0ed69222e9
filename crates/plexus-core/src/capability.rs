//! Advertised plugin capabilities
//!
//! Capabilities are advisory. The host uses them for discovery and for a few
//! admission checks, such as refusing a hot reload for a plugin that does not
//! advertise [`PluginCapabilities::HOT_RELOAD`].

capability_set! {
    /// Bitset of abilities a plugin declares in its metadata
    pub struct PluginCapabilities {
        /// Contributes user-interface elements
        const UI = 0, "ui";
        /// Provides services to other plugins
        const SERVICE = 1, "service";
        /// Performs network I/O
        const NETWORK = 2, "network";
        /// Transforms or analyses data
        const DATA_PROCESSING = 3, "data_processing";
        /// Hosts scripts
        const SCRIPTING = 4, "scripting";
        /// Touches the filesystem
        const FILE_SYSTEM = 5, "file_system";
        /// Talks to a database
        const DATABASE = 6, "database";
        /// Initialises asynchronously
        const ASYNC_INIT = 7, "async_init";
        /// Supports artifact replacement at runtime
        const HOT_RELOAD = 8, "hot_reload";
        /// Accepts configuration documents
        const CONFIGURATION = 9, "configuration";
        /// Emits logs
        const LOGGING = 10, "logging";
        /// Security-sensitive functionality
        const SECURITY = 11, "security";
        /// Spawns its own threads
        const THREADING = 12, "threading";
        /// Exposes monitoring data
        const MONITORING = 13, "monitoring";
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_and_insert() {
        let mut caps = PluginCapabilities::SERVICE | PluginCapabilities::HOT_RELOAD;
        assert!(caps.contains(PluginCapabilities::SERVICE));
        assert!(!caps.contains(PluginCapabilities::UI));
        caps.insert(PluginCapabilities::UI);
        assert!(caps.contains(PluginCapabilities::UI | PluginCapabilities::SERVICE));
        caps.remove(PluginCapabilities::SERVICE);
        assert!(!caps.intersects(PluginCapabilities::SERVICE));
    }

    #[test]
    fn test_serialises_as_names() {
        let caps = PluginCapabilities::NETWORK | PluginCapabilities::MONITORING;
        let json = serde_json::to_string(&caps).unwrap();
        assert_eq!(json, r#"["network","monitoring"]"#);

        let back: PluginCapabilities = serde_json::from_str(r#"["Monitoring","network"]"#).unwrap();
        assert_eq!(back, caps);

        let from_bits: PluginCapabilities = serde_json::from_str("4").unwrap();
        assert_eq!(from_bits, PluginCapabilities::NETWORK);

        assert!(serde_json::from_str::<PluginCapabilities>(r#"["teleport"]"#).is_err());
    }

    #[test]
    fn test_all_and_truncate() {
        assert_eq!(PluginCapabilities::all().names().len(), 14);
        assert_eq!(PluginCapabilities::from_bits_truncate(u32::MAX), PluginCapabilities::all());
        assert!(PluginCapabilities::empty().is_empty());
    }
}
