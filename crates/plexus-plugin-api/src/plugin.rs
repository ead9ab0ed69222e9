//! Core plugin trait and types

use crate::context::PluginContext;
use async_trait::async_trait;
use plexus_bus::Message;
use plexus_contracts::{ServiceContract, ServiceRequirement};
use plexus_core::{PluginCapabilities, PluginError, PluginMetadata, PluginPriority, Result, Version};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a plugin-level transaction
pub type TransactionId = String;

/// Core plugin trait that all plugins must implement
///
/// Identity accessors default to the fields of [`metadata`](Plugin::metadata).
/// Every optional capability defaults to a no-op or to `NotSupported`, so a
/// minimal plugin only implements lifecycle and commands.
#[async_trait]
pub trait Plugin: Send + Sync + fmt::Debug {
    /// Full metadata record
    fn metadata(&self) -> &PluginMetadata;

    /// Plugin id
    fn id(&self) -> &str {
        &self.metadata().id
    }

    /// Display name
    fn name(&self) -> &str {
        &self.metadata().name
    }

    /// Description
    fn description(&self) -> &str {
        &self.metadata().description
    }

    /// Author
    fn author(&self) -> &str {
        &self.metadata().author
    }

    /// Version
    fn version(&self) -> Version {
        self.metadata().version
    }

    /// Category
    fn category(&self) -> &str {
        &self.metadata().category
    }

    /// License
    fn license(&self) -> &str {
        &self.metadata().license
    }

    /// Homepage URL
    fn homepage(&self) -> Option<&str> {
        self.metadata().homepage.as_deref()
    }

    /// Advertised capabilities
    fn capabilities(&self) -> PluginCapabilities {
        self.metadata().capabilities
    }

    /// Startup priority
    fn priority(&self) -> PluginPriority {
        self.metadata().priority
    }

    /// Called once after loading. The context is the plugin's only way back
    /// into the host.
    async fn initialize(&mut self, ctx: PluginContext) -> Result<()>;

    /// Called once before unloading. Must not fail.
    async fn shutdown(&mut self);

    /// Generic command entry point
    async fn execute_command(&mut self, command: &str, params: serde_json::Value) -> Result<serde_json::Value>;

    /// Commands accepted by [`execute_command`](Plugin::execute_command)
    fn available_commands(&self) -> Vec<String>;

    /// Configuration used when none is supplied
    fn default_configuration(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    /// Apply a configuration document
    async fn configure(&mut self, _config: serde_json::Value) -> Result<()> {
        Err(PluginError::not_supported("configure").with_plugin(self.id()))
    }

    /// Configuration currently in effect
    fn current_configuration(&self) -> serde_json::Value {
        self.default_configuration()
    }

    /// Check a configuration document without applying it
    fn validate_configuration(&self, _config: &serde_json::Value) -> Result<()> {
        Ok(())
    }

    /// Suspend work. Plugins that cannot pause keep the default.
    async fn pause(&mut self) -> Result<()> {
        Err(PluginError::not_supported("pause").with_plugin(self.id()))
    }

    /// Resume after [`pause`](Plugin::pause)
    async fn resume(&mut self) -> Result<()> {
        Err(PluginError::not_supported("resume").with_plugin(self.id()))
    }

    /// Restart in place
    async fn restart(&mut self) -> Result<()> {
        Err(PluginError::not_supported("restart").with_plugin(self.id()))
    }

    /// Flush and stop taking new work ahead of shutdown or reload
    async fn prepare_shutdown(&mut self) -> Result<()> {
        Ok(())
    }

    /// Contracts for the services this plugin provides
    fn service_contracts(&self) -> Vec<ServiceContract> {
        Vec::new()
    }

    /// Services this plugin consumes
    fn service_dependencies(&self) -> Vec<ServiceRequirement> {
        Vec::new()
    }

    /// Handle a call to one of the provided services
    async fn handle_service_call(
        &mut self,
        service: &str,
        method: &str,
        _params: serde_json::Value,
    ) -> Result<serde_json::Value> {
        Err(PluginError::not_supported(format!("{service}.{method}")).with_plugin(self.id()))
    }

    /// Report health
    async fn health_check(&self) -> HealthStatus {
        HealthStatus::Healthy
    }

    /// Start a plugin-level transaction
    async fn begin_transaction(&mut self) -> Result<TransactionId> {
        Err(PluginError::not_supported("begin_transaction").with_plugin(self.id()))
    }

    /// Commit a transaction
    async fn commit_transaction(&mut self, _id: &str) -> Result<()> {
        Err(PluginError::not_supported("commit_transaction").with_plugin(self.id()))
    }

    /// Roll a transaction back
    async fn rollback_transaction(&mut self, _id: &str) -> Result<()> {
        Err(PluginError::not_supported("rollback_transaction").with_plugin(self.id()))
    }

    /// Handle a bus message of one of [`supported_events`](Plugin::supported_events)
    async fn handle_event(&mut self, _event: &Message) -> Result<()> {
        Ok(())
    }

    /// Message types the host should route to [`handle_event`](Plugin::handle_event)
    fn supported_events(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Plugin health status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "message")]
pub enum HealthStatus {
    /// Plugin is healthy and operating normally
    Healthy,

    /// Plugin is degraded but still functioning
    Degraded(String),

    /// Plugin is unhealthy and not functioning
    Unhealthy(String),
}

impl HealthStatus {
    /// Check if the plugin is healthy
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    /// Check if the plugin is degraded
    pub fn is_degraded(&self) -> bool {
        matches!(self, HealthStatus::Degraded(_))
    }

    /// Check if the plugin is unhealthy
    pub fn is_unhealthy(&self) -> bool {
        matches!(self, HealthStatus::Unhealthy(_))
    }

    /// Get the health message if any
    pub fn message(&self) -> Option<&str> {
        match self {
            HealthStatus::Healthy => None,
            HealthStatus::Degraded(msg) | HealthStatus::Unhealthy(msg) => Some(msg),
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded(msg) => write!(f, "degraded: {msg}"),
            HealthStatus::Unhealthy(msg) => write!(f, "unhealthy: {msg}"),
        }
    }
}
