//! Mock implementations for testing

use crate::context::PluginContext;
use crate::plugin::{HealthStatus, Plugin, TransactionId};
use crate::PluginFactory;
use async_trait::async_trait;
use parking_lot::Mutex;
use plexus_bus::{Message, MessageHandler, RequestHandler};
use plexus_contracts::ServiceContract;
use plexus_core::{PluginCapabilities, PluginError, PluginMetadata, PluginState, Result, Version};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Call record shared between a mock plugin, its test, and any later
/// instances built from the same builder
#[derive(Debug, Clone, Default)]
pub struct MockProbe {
    inner: Arc<Mutex<ProbeState>>,
}

#[derive(Debug, Default)]
struct ProbeState {
    initialized: Vec<Version>,
    shutdowns: Vec<Version>,
    prepared: usize,
    commands: Vec<String>,
    dependency_states: BTreeMap<String, Option<PluginState>>,
    received: Vec<(Version, serde_json::Value)>,
    events: Vec<(Version, String)>,
    instances_created: usize,
}

impl MockProbe {
    /// Versions that completed `initialize`, in call order
    pub fn initialized(&self) -> Vec<Version> {
        self.inner.lock().initialized.clone()
    }

    /// Number of `initialize` calls that succeeded
    pub fn init_call_count(&self) -> usize {
        self.inner.lock().initialized.len()
    }

    /// Versions that were shut down, in call order
    pub fn shutdowns(&self) -> Vec<Version> {
        self.inner.lock().shutdowns.clone()
    }

    /// Number of `shutdown` calls
    pub fn shutdown_call_count(&self) -> usize {
        self.inner.lock().shutdowns.len()
    }

    /// Number of `prepare_shutdown` calls
    pub fn prepare_call_count(&self) -> usize {
        self.inner.lock().prepared
    }

    /// Commands executed, in call order
    pub fn commands(&self) -> Vec<String> {
        self.inner.lock().commands.clone()
    }

    /// State each declared dependency had when `initialize` ran
    pub fn dependency_states(&self) -> BTreeMap<String, Option<PluginState>> {
        self.inner.lock().dependency_states.clone()
    }

    /// Payloads delivered to subscriptions the plugin created, tagged with
    /// the version of the receiving instance
    pub fn received(&self) -> Vec<(Version, serde_json::Value)> {
        self.inner.lock().received.clone()
    }

    /// Messages routed to `handle_event`, tagged with the receiving version
    pub fn events(&self) -> Vec<(Version, String)> {
        self.inner.lock().events.clone()
    }

    /// Instances constructed through [`MockPluginBuilder::factory`]
    pub fn instances_created(&self) -> usize {
        self.inner.lock().instances_created
    }
}

/// Builder for [`MockPlugin`]
#[derive(Debug, Clone)]
pub struct MockPluginBuilder {
    metadata: PluginMetadata,
    contracts: Vec<ServiceContract>,
    subscriptions: Vec<String>,
    events: Vec<String>,
    fail_initialize: bool,
    pausable: bool,
    health: HealthStatus,
    probe: MockProbe,
}

impl MockPluginBuilder {
    fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let metadata = PluginMetadata {
            name: id.clone(),
            id,
            description: "Mock plugin".to_string(),
            version: Version::new(1, 0, 0),
            author: "Plexus".to_string(),
            license: "MIT".to_string(),
            homepage: None,
            category: "testing".to_string(),
            tags: Default::default(),
            dependencies: Vec::new(),
            optional_dependencies: Vec::new(),
            capabilities: PluginCapabilities::empty(),
            priority: Default::default(),
            min_host_version: None,
            max_host_version: None,
            custom_data: Default::default(),
        };
        Self {
            metadata,
            contracts: Vec::new(),
            subscriptions: Vec::new(),
            events: Vec::new(),
            fail_initialize: false,
            pausable: false,
            health: HealthStatus::Healthy,
            probe: MockProbe::default(),
        }
    }

    /// Plugin version
    pub fn version(mut self, version: Version) -> Self {
        self.metadata.version = version;
        self
    }

    /// Required dependency
    pub fn dependency(mut self, plugin_id: impl Into<String>) -> Self {
        self.metadata.dependencies.push(plugin_id.into());
        self
    }

    /// Optional dependency
    pub fn optional_dependency(mut self, plugin_id: impl Into<String>) -> Self {
        self.metadata.optional_dependencies.push(plugin_id.into());
        self
    }

    /// Startup priority
    pub fn priority(mut self, priority: plexus_core::PluginPriority) -> Self {
        self.metadata.priority = priority;
        self
    }

    /// Advertise hot reload
    pub fn hot_reload(mut self) -> Self {
        self.metadata.capabilities.insert(PluginCapabilities::HOT_RELOAD);
        self
    }

    /// Accept `pause` and `resume`
    pub fn pausable(mut self) -> Self {
        self.pausable = true;
        self
    }

    /// Make `initialize` fail
    pub fn fail_initialize(mut self) -> Self {
        self.fail_initialize = true;
        self
    }

    /// Report this health status
    pub fn health(mut self, status: HealthStatus) -> Self {
        self.health = status;
        self
    }

    /// Provide a service. Every method is also exposed as an endpoint named
    /// `service.method` that echoes its parameters.
    pub fn contract(mut self, contract: ServiceContract) -> Self {
        self.metadata.capabilities.insert(PluginCapabilities::SERVICE);
        self.contracts.push(contract);
        self
    }

    /// Subscribe to a message type during `initialize`
    pub fn subscribe(mut self, message_type: impl Into<String>) -> Self {
        self.subscriptions.push(message_type.into());
        self
    }

    /// Ask the host to route a message type to `handle_event`
    pub fn supported_event(mut self, message_type: impl Into<String>) -> Self {
        self.events.push(message_type.into());
        self
    }

    /// Record calls into an existing probe
    pub fn probe(mut self, probe: MockProbe) -> Self {
        self.probe = probe;
        self
    }

    /// Metadata the plugin will report
    pub fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    /// Build the plugin
    pub fn build(self) -> MockPlugin {
        MockPlugin {
            metadata: self.metadata,
            contracts: self.contracts,
            subscriptions: self.subscriptions,
            events: self.events,
            fail_initialize: self.fail_initialize,
            pausable: self.pausable,
            health: self.health,
            probe: self.probe,
            ctx: None,
            paused: false,
            next_transaction: 0,
        }
    }

    /// Factory producing a fresh instance per call, all sharing one probe
    pub fn factory(self) -> PluginFactory {
        Arc::new(move || -> Result<Box<dyn Plugin>> {
            self.probe.inner.lock().instances_created += 1;
            Ok(Box::new(self.clone().build()))
        })
    }
}

/// Configurable plugin for host tests
#[derive(Debug)]
pub struct MockPlugin {
    metadata: PluginMetadata,
    contracts: Vec<ServiceContract>,
    subscriptions: Vec<String>,
    events: Vec<String>,
    fail_initialize: bool,
    pausable: bool,
    health: HealthStatus,
    probe: MockProbe,
    ctx: Option<PluginContext>,
    paused: bool,
    next_transaction: u64,
}

impl MockPlugin {
    /// Start building a mock with version 1.0.0
    pub fn builder(id: impl Into<String>) -> MockPluginBuilder {
        MockPluginBuilder::new(id)
    }

    /// Shortcut for a plain mock
    pub fn new(id: impl Into<String>) -> Self {
        Self::builder(id).build()
    }

    /// The shared call record
    pub fn probe(&self) -> &MockProbe {
        &self.probe
    }

    fn echo_endpoint(&self, endpoint: String) -> RequestHandler {
        let plugin = self.metadata.id.clone();
        let version = self.metadata.version;
        Arc::new(move |params: serde_json::Value| -> Result<serde_json::Value> {
            Ok(json!({
                "endpoint": endpoint,
                "plugin": plugin,
                "version": version.to_string(),
                "params": params,
            }))
        })
    }
}

#[async_trait]
impl Plugin for MockPlugin {
    fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    async fn initialize(&mut self, ctx: PluginContext) -> Result<()> {
        {
            let mut probe = self.probe.inner.lock();
            for dep in &self.metadata.dependencies {
                probe.dependency_states.insert(dep.clone(), ctx.plugin_state(dep));
            }
        }

        if self.fail_initialize {
            return Err(PluginError::initialization_failed("Mock configured to fail")
                .with_plugin(self.metadata.id.as_str()));
        }

        for contract in &self.contracts {
            ctx.register_contract(contract.clone())?;
            for method in contract.methods.keys() {
                let endpoint = format!("{}.{}", contract.service_name, method);
                ctx.register_endpoint(&endpoint, self.echo_endpoint(endpoint.clone()))?;
            }
        }

        for message_type in &self.subscriptions {
            let probe = self.probe.clone();
            let version = self.metadata.version;
            let handler: MessageHandler = Arc::new(move |m: &Message| -> Result<()> {
                probe.inner.lock().received.push((version, m.payload.clone()));
                Ok(())
            });
            ctx.subscribe(message_type, handler, None)?;
        }

        self.probe.inner.lock().initialized.push(self.metadata.version);
        self.ctx = Some(ctx);
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.probe.inner.lock().shutdowns.push(self.metadata.version);
        self.ctx = None;
    }

    async fn execute_command(&mut self, command: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        self.probe.inner.lock().commands.push(command.to_string());
        match command {
            "hello" => {
                let name = params.get("name").and_then(|n| n.as_str()).unwrap_or("World");
                Ok(json!({
                    "message": format!("Hello, {name}!"),
                    "plugin": self.metadata.id,
                }))
            }
            "echo" => Ok(params),
            "version" => Ok(json!(self.metadata.version.to_string())),
            "fail" => Err(PluginError::execution_failed("Mock command failed")
                .with_plugin(self.metadata.id.as_str())),
            other => Err(PluginError::command_not_found(other).with_plugin(self.metadata.id.as_str())),
        }
    }

    fn available_commands(&self) -> Vec<String> {
        ["hello", "echo", "version", "fail"]
            .iter()
            .map(|c| c.to_string())
            .collect()
    }

    async fn pause(&mut self) -> Result<()> {
        if !self.pausable {
            return Err(PluginError::not_supported("pause").with_plugin(self.metadata.id.as_str()));
        }
        self.paused = true;
        Ok(())
    }

    async fn resume(&mut self) -> Result<()> {
        if !self.pausable {
            return Err(PluginError::not_supported("resume").with_plugin(self.metadata.id.as_str()));
        }
        self.paused = false;
        Ok(())
    }

    async fn prepare_shutdown(&mut self) -> Result<()> {
        self.probe.inner.lock().prepared += 1;
        Ok(())
    }

    fn service_contracts(&self) -> Vec<ServiceContract> {
        self.contracts.clone()
    }

    async fn handle_service_call(
        &mut self,
        service: &str,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let known = self
            .contracts
            .iter()
            .any(|c| c.service_name == service && c.methods.contains_key(method));
        if !known {
            return Err(PluginError::command_not_found(format!("{service}.{method}"))
                .with_plugin(self.metadata.id.as_str()));
        }
        Ok(json!({ "service": service, "method": method, "params": params }))
    }

    async fn health_check(&self) -> HealthStatus {
        if self.paused {
            return HealthStatus::Degraded("paused".to_string());
        }
        self.health.clone()
    }

    async fn begin_transaction(&mut self) -> Result<TransactionId> {
        self.next_transaction += 1;
        Ok(format!("{}-tx-{}", self.metadata.id, self.next_transaction))
    }

    async fn commit_transaction(&mut self, _id: &str) -> Result<()> {
        Ok(())
    }

    async fn rollback_transaction(&mut self, _id: &str) -> Result<()> {
        Ok(())
    }

    async fn handle_event(&mut self, event: &Message) -> Result<()> {
        self.probe
            .inner
            .lock()
            .events
            .push((self.metadata.version, event.message_type.clone()));
        Ok(())
    }

    fn supported_events(&self) -> Vec<String> {
        self.events.clone()
    }
}
