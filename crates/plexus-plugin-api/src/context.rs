//! Plugin context
//!
//! The context is a non-owning mediator between a plugin and the host. It
//! holds shared handles to the bus and the contract registry and a weak view
//! of the plugin directory, so a plugin can never keep the registry alive.
//!
//! A context built for a staged instance (during hot reload) buffers
//! contract and endpoint registrations and creates inactive subscriptions.
//! The host applies them atomically at cutover, or discards them on rollback.

use parking_lot::Mutex;
use plexus_bus::{
    DeliveryMode, DeliveryReport, Event, Message, MessageBus, MessageFilter, MessageHandler,
    MessageId, RequestHandler, SubscriptionHandle,
};
use plexus_contracts::{ContractRegistry, ServiceContract, ServiceVersion};
use plexus_core::{PluginError, PluginMetadata, PluginState, Result};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::debug;

/// Read-only view of the plugin registry offered to plugins
pub trait PluginDirectory: Send + Sync {
    /// Current state of a plugin
    fn plugin_state(&self, plugin_id: &str) -> Option<PluginState>;

    /// Metadata of a plugin
    fn plugin_metadata(&self, plugin_id: &str) -> Option<PluginMetadata>;

    /// Registered plugin ids
    fn plugin_ids(&self) -> Vec<String>;
}

/// Registrations a staged context deferred until cutover
#[derive(Default)]
pub struct StagedRegistrations {
    /// Contracts to install
    pub contracts: Vec<ServiceContract>,
    /// Endpoints to install
    pub endpoints: Vec<(String, RequestHandler)>,
}

impl fmt::Debug for StagedRegistrations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagedRegistrations")
            .field("contracts", &self.contracts.len())
            .field("endpoints", &self.endpoints.len())
            .finish()
    }
}

/// The host services available to a plugin
#[derive(Clone)]
pub struct PluginContext {
    plugin_id: String,
    generation: u64,
    staged: Arc<AtomicBool>,
    config: serde_json::Value,
    bus: Arc<MessageBus>,
    contracts: Arc<ContractRegistry>,
    directory: Weak<dyn PluginDirectory>,
    pending: Arc<Mutex<StagedRegistrations>>,
}

impl fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginContext")
            .field("plugin_id", &self.plugin_id)
            .field("generation", &self.generation)
            .field("staged", &self.is_staged())
            .finish()
    }
}

impl PluginContext {
    /// Context for a live instance
    pub fn new(
        plugin_id: impl Into<String>,
        generation: u64,
        config: serde_json::Value,
        bus: Arc<MessageBus>,
        contracts: Arc<ContractRegistry>,
        directory: Weak<dyn PluginDirectory>,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            generation,
            staged: Arc::new(AtomicBool::new(false)),
            config,
            bus,
            contracts,
            directory,
            pending: Arc::new(Mutex::new(StagedRegistrations::default())),
        }
    }

    /// Context for an instance staged during hot reload
    pub fn staged(
        plugin_id: impl Into<String>,
        generation: u64,
        config: serde_json::Value,
        bus: Arc<MessageBus>,
        contracts: Arc<ContractRegistry>,
        directory: Weak<dyn PluginDirectory>,
    ) -> Self {
        let ctx = Self::new(plugin_id, generation, config, bus, contracts, directory);
        ctx.staged.store(true, Ordering::Release);
        ctx
    }

    /// Owning plugin id
    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// Instance generation; increases with every reload
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether registrations are being deferred
    pub fn is_staged(&self) -> bool {
        self.staged.load(Ordering::Acquire)
    }

    /// Configuration document supplied by the host
    pub fn config(&self) -> &serde_json::Value {
        &self.config
    }

    /// The bus
    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    /// The contract registry
    pub fn contracts(&self) -> &Arc<ContractRegistry> {
        &self.contracts
    }

    /// Subscribe this plugin to a message type
    pub fn subscribe(
        &self,
        message_type: &str,
        handler: MessageHandler,
        filter: Option<MessageFilter>,
    ) -> Result<SubscriptionHandle> {
        let subs = self.bus.subscriptions();
        if self.is_staged() {
            subs.subscribe_staged(&self.plugin_id, message_type, handler, filter, self.generation)
        } else {
            subs.subscribe_generation(&self.plugin_id, message_type, handler, filter, self.generation)
        }
    }

    /// Subscribe to a typed event
    pub fn subscribe_event<E, F>(&self, handler: F) -> Result<SubscriptionHandle>
    where
        E: Event,
        F: Fn(E, &Message) -> Result<()> + Send + Sync + 'static,
    {
        self.subscribe(E::EVENT_TYPE, plexus_bus::event::typed_handler(handler), None)
    }

    /// Publish a message from this plugin
    pub fn publish(
        &self,
        message_type: &str,
        payload: serde_json::Value,
        mode: DeliveryMode,
        recipients: Vec<String>,
    ) -> Result<MessageId> {
        self.bus
            .publish(Message::new(message_type, &self.plugin_id, payload), mode, recipients)
    }

    /// Publish from this plugin and wait for delivery
    pub async fn publish_async(
        &self,
        message_type: &str,
        payload: serde_json::Value,
        mode: DeliveryMode,
        recipients: Vec<String>,
    ) -> Result<DeliveryReport> {
        self.bus
            .publish_async(Message::new(message_type, &self.plugin_id, payload), mode, recipients)
            .await
    }

    /// Broadcast a typed event from this plugin
    pub fn publish_event<E: Event>(&self, event: &E) -> Result<MessageId> {
        self.bus.events().publish(&self.plugin_id, event)
    }

    /// Register a service contract provided by this plugin
    pub fn register_contract(&self, contract: ServiceContract) -> Result<()> {
        let mut pending = self.pending.lock();
        if self.is_staged() {
            contract.validate()?;
            debug!(plugin = %self.plugin_id, service = %contract.service_name, "Contract staged");
            pending.contracts.push(contract);
            Ok(())
        } else {
            drop(pending);
            self.contracts.register(&self.plugin_id, contract)
        }
    }

    /// Register a request/response endpoint provided by this plugin
    pub fn register_endpoint(&self, name: &str, handler: RequestHandler) -> Result<()> {
        let mut pending = self.pending.lock();
        if self.is_staged() {
            if pending.endpoints.iter().any(|(n, _)| n == name) {
                return Err(PluginError::already_exists(format!("Endpoint {name}"))
                    .with_plugin(self.plugin_id.as_str()));
            }
            pending.endpoints.push((name.to_string(), handler));
            Ok(())
        } else {
            drop(pending);
            self.bus.requests().register(&self.plugin_id, name, handler)
        }
    }

    /// Resolve a service contract by minimum version
    pub fn resolve_service(&self, service_name: &str, min_version: &ServiceVersion) -> Result<Arc<ServiceContract>> {
        self.contracts.resolve(service_name, min_version)
    }

    /// Call an endpoint, blocking up to `timeout`
    pub fn call_endpoint(
        &self,
        name: &str,
        request: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value> {
        self.bus.requests().call(name, request, timeout)
    }

    /// Call an endpoint asynchronously
    pub async fn call_endpoint_async(
        &self,
        name: &str,
        request: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value> {
        self.bus.requests().call_async(name, request, timeout).await
    }

    /// Validate a call against a service contract, then call the endpoint of
    /// the same name as `service.method`
    pub fn call_service(
        &self,
        service_name: &str,
        method: &str,
        arguments: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value> {
        self.contracts.validate_method_call(service_name, method, &arguments)?;
        self.call_endpoint(&format!("{service_name}.{method}"), arguments, timeout)
    }

    fn directory(&self) -> Result<Arc<dyn PluginDirectory>> {
        self.directory
            .upgrade()
            .ok_or_else(|| PluginError::invalid_state("Plugin registry is gone"))
    }

    /// State of another plugin
    pub fn plugin_state(&self, plugin_id: &str) -> Option<PluginState> {
        self.directory().ok()?.plugin_state(plugin_id)
    }

    /// Metadata of another plugin
    pub fn plugin_metadata(&self, plugin_id: &str) -> Option<PluginMetadata> {
        self.directory().ok()?.plugin_metadata(plugin_id)
    }

    /// Registered plugin ids
    pub fn plugin_ids(&self) -> Vec<String> {
        self.directory().map(|d| d.plugin_ids()).unwrap_or_default()
    }

    /// End staging: later registrations go straight to the host, and the
    /// deferred ones are returned for the host to install. Every clone of
    /// this context observes the change.
    pub fn go_live(&self) -> StagedRegistrations {
        let mut pending = self.pending.lock();
        self.staged.store(false, Ordering::Release);
        std::mem::take(&mut *pending)
    }

    /// Contracts deferred so far
    pub fn staged_contracts(&self) -> Vec<ServiceContract> {
        self.pending.lock().contracts.clone()
    }

    /// Drop deferred registrations without installing them
    pub fn discard_staged(&self) {
        let mut pending = self.pending.lock();
        *pending = StagedRegistrations::default();
    }
}
