//! Message bus composition

use crate::config::BusConfig;
use crate::event::EventSystem;
use crate::message::{DeliveryMode, Message};
use crate::publisher::{DeliveryReport, Publisher, PublisherConfig};
use crate::request::RequestResponseService;
use crate::router::MessageRouter;
use crate::stats::{BusStatistics, BusStatisticsSnapshot};
use crate::subscription::{MessageFilter, MessageHandler, SubscriptionHandle, SubscriptionManager};
use plexus_core::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// The communication bus: publisher, subscriptions, router, typed events and
/// request/response endpoints behind one handle
#[derive(Debug)]
pub struct MessageBus {
    config: BusConfig,
    subscriptions: Arc<SubscriptionManager>,
    router: MessageRouter,
    publisher: Arc<Publisher>,
    events: EventSystem,
    requests: RequestResponseService,
    stats: Arc<BusStatistics>,
    shut_down: AtomicBool,
}

impl MessageBus {
    /// Build a bus and start its delivery worker
    pub fn new(config: BusConfig) -> Result<Self> {
        config.validate()?;

        let stats = Arc::new(BusStatistics::new(config.enable_statistics));
        let subscriptions = Arc::new(SubscriptionManager::new());
        let router = MessageRouter::new(Arc::clone(&subscriptions));
        let publisher = Arc::new(Publisher::new(
            PublisherConfig {
                max_queue_size: config.max_queue_size,
                delivery_timeout: config.delivery_timeout,
            },
            router.clone(),
            Arc::clone(&stats),
        )?);
        let history = if config.enable_event_history {
            config.max_event_history
        } else {
            0
        };
        let events = EventSystem::new(
            Arc::clone(&publisher),
            Arc::clone(&subscriptions),
            Arc::clone(&stats),
            history,
        );
        let requests = RequestResponseService::new(
            config.default_request_timeout,
            config.max_concurrent_requests,
            Arc::clone(&stats),
        );

        info!(
            max_queue_size = config.max_queue_size,
            max_concurrent_requests = config.max_concurrent_requests,
            "Message bus started"
        );

        Ok(Self {
            config,
            subscriptions,
            router,
            publisher,
            events,
            requests,
            stats,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Configuration in effect
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Subscription manager
    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }

    /// Router
    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    /// Publisher
    pub fn publisher(&self) -> &Arc<Publisher> {
        &self.publisher
    }

    /// Typed event façade
    pub fn events(&self) -> &EventSystem {
        &self.events
    }

    /// Request/response endpoints
    pub fn requests(&self) -> &RequestResponseService {
        &self.requests
    }

    /// Subscribe to a message type
    pub fn subscribe(
        &self,
        subscriber: &str,
        message_type: &str,
        handler: MessageHandler,
        filter: Option<MessageFilter>,
    ) -> Result<SubscriptionHandle> {
        self.subscriptions.subscribe(subscriber, message_type, handler, filter)
    }

    /// Publish without waiting
    pub fn publish(&self, message: Message, mode: DeliveryMode, recipients: Vec<String>) -> Result<uuid::Uuid> {
        self.publisher.publish(message, mode, recipients)
    }

    /// Publish and wait for delivery
    pub async fn publish_async(
        &self,
        message: Message,
        mode: DeliveryMode,
        recipients: Vec<String>,
    ) -> Result<DeliveryReport> {
        self.publisher.publish_async(message, mode, recipients).await
    }

    /// Publish and block until delivery
    pub fn publish_blocking(
        &self,
        message: Message,
        mode: DeliveryMode,
        recipients: Vec<String>,
    ) -> Result<DeliveryReport> {
        self.publisher.publish_blocking(message, mode, recipients)
    }

    /// Release everything a plugin holds on the bus: subscriptions and
    /// request endpoints. Returns `(subscriptions, endpoints)` removed.
    pub fn release_plugin(&self, plugin_id: &str) -> (usize, usize) {
        let subs = self.subscriptions.unsubscribe_all(plugin_id);
        let endpoints = self.requests.unregister_provider(plugin_id).len();
        (subs, endpoints)
    }

    /// Counter snapshot
    pub fn statistics(&self) -> BusStatisticsSnapshot {
        self.stats.snapshot(self.subscriptions.count_by_type())
    }

    /// Whether [`shutdown`](Self::shutdown) has run
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Stop accepting, drain the queue, cancel subscriptions and release
    /// endpoints. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.publisher.shutdown();
        let cancelled = self.subscriptions.clear();
        self.events.clear_history();
        self.requests.clear();
        info!(subscriptions = cancelled, "Message bus shut down");
    }
}

impl Drop for MessageBus {
    fn drop(&mut self) {
        self.shutdown();
    }
}
