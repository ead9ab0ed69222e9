//! Typed events over the message envelope
//!
//! An [`Event`] is serialized into a [`Message`] tagged with
//! `Event::EVENT_TYPE`. Typed subscribers check the tag and deserialize the
//! payload on delivery, so a payload that does not decode is a delivery
//! failure for that subscriber only.

use crate::message::{DeliveryMode, Message, MessagePriority};
use crate::publisher::{DeliveryReport, Publisher};
use crate::stats::BusStatistics;
use crate::subscription::{MessageFilter, MessageHandler, SubscriptionHandle, SubscriptionManager};
use parking_lot::Mutex;
use plexus_core::{PluginError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

/// A statically typed event
pub trait Event: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Type tag used on the bus
    const EVENT_TYPE: &'static str;

    /// Priority the event is published with
    fn priority(&self) -> MessagePriority {
        MessagePriority::Normal
    }
}

/// Wrap an event into a message envelope
pub fn to_message<E: Event>(sender: &str, event: &E) -> Result<Message> {
    let payload = serde_json::to_value(event)?;
    Ok(Message::new(E::EVENT_TYPE, sender, payload).with_priority(event.priority()))
}

/// Unwrap a message into an event, checking the tag
pub fn from_message<E: Event>(message: &Message) -> Result<E> {
    if message.message_type != E::EVENT_TYPE {
        return Err(PluginError::invalid_format(format!(
            "Expected event {}, got {}",
            E::EVENT_TYPE,
            message.message_type
        )));
    }
    Ok(serde_json::from_value(message.payload.clone())?)
}

/// Typed façade over the publisher and subscription manager
pub struct EventSystem {
    publisher: Arc<Publisher>,
    subscriptions: Arc<SubscriptionManager>,
    stats: Arc<BusStatistics>,
    history: Mutex<VecDeque<Message>>,
    max_history: usize,
}

impl std::fmt::Debug for EventSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSystem")
            .field("history", &self.history.lock().len())
            .field("max_history", &self.max_history)
            .finish()
    }
}

impl EventSystem {
    /// Create an event system; `max_history == 0` disables history
    pub fn new(
        publisher: Arc<Publisher>,
        subscriptions: Arc<SubscriptionManager>,
        stats: Arc<BusStatistics>,
        max_history: usize,
    ) -> Self {
        Self {
            publisher,
            subscriptions,
            stats,
            history: Mutex::new(VecDeque::with_capacity(max_history.min(1024))),
            max_history,
        }
    }

    fn remember(&self, message: &Message) {
        if self.max_history == 0 {
            return;
        }
        let mut history = self.history.lock();
        while history.len() >= self.max_history {
            history.pop_front();
        }
        history.push_back(message.clone());
    }

    /// Broadcast an event
    pub fn publish<E: Event>(&self, sender: &str, event: &E) -> Result<uuid::Uuid> {
        let message = to_message(sender, event)?;
        self.remember(&message);
        let id = self.publisher.publish(message, DeliveryMode::Broadcast, Vec::new())?;
        self.stats.record_event();
        Ok(id)
    }

    /// Broadcast an event and wait for delivery
    pub async fn publish_async<E: Event>(&self, sender: &str, event: &E) -> Result<DeliveryReport> {
        let message = to_message(sender, event)?;
        self.remember(&message);
        self.stats.record_event();
        self.publisher
            .publish_async(message, DeliveryMode::Broadcast, Vec::new())
            .await
    }

    /// Subscribe to a typed event
    pub fn subscribe<E, F>(&self, subscriber: &str, handler: F) -> Result<SubscriptionHandle>
    where
        E: Event,
        F: Fn(E, &Message) -> Result<()> + Send + Sync + 'static,
    {
        self.subscriptions
            .subscribe(subscriber, E::EVENT_TYPE, typed_handler(handler), None)
    }

    /// Subscribe to a typed event with a predicate over the decoded value
    pub fn subscribe_filtered<E, F, P>(
        &self,
        subscriber: &str,
        handler: F,
        predicate: P,
    ) -> Result<SubscriptionHandle>
    where
        E: Event,
        F: Fn(E, &Message) -> Result<()> + Send + Sync + 'static,
        P: Fn(&E) -> bool + Send + Sync + 'static,
    {
        let filter: MessageFilter = Arc::new(move |m: &Message| {
            from_message::<E>(m).map(|e| predicate(&e)).unwrap_or(false)
        });
        self.subscriptions
            .subscribe(subscriber, E::EVENT_TYPE, typed_handler(handler), Some(filter))
    }

    /// Retained events, oldest first
    pub fn history(&self) -> Vec<Message> {
        self.history.lock().iter().cloned().collect()
    }

    /// Retained events of one type, oldest first
    pub fn history_of<E: Event>(&self) -> Vec<E> {
        self.history
            .lock()
            .iter()
            .filter_map(|m| from_message::<E>(m).ok())
            .collect()
    }

    /// Drop retained events
    pub fn clear_history(&self) {
        let mut history = self.history.lock();
        if !history.is_empty() {
            debug!(count = history.len(), "Event history cleared");
        }
        history.clear();
    }
}

/// Adapt a typed callback into a message handler
pub fn typed_handler<E, F>(handler: F) -> MessageHandler
where
    E: Event,
    F: Fn(E, &Message) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(move |m: &Message| -> Result<()> {
        let event = from_message::<E>(m)?;
        handler(event, m)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    impl Event for Ping {
        const EVENT_TYPE: &'static str = "test.ping";
    }

    #[test]
    fn test_round_trip_through_envelope() {
        let msg = to_message("host", &Ping { n: 3 }).unwrap();
        assert_eq!(msg.message_type, "test.ping");
        assert_eq!(from_message::<Ping>(&msg).unwrap(), Ping { n: 3 });

        let other = Message::new("test.pong", "host", serde_json::json!({"n": 3}));
        assert!(from_message::<Ping>(&other).is_err());
    }

    #[test]
    fn test_typed_handler_rejects_bad_payload() {
        let handler = typed_handler(|_p: Ping, _m: &Message| Ok(()));
        let bad = Message::new("test.ping", "host", serde_json::json!({"n": "x"}));
        assert!(handler(&bad).is_err());
    }
}
