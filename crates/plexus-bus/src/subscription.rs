//! Subscription ownership and indexing
//!
//! Subscriptions are indexed by id, by subscriber and by message type under one
//! `RwLock`. Each subscription carries a generation so that a reloading plugin
//! can stage subscriptions for its replacement instance and have them swapped
//! in atomically.

use crate::message::Message;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use plexus_core::{PluginError, Result};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info};
use uuid::Uuid;

/// Callback invoked for each delivered message
pub type MessageHandler = Arc<dyn Fn(&Message) -> Result<()> + Send + Sync>;

/// Optional per-subscription predicate
pub type MessageFilter = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

/// A live subscription
pub struct Subscription {
    id: Uuid,
    subscriber: String,
    message_type: String,
    handler: MessageHandler,
    filter: Option<MessageFilter>,
    active: AtomicBool,
    generation: u64,
    created_at: DateTime<Utc>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("subscriber", &self.subscriber)
            .field("message_type", &self.message_type)
            .field("filtered", &self.filter.is_some())
            .field("active", &self.is_active())
            .field("generation", &self.generation)
            .finish()
    }
}

impl Subscription {
    /// Subscription id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Subscribing plugin id
    pub fn subscriber(&self) -> &str {
        &self.subscriber
    }

    /// Message type tag
    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    /// Whether the subscription currently receives messages
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Instance generation that owns this subscription
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the optional predicate accepts `message`
    pub fn accepts(&self, message: &Message) -> bool {
        self.filter.as_ref().map_or(true, |f| f(message))
    }

    /// Invoke the handler, turning errors and panics into a delivery failure
    /// for this subscription only
    pub fn deliver(&self, message: &Message) -> Result<()> {
        if !self.is_active() {
            return Err(PluginError::invalid_state(format!(
                "Subscription {} is not active",
                self.id
            ))
            .with_plugin(self.subscriber.as_str()));
        }

        match catch_unwind(AssertUnwindSafe(|| (self.handler)(message))) {
            Ok(result) => result.map_err(|e| {
                if e.plugin_id().is_some() {
                    e
                } else {
                    e.with_plugin(self.subscriber.as_str())
                }
            }),
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(PluginError::execution_failed(format!(
                    "Handler for {} panicked: {reason}",
                    self.message_type
                ))
                .with_plugin(self.subscriber.as_str()))
            }
        }
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }
}

/// Read-only view of a subscription
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionInfo {
    /// Subscription id
    pub id: Uuid,
    /// Subscribing plugin id
    pub subscriber: String,
    /// Message type tag
    pub message_type: String,
    /// Whether a predicate is attached
    pub filtered: bool,
    /// Whether it currently receives messages
    pub active: bool,
    /// Owning instance generation
    pub generation: u64,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
struct Indexes {
    by_id: HashMap<Uuid, Arc<Subscription>>,
    by_subscriber: HashMap<String, Vec<Uuid>>,
    by_type: HashMap<String, Vec<Uuid>>,
}

impl Indexes {
    fn insert(&mut self, sub: Arc<Subscription>) {
        self.by_subscriber
            .entry(sub.subscriber.clone())
            .or_default()
            .push(sub.id);
        self.by_type
            .entry(sub.message_type.clone())
            .or_default()
            .push(sub.id);
        self.by_id.insert(sub.id, sub);
    }

    fn remove(&mut self, id: &Uuid) -> Option<Arc<Subscription>> {
        let sub = self.by_id.remove(id)?;
        sub.deactivate();

        if let Some(ids) = self.by_subscriber.get_mut(&sub.subscriber) {
            ids.retain(|i| i != id);
            if ids.is_empty() {
                self.by_subscriber.remove(&sub.subscriber);
            }
        }
        if let Some(ids) = self.by_type.get_mut(&sub.message_type) {
            ids.retain(|i| i != id);
            if ids.is_empty() {
                self.by_type.remove(&sub.message_type);
            }
        }
        Some(sub)
    }

    fn of_subscriber(&self, subscriber: &str) -> Vec<Arc<Subscription>> {
        self.by_subscriber
            .get(subscriber)
            .map(|ids| ids.iter().filter_map(|i| self.by_id.get(i).cloned()).collect())
            .unwrap_or_default()
    }
}

/// Handle returned by subscribe; `cancel` is idempotent
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: Uuid,
    cancelled: AtomicBool,
    indexes: Weak<RwLock<Indexes>>,
}

impl fmt::Debug for Indexes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Indexes")
            .field("subscriptions", &self.by_id.len())
            .finish()
    }
}

impl SubscriptionHandle {
    /// Subscription id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Remove the subscription. Returns `true` only for the call that
    /// actually removed it.
    pub fn cancel(&self) -> bool {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return false;
        }
        match self.indexes.upgrade() {
            Some(indexes) => indexes.write().remove(&self.id).is_some(),
            None => false,
        }
    }

    /// Whether `cancel` has been called
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Owner of all subscriptions
#[derive(Debug, Default)]
pub struct SubscriptionManager {
    indexes: Arc<RwLock<Indexes>>,
}

impl SubscriptionManager {
    /// Create an empty manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `subscriber` to messages tagged `message_type`
    pub fn subscribe(
        &self,
        subscriber: impl Into<String>,
        message_type: impl Into<String>,
        handler: MessageHandler,
        filter: Option<MessageFilter>,
    ) -> Result<SubscriptionHandle> {
        self.insert(subscriber.into(), message_type.into(), handler, filter, 0, true)
    }

    /// Subscribe on behalf of a staged instance; the subscription stays
    /// inactive until [`cutover`](Self::cutover) activates `generation`
    pub fn subscribe_staged(
        &self,
        subscriber: impl Into<String>,
        message_type: impl Into<String>,
        handler: MessageHandler,
        filter: Option<MessageFilter>,
        generation: u64,
    ) -> Result<SubscriptionHandle> {
        self.insert(
            subscriber.into(),
            message_type.into(),
            handler,
            filter,
            generation,
            false,
        )
    }

    /// Subscribe with an explicit generation, active immediately
    pub fn subscribe_generation(
        &self,
        subscriber: impl Into<String>,
        message_type: impl Into<String>,
        handler: MessageHandler,
        filter: Option<MessageFilter>,
        generation: u64,
    ) -> Result<SubscriptionHandle> {
        self.insert(
            subscriber.into(),
            message_type.into(),
            handler,
            filter,
            generation,
            true,
        )
    }

    fn insert(
        &self,
        subscriber: String,
        message_type: String,
        handler: MessageHandler,
        filter: Option<MessageFilter>,
        generation: u64,
        active: bool,
    ) -> Result<SubscriptionHandle> {
        if subscriber.trim().is_empty() {
            return Err(PluginError::invalid_argument("Subscriber id is empty"));
        }
        if message_type.trim().is_empty() {
            return Err(PluginError::invalid_argument("Message type tag is empty"));
        }

        let sub = Arc::new(Subscription {
            id: Uuid::new_v4(),
            subscriber,
            message_type,
            handler,
            filter,
            active: AtomicBool::new(active),
            generation,
            created_at: Utc::now(),
        });
        let id = sub.id;

        debug!(
            subscription = %id,
            subscriber = %sub.subscriber,
            message_type = %sub.message_type,
            staged = !active,
            "Subscription added"
        );
        self.indexes.write().insert(sub);

        Ok(SubscriptionHandle {
            id,
            cancelled: AtomicBool::new(false),
            indexes: Arc::downgrade(&self.indexes),
        })
    }

    /// Remove a subscription by id
    pub fn unsubscribe(&self, id: &Uuid) -> bool {
        self.indexes.write().remove(id).is_some()
    }

    /// Remove everything `subscriber` owns; returns the number removed
    pub fn unsubscribe_all(&self, subscriber: &str) -> usize {
        let mut indexes = self.indexes.write();
        let ids: Vec<Uuid> = indexes
            .by_subscriber
            .get(subscriber)
            .cloned()
            .unwrap_or_default();
        let removed = ids.iter().filter(|id| indexes.remove(id).is_some()).count();
        drop(indexes);

        if removed > 0 {
            info!(subscriber = %subscriber, count = removed, "Subscriptions reclaimed");
        }
        removed
    }

    /// Activate `generation` for `subscriber` and drop every other generation
    /// it owns, in one write-locked step. Returns `(activated, removed)`.
    pub fn cutover(&self, subscriber: &str, generation: u64) -> (usize, usize) {
        let mut indexes = self.indexes.write();
        let mut activated = 0;
        let mut removed = 0;
        for sub in indexes.of_subscriber(subscriber) {
            if sub.generation == generation {
                sub.active.store(true, Ordering::Release);
                activated += 1;
            } else if indexes.remove(&sub.id).is_some() {
                removed += 1;
            }
        }
        drop(indexes);

        debug!(
            subscriber = %subscriber,
            generation,
            activated,
            removed,
            "Subscription cutover"
        );
        (activated, removed)
    }

    /// Drop the subscriptions a staged generation created
    pub fn discard_generation(&self, subscriber: &str, generation: u64) -> usize {
        let mut indexes = self.indexes.write();
        let staged: Vec<Uuid> = indexes
            .of_subscriber(subscriber)
            .into_iter()
            .filter(|s| s.generation == generation)
            .map(|s| s.id)
            .collect();
        staged.iter().filter(|id| indexes.remove(id).is_some()).count()
    }

    /// Subscriptions for a type tag, in subscription order
    pub fn for_type(&self, message_type: &str) -> Vec<Arc<Subscription>> {
        let indexes = self.indexes.read();
        indexes
            .by_type
            .get(message_type)
            .map(|ids| ids.iter().filter_map(|i| indexes.by_id.get(i).cloned()).collect())
            .unwrap_or_default()
    }

    /// Subscriptions owned by `subscriber`
    pub fn for_subscriber(&self, subscriber: &str) -> Vec<Arc<Subscription>> {
        self.indexes.read().of_subscriber(subscriber)
    }

    /// Look a subscription up by id
    pub fn get(&self, id: &Uuid) -> Option<Arc<Subscription>> {
        self.indexes.read().by_id.get(id).cloned()
    }

    /// Snapshot of every subscription
    pub fn enumerate(&self) -> Vec<SubscriptionInfo> {
        let indexes = self.indexes.read();
        let mut infos: Vec<SubscriptionInfo> = indexes
            .by_id
            .values()
            .map(|s| SubscriptionInfo {
                id: s.id,
                subscriber: s.subscriber.clone(),
                message_type: s.message_type.clone(),
                filtered: s.filter.is_some(),
                active: s.is_active(),
                generation: s.generation,
                created_at: s.created_at,
            })
            .collect();
        infos.sort_by_key(|i| i.created_at);
        infos
    }

    /// Active subscription counts per type tag
    pub fn count_by_type(&self) -> BTreeMap<String, usize> {
        let indexes = self.indexes.read();
        indexes
            .by_type
            .iter()
            .map(|(tag, ids)| {
                let active = ids
                    .iter()
                    .filter_map(|i| indexes.by_id.get(i))
                    .filter(|s| s.is_active())
                    .count();
                (tag.clone(), active)
            })
            .collect()
    }

    /// Total number of subscriptions, active or staged
    pub fn len(&self) -> usize {
        self.indexes.read().by_id.len()
    }

    /// Whether there are no subscriptions
    pub fn is_empty(&self) -> bool {
        self.indexes.read().by_id.is_empty()
    }

    /// Cancel every subscription
    pub fn clear(&self) -> usize {
        let mut indexes = self.indexes.write();
        let count = indexes.by_id.len();
        for sub in indexes.by_id.values() {
            sub.deactivate();
        }
        *indexes = Indexes::default();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn recording(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> MessageHandler {
        let log = Arc::clone(log);
        Arc::new(move |m: &Message| -> Result<()> {
            log.lock().push(format!("{tag}:{}", m.payload));
            Ok(())
        })
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let manager = SubscriptionManager::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let handle = manager
            .subscribe("com.example.a", "t", recording(&log, "a"), None)
            .unwrap();
        assert_eq!(manager.len(), 1);
        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert!(handle.is_cancelled());
        assert!(manager.is_empty());
    }

    #[test]
    fn test_unsubscribe_all_reclaims_and_blocks_delivery() {
        let manager = SubscriptionManager::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        manager.subscribe("com.example.a", "t1", recording(&log, "a"), None).unwrap();
        manager.subscribe("com.example.a", "t2", recording(&log, "a"), None).unwrap();
        manager.subscribe("com.example.b", "t1", recording(&log, "b"), None).unwrap();

        let held = manager.for_type("t1");
        assert_eq!(manager.unsubscribe_all("com.example.a"), 2);
        assert_eq!(manager.len(), 1);

        let msg = Message::new("t1", "host", json!(1));
        // a snapshot taken before reclaim must not reach the handler
        assert!(held[0].deliver(&msg).is_err());
        assert!(held[1].deliver(&msg).is_ok());
        assert_eq!(log.lock().as_slice(), ["b:1"]);
    }

    #[test]
    fn test_handler_panic_is_isolated() {
        let manager = SubscriptionManager::new();
        let handler: MessageHandler = Arc::new(|_m: &Message| -> Result<()> { panic!("boom") });
        manager.subscribe("com.example.a", "t", handler, None).unwrap();
        let sub = &manager.for_type("t")[0];
        let err = sub.deliver(&Message::new("t", "host", json!(null))).unwrap_err();
        assert!(err.message().contains("boom"));
        assert_eq!(err.plugin_id(), Some("com.example.a"));
    }

    #[test]
    fn test_staged_generation_cutover() {
        let manager = SubscriptionManager::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        manager
            .subscribe_generation("com.example.a", "t", recording(&log, "old"), None, 1)
            .unwrap();
        manager
            .subscribe_staged("com.example.a", "t", recording(&log, "new"), None, 2)
            .unwrap();

        let active: Vec<_> = manager.for_type("t").into_iter().filter(|s| s.is_active()).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].generation(), 1);

        assert_eq!(manager.cutover("com.example.a", 2), (1, 1));
        let subs = manager.for_type("t");
        assert_eq!(subs.len(), 1);
        assert!(subs[0].is_active());
        assert_eq!(subs[0].generation(), 2);
    }

    #[test]
    fn test_discard_generation() {
        let manager = SubscriptionManager::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        manager.subscribe("com.example.a", "t", recording(&log, "old"), None).unwrap();
        manager
            .subscribe_staged("com.example.a", "t", recording(&log, "new"), None, 1)
            .unwrap();
        assert_eq!(manager.discard_generation("com.example.a", 1), 1);
        assert_eq!(manager.len(), 1);
        assert_eq!(manager.count_by_type().get("t"), Some(&1));
    }
}
