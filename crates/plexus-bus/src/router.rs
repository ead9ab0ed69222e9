//! Message routing

use crate::message::{DeliveryMode, Message};
use crate::subscription::{Subscription, SubscriptionManager};
use std::sync::Arc;

/// Chooses which subscriptions receive a message
#[derive(Debug, Clone)]
pub struct MessageRouter {
    subscriptions: Arc<SubscriptionManager>,
}

impl MessageRouter {
    /// Create a router over `subscriptions`
    pub fn new(subscriptions: Arc<SubscriptionManager>) -> Self {
        Self { subscriptions }
    }

    /// Active subscriptions that should receive `message`, in subscription order.
    ///
    /// The type tag must always match. Broadcast ignores `recipients`;
    /// unicast and multicast keep only subscribers named in it. A
    /// subscription's own predicate is applied last.
    pub fn route(
        &self,
        message: &Message,
        mode: DeliveryMode,
        recipients: &[String],
    ) -> Vec<Arc<Subscription>> {
        self.subscriptions
            .for_type(&message.message_type)
            .into_iter()
            .filter(|s| s.is_active())
            .filter(|s| match mode {
                DeliveryMode::Broadcast => true,
                DeliveryMode::Unicast | DeliveryMode::Multicast => {
                    recipients.iter().any(|r| r == s.subscriber())
                }
            })
            .filter(|s| s.accepts(message))
            .collect()
    }
}
