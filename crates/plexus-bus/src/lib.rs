//! # Plexus Bus
//!
//! Inter-plugin communication for the Plexus host.
//!
//! The bus is split into single-purpose parts:
//! - [`Publisher`]: validates and queues messages on a bounded queue
//! - [`SubscriptionManager`]: owns subscriptions, indexed by id, subscriber and type
//! - [`MessageRouter`]: picks the active subscriptions for a message
//! - [`EventSystem`]: typed events over the generic [`Message`] envelope
//! - [`RequestResponseService`]: named endpoints called directly, outside the queue
//!
//! [`MessageBus`] composes them behind one handle.
//!
//! ## Example
//!
//! ```rust,no_run
//! use plexus_bus::{BusConfig, DeliveryMode, Message, MessageBus, MessageHandler};
//! use std::sync::Arc;
//!
//! # fn main() -> plexus_core::Result<()> {
//! let bus = MessageBus::new(BusConfig::default())?;
//! let handler: MessageHandler = Arc::new(|m: &Message| -> plexus_core::Result<()> {
//!     println!("got {}", m.payload);
//!     Ok(())
//! });
//! let _sub = bus.subscribe("com.example.listener", "greeting", handler, None)?;
//! bus.publish(
//!     Message::new("greeting", "host", serde_json::json!({"hello": "world"})),
//!     DeliveryMode::Broadcast,
//!     vec![],
//! )?;
//! bus.shutdown();
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod bus;
pub mod config;
pub mod event;
pub mod message;
pub mod publisher;
pub mod request;
pub mod router;
pub mod stats;
pub mod subscription;

pub use bus::MessageBus;
pub use config::BusConfig;
pub use event::{Event, EventSystem};
pub use message::{DeliveryMode, Message, MessageId, MessagePriority};
pub use publisher::{DeliveryFailure, DeliveryReport, Publisher, PublisherConfig};
pub use request::{EndpointInfo, RequestHandler, RequestResponseService};
pub use router::MessageRouter;
pub use stats::{BusStatistics, BusStatisticsSnapshot};
pub use subscription::{
    MessageFilter, MessageHandler, Subscription, SubscriptionHandle, SubscriptionInfo,
    SubscriptionManager,
};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::{
        BusConfig, DeliveryMode, Event, Message, MessageBus, MessageHandler, MessagePriority,
        SubscriptionHandle,
    };
}
