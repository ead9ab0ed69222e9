//! Message envelope and delivery modes

use chrono::{DateTime, Utc};
use plexus_core::{PluginError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Message identifier
pub type MessageId = Uuid;

/// Message priority; carried with the message, does not reorder delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    /// Background traffic
    Low,
    /// Default priority
    #[default]
    Normal,
    /// Elevated priority
    High,
    /// Must not be ignored
    Critical,
}

/// Who receives a published message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Every subscriber of the message type
    #[default]
    Broadcast,
    /// Exactly one named recipient
    Unicast,
    /// A named set of recipients
    Multicast,
}

impl DeliveryMode {
    /// Check a recipient list against the mode
    pub fn validate_recipients(self, recipients: &[String]) -> Result<()> {
        match self {
            DeliveryMode::Broadcast => Ok(()),
            DeliveryMode::Unicast if recipients.len() == 1 => Ok(()),
            DeliveryMode::Unicast => Err(PluginError::invalid_argument(format!(
                "Unicast delivery needs exactly one recipient, got {}",
                recipients.len()
            ))),
            DeliveryMode::Multicast if !recipients.is_empty() => Ok(()),
            DeliveryMode::Multicast => Err(PluginError::invalid_argument(
                "Multicast delivery needs at least one recipient",
            )),
        }
    }
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryMode::Broadcast => write!(f, "broadcast"),
            DeliveryMode::Unicast => write!(f, "unicast"),
            DeliveryMode::Multicast => write!(f, "multicast"),
        }
    }
}

/// Generic message envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique id
    pub id: Uuid,
    /// Type tag subscribers match on
    pub message_type: String,
    /// Sending plugin id, or `host`
    pub sender: String,
    /// Creation time
    pub timestamp: DateTime<Utc>,
    /// Priority
    #[serde(default)]
    pub priority: MessagePriority,
    /// Payload document
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Message {
    /// Create a message with normal priority
    pub fn new(
        message_type: impl Into<String>,
        sender: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_type: message_type.into(),
            sender: sender.into(),
            timestamp: Utc::now(),
            priority: MessagePriority::Normal,
            payload,
        }
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Reject envelopes the router cannot match
    pub fn validate(&self) -> Result<()> {
        if self.message_type.trim().is_empty() {
            return Err(PluginError::invalid_argument("Message type tag is empty"));
        }
        if self.sender.trim().is_empty() {
            return Err(PluginError::invalid_argument("Message sender is empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_recipient_validation() {
        let one = vec!["a".to_string()];
        let two = vec!["a".to_string(), "b".to_string()];
        assert!(DeliveryMode::Broadcast.validate_recipients(&[]).is_ok());
        assert!(DeliveryMode::Unicast.validate_recipients(&one).is_ok());
        assert!(DeliveryMode::Unicast.validate_recipients(&two).is_err());
        assert!(DeliveryMode::Multicast.validate_recipients(&two).is_ok());
        assert!(DeliveryMode::Multicast.validate_recipients(&[]).is_err());
    }

    #[test]
    fn test_message_validation() {
        assert!(Message::new("t", "host", json!(null)).validate().is_ok());
        assert!(Message::new(" ", "host", json!(null)).validate().is_err());
        assert!(Message::new("t", "", json!(null)).validate().is_err());
    }
}
