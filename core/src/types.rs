/// Shared data types for conversations and order tracking
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Delivery state of one message as seen by this client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Local placeholder, not yet echoed by the server
    Pending,
    /// Known to the server
    #[default]
    Confirmed,
    /// Did not reach the server; can be retried
    Failed,
}

/// One chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// Server payloads omit this; anything the server sends is confirmed
    #[serde(default)]
    pub delivery_state: DeliveryState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    /// Client-generated idempotency key, echoed back by servers that support it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,
}

impl Message {
    /// Build a local, not yet confirmed message. The id doubles as the client key.
    pub fn placeholder(
        sender_id: &str,
        recipient_id: &str,
        content: &str,
        created_at: DateTime<Utc>,
    ) -> Self {
        let local_id = format!("local-{}", uuid::Uuid::new_v4());
        Self {
            id: local_id.clone(),
            sender_id: sender_id.to_string(),
            recipient_id: recipient_id.to_string(),
            content: content.to_string(),
            created_at,
            delivery_state: DeliveryState::Pending,
            sender_name: None,
            client_key: Some(local_id),
        }
    }

    /// The other party of this message from `self_id`'s point of view
    pub fn counterpart(&self, self_id: &str) -> &str {
        if self.sender_id == self_id {
            &self.recipient_id
        } else {
            &self.sender_id
        }
    }

    pub fn involves(&self, user_id: &str) -> bool {
        self.sender_id == user_id || self.recipient_id == user_id
    }

    pub fn is_pending(&self) -> bool {
        self.delivery_state == DeliveryState::Pending
    }

    /// Short text for roster previews
    pub fn preview(&self, max_chars: usize) -> String {
        let mut chars = self.content.chars();
        let head: String = chars.by_ref().take(max_chars).collect();
        if chars.next().is_some() {
            format!("{}…", head)
        } else {
            head
        }
    }
}

/// Ordered history between this client and one peer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conversation {
    pub peer_id: String,
    pub peer_display_name: String,
    pub messages: Vec<Message>,
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl Conversation {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }
}

/// Display name for `peer_id`, taken from the message when the peer sent it
pub(crate) fn display_name_for(peer_id: &str, message: &Message) -> String {
    match &message.sender_name {
        Some(name) if message.sender_id == peer_id && !name.is_empty() => name.clone(),
        _ => peer_id.to_string(),
    }
}

/// Order lifecycle as driven by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Processing,
    Shipped,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    /// The forward track, in order
    pub const TRACK: [OrderStatus; 4] = [
        OrderStatus::Pending,
        OrderStatus::Processing,
        OrderStatus::Shipped,
        OrderStatus::Delivered,
    ];

    /// Position on the forward track; `None` for cancelled
    pub fn rank(self) -> Option<usize> {
        Self::TRACK.iter().position(|s| *s == self)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Delivered | OrderStatus::Cancelled)
    }

    /// Whether the server moving from `self` to `next` is a legal transition.
    /// The client only uses this to flag anomalies; it never rejects an update.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        if self.is_terminal() {
            return self == next;
        }
        match (self.rank(), next.rank()) {
            (_, None) => true,
            (Some(cur), Some(nxt)) => nxt >= cur,
            (None, Some(_)) => false,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Processing => "processing",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderStatusEvent {
    pub order_id: String,
    pub status: OrderStatus,
    pub occurred_at: DateTime<Utc>,
}

/// REST view of one order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderSnapshot {
    pub order_id: String,
    pub status: OrderStatus,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub history: Vec<OrderStatusEvent>,
}
