/// Push channel wire protocol
///
/// Frames are a u32 big-endian length followed by a JSON payload. Client
/// frames carry a `ClientEvent`, server frames a `ServerFrame` (optional room
/// key plus a `ServerEvent`).
use crate::error::{Result, SyncError};
use crate::identity::Credential;
use crate::types::{Message, OrderStatus};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Frames larger than this are treated as a protocol violation
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Server-side multiplexing scope
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Room {
    /// A user's personal room (buyer side of the support chat)
    Personal(String),
    /// Operator inbox: every buyer message
    Admin,
    /// Operator conversation with one buyer
    Chat(String),
    /// Live status feed of one order
    Order(String),
}

impl Room {
    /// Key used on the wire
    pub fn key(&self) -> String {
        match self {
            Room::Personal(id) => format!("user:{}", id),
            Room::Admin => "admin".to_string(),
            Room::Chat(peer) => format!("chat:{}", peer),
            Room::Order(order) => format!("order:{}", order),
        }
    }

    pub fn parse(key: &str) -> Option<Self> {
        if key == "admin" {
            return Some(Room::Admin);
        }
        let (kind, id) = key.split_once(':')?;
        if id.is_empty() {
            return None;
        }
        match kind {
            "user" => Some(Room::Personal(id.to_string())),
            "chat" => Some(Room::Chat(id.to_string())),
            "order" => Some(Room::Order(id.to_string())),
            _ => None,
        }
    }

    /// Frame that joins this room
    pub fn join_event(&self) -> ClientEvent {
        match self {
            Room::Personal(id) => ClientEvent::Join { peer_id: id.clone() },
            Room::Admin => ClientEvent::JoinAdmin,
            Room::Chat(peer) => ClientEvent::JoinChat {
                peer_id: peer.clone(),
            },
            Room::Order(order) => ClientEvent::JoinOrderTracking {
                order_id: order.clone(),
            },
        }
    }

    /// Frame that leaves this room. Personal and admin rooms have none; the
    /// server drops them with the connection.
    pub fn leave_event(&self) -> Option<ClientEvent> {
        match self {
            Room::Personal(_) | Room::Admin => None,
            Room::Chat(peer) => Some(ClientEvent::LeaveChat {
                peer_id: peer.clone(),
            }),
            Room::Order(order) => Some(ClientEvent::LeaveOrderTracking {
                order_id: order.clone(),
            }),
        }
    }
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Events sent by the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    Authenticate {
        credential: Credential,
        protocol_version: u8,
    },
    #[serde(rename_all = "camelCase")]
    Join { peer_id: String },
    JoinAdmin,
    #[serde(rename_all = "camelCase")]
    JoinChat { peer_id: String },
    #[serde(rename_all = "camelCase")]
    LeaveChat { peer_id: String },
    #[serde(rename_all = "camelCase")]
    JoinOrderTracking { order_id: String },
    #[serde(rename_all = "camelCase")]
    LeaveOrderTracking { order_id: String },
    #[serde(rename_all = "camelCase")]
    SendMessage {
        recipient_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_key: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Typing { peer_id: String },
    #[serde(rename_all = "camelCase")]
    StopTyping { peer_id: String },
    Ping { timestamp: i64 },
}

impl ClientEvent {
    /// Get event name as string
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Authenticate { .. } => "authenticate",
            ClientEvent::Join { .. } => "join",
            ClientEvent::JoinAdmin => "join_admin",
            ClientEvent::JoinChat { .. } => "join_chat",
            ClientEvent::LeaveChat { .. } => "leave_chat",
            ClientEvent::JoinOrderTracking { .. } => "join_order_tracking",
            ClientEvent::LeaveOrderTracking { .. } => "leave_order_tracking",
            ClientEvent::SendMessage { .. } => "send_message",
            ClientEvent::Typing { .. } => "typing",
            ClientEvent::StopTyping { .. } => "stop_typing",
            ClientEvent::Ping { .. } => "ping",
        }
    }
}

/// Events pushed by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    Connected { connection_id: String },
    AuthRejected { reason: String },
    NewMessage { message: Message },
    #[serde(rename_all = "camelCase")]
    UserTyping { peer_id: String, is_typing: bool },
    #[serde(rename_all = "camelCase")]
    OrderStatusUpdate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        order_id: Option<String>,
        status: OrderStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        occurred_at: Option<DateTime<Utc>>,
    },
    Pong { timestamp: i64 },
    Error { message: String },
}

/// One server frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    #[serde(flatten)]
    pub event: ServerEvent,
}

impl ServerFrame {
    pub fn new(room: Option<&Room>, event: ServerEvent) -> Self {
        Self {
            room: room.map(Room::key),
            event,
        }
    }
}

/// Protocol frame with length prefix
#[derive(Debug)]
pub struct Frame {
    pub length: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a new frame from any serializable event
    pub fn encode<T: Serialize>(event: &T) -> Result<Self> {
        let payload = serde_json::to_vec(event)?;
        if payload.len() > MAX_FRAME_LEN {
            return Err(SyncError::Transport(format!(
                "frame of {} bytes exceeds limit",
                payload.len()
            )));
        }
        Ok(Self {
            length: payload.len() as u32,
            payload,
        })
    }

    /// Serialize frame to bytes (length prefix + payload)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.payload.len());
        buf.extend_from_slice(&self.length.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Write one event as a frame
pub async fn write_frame<W, T>(writer: &mut W, event: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = Frame::encode(event)?;
    writer.write_all(&frame.to_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the peer closed the stream cleanly.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(SyncError::Io(e)),
    }

    let length = u32::from_be_bytes(len_buf) as usize;
    if length > MAX_FRAME_LEN {
        return Err(SyncError::Transport(format!(
            "frame of {} bytes exceeds limit",
            length
        )));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;
    Ok(Some(serde_json::from_slice(&payload)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_keys_parse_back() {
        for room in [
            Room::Personal("42".to_string()),
            Room::Admin,
            Room::Chat("42".to_string()),
            Room::Order("ORD-1".to_string()),
        ] {
            assert_eq!(Room::parse(&room.key()), Some(room));
        }
        assert_eq!(Room::parse("chat:"), None);
        assert_eq!(Room::parse("lobby"), None);
    }

    #[test]
    fn test_client_event_wire_names() {
        let json = serde_json::to_value(ClientEvent::SendMessage {
            recipient_id: "42".to_string(),
            content: "Hello".to_string(),
            client_key: None,
        })
        .unwrap();
        assert_eq!(json["event"], "send_message");
        assert_eq!(json["recipientId"], "42");
        assert!(json.get("clientKey").is_none());

        let leave = Room::Order("ORD-1".to_string()).leave_event().unwrap();
        assert_eq!(leave.name(), "leave_order_tracking");
        assert!(Room::Admin.leave_event().is_none());
    }

    #[test]
    fn test_server_frame_flattens_event() {
        let raw = r#"{"room":"order:ORD-1","event":"order_status_update","status":"shipped"}"#;
        let frame: ServerFrame = serde_json::from_str(raw).unwrap();
        assert_eq!(frame.room.as_deref(), Some("order:ORD-1"));
        assert_eq!(
            frame.event,
            ServerEvent::OrderStatusUpdate {
                order_id: None,
                status: OrderStatus::Shipped,
                occurred_at: None,
            }
        );
    }

    #[tokio::test]
    async fn test_frame_io_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, &ClientEvent::JoinAdmin).await.unwrap();
        drop(a);

        let first: Option<ClientEvent> = read_frame(&mut b).await.unwrap();
        assert_eq!(first, Some(ClientEvent::JoinAdmin));
        let eof: Option<ClientEvent> = read_frame(&mut b).await.unwrap();
        assert!(eof.is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let _ = a.write_all(&(u32::MAX).to_be_bytes()).await;
        });
        let result: Result<Option<ClientEvent>> = read_frame(&mut b).await;
        assert!(matches!(result, Err(SyncError::Transport(_))));
    }
}
