//! Shared fixtures: an in-memory REST collaborator and a push server on the
//! far end of a duplex stream
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use storelink_core::transport::protocol::{read_frame, write_frame};
use storelink_core::transport::{ClientEvent, Room, ServerEvent, ServerFrame};
use storelink_core::{
    Credential, DeliveryState, HistoryApi, Message, OrderSnapshot, Principal, Result, Role,
    SyncError, TransportChannel, TransportSession,
};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::time::timeout;

pub const WAIT: Duration = Duration::from_secs(2);

pub fn at(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
}

pub fn message(id: &str, sender: &str, recipient: &str, content: &str, ms: i64) -> Message {
    Message {
        id: id.to_string(),
        sender_id: sender.to_string(),
        recipient_id: recipient.to_string(),
        content: content.to_string(),
        created_at: at(ms),
        delivery_state: DeliveryState::Confirmed,
        sender_name: None,
        client_key: None,
    }
}

pub fn buyer(id: &str) -> Principal {
    Principal::new(id, format!("Buyer {}", id), Role::Buyer, Credential::new("buyer-token"))
}

pub fn operator(id: &str) -> Principal {
    Principal::new(id, "Support", Role::Operator, Credential::new("op-token"))
}

#[derive(Default)]
pub struct FakeState {
    pub history: Vec<Message>,
    pub orders: HashMap<String, OrderSnapshot>,
    pub fail_history: bool,
    pub fail_send: bool,
    pub sent: Vec<(String, String)>,
    pub history_calls: usize,
    next_id: u64,
}

/// REST collaborator backed by a vector
pub struct FakeApi {
    self_id: String,
    pub state: Mutex<FakeState>,
}

impl FakeApi {
    pub fn new(self_id: &str) -> Arc<Self> {
        Arc::new(Self {
            self_id: self_id.to_string(),
            state: Mutex::new(FakeState::default()),
        })
    }

    pub fn with_history(self_id: &str, history: Vec<Message>) -> Arc<Self> {
        let api = Self::new(self_id);
        api.state.lock().history = history;
        api
    }
}

#[async_trait]
impl HistoryApi for FakeApi {
    async fn fetch_history(&self, peer_id: Option<&str>) -> Result<Vec<Message>> {
        let mut state = self.state.lock();
        state.history_calls += 1;
        if state.fail_history {
            return Err(SyncError::HistoryFetch("connection refused".to_string()));
        }
        Ok(state
            .history
            .iter()
            .filter(|m| peer_id.map_or(true, |peer| m.involves(peer)))
            .cloned()
            .collect())
    }

    async fn send_message(&self, recipient_id: &str, content: &str) -> Result<Message> {
        let mut state = self.state.lock();
        if state.fail_send {
            return Err(SyncError::Send("503 from upstream".to_string()));
        }
        state.next_id += 1;
        state.sent.push((recipient_id.to_string(), content.to_string()));
        let stored = Message {
            id: format!("srv-{}", state.next_id),
            sender_id: self.self_id.clone(),
            recipient_id: recipient_id.to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
            delivery_state: DeliveryState::Confirmed,
            sender_name: None,
            client_key: None,
        };
        state.history.push(stored.clone());
        Ok(stored)
    }

    async fn fetch_order(&self, order_id: &str) -> Result<OrderSnapshot> {
        self.state
            .lock()
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| SyncError::OrderNotFound(order_id.to_string()))
    }
}

/// Server end of an attached push channel
pub struct FakeServer {
    reader: ReadHalf<DuplexStream>,
    writer: WriteHalf<DuplexStream>,
    pub hello: ClientEvent,
}

impl FakeServer {
    /// Attach `channel` to a fresh in-memory server that accepts any credential
    pub async fn accept(channel: &TransportChannel) -> (TransportSession, FakeServer) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (mut reader, mut writer) = tokio::io::split(server);
        let credential = Credential::new("test-token");

        let serve = async {
            let hello: ClientEvent = read_frame(&mut reader).await.unwrap().unwrap();
            let reply = ServerFrame::new(
                None,
                ServerEvent::Connected {
                    connection_id: "conn-1".to_string(),
                },
            );
            write_frame(&mut writer, &reply).await.unwrap();
            hello
        };
        let (session, hello) = tokio::join!(channel.attach(client, &credential), serve);

        (
            session.unwrap(),
            FakeServer {
                reader,
                writer,
                hello,
            },
        )
    }

    /// Next frame written by the client; `None` on EOF or after `WAIT`
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        match timeout(WAIT, read_frame::<_, ClientEvent>(&mut self.reader)).await {
            Ok(Ok(event)) => event,
            _ => None,
        }
    }

    /// Whether the client closed its side
    pub async fn closed(&mut self) -> bool {
        matches!(
            timeout(WAIT, read_frame::<_, ClientEvent>(&mut self.reader)).await,
            Ok(Ok(None))
        )
    }

    pub async fn push(&mut self, room: Option<&Room>, event: ServerEvent) {
        write_frame(&mut self.writer, &ServerFrame::new(room, event))
            .await
            .unwrap();
    }
}
