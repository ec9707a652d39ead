/// REST history client
///
/// Endpoints consumed:
///   GET  /api/messages            ?peer=<id>   history snapshot (all peers when omitted)
///   POST /api/messages            body: {"recipientId":"...","content":"..."}
///   GET  /api/orders/:order_id    order snapshot
///
/// Every request carries the principal's credential as a bearer token and is
/// aborted after `request_timeout`.
use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::identity::Credential;
use crate::types::{Message, OrderSnapshot};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// REST collaborator surface used by the views
#[async_trait]
pub trait HistoryApi: Send + Sync {
    /// Past messages; filtered to one peer when `peer_id` is set
    async fn fetch_history(&self, peer_id: Option<&str>) -> Result<Vec<Message>>;

    /// Send RPC; returns the stored, confirmed message with its server id
    async fn send_message(&self, recipient_id: &str, content: &str) -> Result<Message>;

    async fn fetch_order(&self, order_id: &str) -> Result<OrderSnapshot>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SendRequest<'a> {
    recipient_id: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct HistoryResponse {
    messages: Vec<Message>,
}

#[derive(Deserialize)]
struct SendResponse {
    message: Message,
}

#[derive(Deserialize)]
struct OrderResponse {
    order: OrderSnapshot,
}

/// What went wrong with one request, before it is mapped to the caller's
/// error variant
enum CallError {
    Status(StatusCode),
    Other(String),
}

impl CallError {
    fn describe(&self) -> String {
        match self {
            CallError::Status(status) => format!("server answered {}", status),
            CallError::Other(msg) => msg.clone(),
        }
    }
}

pub struct HttpHistoryApi {
    client: Client<HttpConnector, Full<Bytes>>,
    base_url: String,
    credential: Credential,
    request_timeout: Duration,
}

impl HttpHistoryApi {
    pub fn new(config: &Config, credential: Credential) -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            base_url: config.rest_base_url.trim_end_matches('/').to_string(),
            credential,
            request_timeout: config.request_timeout,
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> std::result::Result<T, CallError> {
        let uri = format!("{}{}", self.base_url, path);
        debug!("{} {}", method, uri);

        let mut builder = Request::builder()
            .method(method)
            .uri(uri.as_str())
            .header("Accept", "application/json")
            .header(
                "Authorization",
                format!("Bearer {}", self.credential.expose()),
            );
        if body.is_some() {
            builder = builder.header("Content-Type", "application/json");
        }
        let request = builder
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| CallError::Other(format!("invalid request: {}", e)))?;

        let exchange = async {
            let response = self
                .client
                .request(request)
                .await
                .map_err(|e| CallError::Other(format!("request failed: {}", e)))?;
            let status = response.status();
            let bytes = response
                .into_body()
                .collect()
                .await
                .map_err(|e| CallError::Other(format!("body read error: {}", e)))?
                .to_bytes();
            Ok::<_, CallError>((status, bytes))
        };

        let (status, bytes) = timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| CallError::Other(format!("{} timed out", uri)))??;

        if !status.is_success() {
            return Err(CallError::Status(status));
        }
        serde_json::from_slice(&bytes).map_err(|e| CallError::Other(format!("invalid JSON: {}", e)))
    }
}

#[async_trait]
impl HistoryApi for HttpHistoryApi {
    async fn fetch_history(&self, peer_id: Option<&str>) -> Result<Vec<Message>> {
        let path = match peer_id {
            Some(peer) => format!("/api/messages?peer={}", urlencoding::encode(peer)),
            None => "/api/messages".to_string(),
        };
        self.call::<HistoryResponse>(Method::GET, &path, None)
            .await
            .map(|r| r.messages)
            .map_err(|e| {
                warn!("History fetch failed: {}", e.describe());
                SyncError::HistoryFetch(e.describe())
            })
    }

    async fn send_message(&self, recipient_id: &str, content: &str) -> Result<Message> {
        let body = serde_json::to_vec(&SendRequest {
            recipient_id,
            content,
        })?;
        self.call::<SendResponse>(Method::POST, "/api/messages", Some(body))
            .await
            .map(|r| r.message)
            .map_err(|e| {
                warn!("Send to {} failed: {}", recipient_id, e.describe());
                SyncError::Send(e.describe())
            })
    }

    async fn fetch_order(&self, order_id: &str) -> Result<OrderSnapshot> {
        let path = format!("/api/orders/{}", urlencoding::encode(order_id));
        match self.call::<OrderResponse>(Method::GET, &path, None).await {
            Ok(r) => Ok(r.order),
            Err(CallError::Status(StatusCode::NOT_FOUND)) => {
                Err(SyncError::OrderNotFound(order_id.to_string()))
            }
            Err(e) => {
                warn!("Order {} fetch failed: {}", order_id, e.describe());
                Err(SyncError::OrderFetch {
                    order_id: order_id.to_string(),
                    reason: e.describe(),
                })
            }
        }
    }
}
