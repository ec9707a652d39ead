/// Error types for the sync layer
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Connect or authentication failure on the push channel
    #[error("Transport error: {0}")]
    Transport(String),

    /// REST history snapshot could not be fetched
    #[error("History fetch error: {0}")]
    HistoryFetch(String),

    /// A composed message did not reach the server
    #[error("Send error: {0}")]
    Send(String),

    #[error("Order fetch error for {order_id}: {reason}")]
    OrderFetch { order_id: String, reason: String },

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timeout error: {0}")]
    Timeout(String),
}

impl SyncError {
    /// Text shown to the user. Views store this instead of the error itself.
    pub fn user_message(&self) -> String {
        match self {
            SyncError::Transport(_) => {
                "Live updates are unavailable. Check your connection and retry.".to_string()
            }
            SyncError::HistoryFetch(_) => {
                "Could not load earlier messages. Tap to retry.".to_string()
            }
            SyncError::Send(_) => "Message not sent. Tap to retry.".to_string(),
            SyncError::OrderFetch { .. } => "Could not load this order.".to_string(),
            SyncError::OrderNotFound(id) => format!("Order {} was not found.", id),
            SyncError::Timeout(_) => "The server took too long to respond.".to_string(),
            _ => "Something went wrong. Please try again.".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
