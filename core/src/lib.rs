/// StoreLink - real-time conversation and order-status sync
///
/// Client-side sync layer for a storefront: one shared push channel with
/// reference-counted rooms, REST snapshots, and view state machines that
/// reconcile both into a consistent, deduplicated message list.

pub mod cache;
pub mod config;
pub mod console;
pub mod error;
pub mod identity;
pub mod reconcile;
pub mod rest;
pub mod transport;
pub mod types;
pub mod utils;
pub mod views;

pub use config::Config;
pub use error::{Result, SyncError};
pub use identity::{Credential, IdentityProvider, Principal, Role, StaticIdentity};
pub use rest::{HistoryApi, HttpHistoryApi};
pub use transport::{ChannelEvent, ChannelHandle, TransportChannel, TransportSession};
pub use types::{DeliveryState, Message, OrderSnapshot, OrderStatus, OrderStatusEvent};
