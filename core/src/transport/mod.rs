/// Push channel: wire protocol, room ownership, connection lifecycle
pub mod channel;
pub mod protocol;
pub mod rooms;

pub use channel::{ChannelEvent, ChannelHandle, TransportChannel, TransportSession};
pub use protocol::{ClientEvent, Room, ServerEvent, ServerFrame, PROTOCOL_VERSION};
pub use rooms::{OwnerId, RoomRegistry};
