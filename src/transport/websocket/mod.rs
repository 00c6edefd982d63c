//! WebSocket transport
//!
//! - [`protocol`]: the JSON frames exchanged with the broker
//! - [`client`]: connect, login handshake and the frame pump task

pub mod client;
pub mod protocol;

pub use client::WebSocketTransport;
pub use protocol::{ClientFrame, ServerFrame, PROTOCOL_VERSION};
