//! Transport layer beneath the connection
//!
//! The connection never touches framing, handshakes or sockets. It talks to a
//! [`Transport`] through a deliberately narrow contract:
//!
//! - `connect` establishes a session and returns a [`TransportSession`]
//! - the session accepts [`Request`]s, each carrying a correlation id
//! - the session yields a single stream of [`Notification`]s
//!
//! Implementations:
//!
//! - [`websocket::WebSocketTransport`] - JSON frames over `ws://` / `wss://`
//! - [`crate::testing::LoopbackBroker`] - in-process broker for tests and demos

use crate::config::ConnectOptions;
use crate::error::ConnectError;
use crate::message::Message;
use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

pub mod websocket;

/// Numeric codes carried by rejections and close notifications
pub mod codes {
    pub const BAD_REQUEST: u16 = 400;
    pub const UNAUTHORIZED: u16 = 401;
    pub const FORBIDDEN: u16 = 403;
    pub const CONFLICT: u16 = 409;
    pub const SERVER_ERROR: u16 = 500;
    pub const NORMAL_CLOSE: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const ABNORMAL_CLOSE: u16 = 1006;
}

/// Outbound request, correlated by `seq` or `id`
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Publish {
        seq: u64,
        message: Message,
    },
    Subscribe {
        id: u64,
        matcher: String,
        durable: Option<String>,
    },
    Unsubscribe {
        id: u64,
    },
    Disconnect,
}

/// Inbound notification from the broker side of the session
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    PublishAck { seq: u64 },
    PublishFailed { seq: u64, code: u16, reason: String },
    Subscribed { id: u64 },
    SubscriptionFailed { id: u64, code: u16, reason: String },
    Delivery { id: u64, message: Message },
    Closed { code: u16, reason: String },
}

/// Live session handed back by [`Transport::connect`]
///
/// The transport keeps running until `requests` is dropped, a
/// [`Request::Disconnect`] is sent, or it reports [`Notification::Closed`].
#[derive(Debug)]
pub struct TransportSession {
    /// Client identifier confirmed (or assigned) by the server
    pub client_id: String,
    pub requests: mpsc::Sender<Request>,
    pub notifications: mpsc::Receiver<Notification>,
}

/// Transport abstraction for the connection
///
/// Allows the real WebSocket transport to be swapped for an in-process broker in
/// tests.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish a session, including any login handshake
    async fn connect(
        &self,
        url: &Url,
        options: &ConnectOptions,
    ) -> Result<TransportSession, ConnectError>;
}
