//! Error taxonomy for the channel client
//!
//! Synchronous failures (`ConnectError`) are returned from `Connection::connect`.
//! Everything else is delivered asynchronously through the sink correlated with the
//! request that caused it: `PublishError` inside a `Completion`, `SubscribeError`
//! inside a `Subscription`, and `ConnectionError` on the connection's error sink.

use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;
use thiserror::Error;

/// Failure to establish a session, surfaced synchronously from `connect`
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Network failure: {0}")]
    Network(String),

    #[error("Authentication rejected: {0}")]
    Authentication(String),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] crate::tls::TlsError),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Connect timed out after {0:?}")]
    Timeout(Duration),
}

impl ConnectError {
    /// Create network error, redacting any credentials in the description
    pub fn network<S: AsRef<str>>(message: S) -> Self {
        Self::Network(redact_credentials(message.as_ref()))
    }

    /// Create handshake error
    pub fn handshake<S: AsRef<str>>(message: S) -> Self {
        Self::Handshake(redact_credentials(message.as_ref()))
    }

    /// Create authentication error
    pub fn authentication<S: AsRef<str>>(message: S) -> Self {
        Self::Authentication(redact_credentials(message.as_ref()))
    }
}

/// Outcome error of a single publish request
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PublishError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Publish rejected ({code}): {reason}")]
    Rejected { code: u16, reason: String },

    #[error("Connection lost before acknowledgment")]
    ConnectionLost,

    #[error("Outbound queue full")]
    QueueFull,
}

impl PublishError {
    /// Create rejection error from a broker response
    pub fn rejected<S: AsRef<str>>(code: u16, reason: S) -> Self {
        Self::Rejected {
            code,
            reason: redact_credentials(reason.as_ref()),
        }
    }
}

/// Outcome error of a single subscribe request
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SubscribeError {
    #[error("Invalid matcher: {0}")]
    InvalidMatcher(String),

    #[error("Durable '{durable}' already exists with a different matcher")]
    DurableConflict { durable: String },

    #[error("Subscription rejected ({code}): {reason}")]
    Rejected { code: u16, reason: String },

    #[error("Connection lost before acknowledgment")]
    ConnectionLost,

    #[error("Outbound queue full")]
    QueueFull,
}

impl SubscribeError {
    /// Create rejection error from a broker response
    pub fn rejected<S: AsRef<str>>(code: u16, reason: S) -> Self {
        Self::Rejected {
            code,
            reason: redact_credentials(reason.as_ref()),
        }
    }
}

/// Unsolicited notification that the session has failed or was closed by the peer
///
/// Always fatal to the session it was raised on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Connection closed ({code}): {reason}")]
pub struct ConnectionError {
    pub code: u16,
    pub reason: String,
}

impl ConnectionError {
    pub fn new<S: AsRef<str>>(code: u16, reason: S) -> Self {
        Self {
            code,
            reason: redact_credentials(reason.as_ref()),
        }
    }
}

/// Frame-level failures inside a transport implementation
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Frame codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Socket error: {0}")]
    Socket(String),
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|passwd|token|secret)([=:]\s*)\S+").expect("valid secret pattern")
});

static URL_USERINFO_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(wss?|loopback)://[^/@\s]+@").expect("valid userinfo pattern")
});

/// Strip credentials from text that may reach logs
///
/// Covers `key=value` style secrets and `user:pass@` userinfo in endpoint URLs.
pub fn redact_credentials(text: &str) -> String {
    let redacted = SECRET_PATTERN.replace_all(text, "${1}${2}***");
    URL_USERINFO_PATTERN
        .replace_all(&redacted, "${1}://***@")
        .into_owned()
}
