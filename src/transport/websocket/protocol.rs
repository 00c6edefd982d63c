//! JSON frames exchanged with the broker over a WebSocket
//!
//! Every frame is a single text message carrying an `op` tag:
//!
//! ```text
//! client → server   login, subscribe, unsubscribe, publish, disconnect
//! server → client   welcome, subscribed, subscription_error, ack, event, error, heartbeat
//! ```

use crate::error::TransportError;
use crate::message::Message;
use crate::transport::{Notification, Request};
use serde::{Deserialize, Serialize};

/// Protocol revision sent in the login frame
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientFrame {
    Login {
        #[serde(skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        user: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        password: Option<String>,
        protocol: u32,
    },
    Subscribe {
        id: u64,
        matcher: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        durable: Option<String>,
    },
    Unsubscribe {
        id: u64,
    },
    Publish {
        seq: u64,
        body: Message,
    },
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ServerFrame {
    Welcome {
        client_id: String,
    },
    Subscribed {
        id: u64,
    },
    SubscriptionError {
        id: u64,
        code: u16,
        reason: String,
    },
    /// Publish outcome; a present `code` means the publish was rejected
    Ack {
        seq: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Event {
        to: u64,
        body: Message,
    },
    Error {
        code: u16,
        reason: String,
    },
    Heartbeat,
}

impl From<Request> for ClientFrame {
    fn from(request: Request) -> Self {
        match request {
            Request::Publish { seq, message } => ClientFrame::Publish { seq, body: message },
            Request::Subscribe {
                id,
                matcher,
                durable,
            } => ClientFrame::Subscribe {
                id,
                matcher,
                durable,
            },
            Request::Unsubscribe { id } => ClientFrame::Unsubscribe { id },
            Request::Disconnect => ClientFrame::Disconnect,
        }
    }
}

impl ClientFrame {
    pub fn encode(&self) -> Result<String, TransportError> {
        Ok(serde_json::to_string(self)?)
    }
}

impl ServerFrame {
    pub fn decode(text: &str) -> Result<Self, TransportError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Map a post-handshake frame onto the transport contract
    ///
    /// Heartbeats and stray welcomes carry nothing for the session and yield `None`.
    pub fn into_notification(self) -> Option<Notification> {
        match self {
            ServerFrame::Subscribed { id } => Some(Notification::Subscribed { id }),
            ServerFrame::SubscriptionError { id, code, reason } => {
                Some(Notification::SubscriptionFailed { id, code, reason })
            }
            ServerFrame::Ack {
                seq, code: None, ..
            } => Some(Notification::PublishAck { seq }),
            ServerFrame::Ack {
                seq,
                code: Some(code),
                reason,
            } => Some(Notification::PublishFailed {
                seq,
                code,
                reason: reason.unwrap_or_else(|| "rejected".to_string()),
            }),
            ServerFrame::Event { to, body } => Some(Notification::Delivery { id: to, message: body }),
            ServerFrame::Error { code, reason } => Some(Notification::Closed { code, reason }),
            ServerFrame::Welcome { .. } | ServerFrame::Heartbeat => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_frame_omits_missing_fields() {
        let frame = ClientFrame::Login {
            client_id: None,
            user: Some("alice".to_string()),
            password: None,
            protocol: PROTOCOL_VERSION,
        };
        assert_eq!(
            frame.encode().unwrap(),
            r#"{"op":"login","user":"alice","protocol":1}"#
        );
    }

    #[test]
    fn test_publish_frame_wire_form() {
        let request = Request::Publish {
            seq: 7,
            message: Message::builder().destination("sample").long("now", 5).build(),
        };
        let encoded = ClientFrame::from(request).encode().unwrap();
        assert_eq!(
            encoded,
            r#"{"op":"publish","seq":7,"body":{"_dest":"sample","now":5}}"#
        );
    }

    #[test]
    fn test_ack_with_code_is_a_failure() {
        let frame = ServerFrame::decode(r#"{"op":"ack","seq":3,"code":403,"reason":"forbidden"}"#)
            .unwrap();
        assert_eq!(
            frame.into_notification(),
            Some(Notification::PublishFailed {
                seq: 3,
                code: 403,
                reason: "forbidden".to_string()
            })
        );

        let frame = ServerFrame::decode(r#"{"op":"ack","seq":4}"#).unwrap();
        assert_eq!(
            frame.into_notification(),
            Some(Notification::PublishAck { seq: 4 })
        );
    }

    #[test]
    fn test_event_becomes_delivery() {
        let frame =
            ServerFrame::decode(r#"{"op":"event","to":2,"body":{"_dest":"sample"}}"#).unwrap();
        match frame.into_notification() {
            Some(Notification::Delivery { id, message }) => {
                assert_eq!(id, 2);
                assert_eq!(message.destination(), Some("sample"));
            }
            other => panic!("unexpected notification: {other:?}"),
        }
    }

    #[test]
    fn test_heartbeat_is_ignored() {
        let frame = ServerFrame::decode(r#"{"op":"heartbeat"}"#).unwrap();
        assert_eq!(frame.into_notification(), None);
    }

    #[test]
    fn test_unknown_op_is_a_codec_error() {
        let result = ServerFrame::decode(r#"{"op":"teleport"}"#);
        assert!(matches!(result, Err(TransportError::Codec(_))));
    }
}
