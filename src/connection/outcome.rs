//! Outcomes posted to the completion and subscription sinks

use crate::error::{PublishError, SubscribeError};
use crate::message::Message;

/// Identifier of a subscribe request, unique within one connection
pub type SubscriptionId = u64;

/// Outcome of exactly one `publish_async` call
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    /// Sequence number returned by `publish_async`
    pub sequence: u64,
    /// The message as it was published
    pub message: Message,
    pub result: Result<(), PublishError>,
}

impl Completion {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    pub fn error(&self) -> Option<&PublishError> {
        self.result.as_ref().err()
    }
}

/// Outcome of exactly one `subscribe_async` call
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub id: SubscriptionId,
    /// Matcher text as supplied by the caller
    pub matcher: String,
    pub durable: Option<String>,
    pub result: Result<(), SubscribeError>,
}

impl Subscription {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    pub fn error(&self) -> Option<&SubscribeError> {
        self.result.as_ref().err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_accessors() {
        let completion = Completion {
            sequence: 1,
            message: Message::builder().destination("sample").build(),
            result: Err(PublishError::ConnectionLost),
        };
        assert!(!completion.is_ok());
        assert_eq!(completion.error(), Some(&PublishError::ConnectionLost));
    }

    #[test]
    fn test_subscription_accessors() {
        let subscription = Subscription {
            id: 3,
            matcher: r#"{"_dest":"sample"}"#.to_string(),
            durable: Some("orders".to_string()),
            result: Ok(()),
        };
        assert!(subscription.is_ok());
        assert!(subscription.error().is_none());
    }
}
