//! Bounded notification sinks
//!
//! Every asynchronous outcome reaches the application through a [`Sink`]: a bounded,
//! single-producer single-consumer channel with an explicit [`Backpressure`] policy.
//! The producer is the connection's session task; the consumer is the application's
//! event loop holding the paired `mpsc::Receiver`.

use crate::config::SinkSettings;
use crate::connection::{Completion, Subscription};
use crate::error::ConnectionError;
use crate::message::Message;
use serde::{Deserialize, Serialize};
use std::future::Future;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

/// What the producer does when a sink is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backpressure {
    /// Producer waits until the consumer frees a slot
    #[default]
    Block,
    /// Notification is discarded and a warning is logged
    DropNewest,
}

/// Producing half of a bounded notification channel
#[derive(Debug)]
pub struct Sink<T> {
    tx: mpsc::Sender<T>,
    policy: Backpressure,
}

impl<T> Clone for Sink<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            policy: self.policy,
        }
    }
}

/// Create a sink and its receiving half
///
/// A capacity of zero is raised to one.
pub fn sink<T>(capacity: usize, policy: Backpressure) -> (Sink<T>, mpsc::Receiver<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (Sink { tx, policy }, rx)
}

impl<T: Send + 'static> Sink<T> {
    pub fn policy(&self) -> Backpressure {
        self.policy
    }

    /// True once the receiving half has been dropped
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Deliver `item` according to the sink's policy
    ///
    /// Returns false when the item was dropped or the receiver is gone.
    pub async fn post(&self, item: T) -> bool {
        match self.policy {
            Backpressure::Block => self.tx.send(item).await.is_ok(),
            Backpressure::DropNewest => match self.tx.try_send(item) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        capacity = self.tx.max_capacity(),
                        "Sink full, dropping notification"
                    );
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            },
        }
    }

    /// Deliver `item` like [`Sink::post`], giving up if `interrupt` completes first
    ///
    /// Only a blocked [`Backpressure::Block`] post can be interrupted. The item comes
    /// back to the caller in that case, neither delivered nor dropped.
    pub async fn post_unless<F>(&self, item: T, interrupt: F) -> Option<T>
    where
        F: Future<Output = ()>,
    {
        match self.policy {
            Backpressure::DropNewest => {
                self.post(item).await;
                None
            }
            Backpressure::Block => tokio::select! {
                biased;

                permit = self.tx.reserve() => {
                    if let Ok(permit) = permit {
                        permit.send(item);
                    }
                    None
                }
                _ = interrupt => Some(item),
            },
        }
    }

    /// Deliver `item` without ever suspending the caller
    ///
    /// Under [`Backpressure::Block`] a full sink hands the item to a spawned task that
    /// waits for capacity, so delivery still happens exactly once.
    pub fn post_detached(&self, item: T) {
        match self.tx.try_send(item) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(item)) => match self.policy {
                Backpressure::Block => match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        let tx = self.tx.clone();
                        handle.spawn(async move {
                            let _ = tx.send(item).await;
                        });
                    }
                    Err(_) => warn!("Sink full outside a runtime, dropping notification"),
                },
                Backpressure::DropNewest => {
                    warn!(
                        capacity = self.tx.max_capacity(),
                        "Sink full, dropping notification"
                    );
                }
            },
        }
    }
}

/// Sink receiving publish completions
pub type CompletionSink = Sink<Completion>;
/// Sink receiving subscription acknowledgments
pub type SubscriptionSink = Sink<Subscription>;
/// Sink receiving messages delivered against a subscription
pub type MessageSink = Sink<Message>;
/// Sink receiving unsolicited connection errors
pub type ErrorSink = Sink<ConnectionError>;

impl SinkSettings {
    pub fn completion_sink(&self) -> (CompletionSink, mpsc::Receiver<Completion>) {
        sink(self.completion_capacity, self.backpressure)
    }

    pub fn subscription_sink(&self) -> (SubscriptionSink, mpsc::Receiver<Subscription>) {
        sink(self.subscription_capacity, self.backpressure)
    }

    pub fn message_sink(&self) -> (MessageSink, mpsc::Receiver<Message>) {
        sink(self.message_capacity, self.backpressure)
    }

    pub fn error_sink(&self) -> (ErrorSink, mpsc::Receiver<ConnectionError>) {
        sink(self.error_capacity, self.backpressure)
    }
}
