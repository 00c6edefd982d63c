//! Session task
//!
//! One task per connection owns every piece of correlation state: publishes awaiting
//! acknowledgment, subscriptions and their sinks, and the durable-name registry.
//! Nothing here is shared, so no locks are needed. The task exits on local shutdown,
//! on peer close, or when the transport goes away.
//!
//! A post to a full `Block` sink never outlasts a shutdown request: the wait is
//! abandoned and the outcome is settled during teardown instead.

use super::outcome::{Completion, Subscription, SubscriptionId};
use super::state::{next_state, ConnectionState, StateEvent};
use crate::error::{ConnectionError, PublishError, SubscribeError};
use crate::matcher::Matcher;
use crate::message::Message;
use crate::sink::{Backpressure, CompletionSink, ErrorSink, MessageSink, SubscriptionSink};
use crate::transport::{codes, Notification, Request, TransportSession};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Work handed from the `Connection` to its session task
#[derive(Debug)]
pub(crate) enum Command {
    Publish {
        seq: u64,
        message: Message,
        completions: CompletionSink,
    },
    Subscribe {
        id: SubscriptionId,
        text: String,
        matcher: Matcher,
        durable: Option<String>,
        messages: MessageSink,
        acks: SubscriptionSink,
    },
    Unsubscribe {
        id: SubscriptionId,
    },
}

#[derive(Debug)]
struct PendingPublish {
    message: Message,
    completions: CompletionSink,
}

#[derive(Debug)]
struct ActiveSubscription {
    text: String,
    matcher: Matcher,
    durable: Option<String>,
    messages: MessageSink,
    acks: SubscriptionSink,
    acknowledged: bool,
    unsubscribed: bool,
    /// Deliveries that arrived before the acknowledgment, at most the sink's capacity
    held: VecDeque<Message>,
}

impl ActiveSubscription {
    /// No room left to hold another early delivery
    fn holding_full(&self) -> bool {
        !self.acknowledged && self.held.len() >= self.messages.capacity()
    }

    fn outcome(&self, id: SubscriptionId, result: Result<(), SubscribeError>) -> Subscription {
        Subscription {
            id,
            matcher: self.text.clone(),
            durable: self.durable.clone(),
            result,
        }
    }
}

pub(crate) struct Session {
    requests: mpsc::Sender<Request>,
    notifications: mpsc::Receiver<Notification>,
    state: Arc<watch::Sender<ConnectionState>>,
    errors: ErrorSink,
    pending: HashMap<u64, PendingPublish>,
    subscriptions: HashMap<SubscriptionId, ActiveSubscription>,
    /// Durable names acknowledged during this session
    durables: HashMap<String, Matcher>,
    shutdown: watch::Receiver<bool>,
    /// Set when shutdown interrupted a blocked post
    stopping: bool,
}

/// Why a request could not be handed to the transport
#[derive(Debug, Clone, Copy)]
enum Refused {
    Full,
    Closed,
}

impl From<Refused> for PublishError {
    fn from(refused: Refused) -> Self {
        match refused {
            Refused::Full => PublishError::QueueFull,
            Refused::Closed => PublishError::ConnectionLost,
        }
    }
}

impl From<Refused> for SubscribeError {
    fn from(refused: Refused) -> Self {
        match refused {
            Refused::Full => SubscribeError::QueueFull,
            Refused::Closed => SubscribeError::ConnectionLost,
        }
    }
}

/// How the session loop ended
#[derive(Debug)]
enum Exit {
    Local,
    Peer(ConnectionError),
}

impl Session {
    pub(crate) fn new(
        transport: TransportSession,
        state: Arc<watch::Sender<ConnectionState>>,
        errors: ErrorSink,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            requests: transport.requests,
            notifications: transport.notifications,
            state,
            errors,
            pending: HashMap::new(),
            subscriptions: HashMap::new(),
            durables: HashMap::new(),
            shutdown,
            stopping: false,
        }
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let exit = loop {
            if self.stopping {
                break Exit::Local;
            }
            let paused = self.held_saturated();

            tokio::select! {
                biased;

                _ = self.shutdown.changed() => break Exit::Local,

                notification = self.notifications.recv(), if !paused => match notification {
                    Some(Notification::Closed { code, reason }) => {
                        break Exit::Peer(ConnectionError::new(code, reason));
                    }
                    Some(notification) => self.handle_notification(notification).await,
                    None => {
                        break Exit::Peer(ConnectionError::new(
                            codes::ABNORMAL_CLOSE,
                            "transport ended",
                        ));
                    }
                },

                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break Exit::Local,
                },
            }
        };

        self.finish(exit, commands);
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Publish {
                seq,
                message,
                completions,
            } => {
                let request = Request::Publish {
                    seq,
                    message: message.clone(),
                };
                self.pending.insert(
                    seq,
                    PendingPublish {
                        message,
                        completions,
                    },
                );
                if let Err(refused) = self.forward(request) {
                    self.complete(seq, Err(refused.into()));
                }
            }
            Command::Subscribe {
                id,
                text,
                matcher,
                durable,
                messages,
                acks,
            } => {
                let subscription = ActiveSubscription {
                    text,
                    matcher,
                    durable,
                    messages,
                    acks,
                    acknowledged: false,
                    unsubscribed: false,
                    held: VecDeque::new(),
                };

                if let Some(name) = &subscription.durable {
                    if self.durable_conflicts(name, &subscription.matcher) {
                        warn!(id, durable = %name, "Durable name already bound to another matcher");
                        let conflict = SubscribeError::DurableConflict {
                            durable: name.clone(),
                        };
                        subscription
                            .acks
                            .post_detached(subscription.outcome(id, Err(conflict)));
                        return;
                    }
                }

                let request = Request::Subscribe {
                    id,
                    matcher: subscription.matcher.to_string(),
                    durable: subscription.durable.clone(),
                };
                match self.forward(request) {
                    Ok(()) => {
                        self.subscriptions.insert(id, subscription);
                    }
                    Err(refused) => {
                        subscription
                            .acks
                            .post_detached(subscription.outcome(id, Err(refused.into())));
                    }
                }
            }
            Command::Unsubscribe { id } => {
                let Some(subscription) = self.subscriptions.get_mut(&id) else {
                    debug!(id, "Unsubscribe for unknown subscription");
                    return;
                };
                if subscription.acknowledged {
                    self.subscriptions.remove(&id);
                } else {
                    // The acknowledgment is still owed to the caller
                    subscription.unsubscribed = true;
                    subscription.held.clear();
                }
                if self.forward(Request::Unsubscribe { id }).is_err() {
                    debug!(id, "Unsubscribe not forwarded");
                }
            }
        }
    }

    /// An unacknowledged `Block` subscription cannot hold more early deliveries
    ///
    /// Notifications stay unread until its acknowledgment frees the backlog, so the
    /// transport queue absorbs the pressure.
    fn held_saturated(&self) -> bool {
        self.subscriptions
            .values()
            .any(|s| s.messages.policy() == Backpressure::Block && s.holding_full())
    }

    /// A durable name conflicts when it is bound, or being bound, to a different matcher
    fn durable_conflicts(&self, name: &str, matcher: &Matcher) -> bool {
        let registered = self.durables.get(name).is_some_and(|m| m != matcher);
        let in_flight = self
            .subscriptions
            .values()
            .any(|s| s.durable.as_deref() == Some(name) && &s.matcher != matcher);
        registered || in_flight
    }

    fn forward(&self, request: Request) -> Result<(), Refused> {
        self.requests.try_send(request).map_err(|e| match e {
            TrySendError::Full(_) => Refused::Full,
            TrySendError::Closed(_) => Refused::Closed,
        })
    }

    async fn handle_notification(&mut self, notification: Notification) {
        match notification {
            Notification::PublishAck { seq } => self.complete_blocking(seq, Ok(())).await,
            Notification::PublishFailed { seq, code, reason } => {
                let error = if code == codes::BAD_REQUEST {
                    PublishError::Malformed(reason)
                } else {
                    PublishError::rejected(code, reason)
                };
                self.complete_blocking(seq, Err(error)).await;
            }
            Notification::Subscribed { id } => self.acknowledge(id).await,
            Notification::SubscriptionFailed { id, code, reason } => {
                let Some(subscription) = self.subscriptions.remove(&id) else {
                    debug!(id, "Rejection for unknown subscription");
                    return;
                };
                let error = match (code, &subscription.durable) {
                    (codes::CONFLICT, Some(durable)) => SubscribeError::DurableConflict {
                        durable: durable.clone(),
                    },
                    (codes::BAD_REQUEST, _) => SubscribeError::InvalidMatcher(reason),
                    _ => SubscribeError::rejected(code, reason),
                };
                warn!(id, error = %error, "Subscription rejected");
                let outcome = subscription.outcome(id, Err(error));
                if let Some(outcome) = subscription
                    .acks
                    .post_unless(outcome, stop_requested(&mut self.shutdown))
                    .await
                {
                    subscription.acks.post_detached(outcome);
                    self.stopping = true;
                }
            }
            Notification::Delivery { id, message } => {
                let Some(subscription) = self.subscriptions.get_mut(&id) else {
                    debug!(id, "Delivery for unknown subscription");
                    return;
                };
                if subscription.unsubscribed {
                    return;
                }
                if subscription.acknowledged {
                    let undelivered = subscription
                        .messages
                        .post_unless(message, stop_requested(&mut self.shutdown))
                        .await;
                    if undelivered.is_some() {
                        self.stopping = true;
                    }
                } else if subscription.holding_full() {
                    warn!(
                        id,
                        held = subscription.held.len(),
                        "Dropping delivery that arrived before the acknowledgment"
                    );
                } else {
                    subscription.held.push_back(message);
                }
            }
            // Handled by the run loop
            Notification::Closed { .. } => {}
        }
    }

    async fn acknowledge(&mut self, id: SubscriptionId) {
        let Some(subscription) = self.subscriptions.get_mut(&id) else {
            debug!(id, "Acknowledgment for unknown subscription");
            return;
        };
        subscription.acknowledged = true;
        info!(id, matcher = %subscription.matcher, durable = ?subscription.durable, "Subscribed");
        if let Some(name) = subscription.durable.clone() {
            self.durables.insert(name, subscription.matcher.clone());
        }

        let ack = subscription.outcome(id, Ok(()));
        if let Some(ack) = subscription
            .acks
            .post_unless(ack, stop_requested(&mut self.shutdown))
            .await
        {
            subscription.acks.post_detached(ack);
            subscription.held.clear();
            self.stopping = true;
        }

        // Early deliveries go out only after the acknowledgment has been posted
        while let Some(message) = subscription.held.pop_front() {
            let undelivered = subscription
                .messages
                .post_unless(message, stop_requested(&mut self.shutdown))
                .await;
            if undelivered.is_some() {
                subscription.held.clear();
                self.stopping = true;
            }
        }

        if subscription.unsubscribed {
            self.subscriptions.remove(&id);
        }
    }

    async fn complete_blocking(&mut self, seq: u64, result: Result<(), PublishError>) {
        let Some(pending) = self.pending.remove(&seq) else {
            debug!(seq, "Outcome for unknown publish");
            return;
        };
        if let Err(error) = &result {
            debug!(seq, error = %error, "Publish failed");
        }
        let completion = Completion {
            sequence: seq,
            message: pending.message,
            result,
        };
        if let Some(completion) = pending
            .completions
            .post_unless(completion, stop_requested(&mut self.shutdown))
            .await
        {
            pending.completions.post_detached(completion);
            self.stopping = true;
        }
    }

    fn complete(&mut self, seq: u64, result: Result<(), PublishError>) {
        if let Some(pending) = self.pending.remove(&seq) {
            pending.completions.post_detached(Completion {
                sequence: seq,
                message: pending.message,
                result,
            });
        }
    }

    /// Settle every outstanding operation and record how the session ended
    fn finish(mut self, exit: Exit, mut commands: mpsc::Receiver<Command>) {
        // Commands queued after the loop stopped still owe an outcome
        commands.close();
        while let Ok(command) = commands.try_recv() {
            match command {
                Command::Publish {
                    seq,
                    message,
                    completions,
                } => completions.post_detached(Completion {
                    sequence: seq,
                    message,
                    result: Err(PublishError::ConnectionLost),
                }),
                Command::Subscribe {
                    id,
                    text,
                    durable,
                    acks,
                    ..
                } => acks.post_detached(Subscription {
                    id,
                    matcher: text,
                    durable,
                    result: Err(SubscribeError::ConnectionLost),
                }),
                Command::Unsubscribe { .. } => {}
            }
        }

        let lost = self.pending.len();
        for (seq, pending) in self.pending.drain() {
            pending.completions.post_detached(Completion {
                sequence: seq,
                message: pending.message,
                result: Err(PublishError::ConnectionLost),
            });
        }
        for (id, subscription) in self.subscriptions.drain() {
            if !subscription.acknowledged {
                subscription
                    .acks
                    .post_detached(subscription.outcome(id, Err(SubscribeError::ConnectionLost)));
            }
        }

        match exit {
            Exit::Local => {
                if let Err(TrySendError::Full(_)) = self.requests.try_send(Request::Disconnect) {
                    debug!("Outbound queue full, dropping transport without farewell");
                }
                self.state
                    .send_modify(|s| *s = next_state(*s, StateEvent::LocalDisconnect));
                info!(unacknowledged = lost, "Session closed locally");
            }
            Exit::Peer(error) => {
                warn!(code = error.code, reason = %error.reason, unacknowledged = lost, "Session closed by peer");
                self.state
                    .send_modify(|s| *s = next_state(*s, StateEvent::PeerClosed));
                self.errors.post_detached(error);
            }
        }
    }
}

/// Resolves once shutdown is requested or the `Connection` is gone
async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::sink;
    use std::time::Duration;

    struct Harness {
        session: Session,
        notifications: mpsc::Sender<Notification>,
        _requests: mpsc::Receiver<Request>,
        shutdown: watch::Sender<bool>,
    }

    fn harness() -> Harness {
        let (request_tx, request_rx) = mpsc::channel(16);
        let (notification_tx, notification_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (errors, _) = sink(1, Backpressure::Block);
        let transport = TransportSession {
            client_id: "session-test".to_string(),
            requests: request_tx,
            notifications: notification_rx,
        };
        let state = Arc::new(watch::Sender::new(ConnectionState::Connected));
        Harness {
            session: Session::new(transport, state, errors, shutdown_rx),
            notifications: notification_tx,
            _requests: request_rx,
            shutdown: shutdown_tx,
        }
    }

    fn subscribe(id: u64, messages: &MessageSink, acks: &SubscriptionSink) -> Command {
        Command::Subscribe {
            id,
            text: r#"{"_dest":"x"}"#.to_string(),
            matcher: Matcher::destination("x"),
            durable: None,
            messages: messages.clone(),
            acks: acks.clone(),
        }
    }

    fn delivery(id: u64, n: i64) -> Notification {
        Notification::Delivery {
            id,
            message: Message::builder().destination("x").long("n", n).build(),
        }
    }

    #[tokio::test]
    async fn test_early_deliveries_capped_under_drop_policy() {
        let mut h = harness();
        let (messages, mut message_rx) = sink::<Message>(2, Backpressure::DropNewest);
        let (acks, mut ack_rx) = sink::<Subscription>(1, Backpressure::DropNewest);
        h.session.handle_command(subscribe(1, &messages, &acks));

        for n in 0..5 {
            h.session.handle_notification(delivery(1, n)).await;
        }
        assert_eq!(h.session.subscriptions[&1].held.len(), 2);
        assert!(!h.session.held_saturated());

        h.session.handle_notification(Notification::Subscribed { id: 1 }).await;
        assert!(ack_rx.try_recv().unwrap().is_ok());
        assert_eq!(message_rx.try_recv().unwrap().get_long("n"), Some(0));
        assert_eq!(message_rx.try_recv().unwrap().get_long("n"), Some(1));
        assert!(message_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_hold_under_block_policy_pauses_notifications() {
        let mut h = harness();
        let (messages, mut message_rx) = sink::<Message>(2, Backpressure::Block);
        let (acks, mut ack_rx) = sink::<Subscription>(1, Backpressure::Block);
        h.session.handle_command(subscribe(1, &messages, &acks));

        h.session.handle_notification(delivery(1, 0)).await;
        assert!(!h.session.held_saturated());
        h.session.handle_notification(delivery(1, 1)).await;
        assert!(h.session.held_saturated());

        h.session.handle_notification(Notification::Subscribed { id: 1 }).await;
        assert!(!h.session.held_saturated());
        assert!(ack_rx.try_recv().unwrap().is_ok());
        assert_eq!(message_rx.try_recv().unwrap().get_long("n"), Some(0));
        assert_eq!(message_rx.try_recv().unwrap().get_long("n"), Some(1));
    }

    #[tokio::test]
    async fn test_unsubscribe_releases_paused_hold() {
        let mut h = harness();
        let (messages, _message_rx) = sink::<Message>(1, Backpressure::Block);
        let (acks, _ack_rx) = sink::<Subscription>(1, Backpressure::Block);
        h.session.handle_command(subscribe(1, &messages, &acks));

        h.session.handle_notification(delivery(1, 0)).await;
        assert!(h.session.held_saturated());

        h.session.handle_command(Command::Unsubscribe { id: 1 });
        assert!(!h.session.held_saturated());
    }

    #[tokio::test]
    async fn test_shutdown_settles_subscription_stalled_behind_full_hold() {
        let h = harness();
        let (messages, _message_rx) = sink::<Message>(1, Backpressure::Block);
        let (acks, mut ack_rx) = sink::<Subscription>(1, Backpressure::Block);
        let (command_tx, command_rx) = mpsc::channel(4);
        command_tx.send(subscribe(1, &messages, &acks)).await.unwrap();

        let task = tokio::spawn(h.session.run(command_rx));
        tokio::time::sleep(Duration::from_millis(10)).await;
        for notification in [delivery(1, 0), delivery(1, 1), Notification::Subscribed { id: 1 }] {
            h.notifications.send(notification).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(ack_rx.try_recv().is_err());

        h.shutdown.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("session must finish after shutdown")
            .unwrap();

        let ack = ack_rx.recv().await.unwrap();
        assert_eq!(ack.result, Err(SubscribeError::ConnectionLost));
        assert!(ack_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_blocked_completion() {
        let mut h = harness();
        let (completions, mut completion_rx) = sink::<Completion>(1, Backpressure::Block);
        for seq in 1..=3 {
            h.session.handle_command(Command::Publish {
                seq,
                message: Message::builder().destination("x").build(),
                completions: completions.clone(),
            });
        }

        h.session.handle_notification(Notification::PublishAck { seq: 1 }).await;
        assert!(!h.session.stopping);

        h.shutdown.send(true).unwrap();
        h.session.handle_notification(Notification::PublishAck { seq: 2 }).await;
        assert!(h.session.stopping);

        let (_commands, command_rx) = mpsc::channel(1);
        h.session.finish(Exit::Local, command_rx);

        let mut outcomes = Vec::new();
        for _ in 0..3 {
            let completion = completion_rx.recv().await.unwrap();
            outcomes.push((completion.sequence, completion.result));
        }
        outcomes.sort_by_key(|(seq, _)| *seq);
        assert_eq!(
            outcomes,
            vec![
                (1, Ok(())),
                (2, Ok(())),
                (3, Err(PublishError::ConnectionLost)),
            ]
        );
        assert!(completion_rx.try_recv().is_err());
    }
}
