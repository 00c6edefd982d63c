//! Event multiplexer
//!
//! A single cooperative loop waiting on every asynchronous source an application
//! cares about: a periodic ticker, the completion, subscription, message and
//! connection-error sinks, and a shutdown signal. Each iteration takes exactly one
//! ready event and hands it to an [`EventHandler`].
//!
//! ```text
//!            ┌──────────── event ─────────────┐
//!            ▼                                │
//!       [ Running ] ── shutdown / connection error / abort ──► [ Terminated ]
//! ```
//!
//! When several sources are ready at once they are serviced in a fixed order:
//! shutdown, connection error, subscription, completion, tick, message. Serving
//! subscriptions ahead of messages keeps each acknowledgment ahead of the messages
//! delivered against it. A source whose channel closes is dropped from the wait set;
//! once every source is gone the loop shuts down.

use crate::connection::{Completion, Subscription};
use crate::error::{ConnectionError, PublishError, SubscribeError};
use crate::message::Message;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::pending;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, warn};

/// One unit of work for the handler
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Tick(Instant),
    Completion(Completion),
    Subscription(Subscription),
    Message(Message),
    ConnectionError(ConnectionError),
    Shutdown,
}

/// Source an [`Event`] came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Tick,
    Completion,
    Subscription,
    Message,
    ConnectionError,
    Shutdown,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Tick(_) => EventKind::Tick,
            Event::Completion(_) => EventKind::Completion,
            Event::Subscription(_) => EventKind::Subscription,
            Event::Message(_) => EventKind::Message,
            Event::ConnectionError(_) => EventKind::ConnectionError,
            Event::Shutdown => EventKind::Shutdown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    Terminated,
}

/// What to do with a completion or subscription carrying an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    #[default]
    Terminate,
    LogAndContinue,
}

/// Handler verdict after processing an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Abort,
}

/// Why the loop stopped
#[derive(Debug, Clone, PartialEq)]
pub enum Termination {
    Shutdown,
    ConnectionError(ConnectionError),
    /// A handler returned [`Flow::Abort`] while processing this kind of event
    Aborted(EventKind),
    PublishFailed(PublishError),
    SubscribeFailed(SubscribeError),
}

impl Termination {
    /// True when the loop stopped because shutdown was requested
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Termination::Shutdown)
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Shutdown => write!(f, "shutdown requested"),
            Termination::ConnectionError(e) => write!(f, "connection error: {e}"),
            Termination::Aborted(kind) => write!(f, "handler aborted on {kind:?} event"),
            Termination::PublishFailed(e) => write!(f, "publish operation failed: {e}"),
            Termination::SubscribeFailed(e) => write!(f, "subscribe operation failed: {e}"),
        }
    }
}

/// Application callbacks, one per event source
///
/// Callbacks run on the loop itself and must not block; a slow callback delays
/// every other source. Every callback defaults to doing nothing.
pub trait EventHandler {
    fn on_tick(&mut self, _at: Instant) -> Flow {
        Flow::Continue
    }

    fn on_completion(&mut self, _completion: Completion) -> Flow {
        Flow::Continue
    }

    fn on_subscription(&mut self, _subscription: Subscription) -> Flow {
        Flow::Continue
    }

    fn on_message(&mut self, _message: Message) -> Flow {
        Flow::Continue
    }

    /// Called once before the loop terminates on a connection error
    fn on_connection_error(&mut self, _error: &ConnectionError) {}
}

/// The multiplexing loop
///
/// Sources are registered with the `with_*` builders; unregistered sources are
/// never waited on.
#[derive(Debug)]
pub struct EventLoop {
    ticker: Option<Interval>,
    completions: Option<mpsc::Receiver<Completion>>,
    subscriptions: Option<mpsc::Receiver<Subscription>>,
    messages: Option<mpsc::Receiver<Message>>,
    errors: Option<mpsc::Receiver<ConnectionError>>,
    shutdown: Option<watch::Receiver<bool>>,
    policy: ErrorPolicy,
    state: LoopState,
    termination: Option<Termination>,
    dispatched: u64,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    pub fn new() -> Self {
        Self {
            ticker: None,
            completions: None,
            subscriptions: None,
            messages: None,
            errors: None,
            shutdown: None,
            policy: ErrorPolicy::default(),
            state: LoopState::Running,
            termination: None,
            dispatched: 0,
        }
    }

    /// Tick every `period`, first tick one period from now
    pub fn with_ticker(mut self, period: Duration) -> Self {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.ticker = Some(ticker);
        self
    }

    pub fn with_completions(mut self, completions: mpsc::Receiver<Completion>) -> Self {
        self.completions = Some(completions);
        self
    }

    pub fn with_subscriptions(mut self, subscriptions: mpsc::Receiver<Subscription>) -> Self {
        self.subscriptions = Some(subscriptions);
        self
    }

    pub fn with_messages(mut self, messages: mpsc::Receiver<Message>) -> Self {
        self.messages = Some(messages);
        self
    }

    pub fn with_errors(mut self, errors: mpsc::Receiver<ConnectionError>) -> Self {
        self.errors = Some(errors);
        self
    }

    /// Terminate once `shutdown` reads true or its sender is dropped
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Number of events processed by [`run`](Self::run), including the final one
    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    pub fn termination(&self) -> Option<&Termination> {
        self.termination.as_ref()
    }

    fn has_sources(&self) -> bool {
        self.ticker.is_some()
            || self.completions.is_some()
            || self.subscriptions.is_some()
            || self.messages.is_some()
            || self.errors.is_some()
    }

    fn terminate(&mut self, reason: Termination) -> Termination {
        if self.state == LoopState::Running {
            debug!(?reason, dispatched = self.dispatched, "Event loop terminated");
        }
        self.state = LoopState::Terminated;
        self.termination = Some(reason.clone());
        reason
    }

    /// Wait for the next event
    ///
    /// Returns `None` once the loop is terminated. Yielding `Shutdown` or
    /// `ConnectionError` terminates the loop.
    pub async fn next_event(&mut self) -> Option<Event> {
        if self.state == LoopState::Terminated {
            return None;
        }

        let event = loop {
            if !self.has_sources() {
                debug!("All event sources closed");
                break Event::Shutdown;
            }

            tokio::select! {
                biased;

                _ = shutdown_requested(&mut self.shutdown) => break Event::Shutdown,

                error = recv_opt(&mut self.errors) => match error {
                    Some(error) => break Event::ConnectionError(error),
                    None => self.errors = None,
                },

                subscription = recv_opt(&mut self.subscriptions) => match subscription {
                    Some(subscription) => break Event::Subscription(subscription),
                    None => self.subscriptions = None,
                },

                completion = recv_opt(&mut self.completions) => match completion {
                    Some(completion) => break Event::Completion(completion),
                    None => self.completions = None,
                },

                at = tick_opt(&mut self.ticker) => break Event::Tick(at),

                message = recv_opt(&mut self.messages) => match message {
                    Some(message) => break Event::Message(message),
                    None => self.messages = None,
                },
            }
        };

        match &event {
            Event::Shutdown => {
                self.terminate(Termination::Shutdown);
            }
            Event::ConnectionError(e) => {
                self.terminate(Termination::ConnectionError(e.clone()));
            }
            _ => {}
        }
        Some(event)
    }

    /// Dispatch events to `handler` until the loop terminates
    pub async fn run<H: EventHandler + ?Sized>(&mut self, handler: &mut H) -> Termination {
        while let Some(event) = self.next_event().await {
            self.dispatched += 1;
            if let Some(reason) = self.dispatch(event, handler) {
                return self.terminate(reason);
            }
        }
        self.termination.clone().unwrap_or(Termination::Shutdown)
    }

    fn dispatch<H: EventHandler + ?Sized>(
        &self,
        event: Event,
        handler: &mut H,
    ) -> Option<Termination> {
        let kind = event.kind();
        let aborted = |flow: Flow| (flow == Flow::Abort).then_some(Termination::Aborted(kind));

        match event {
            Event::Tick(at) => aborted(handler.on_tick(at)),
            Event::Completion(completion) => {
                let failure = completion.result.clone().err();
                if let Some(e) = &failure {
                    warn!(seq = completion.sequence, error = %e, "Publish failed");
                }
                aborted(handler.on_completion(completion)).or_else(|| {
                    failure
                        .filter(|_| self.policy == ErrorPolicy::Terminate)
                        .map(Termination::PublishFailed)
                })
            }
            Event::Subscription(subscription) => {
                let failure = subscription.result.clone().err();
                if let Some(e) = &failure {
                    warn!(id = subscription.id, error = %e, "Subscribe failed");
                }
                aborted(handler.on_subscription(subscription)).or_else(|| {
                    failure
                        .filter(|_| self.policy == ErrorPolicy::Terminate)
                        .map(Termination::SubscribeFailed)
                })
            }
            Event::Message(message) => aborted(handler.on_message(message)),
            Event::ConnectionError(e) => {
                error!(code = e.code, reason = %e.reason, "Connection error");
                handler.on_connection_error(&e);
                Some(Termination::ConnectionError(e))
            }
            Event::Shutdown => Some(Termination::Shutdown),
        }
    }
}

async fn recv_opt<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

async fn tick_opt(ticker: &mut Option<Interval>) -> Instant {
    match ticker {
        Some(ticker) => ticker.tick().await,
        None => pending().await,
    }
}

async fn shutdown_requested(shutdown: &mut Option<watch::Receiver<bool>>) {
    let Some(rx) = shutdown else {
        return pending().await;
    };
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        ticks: usize,
        messages: Vec<Message>,
        abort_on_tick: Option<usize>,
        connection_errors: usize,
    }

    impl EventHandler for Recorder {
        fn on_tick(&mut self, _at: Instant) -> Flow {
            self.ticks += 1;
            match self.abort_on_tick {
                Some(n) if n == self.ticks => Flow::Abort,
                _ => Flow::Continue,
            }
        }

        fn on_message(&mut self, message: Message) -> Flow {
            self.messages.push(message);
            Flow::Continue
        }

        fn on_connection_error(&mut self, _error: &ConnectionError) {
            self.connection_errors += 1;
        }
    }

    fn failed_completion() -> Completion {
        Completion {
            sequence: 1,
            message: Message::default(),
            result: Err(PublishError::ConnectionLost),
        }
    }

    #[tokio::test]
    async fn test_connection_error_terminates() {
        let (tx, rx) = mpsc::channel(1);
        let mut event_loop = EventLoop::new().with_errors(rx);
        tx.send(ConnectionError::new(1006, "gone")).await.unwrap();

        let mut handler = Recorder::default();
        let termination = event_loop.run(&mut handler).await;

        assert_eq!(
            termination,
            Termination::ConnectionError(ConnectionError::new(1006, "gone"))
        );
        assert_eq!(handler.connection_errors, 1);
        assert_eq!(event_loop.state(), LoopState::Terminated);
        assert!(event_loop.next_event().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_abort_terminates() {
        let mut event_loop = EventLoop::new().with_ticker(Duration::from_secs(1));
        let mut handler = Recorder {
            abort_on_tick: Some(2),
            ..Default::default()
        };

        let termination = event_loop.run(&mut handler).await;
        assert_eq!(termination, Termination::Aborted(EventKind::Tick));
        assert_eq!(handler.ticks, 2);
        assert_eq!(event_loop.dispatched(), 2);
    }

    #[tokio::test]
    async fn test_error_policy_terminate() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(failed_completion()).await.unwrap();
        let mut event_loop = EventLoop::new().with_completions(rx);

        let termination = event_loop.run(&mut Recorder::default()).await;
        assert_eq!(
            termination,
            Termination::PublishFailed(PublishError::ConnectionLost)
        );
    }

    #[tokio::test]
    async fn test_error_policy_log_and_continue() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(failed_completion()).await.unwrap();
        tx.send(failed_completion()).await.unwrap();
        drop(tx);
        let mut event_loop = EventLoop::new()
            .with_completions(rx)
            .with_error_policy(ErrorPolicy::LogAndContinue);

        // Both failures are dispatched, then the closed source ends the loop
        let termination = event_loop.run(&mut Recorder::default()).await;
        assert_eq!(termination, Termination::Shutdown);
        assert_eq!(event_loop.dispatched(), 3);
    }

    #[tokio::test]
    async fn test_shutdown_signal() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (_message_tx, message_rx) = mpsc::channel::<Message>(1);
        let mut event_loop = EventLoop::new()
            .with_messages(message_rx)
            .with_shutdown(shutdown_rx);

        shutdown_tx.send(true).unwrap();
        assert_eq!(event_loop.next_event().await, Some(Event::Shutdown));
        assert_eq!(event_loop.state(), LoopState::Terminated);
    }

    #[tokio::test]
    async fn test_dropped_shutdown_sender_counts_as_shutdown() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (_message_tx, message_rx) = mpsc::channel::<Message>(1);
        let mut event_loop = EventLoop::new()
            .with_messages(message_rx)
            .with_shutdown(shutdown_rx);

        drop(shutdown_tx);
        assert_eq!(event_loop.run(&mut Recorder::default()).await, Termination::Shutdown);
    }

    #[tokio::test]
    async fn test_subscription_served_before_message() {
        let (sub_tx, sub_rx) = mpsc::channel(1);
        let (msg_tx, msg_rx) = mpsc::channel(1);
        // Both ready before the loop looks at either
        msg_tx.send(Message::default()).await.unwrap();
        sub_tx
            .send(Subscription {
                id: 1,
                matcher: "{}".to_string(),
                durable: None,
                result: Ok(()),
            })
            .await
            .unwrap();

        let mut event_loop = EventLoop::new()
            .with_subscriptions(sub_rx)
            .with_messages(msg_rx);
        let first = event_loop.next_event().await.unwrap();
        let second = event_loop.next_event().await.unwrap();
        assert_eq!(first.kind(), EventKind::Subscription);
        assert_eq!(second.kind(), EventKind::Message);
    }

    #[tokio::test]
    async fn test_no_sources_shuts_down() {
        let mut event_loop = EventLoop::new();
        assert_eq!(event_loop.next_event().await, Some(Event::Shutdown));
    }
}
