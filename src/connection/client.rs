//! Connection handle
//!
//! A [`Connection`] is a thin handle over a spawned session task. Publish and
//! subscribe calls validate locally, assign a correlation id and enqueue a command;
//! they never wait for the broker. Outcomes arrive later on the sinks supplied with
//! each call.

use super::outcome::{Completion, Subscription, SubscriptionId};
use super::session::{Command, Session};
use super::state::{next_state, ConnectionState, StateEvent};
use crate::config::ConnectOptions;
use crate::error::{ConnectError, PublishError, SubscribeError};
use crate::matcher::Matcher;
use crate::message::Message;
use crate::sink::{CompletionSink, ErrorSink, MessageSink, SubscriptionSink};
use crate::transport::websocket::WebSocketTransport;
use crate::transport::Transport;
use crate::{publish_span, session_span, subscribe_span};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};
use url::Url;

/// Grace period for the session task to settle outstanding work on disconnect
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// One logical session with a broker
pub struct Connection {
    url: Url,
    client_id: String,
    commands: mpsc::Sender<Command>,
    state: Arc<watch::Sender<ConnectionState>>,
    shutdown: watch::Sender<bool>,
    session: Option<JoinHandle<()>>,
    next_sequence: AtomicU64,
    next_subscription: AtomicU64,
}

impl Connection {
    /// Connect over WebSocket (`ws://` or `wss://`)
    ///
    /// Connection errors raised after this returns are posted to `errors`.
    pub async fn connect(
        url: &str,
        options: ConnectOptions,
        errors: ErrorSink,
    ) -> Result<Self, ConnectError> {
        Self::connect_with(&WebSocketTransport::new(), url, options, errors).await
    }

    /// Connect through an explicit transport
    pub async fn connect_with<T: Transport + ?Sized>(
        transport: &T,
        url: &str,
        options: ConnectOptions,
        errors: ErrorSink,
    ) -> Result<Self, ConnectError> {
        let url = Url::parse(url).map_err(|e| ConnectError::InvalidUrl(format!("{url}: {e}")))?;

        let state = Arc::new(watch::Sender::new(ConnectionState::Disconnected));
        state.send_modify(|s| *s = next_state(*s, StateEvent::ConnectStarted));

        info!(url = %url, client_id = ?options.client_id, "Connecting");
        let session = match tokio::time::timeout(
            options.connect_timeout,
            transport.connect(&url, &options),
        )
        .await
        {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                warn!(error = %e, "Connect failed");
                return Err(e);
            }
            Err(_) => {
                warn!(timeout = ?options.connect_timeout, "Connect timed out");
                return Err(ConnectError::Timeout(options.connect_timeout));
            }
        };

        state.send_modify(|s| *s = next_state(*s, StateEvent::Established));
        let client_id = session.client_id.clone();
        info!(client_id = %client_id, "Connected");

        let (command_tx, command_rx) = mpsc::channel(options.outbound_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = Session::new(session, state.clone(), errors, shutdown_rx)
            .run(command_rx)
            .instrument(session_span!(client_id = %client_id, url = %url));

        Ok(Self {
            url,
            client_id,
            commands: command_tx,
            state,
            shutdown: shutdown_tx,
            session: Some(tokio::spawn(task)),
            next_sequence: AtomicU64::new(1),
            next_subscription: AtomicU64::new(1),
        })
    }

    /// Enqueue `message` for publication
    ///
    /// Never waits for the broker. Exactly one [`Completion`] carrying the returned
    /// sequence number is posted to `completions`.
    pub fn publish_async(&self, message: Message, completions: &CompletionSink) -> u64 {
        let seq = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let _span = publish_span!(seq, destination = ?message.destination()).entered();

        if let Err(e) = message.validate() {
            debug!(error = %e, "Rejecting malformed message");
            completions.post_detached(Completion {
                sequence: seq,
                message,
                result: Err(PublishError::Malformed(e.to_string())),
            });
            return seq;
        }

        let command = Command::Publish {
            seq,
            message,
            completions: completions.clone(),
        };
        if let Err(e) = self.commands.try_send(command) {
            let (error, command) = match e {
                TrySendError::Full(c) => (PublishError::QueueFull, c),
                TrySendError::Closed(c) => (PublishError::ConnectionLost, c),
            };
            if let Command::Publish { message, .. } = command {
                debug!(error = %error, "Publish not enqueued");
                completions.post_detached(Completion {
                    sequence: seq,
                    message,
                    result: Err(error),
                });
            }
        }
        seq
    }

    /// Register interest in messages satisfying `matcher`
    ///
    /// A non-empty `durable` name makes the subscription persistent under that name;
    /// repeating it with an equal matcher resumes it. Exactly one [`Subscription`]
    /// outcome is posted to `acks`, before any message reaches `messages`.
    pub fn subscribe_async(
        &self,
        matcher: &str,
        durable: &str,
        messages: &MessageSink,
        acks: &SubscriptionSink,
    ) -> SubscriptionId {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let durable = (!durable.is_empty()).then(|| durable.to_string());
        let _span = subscribe_span!(id, matcher, durable = ?durable).entered();

        let outcome = |result| Subscription {
            id,
            matcher: matcher.to_string(),
            durable: durable.clone(),
            result,
        };

        let parsed = match Matcher::parse(matcher) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(error = %e, "Rejecting invalid matcher");
                acks.post_detached(outcome(Err(SubscribeError::InvalidMatcher(e.to_string()))));
                return id;
            }
        };

        let command = Command::Subscribe {
            id,
            text: matcher.to_string(),
            matcher: parsed,
            durable: durable.clone(),
            messages: messages.clone(),
            acks: acks.clone(),
        };
        match self.commands.try_send(command) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => acks.post_detached(outcome(Err(SubscribeError::QueueFull))),
            Err(TrySendError::Closed(_)) => {
                acks.post_detached(outcome(Err(SubscribeError::ConnectionLost)))
            }
        }
        id
    }

    /// Stop deliveries for a subscription
    ///
    /// A durable subscription stays registered with the broker under its name.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        if self.commands.try_send(Command::Unsubscribe { id }).is_err() {
            debug!(id, "Unsubscribe not enqueued");
        }
    }

    /// Release the transport and settle all outstanding operations
    ///
    /// Idempotent, and safe after the peer has already closed the session.
    pub async fn disconnect(&mut self) {
        let Some(session) = self.session.take() else {
            debug!("Already disconnected");
            return;
        };

        info!(client_id = %self.client_id, "Disconnecting");
        let _ = self.shutdown.send(true);

        let abort = session.abort_handle();
        match tokio::time::timeout(DISCONNECT_GRACE, session).await {
            Ok(Ok(())) => debug!("Session task finished"),
            Ok(Err(e)) => warn!(error = %e, "Session task failed"),
            Err(_) => {
                warn!("Session task did not finish in time, aborting");
                abort.abort();
            }
        }

        self.state
            .send_modify(|s| *s = next_state(*s, StateEvent::LocalDisconnect));
    }

    /// Client identifier confirmed by the broker
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver observing every state change
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("url", &self.url.as_str())
            .field("client_id", &self.client_id)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.session.is_some() {
            // Session task settles outstanding work on its own
            let _ = self.shutdown.send(true);
        }
    }
}
