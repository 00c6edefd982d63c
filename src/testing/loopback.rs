//! In-process loopback broker
//!
//! [`LoopbackBroker`] implements [`Transport`] without any I/O. Every connection made
//! through one broker value shares the same routing table, so a publisher and a
//! subscriber connected to clones of the same broker see each other's traffic.
//!
//! Beyond plain fan-out it can require credentials, reject publishes to forbidden
//! destinations, fail every publish, and close every session on demand.

use crate::config::ConnectOptions;
use crate::error::ConnectError;
use crate::matcher::Matcher;
use crate::message::Message;
use crate::transport::{codes, Notification, Request, Transport, TransportSession};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;
use url::Url;

/// Capacity of each session's notification queue
const NOTIFICATION_CAPACITY: usize = 1024;

type Outbox = Vec<(mpsc::Sender<Notification>, Notification)>;

#[derive(Debug)]
struct ClientEntry {
    client_id: String,
    notifications: mpsc::Sender<Notification>,
    subscriptions: HashMap<u64, Matcher>,
}

#[derive(Debug)]
struct DurableEntry {
    matcher: Matcher,
    /// Session and subscription currently receiving for this name
    owner: Option<(u64, u64)>,
}

#[derive(Debug, Default)]
struct BrokerState {
    next_session: u64,
    clients: HashMap<u64, ClientEntry>,
    credentials: Option<(String, String)>,
    forbidden: HashSet<String>,
    publish_failure: Option<(u16, String)>,
    durables: HashMap<String, DurableEntry>,
    published: Vec<Message>,
    disconnects: usize,
}

/// Shared in-process broker; clones refer to the same broker
#[derive(Debug, Clone, Default)]
pub struct LoopbackBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl LoopbackBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject logins that do not present exactly these credentials
    pub async fn require_credentials(&self, username: &str, password: &str) {
        self.state.lock().await.credentials = Some((username.to_string(), password.to_string()));
    }

    /// Reject publishes whose `_dest` equals `destination`
    pub async fn forbid_destination(&self, destination: &str) {
        self.state.lock().await.forbidden.insert(destination.to_string());
    }

    /// Fail every subsequent publish with `code`
    pub async fn fail_publishes(&self, code: u16, reason: &str) {
        self.state.lock().await.publish_failure = Some((code, reason.to_string()));
    }

    pub async fn clear_faults(&self) {
        let mut state = self.state.lock().await;
        state.forbidden.clear();
        state.publish_failure = None;
    }

    /// Close every live session as if the broker went away
    pub async fn close_all(&self, code: u16, reason: &str) {
        let clients: Vec<ClientEntry> = {
            let mut state = self.state.lock().await;
            for durable in state.durables.values_mut() {
                durable.owner = None;
            }
            state.clients.drain().map(|(_, client)| client).collect()
        };

        for client in clients {
            debug!(client_id = %client.client_id, code, "Closing loopback session");
            let _ = client
                .notifications
                .send(Notification::Closed {
                    code,
                    reason: reason.to_string(),
                })
                .await;
        }
    }

    /// Every message accepted for routing, in acceptance order
    pub async fn published(&self) -> Vec<Message> {
        self.state.lock().await.published.clone()
    }

    /// Sessions that ended with an explicit disconnect request
    pub async fn disconnect_count(&self) -> usize {
        self.state.lock().await.disconnects
    }

    pub async fn client_count(&self) -> usize {
        self.state.lock().await.clients.len()
    }

    pub async fn durable_names(&self) -> Vec<String> {
        self.state
            .lock()
            .await
            .durables
            .keys()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    async fn serve(self, session: u64, mut requests: mpsc::Receiver<Request>) {
        while let Some(request) = requests.recv().await {
            let disconnect = matches!(request, Request::Disconnect);
            let outbox = {
                let mut state = self.state.lock().await;
                if !state.clients.contains_key(&session) {
                    break;
                }
                state.handle(session, request)
            };
            for (notifications, notification) in outbox {
                let _ = notifications.send(notification).await;
            }
            if disconnect {
                return;
            }
        }

        // Requests channel dropped without a farewell, or session already closed
        let mut state = self.state.lock().await;
        state.remove_client(session);
    }
}

impl BrokerState {
    fn handle(&mut self, session: u64, request: Request) -> Outbox {
        let mut outbox = Outbox::new();
        let Some(own) = self.clients.get(&session).map(|c| c.notifications.clone()) else {
            return outbox;
        };

        match request {
            Request::Publish { seq, message } => {
                if let Some((code, reason)) = self.publish_failure.clone() {
                    outbox.push((own, Notification::PublishFailed { seq, code, reason }));
                    return outbox;
                }
                if let Err(e) = message.validate() {
                    outbox.push((
                        own,
                        Notification::PublishFailed {
                            seq,
                            code: codes::BAD_REQUEST,
                            reason: e.to_string(),
                        },
                    ));
                    return outbox;
                }
                if message
                    .destination()
                    .is_some_and(|d| self.forbidden.contains(d))
                {
                    outbox.push((
                        own,
                        Notification::PublishFailed {
                            seq,
                            code: codes::FORBIDDEN,
                            reason: "destination forbidden".to_string(),
                        },
                    ));
                    return outbox;
                }

                outbox.push((own, Notification::PublishAck { seq }));
                for client in self.clients.values() {
                    for (id, matcher) in &client.subscriptions {
                        if matcher.matches(&message) {
                            outbox.push((
                                client.notifications.clone(),
                                Notification::Delivery {
                                    id: *id,
                                    message: message.clone(),
                                },
                            ));
                        }
                    }
                }
                self.published.push(message);
            }
            Request::Subscribe {
                id,
                matcher,
                durable,
            } => {
                let matcher = match Matcher::parse(&matcher) {
                    Ok(matcher) => matcher,
                    Err(e) => {
                        outbox.push((
                            own,
                            Notification::SubscriptionFailed {
                                id,
                                code: codes::BAD_REQUEST,
                                reason: e.to_string(),
                            },
                        ));
                        return outbox;
                    }
                };

                if let Some(name) = durable {
                    match self.durables.get_mut(&name) {
                        Some(entry) if entry.matcher != matcher => {
                            outbox.push((
                                own,
                                Notification::SubscriptionFailed {
                                    id,
                                    code: codes::CONFLICT,
                                    reason: format!("durable '{name}' bound to {}", entry.matcher),
                                },
                            ));
                            return outbox;
                        }
                        Some(entry) => {
                            // Resumption moves delivery to the newest subscriber
                            if let Some((old_session, old_id)) = entry.owner.replace((session, id)) {
                                if let Some(client) = self.clients.get_mut(&old_session) {
                                    client.subscriptions.remove(&old_id);
                                }
                            }
                        }
                        None => {
                            self.durables.insert(
                                name,
                                DurableEntry {
                                    matcher: matcher.clone(),
                                    owner: Some((session, id)),
                                },
                            );
                        }
                    }
                }

                if let Some(client) = self.clients.get_mut(&session) {
                    client.subscriptions.insert(id, matcher);
                }
                outbox.push((own, Notification::Subscribed { id }));
            }
            Request::Unsubscribe { id } => {
                if let Some(client) = self.clients.get_mut(&session) {
                    client.subscriptions.remove(&id);
                }
                for entry in self.durables.values_mut() {
                    if entry.owner == Some((session, id)) {
                        entry.owner = None;
                    }
                }
            }
            Request::Disconnect => {
                self.remove_client(session);
                self.disconnects += 1;
            }
        }
        outbox
    }

    fn remove_client(&mut self, session: u64) {
        if let Some(client) = self.clients.remove(&session) {
            debug!(client_id = %client.client_id, "Loopback session ended");
        }
        for entry in self.durables.values_mut() {
            if entry.owner.is_some_and(|(s, _)| s == session) {
                entry.owner = None;
            }
        }
    }
}

#[async_trait]
impl Transport for LoopbackBroker {
    async fn connect(
        &self,
        _url: &Url,
        options: &ConnectOptions,
    ) -> Result<TransportSession, ConnectError> {
        let (request_tx, request_rx) = mpsc::channel(options.outbound_capacity.max(1));
        let (notification_tx, notification_rx) = mpsc::channel(NOTIFICATION_CAPACITY);

        let (session, client_id) = {
            let mut state = self.state.lock().await;
            if let Some((user, password)) = &state.credentials {
                let presented = (options.username.as_deref(), options.password.as_deref());
                if presented != (Some(user.as_str()), Some(password.as_str())) {
                    return Err(ConnectError::authentication("invalid username or password"));
                }
            }

            state.next_session += 1;
            let session = state.next_session;
            let client_id = options
                .client_id
                .clone()
                .unwrap_or_else(|| format!("loopback-{session}"));
            state.clients.insert(
                session,
                ClientEntry {
                    client_id: client_id.clone(),
                    notifications: notification_tx,
                    subscriptions: HashMap::new(),
                },
            );
            (session, client_id)
        };

        tokio::spawn(self.clone().serve(session, request_rx));

        Ok(TransportSession {
            client_id,
            requests: request_tx,
            notifications: notification_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url() -> Url {
        Url::parse("loopback://broker").unwrap()
    }

    #[tokio::test]
    async fn test_assigns_client_id() {
        let broker = LoopbackBroker::new();
        let session = broker.connect(&url(), &ConnectOptions::default()).await.unwrap();
        assert_eq!(session.client_id, "loopback-1");

        let named = broker
            .connect(&url(), &ConnectOptions::default().with_client_id("orders"))
            .await
            .unwrap();
        assert_eq!(named.client_id, "orders");
        assert_eq!(broker.client_count().await, 2);
    }

    #[tokio::test]
    async fn test_rejects_bad_credentials() {
        let broker = LoopbackBroker::new();
        broker.require_credentials("alice", "secret").await;

        let result = broker
            .connect(&url(), &ConnectOptions::default().with_credentials("alice", "wrong"))
            .await;
        assert!(matches!(result, Err(ConnectError::Authentication(_))));

        let result = broker
            .connect(&url(), &ConnectOptions::default().with_credentials("alice", "secret"))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_publish_fans_out_to_matching_subscription() {
        let broker = LoopbackBroker::new();
        let mut session = broker.connect(&url(), &ConnectOptions::default()).await.unwrap();

        session
            .requests
            .send(Request::Subscribe {
                id: 1,
                matcher: r#"{"_dest":"sample"}"#.to_string(),
                durable: None,
            })
            .await
            .unwrap();
        assert_eq!(
            session.notifications.recv().await,
            Some(Notification::Subscribed { id: 1 })
        );

        let message = Message::builder().destination("sample").long("now", 1).build();
        session
            .requests
            .send(Request::Publish {
                seq: 1,
                message: message.clone(),
            })
            .await
            .unwrap();
        assert_eq!(
            session.notifications.recv().await,
            Some(Notification::PublishAck { seq: 1 })
        );
        assert_eq!(
            session.notifications.recv().await,
            Some(Notification::Delivery { id: 1, message })
        );
    }

    #[tokio::test]
    async fn test_durable_conflict_returns_409() {
        let broker = LoopbackBroker::new();
        let mut session = broker.connect(&url(), &ConnectOptions::default()).await.unwrap();

        for (id, matcher) in [(1, r#"{"_dest":"a"}"#), (2, r#"{"_dest":"b"}"#)] {
            session
                .requests
                .send(Request::Subscribe {
                    id,
                    matcher: matcher.to_string(),
                    durable: Some("orders".to_string()),
                })
                .await
                .unwrap();
        }

        assert_eq!(
            session.notifications.recv().await,
            Some(Notification::Subscribed { id: 1 })
        );
        assert!(matches!(
            session.notifications.recv().await,
            Some(Notification::SubscriptionFailed { id: 2, code: codes::CONFLICT, .. })
        ));
        assert_eq!(broker.durable_names().await, vec!["orders".to_string()]);
    }

    #[tokio::test]
    async fn test_close_all_notifies_sessions() {
        let broker = LoopbackBroker::new();
        let mut session = broker.connect(&url(), &ConnectOptions::default()).await.unwrap();

        broker.close_all(codes::GOING_AWAY, "maintenance").await;
        assert_eq!(
            session.notifications.recv().await,
            Some(Notification::Closed {
                code: codes::GOING_AWAY,
                reason: "maintenance".to_string()
            })
        );
        assert_eq!(broker.client_count().await, 0);
    }
}
