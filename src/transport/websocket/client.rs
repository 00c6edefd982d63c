//! WebSocket client transport
//!
//! `connect` opens the socket (through rustls for `wss://`), sends the login frame and
//! waits for the broker's welcome. After that a single pump task owns both halves of
//! the socket: it encodes [`Request`]s into frames and decodes frames into
//! [`Notification`]s until either side closes.

use super::protocol::{ClientFrame, ServerFrame, PROTOCOL_VERSION};
use crate::config::ConnectOptions;
use crate::error::ConnectError;
use crate::transport::{codes, Notification, Request, Transport, TransportSession};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;
type WsSource = SplitStream<WsStream>;

/// Transport speaking the JSON frame protocol over `ws://` or `wss://`
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(
        &self,
        url: &Url,
        options: &ConnectOptions,
    ) -> Result<TransportSession, ConnectError> {
        let connector = match url.scheme() {
            "ws" => None,
            "wss" => Some(Connector::Rustls(Arc::new(options.tls.client_config()?))),
            other => return Err(ConnectError::UnsupportedScheme(other.to_string())),
        };

        debug!(url = %url, tls = connector.is_some(), "Opening WebSocket");
        let (socket, _response) =
            connect_async_tls_with_config(url.as_str(), None, false, connector)
                .await
                .map_err(classify_ws_error)?;

        let (mut sink, mut source) = socket.split();

        let login = ClientFrame::Login {
            client_id: options.client_id.clone(),
            user: options.username.clone(),
            password: options.password.clone(),
            protocol: PROTOCOL_VERSION,
        }
        .encode()
        .map_err(|e| ConnectError::handshake(e.to_string()))?;
        sink.send(WsMessage::Text(login.into()))
            .await
            .map_err(classify_ws_error)?;

        let client_id = await_welcome(&mut source).await?;
        info!(client_id = %client_id, "Broker accepted login");

        let capacity = options.outbound_capacity.max(1);
        let (request_tx, request_rx) = mpsc::channel(capacity);
        let (notification_tx, notification_rx) = mpsc::channel(capacity);
        tokio::spawn(pump(sink, source, request_rx, notification_tx));

        Ok(TransportSession {
            client_id,
            requests: request_tx,
            notifications: notification_rx,
        })
    }
}

fn classify_ws_error(error: WsError) -> ConnectError {
    match error {
        WsError::Io(e) => ConnectError::network(e.to_string()),
        WsError::Url(e) => ConnectError::InvalidUrl(e.to_string()),
        WsError::Http(response) => {
            let status = response.status();
            if status.as_u16() == codes::UNAUTHORIZED || status.as_u16() == codes::FORBIDDEN {
                ConnectError::authentication(format!("HTTP {status}"))
            } else {
                ConnectError::handshake(format!("HTTP {status}"))
            }
        }
        other => ConnectError::handshake(other.to_string()),
    }
}

/// Read frames until the broker answers the login
async fn await_welcome(source: &mut WsSource) -> Result<String, ConnectError> {
    while let Some(frame) = source.next().await {
        match frame.map_err(classify_ws_error)? {
            WsMessage::Text(text) => match ServerFrame::decode(text.as_str()) {
                Ok(ServerFrame::Welcome { client_id }) => return Ok(client_id),
                Ok(ServerFrame::Error { code, reason })
                    if code == codes::UNAUTHORIZED || code == codes::FORBIDDEN =>
                {
                    return Err(ConnectError::authentication(reason));
                }
                Ok(ServerFrame::Error { code, reason }) => {
                    return Err(ConnectError::handshake(format!("{code}: {reason}")));
                }
                Ok(ServerFrame::Heartbeat) => {}
                Ok(other) => {
                    return Err(ConnectError::handshake(format!(
                        "unexpected frame before welcome: {other:?}"
                    )));
                }
                Err(e) => return Err(ConnectError::handshake(e.to_string())),
            },
            WsMessage::Close(_) => {
                return Err(ConnectError::handshake("socket closed during login"));
            }
            _ => {}
        }
    }
    Err(ConnectError::handshake("stream ended during login"))
}

/// Forward requests to the socket and frames to the session until either side ends
///
/// Exactly one `Closed` notification is emitted unless the local side initiated the
/// shutdown.
async fn pump(
    mut sink: WsSink,
    mut source: WsSource,
    mut requests: mpsc::Receiver<Request>,
    notifications: mpsc::Sender<Notification>,
) {
    let closed = loop {
        tokio::select! {
            request = requests.recv() => {
                let Some(request) = request else {
                    let _ = sink.close().await;
                    break None;
                };
                let disconnect = matches!(request, Request::Disconnect);
                let publish_seq = match &request {
                    Request::Publish { seq, .. } => Some(*seq),
                    _ => None,
                };

                match ClientFrame::from(request).encode() {
                    Ok(text) => {
                        if let Err(e) = sink.send(WsMessage::Text(text.into())).await {
                            break Some(Notification::Closed {
                                code: codes::ABNORMAL_CLOSE,
                                reason: e.to_string(),
                            });
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to encode request");
                        if let Some(seq) = publish_seq {
                            let failed = Notification::PublishFailed {
                                seq,
                                code: codes::BAD_REQUEST,
                                reason: e.to_string(),
                            };
                            if notifications.send(failed).await.is_err() {
                                break None;
                            }
                        }
                    }
                }

                if disconnect {
                    let _ = sink.close().await;
                    break None;
                }
            }
            frame = source.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => match ServerFrame::decode(text.as_str()) {
                    Ok(ServerFrame::Error { code, reason }) => {
                        break Some(Notification::Closed { code, reason });
                    }
                    Ok(frame) => {
                        if let Some(notification) = frame.into_notification() {
                            if notifications.send(notification).await.is_err() {
                                break None;
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "Dropping undecodable frame"),
                },
                Some(Ok(WsMessage::Close(close))) => {
                    let (code, reason) = match close {
                        Some(close) => (u16::from(close.code), close.reason.as_str().to_string()),
                        None => (codes::NORMAL_CLOSE, "closed by peer".to_string()),
                    };
                    break Some(Notification::Closed { code, reason });
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    break Some(Notification::Closed {
                        code: codes::ABNORMAL_CLOSE,
                        reason: e.to_string(),
                    });
                }
                None => {
                    break Some(Notification::Closed {
                        code: codes::ABNORMAL_CLOSE,
                        reason: "stream ended".to_string(),
                    });
                }
            },
        }
    };

    if let Some(closed) = closed {
        debug!(?closed, "WebSocket session ended by peer");
        let _ = notifications.send(closed).await;
    } else {
        debug!("WebSocket session ended locally");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::TlsPolicy;

    #[tokio::test]
    async fn test_unsupported_scheme() {
        let url = Url::parse("http://localhost:9191/channel").unwrap();
        let result = WebSocketTransport::new()
            .connect(&url, &ConnectOptions::default())
            .await;
        assert!(matches!(result, Err(ConnectError::UnsupportedScheme(s)) if s == "http"));
    }

    #[tokio::test]
    async fn test_refused_connection_is_network_error() {
        // Bind then drop to obtain a port with nothing listening
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let url = Url::parse(&format!("ws://127.0.0.1:{port}/channel")).unwrap();
        let result = WebSocketTransport::new()
            .connect(&url, &ConnectOptions::default())
            .await;
        assert!(matches!(result, Err(ConnectError::Network(_))));
    }

    #[tokio::test]
    async fn test_wss_with_accept_all_builds_connector() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let url = Url::parse(&format!("wss://127.0.0.1:{port}/channel")).unwrap();
        let options = ConnectOptions::default().with_tls(TlsPolicy::AcceptAll);
        let result = WebSocketTransport::new().connect(&url, &options).await;
        // TLS setup succeeds; only the TCP connect fails
        assert!(matches!(result, Err(ConnectError::Network(_))));
    }
}
