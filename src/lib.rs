//! Channel Client - asynchronous publish/subscribe client
//!
//! One [`Connection`] per broker session, non-blocking publish and subscribe, and a
//! single [`EventLoop`] that multiplexes every asynchronous outcome back to the
//! application.
//!
//! # Overview
//!
//! - [`connection`]: connect, `publish_async`, `subscribe_async`, `disconnect`
//! - [`multiplexer`]: the event loop and its handler trait
//! - [`sink`]: bounded notification channels with an explicit backpressure policy
//! - [`message`] and [`matcher`]: typed messages and content filters
//! - [`transport`]: the transport contract and its WebSocket implementation
//! - [`testing`]: an in-process loopback broker
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use channel_client::{Connection, ConnectOptions, EventLoop, Message, SinkSettings};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let sinks = SinkSettings::default();
//! let (error_sink, errors) = sinks.error_sink();
//! let (completion_sink, completions) = sinks.completion_sink();
//!
//! let mut connection =
//!     Connection::connect("ws://localhost:9191/channel", ConnectOptions::default(), error_sink)
//!         .await?;
//!
//! let message = Message::builder().destination("sample").long("now", 1).build();
//! connection.publish_async(message, &completion_sink);
//!
//! let mut event_loop = EventLoop::new().with_completions(completions).with_errors(errors);
//! if let Some(event) = event_loop.next_event().await {
//!     println!("{event:?}");
//! }
//!
//! connection.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod connection;
pub mod error;
pub mod matcher;
pub mod message;
pub mod multiplexer;
pub mod observability;
pub mod sink;
pub mod testing;
pub mod tls;
pub mod transport;

pub use config::{ClientConfig, ConfigError, ConnectOptions, SinkSettings};
pub use connection::{Completion, Connection, ConnectionState, Subscription, SubscriptionId};
pub use error::{ConnectError, ConnectionError, PublishError, SubscribeError};
pub use matcher::Matcher;
pub use message::{FieldValue, Message, DESTINATION_FIELD};
pub use multiplexer::{ErrorPolicy, Event, EventHandler, EventLoop, Flow, LoopState, Termination};
pub use sink::{Backpressure, CompletionSink, ErrorSink, MessageSink, Sink, SubscriptionSink};
pub use tls::TlsPolicy;
pub use transport::Transport;
