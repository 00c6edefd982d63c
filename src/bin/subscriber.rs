//! Subscribes to a destination and logs every message received
//!
//! Runs until SIGINT/SIGTERM, a connection error, or a rejected subscription.

use channel_client::cli::{shutdown_on_signal, ConnectionArgs};
use channel_client::observability::init_default_logging;
use channel_client::{Connection, EventHandler, EventLoop, Flow, Matcher, Message, Subscription};
use clap::Parser;
use std::process;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "subscriber")]
#[command(about = "Subscribe to a destination and log received messages")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Destination to receive messages from
    #[arg(long, default_value = "sample")]
    destination: String,

    /// Durable name; the subscription survives reconnects under this name
    #[arg(long, default_value = "")]
    durable: String,
}

#[derive(Default)]
struct Subscriber {
    received: u64,
}

impl EventHandler for Subscriber {
    fn on_subscription(&mut self, subscription: Subscription) -> Flow {
        if subscription.is_ok() {
            info!(matcher = %subscription.matcher, durable = ?subscription.durable, "Subscribed");
        }
        Flow::Continue
    }

    fn on_message(&mut self, message: Message) -> Flow {
        self.received += 1;
        info!(count = self.received, message = %message, "Received message");
        Flow::Continue
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_default_logging();

    if let Err(e) = run(cli).await {
        error!("{e}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let resolved = cli.connection.resolve()?;
    let (error_sink, errors) = resolved.sinks.error_sink();
    let (subscription_sink, subscriptions) = resolved.sinks.subscription_sink();
    let (message_sink, messages) = resolved.sinks.message_sink();

    let mut connection = Connection::connect(&resolved.url, resolved.options, error_sink).await?;

    let matcher = Matcher::destination(&cli.destination).to_string();
    connection.subscribe_async(&matcher, &cli.durable, &message_sink, &subscription_sink);

    let mut event_loop = EventLoop::new()
        .with_subscriptions(subscriptions)
        .with_messages(messages)
        .with_errors(errors)
        .with_shutdown(shutdown_on_signal());

    let mut subscriber = Subscriber::default();
    let termination = event_loop.run(&mut subscriber).await;

    connection.disconnect().await;

    if termination.is_shutdown() {
        info!(received = subscriber.received, "Subscriber shutdown complete");
        Ok(())
    } else {
        Err(termination.to_string().into())
    }
}
