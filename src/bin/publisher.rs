//! Publishes a timestamped message to a destination on every tick
//!
//! Runs until SIGINT/SIGTERM, a connection error, or (unless `--keep-going`) the
//! first failed publish.

use channel_client::cli::{shutdown_on_signal, ConnectionArgs};
use channel_client::observability::init_default_logging;
use channel_client::{
    Completion, CompletionSink, Connection, ErrorPolicy, EventHandler, EventLoop, Flow, Message,
};
use chrono::Utc;
use clap::Parser;
use std::process;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "publisher")]
#[command(about = "Publish messages to a destination once per interval")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Destination on which to publish messages
    #[arg(long, default_value = "sample")]
    destination: String,

    /// Seconds between publishes
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u64).range(1..))]
    interval: u64,

    /// Log failed publishes instead of exiting
    #[arg(long)]
    keep_going: bool,
}

struct Publisher<'a> {
    connection: &'a Connection,
    completions: CompletionSink,
    destination: String,
}

impl EventHandler for Publisher<'_> {
    fn on_tick(&mut self, _at: Instant) -> Flow {
        let message = Message::builder()
            .destination(self.destination.as_str())
            .timestamp("now", Utc::now())
            .build();
        self.connection.publish_async(message, &self.completions);
        Flow::Continue
    }

    fn on_completion(&mut self, completion: Completion) -> Flow {
        if completion.is_ok() {
            info!(seq = completion.sequence, message = %completion.message, "Published message");
        }
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
    let (completion_sink, completions) = resolved.sinks.completion_sink();

    let mut connection = Connection::connect(&resolved.url, resolved.options, error_sink).await?;
    info!(client_id = connection.client_id(), destination = %cli.destination, "Publisher started");

    let policy = if cli.keep_going {
        ErrorPolicy::LogAndContinue
    } else {
        ErrorPolicy::Terminate
    };
    let mut event_loop = EventLoop::new()
        .with_ticker(Duration::from_secs(cli.interval))
        .with_completions(completions)
        .with_errors(errors)
        .with_shutdown(shutdown_on_signal())
        .with_error_policy(policy);

    let mut publisher = Publisher {
        connection: &connection,
        completions: completion_sink,
        destination: cli.destination,
    };
    let termination = event_loop.run(&mut publisher).await;
    drop(publisher);

    connection.disconnect().await;

    if termination.is_shutdown() {
        info!("Publisher shutdown complete");
        Ok(())
    } else {
        Err(termination.to_string().into())
    }
}
