//! Command-line plumbing shared by the example programs
//!
//! Flags override values loaded from an optional TOML file, which in turn override
//! built-in defaults.

use crate::config::{validate_client_id, ClientConfig, ConfigError, ConnectOptions, SinkSettings};
use clap::Args;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{info, warn};

/// Connection flags
#[derive(Debug, Clone, Default, Args)]
pub struct ConnectionArgs {
    /// Broker endpoint (ws:// or wss://)
    #[arg(long, env = "CHANNEL_URL")]
    pub url: Option<String>,

    /// Client identifier; assigned by the server when omitted
    #[arg(long = "clientid", env = "CHANNEL_CLIENT_ID")]
    pub client_id: Option<String>,

    #[arg(long, env = "CHANNEL_USERNAME")]
    pub username: Option<String>,

    #[arg(long, env = "CHANNEL_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// PEM file with trusted CA certificates; every certificate is accepted when omitted
    #[arg(long, value_name = "FILE")]
    pub ca: Option<PathBuf>,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

/// Everything needed to open a connection and its sinks
#[derive(Debug, Clone)]
pub struct ResolvedConnection {
    pub url: String,
    pub options: ConnectOptions,
    pub sinks: SinkSettings,
}

impl ConnectionArgs {
    /// Merge flags over the configuration file, validate, and build connect options
    pub fn resolve(&self) -> Result<ResolvedConnection, ConfigError> {
        let mut config = match &self.config {
            Some(path) => {
                info!(path = %path.display(), "Loading configuration");
                ClientConfig::load_from_file(path)?
            }
            None => ClientConfig::default(),
        };

        let connection = &mut config.connection;
        if let Some(url) = &self.url {
            connection.url = url.clone();
        }
        match self.client_id.as_deref() {
            // Empty asks the broker to assign one
            Some("") => connection.client_id = None,
            Some(client_id) => {
                validate_client_id(client_id)?;
                connection.client_id = Some(client_id.to_string());
            }
            None => {}
        }
        if let Some(username) = &self.username {
            connection.username = Some(username.clone());
            connection.username_env = None;
        }
        if let Some(password) = &self.password {
            connection.password = Some(password.clone());
            connection.password_env = None;
        }
        if let Some(ca) = &self.ca {
            connection.ca_file = Some(ca.clone());
        }

        config.validate()?;
        let options = config.connect_options()?;
        Ok(ResolvedConnection {
            url: config.connection.url,
            options,
            sinks: config.sinks,
        })
    }
}

/// Receiver that flips to true on SIGINT or SIGTERM
pub fn shutdown_on_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = tx.send(true);
    });
    rx
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigint, mut sigterm) = match (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    ) {
        (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
        _ => {
            warn!("Unable to install signal handlers, falling back to Ctrl-C");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Received Ctrl-C, shutting down gracefully...");
    }
}
