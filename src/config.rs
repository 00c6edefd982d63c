//! Client configuration
//!
//! Two layers:
//!
//! - [`ClientConfig`]: the TOML file (`[connection]` and `[sinks]` sections), loaded
//!   with [`ClientConfig::load_from_file`].
//! - [`ConnectOptions`]: the runtime options object handed to `Connection::connect`,
//!   built programmatically or from a loaded [`ClientConfig`].
//!
//! ```toml
//! [connection]
//! url = "wss://broker.example.com:9291/channel"
//! client_id = "orders-publisher"
//! username_env = "CHANNEL_USERNAME"
//! password_env = "CHANNEL_PASSWORD"
//! ca_file = "certs/ca.pem"
//!
//! [sinks]
//! completion_capacity = 1000
//! backpressure = "block"
//! ```

use crate::sink::Backpressure;
use crate::tls::{TlsError, TlsPolicy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_URL: &str = "ws://localhost:9191/channel";

/// Top-level configuration file structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    pub connection: ConnectionSection,
    #[serde(default)]
    pub sinks: SinkSettings,
}

/// Connection section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionSection {
    /// Broker endpoint, `ws://` or `wss://`
    #[serde(default = "default_url")]
    pub url: String,
    /// Client identifier; the server assigns one when absent
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Environment variable holding the username (takes precedence over `username`)
    pub username_env: Option<String>,
    /// Environment variable holding the password (takes precedence over `password`)
    pub password_env: Option<String>,
    /// PEM trust anchors; when absent every server certificate is accepted
    pub ca_file: Option<PathBuf>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,
}

fn default_url() -> String {
    DEFAULT_URL.to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_outbound_capacity() -> usize {
    1024
}

/// Capacities and backpressure policy of the notification sinks
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SinkSettings {
    #[serde(default = "default_completion_capacity")]
    pub completion_capacity: usize,
    #[serde(default = "default_message_capacity")]
    pub message_capacity: usize,
    #[serde(default = "default_subscription_capacity")]
    pub subscription_capacity: usize,
    #[serde(default = "default_error_capacity")]
    pub error_capacity: usize,
    #[serde(default)]
    pub backpressure: Backpressure,
}

fn default_completion_capacity() -> usize {
    1000
}

fn default_message_capacity() -> usize {
    1000
}

fn default_subscription_capacity() -> usize {
    16
}

fn default_error_capacity() -> usize {
    1
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            completion_capacity: default_completion_capacity(),
            message_capacity: default_message_capacity(),
            subscription_capacity: default_subscription_capacity(),
            error_capacity: default_error_capacity(),
            backpressure: Backpressure::default(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid client ID: {0}")]
    InvalidClientId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("TLS setup failed: {0}")]
    Tls(#[from] TlsError),
}

impl ClientConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: ClientConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(client_id) = &self.connection.client_id {
            validate_client_id(client_id)?;
        }
        if self.connection.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "connect_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.connection.outbound_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "outbound_capacity must be greater than 0".to_string(),
            ));
        }
        let sinks = &self.sinks;
        if [
            sinks.completion_capacity,
            sinks.message_capacity,
            sinks.subscription_capacity,
            sinks.error_capacity,
        ]
        .contains(&0)
        {
            return Err(ConfigError::InvalidConfig(
                "sink capacities must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Username, preferring the environment variable named by `username_env`
    pub fn username(&self) -> Result<Option<String>, ConfigError> {
        resolve_credential(
            self.connection.username_env.as_deref(),
            self.connection.username.as_deref(),
        )
    }

    /// Password, preferring the environment variable named by `password_env`
    pub fn password(&self) -> Result<Option<String>, ConfigError> {
        resolve_credential(
            self.connection.password_env.as_deref(),
            self.connection.password.as_deref(),
        )
    }

    /// Build runtime options, resolving credentials and loading trust anchors
    pub fn connect_options(&self) -> Result<ConnectOptions, ConfigError> {
        let tls = match &self.connection.ca_file {
            Some(path) => TlsPolicy::from_ca_file(path)?,
            None => TlsPolicy::AcceptAll,
        };

        Ok(ConnectOptions {
            client_id: self.connection.client_id.clone(),
            username: self.username()?,
            password: self.password()?,
            tls,
            connect_timeout: Duration::from_secs(self.connection.connect_timeout_secs),
            outbound_capacity: self.connection.outbound_capacity,
        })
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionSection {
                url: default_url(),
                client_id: None,
                username: None,
                password: None,
                username_env: None,
                password_env: None,
                ca_file: None,
                connect_timeout_secs: default_connect_timeout(),
                outbound_capacity: default_outbound_capacity(),
            },
            sinks: SinkSettings::default(),
        }
    }
}

fn resolve_credential(
    env_var_name: Option<&str>,
    literal: Option<&str>,
) -> Result<Option<String>, ConfigError> {
    match env_var_name {
        Some(name) => std::env::var(name)
            .map(Some)
            .map_err(|_| ConfigError::EnvVarNotFound(name.to_string())),
        None => Ok(literal.map(str::to_string)),
    }
}

/// Validate client ID format: non-empty, `[a-zA-Z0-9._-]+`
pub fn validate_client_id(client_id: &str) -> Result<(), ConfigError> {
    let valid_chars = client_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if client_id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidClientId(format!(
            "Client ID '{client_id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}

/// Runtime options for establishing a session
#[derive(Clone)]
pub struct ConnectOptions {
    /// Requested client identifier; server-assigned when `None`
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: TlsPolicy,
    /// Upper bound on transport connect plus login handshake
    pub connect_timeout: Duration,
    /// Capacity of the queue between the caller and the session task
    pub outbound_capacity: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            client_id: None,
            username: None,
            password: None,
            tls: TlsPolicy::AcceptAll,
            connect_timeout: Duration::from_secs(default_connect_timeout()),
            outbound_capacity: default_outbound_capacity(),
        }
    }
}

impl ConnectOptions {
    pub fn with_client_id<S: Into<String>>(mut self, client_id: S) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_credentials<U: Into<String>, P: Into<String>>(
        mut self,
        username: U,
        password: P,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_tls(mut self, tls: TlsPolicy) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity.max(1);
        self
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("tls", &self.tls)
            .field("connect_timeout", &self.connect_timeout)
            .field("outbound_capacity", &self.outbound_capacity)
            .finish()
    }
}
