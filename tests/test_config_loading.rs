//! Configuration loading and validation tests
//!
//! Tests focus on the observable outcomes of loading a TOML file: parsed values,
//! defaults, validation failures and credential resolution.

use channel_client::config::{ClientConfig, ConfigError, DEFAULT_URL};
use channel_client::{Backpressure, TlsPolicy};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(contents: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "{contents}").unwrap();
    temp_file
}

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let temp_file = write_config(
        r#"
[connection]
url = "wss://broker.example.com:9291/channel"
client_id = "orders-publisher"
username = "alice"
password = "secret"
connect_timeout_secs = 3

[sinks]
completion_capacity = 50
message_capacity = 500
backpressure = "drop_newest"
"#,
    );

    let config = ClientConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.connection.url, "wss://broker.example.com:9291/channel");
    assert_eq!(config.connection.client_id.as_deref(), Some("orders-publisher"));
    assert_eq!(config.sinks.completion_capacity, 50);
    assert_eq!(config.sinks.message_capacity, 500);
    assert_eq!(config.sinks.subscription_capacity, 16);
    assert_eq!(config.sinks.backpressure, Backpressure::DropNewest);

    let options = config.connect_options().unwrap();
    assert_eq!(options.client_id.as_deref(), Some("orders-publisher"));
    assert_eq!(options.username.as_deref(), Some("alice"));
    assert_eq!(options.password.as_deref(), Some("secret"));
    assert_eq!(options.connect_timeout, Duration::from_secs(3));
}

#[test]
fn test_config_applies_defaults_when_not_specified() {
    let temp_file = write_config("[connection]\n");

    let config = ClientConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.connection.url, DEFAULT_URL);
    assert_eq!(config.connection.client_id, None);
    assert_eq!(config.connection.connect_timeout_secs, 10);
    assert_eq!(config.sinks.completion_capacity, 1000);
    assert_eq!(config.sinks.backpressure, Backpressure::Block);
    assert!(matches!(
        config.connect_options().unwrap().tls,
        TlsPolicy::AcceptAll
    ));
}

#[test]
fn test_config_returns_error_when_connection_section_missing() {
    let temp_file = write_config(
        r#"
[sinks]
completion_capacity = 10
"#,
    );

    let result = ClientConfig::load_from_file(temp_file.path());

    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_config_returns_error_for_invalid_toml_syntax() {
    let temp_file = write_config("[connection\nurl = ");

    let result = ClientConfig::load_from_file(temp_file.path());

    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_config_returns_error_for_unknown_backpressure_policy() {
    let temp_file = write_config(
        r#"
[connection]

[sinks]
backpressure = "drop_everything"
"#,
    );

    let result = ClientConfig::load_from_file(temp_file.path());

    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_config_returns_error_for_invalid_client_id_with_special_chars() {
    let temp_file = write_config(
        r#"
[connection]
client_id = "orders/publisher"
"#,
    );

    let result = ClientConfig::load_from_file(temp_file.path());

    assert!(matches!(result, Err(ConfigError::InvalidClientId(_))));
}

#[test]
fn test_config_returns_error_for_zero_connect_timeout() {
    let temp_file = write_config(
        r#"
[connection]
connect_timeout_secs = 0
"#,
    );

    let result = ClientConfig::load_from_file(temp_file.path());

    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_config_returns_error_for_zero_sink_capacity() {
    let temp_file = write_config(
        r#"
[connection]

[sinks]
error_capacity = 0
"#,
    );

    let result = ClientConfig::load_from_file(temp_file.path());

    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_config_returns_error_when_file_not_found() {
    let result = ClientConfig::load_from_file(std::path::Path::new("/nonexistent/channel.toml"));

    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_credentials_retrieved_from_environment() {
    std::env::set_var("CHANNEL_TEST_CONFIG_USER", "env_user");
    std::env::set_var("CHANNEL_TEST_CONFIG_PASS", "env_pass");

    let temp_file = write_config(
        r#"
[connection]
username = "ignored"
username_env = "CHANNEL_TEST_CONFIG_USER"
password_env = "CHANNEL_TEST_CONFIG_PASS"
"#,
    );

    let config = ClientConfig::load_from_file(temp_file.path()).unwrap();
    let options = config.connect_options().unwrap();

    assert_eq!(options.username.as_deref(), Some("env_user"));
    assert_eq!(options.password.as_deref(), Some("env_pass"));

    std::env::remove_var("CHANNEL_TEST_CONFIG_USER");
    std::env::remove_var("CHANNEL_TEST_CONFIG_PASS");
}

#[test]
fn test_credentials_return_error_when_env_var_not_set() {
    std::env::remove_var("CHANNEL_TEST_CONFIG_MISSING");

    let temp_file = write_config(
        r#"
[connection]
password_env = "CHANNEL_TEST_CONFIG_MISSING"
"#,
    );

    let config = ClientConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.username().unwrap(), None);
    assert!(matches!(
        config.connect_options(),
        Err(ConfigError::EnvVarNotFound(name)) if name == "CHANNEL_TEST_CONFIG_MISSING"
    ));
}

#[test]
fn test_missing_ca_file_is_tls_error() {
    let temp_file = write_config(
        r#"
[connection]
url = "wss://broker.example.com:9291/channel"
ca_file = "/nonexistent/ca.pem"
"#,
    );

    let config = ClientConfig::load_from_file(temp_file.path()).unwrap();

    assert!(matches!(config.connect_options(), Err(ConfigError::Tls(_))));
}
