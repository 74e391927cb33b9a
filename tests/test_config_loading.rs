//! Configuration loading and validation tests
//!
//! Tests focus on observable outcomes of loading: parsed values, defaults,
//! normalization of broker URLs and rejection of invalid files.

use broker_link::config::{BridgeConfig, ConfigError, DeliveryGuarantee};
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    write!(temp_file, "{content}").unwrap();
    temp_file
}

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let temp_file = write_config(
        r#"
[broker]
address = "broker.local"
port = 1884
encrypted = false
connect_delay_ms = 250
settle_delay_ms = 0
connect_timeout_ms = 5000
keep_alive_secs = 30
auto_connect = true
topics = ["sensor/a", "sensor/b"]
qos = "at_least_once"

[runtime]
tick_interval_ms = 20
drain_passes = 3
"#,
    );

    let config = BridgeConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.broker.address, "broker.local");
    assert_eq!(config.broker.port, 1884);
    assert_eq!(config.broker.connect_delay_ms, 250);
    assert_eq!(config.broker.connect_timeout_ms, 5000);
    assert!(config.broker.auto_connect);
    assert_eq!(config.broker.topics, vec!["sensor/a", "sensor/b"]);
    assert_eq!(config.broker.qos, DeliveryGuarantee::AtLeastOnce);
    assert_eq!(config.runtime.tick_interval_ms, 20);
    assert_eq!(config.runtime.drain_passes, 3);
}

#[test]
fn test_config_defaults_match_reference_timings() {
    let temp_file = write_config("[broker]\n");

    let config = BridgeConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.broker.address, "localhost");
    assert_eq!(config.broker.port, 1883);
    assert!(!config.broker.encrypted);
    assert!(!config.broker.auto_connect);
    assert_eq!(config.broker.connect_delay_ms, 500);
    assert_eq!(config.broker.connect_timeout_ms, 30_000);
    assert_eq!(config.broker.keep_alive_secs, 60);
    assert_eq!(config.broker.qos, DeliveryGuarantee::ExactlyOnce);
    assert!(config.broker.topics.is_empty());
    assert_eq!(config.runtime.drain_passes, 2);
}

#[test]
fn test_broker_url_overrides_address_port_and_tls() {
    let temp_file = write_config(
        r#"
[broker]
address = "ignored"
broker_url = "mqtts://secure.example.com"
"#,
    );

    let config = BridgeConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.broker.address, "secure.example.com");
    assert_eq!(config.broker.port, 8883);
    assert!(config.broker.encrypted);
}

#[test]
fn test_invalid_broker_url_rejected() {
    for url in ["http://example.com", "not a url", "mqtt://"] {
        let temp_file = write_config(&format!("[broker]\nbroker_url = \"{url}\"\n"));
        let result = BridgeConfig::load_from_file(temp_file.path());
        assert!(
            matches!(result, Err(ConfigError::InvalidBrokerUrl(_))),
            "{url} should be rejected, got {result:?}"
        );
    }
}

#[test]
fn test_invalid_values_rejected() {
    let cases = [
        "[broker]\nport = 0\n",
        "[broker]\naddress = \"\"\n",
        "[broker]\nconnect_timeout_ms = 0\n",
        "[broker]\nkeep_alive_secs = 2\n",
        "[broker]\n[runtime]\ndrain_passes = 0\n",
        "[broker]\n[runtime]\ntick_interval_ms = 0\n",
    ];
    for content in cases {
        let temp_file = write_config(content);
        let result = BridgeConfig::load_from_file(temp_file.path());
        assert!(
            matches!(result, Err(ConfigError::InvalidConfig(_))),
            "{content:?} should be rejected, got {result:?}"
        );
    }
}

#[test]
fn test_keep_alive_zero_disables() {
    let temp_file = write_config("[broker]\nkeep_alive_secs = 0\n");
    let config = BridgeConfig::load_from_file(temp_file.path()).unwrap();
    assert_eq!(config.broker.keep_alive_secs, 0);
}

#[test]
fn test_missing_file_is_read_error() {
    let result = BridgeConfig::load_from_file(Path::new("/nonexistent/broker.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_malformed_toml_is_parse_error() {
    let temp_file = write_config("[broker\naddress = ");
    let result = BridgeConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_unknown_qos_is_parse_error() {
    let temp_file = write_config("[broker]\nqos = \"twice\"\n");
    let result = BridgeConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_credentials_from_environment() {
    std::env::set_var("BROKER_LINK_TEST_USER", "env-user");
    std::env::set_var("BROKER_LINK_TEST_PASS", "env-pass");
    let temp_file = write_config(
        r#"
[broker]
username_env = "BROKER_LINK_TEST_USER"
password_env = "BROKER_LINK_TEST_PASS"
"#,
    );

    let config = BridgeConfig::load_from_file(temp_file.path()).unwrap();
    let credentials = config.broker.credentials().unwrap();

    assert_eq!(credentials.username, "env-user");
    assert_eq!(credentials.password.as_deref(), Some("env-pass"));
    assert!(!format!("{credentials:?}").contains("env-pass"));
}

#[test]
fn test_inline_credentials_take_precedence() {
    std::env::set_var("BROKER_LINK_TEST_SHADOWED_USER", "from-env");
    let temp_file = write_config(
        r#"
[broker]
username = "inline"
username_env = "BROKER_LINK_TEST_SHADOWED_USER"
"#,
    );

    let config = BridgeConfig::load_from_file(temp_file.path()).unwrap();
    let credentials = config.broker.credentials().unwrap();
    assert_eq!(credentials.username, "inline");
    assert_eq!(credentials.password, None);
}

#[test]
fn test_config_round_trips_through_show_output() {
    let temp_file = write_config("[broker]\ntopics = [\"sensor/a\"]\n");
    let config = BridgeConfig::load_from_file(temp_file.path()).unwrap();

    let rendered = toml::to_string_pretty(&config).unwrap();
    let reparsed = BridgeConfig::from_toml_str(&rendered).unwrap();
    assert_eq!(reparsed, config);
}
