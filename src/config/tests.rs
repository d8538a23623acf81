//! Config module tests

use std::io::Write;
use std::time::Duration;

use super::*;
use crate::discovery::Component;
use crate::point::DeviceKind;

const MINIMAL: &str = r#"
[bridge]
node = "unipi"

[[point]]
dev = "relay"
circuit = "1"
"#;

fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_substitute_env_vars_simple() {
    std::env::set_var("EVOKMQ_TEST_VAR_SIMPLE", "hello");
    let result = substitute_env_vars("value = \"${EVOKMQ_TEST_VAR_SIMPLE}\"");
    assert_eq!(result, "value = \"hello\"");
    std::env::remove_var("EVOKMQ_TEST_VAR_SIMPLE");
}

#[test]
fn test_substitute_env_vars_with_default() {
    // Unset var should use default
    std::env::remove_var("EVOKMQ_TEST_VAR_UNSET");
    let result = substitute_env_vars("value = \"${EVOKMQ_TEST_VAR_UNSET:-default_value}\"");
    assert_eq!(result, "value = \"default_value\"");

    // Set var should use env value
    std::env::set_var("EVOKMQ_TEST_VAR_SET", "env_value");
    let result = substitute_env_vars("value = \"${EVOKMQ_TEST_VAR_SET:-default_value}\"");
    assert_eq!(result, "value = \"env_value\"");
    std::env::remove_var("EVOKMQ_TEST_VAR_SET");
}

#[test]
fn test_substitute_env_vars_missing_no_default() {
    std::env::remove_var("EVOKMQ_TEST_VAR_MISSING");
    let result = substitute_env_vars("value = \"${EVOKMQ_TEST_VAR_MISSING}\"");
    assert_eq!(result, "value = \"\"");
}

#[test]
fn test_load_config_with_env_substitution() {
    std::env::set_var("EVOKMQ_TEST_EVOK_HOST", "10.0.0.5");

    let file = write_config(
        r#"
[feed]
url = "ws://${EVOKMQ_TEST_EVOK_HOST}/ws"

[bus]
host = "${EVOKMQ_TEST_BROKER:-broker.local}"

[bridge]
node = "unipi"

[[point]]
dev = "relay"
circuit = "1"
"#,
    );

    let config = Config::load(file.path()).unwrap();
    assert_eq!(config.feed.url, "ws://10.0.0.5/ws");
    assert_eq!(config.bus.host, "broker.local"); // Uses default

    std::env::remove_var("EVOKMQ_TEST_EVOK_HOST");
}

#[test]
fn test_load_applies_defaults() {
    let file = write_config(MINIMAL);
    let config = Config::load(file.path()).unwrap();

    assert_eq!(config.log.level, "info");
    assert_eq!(config.feed.url, "ws://localhost/ws");
    assert_eq!(config.feed.connect_timeout, Duration::from_secs(10));
    assert_eq!(config.bus.port, 1883);
    assert_eq!(config.bus.qos, 1);
    assert_eq!(config.bus.max_pending, 1000);
    assert_eq!(config.bridge.payload_on, "ON");
    assert_eq!(config.bridge.drain_grace, Duration::from_secs(5));
    assert_eq!(config.reconnect.initial_delay, Duration::from_secs(1));
    assert_eq!(config.reconnect.max_delay, Duration::from_secs(30));
    assert!(config.discovery.enabled);
    assert_eq!(config.discovery.prefix, "homeassistant");
}

#[test]
fn test_missing_file_without_points_fails_validation() {
    let dir = tempfile::tempdir().unwrap();
    let result = Config::load(dir.path().join("absent.toml"));
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_parse_full_config() {
    let config = Config::parse(
        r#"
[log]
level = "debug"

[feed]
url = "wss://unipi.local/ws"
connect_timeout = "3s"

[bus]
host = "mqtt.local"
port = 8883
client_id = "unipi-bridge"
username = "bridge"
password = "secret"
keep_alive = "1m"
qos = 2
max_pending = 50

[bridge]
node = "unipi"
topic_prefix = "home"
payload_on = "true"
payload_off = "false"
drain_grace = "2s"

[reconnect]
initial_delay = "500ms"
max_delay = "1m"

[discovery]
enabled = false

[[point]]
dev = "relay"
circuit = "1"
id = "relay1"
name = "Kitchen light"

[[point]]
dev = "temp"
circuit = "28FF"
"#,
    )
    .unwrap();

    assert_eq!(config.log.level, "debug");
    assert_eq!(config.feed.connect_timeout, Duration::from_secs(3));
    assert_eq!(config.bus.keep_alive, Duration::from_secs(60));
    assert_eq!(config.bus.qos, 2);
    assert_eq!(config.bridge.topic_prefix(), "home");
    assert_eq!(config.reconnect.initial_delay, Duration::from_millis(500));
    assert!(!config.discovery.enabled);
    assert_eq!(config.points.len(), 2);
    assert_eq!(config.points[1].dev, DeviceKind::Temp);

    let mapper = config.mapper().unwrap();
    assert_eq!(mapper.command_filters(), vec!["home/relay1/set".to_string()]);

    let settings = config.mqtt_settings().unwrap();
    assert_eq!(settings.client_id, "unipi-bridge");
    assert_eq!(settings.availability_topic.as_deref(), Some("home/availability"));

    let engine = config.engine_config();
    assert_eq!(engine.max_pending, 50);
    assert_eq!(engine.drain_grace, Duration::from_secs(2));
    assert!(engine.discovery.is_none());
}

#[test]
fn test_default_client_id_uses_node() {
    let config = Config::parse(MINIMAL).unwrap();
    let settings = config.mqtt_settings().unwrap();
    assert_eq!(settings.client_id, "evokmq-unipi");
}

#[test]
fn test_validation_rejects_empty_point_list() {
    let result = Config::parse("[bridge]\nnode = \"unipi\"\n");
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_validation_rejects_duplicate_points() {
    let result = Config::parse(
        r#"
[bridge]
node = "unipi"

[[point]]
dev = "relay"
circuit = "1"

[[point]]
dev = "relay"
circuit = "1"
id = "other"
"#,
    );
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_validation_rejects_wildcard_in_id() {
    let result = Config::parse(
        r#"
[bridge]
node = "unipi"

[[point]]
dev = "relay"
circuit = "1"
id = "relay/+"
"#,
    );
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_validation_rejects_bad_bus_settings() {
    let mut config = Config::parse(MINIMAL).unwrap();
    config.bus.qos = 3;
    assert!(config.validate().is_err());

    let mut config = Config::parse(MINIMAL).unwrap();
    config.bus.port = 0;
    assert!(config.validate().is_err());

    let mut config = Config::parse(MINIMAL).unwrap();
    config.bus.max_pending = 0;
    assert!(config.validate().is_err());
}

#[test]
fn test_validation_rejects_equal_payloads() {
    let mut config = Config::parse(MINIMAL).unwrap();
    config.bridge.payload_off = config.bridge.payload_on.clone();
    assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
}

#[test]
fn test_unknown_device_type_is_parse_error() {
    let result = Config::parse(
        r#"
[[point]]
dev = "neuron"
circuit = "1"
"#,
    );
    assert!(matches!(result, Err(ConfigError::Parse(_))));
}

#[test]
fn test_point_component_override() {
    let config = Config::parse(
        r#"
[bridge]
node = "unipi"

[[point]]
dev = "relay"
circuit = "1"
component = "light"

[[point]]
dev = "relay"
circuit = "2"
"#,
    )
    .unwrap();

    assert_eq!(config.points[0].component, Some(Component::Light));
    assert_eq!(config.points[1].component, None);

    let mapper = config.mapper().unwrap();
    assert_eq!(mapper.points()[0].component, Some(Component::Light));

    let discovery = config.engine_config().discovery.unwrap();
    assert_eq!(
        discovery.config_topic(&mapper.points()[0]),
        "homeassistant/light/unipi/relay_1/config"
    );
    assert_eq!(
        discovery.config_topic(&mapper.points()[1]),
        "homeassistant/switch/unipi/relay_2/config"
    );
}

#[test]
fn test_validation_rejects_component_for_wrong_device() {
    let result = Config::parse(
        r#"
[bridge]
node = "unipi"

[[point]]
dev = "temp"
circuit = "28FF"
component = "light"
"#,
    );
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_validation_rejects_bad_discovery_topics() {
    let mut config = Config::parse(MINIMAL).unwrap();
    config.discovery.prefix = "homeassistant/#".to_string();
    assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));

    let mut config = Config::parse(MINIMAL).unwrap();
    config.bridge.topic_prefix = Some("home".to_string());
    config.bridge.node = Some("a/b".to_string());
    assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));

    // The node only becomes a topic level through discovery
    config.discovery.enabled = false;
    assert!(config.validate().is_ok());
}
