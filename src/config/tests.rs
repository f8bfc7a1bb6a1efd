//! Config module tests

use super::*;
use pretty_assertions::assert_eq;

#[test]
fn test_substitute_env_vars_simple() {
    std::env::set_var("PB_TEST_VAR_SIMPLE", "hello");
    let result = substitute_env_vars("value = \"${PB_TEST_VAR_SIMPLE}\"").unwrap();
    assert_eq!(result, "value = \"hello\"");
    std::env::remove_var("PB_TEST_VAR_SIMPLE");
}

#[test]
fn test_substitute_env_vars_with_default() {
    std::env::remove_var("PB_TEST_VAR_UNSET");
    let result = substitute_env_vars("value = \"${PB_TEST_VAR_UNSET:-fallback}\"").unwrap();
    assert_eq!(result, "value = \"fallback\"");

    std::env::set_var("PB_TEST_VAR_SET", "env_value");
    let result = substitute_env_vars("value = \"${PB_TEST_VAR_SET:-fallback}\"").unwrap();
    assert_eq!(result, "value = \"env_value\"");
    std::env::remove_var("PB_TEST_VAR_SET");
}

#[test]
fn test_substitute_env_vars_missing_no_default() {
    std::env::remove_var("PB_TEST_VAR_MISSING");
    let result = substitute_env_vars("value = \"${PB_TEST_VAR_MISSING}\"").unwrap();
    assert_eq!(result, "value = \"\"");
}

#[test]
fn test_default_config() {
    let config = Config::default();
    assert_eq!(config.log.level, "info");
    assert_eq!(config.mqtt.bind.port(), 1883);
    assert_eq!(config.mqtt.max_connections, 1000);
    assert_eq!(config.mqtt.connect_timeout, Duration::from_secs(30));
    assert!(!config.mqtt.auth.enabled);
    assert!(config.mqtt.auth.allow_anonymous);
    assert_eq!(config.http.bind.port(), 8080);
    assert_eq!(config.http.public_url, "http://localhost:8080");
    assert_eq!(config.bridge.device, "main");
    assert_eq!(config.bridge.status_timeout, Duration::from_secs(10));
    assert!(config.validate().is_ok());
}

#[test]
fn test_parse_minimal_config() {
    let config = Config::parse("").unwrap();
    assert_eq!(config.bridge.device, "main");
    assert_eq!(config.mqtt.outbound_channel_capacity, 256);
}

#[test]
fn test_parse_full_config() {
    let toml = r#"
[log]
level = "debug"

[mqtt]
bind = "127.0.0.1:1884"
max_connections = 10
max_packet_size = 4096
default_keep_alive = 0
connect_timeout = "5s"
outbound_channel_capacity = 16

[mqtt.auth]
enabled = true
allow_anonymous = false
users = [{ username = "tasmota", password = "secret" }]

[http]
bind = "127.0.0.1:8081"
public_url = "http://switch.lan:8081"

[bridge]
device = "kitchen"
status_timeout = "1500ms"
"#;

    let config = Config::parse(toml).unwrap();
    assert_eq!(config.log.level, "debug");
    assert_eq!(config.mqtt.bind.to_string(), "127.0.0.1:1884");
    assert_eq!(config.mqtt.max_connections, 10);
    assert_eq!(config.mqtt.max_packet_size, 4096);
    assert_eq!(config.mqtt.default_keep_alive, 0);
    assert_eq!(config.mqtt.connect_timeout, Duration::from_secs(5));
    assert_eq!(config.mqtt.outbound_channel_capacity, 16);
    assert!(config.mqtt.auth.enabled);
    assert!(!config.mqtt.auth.allow_anonymous);
    assert_eq!(config.mqtt.auth.users.len(), 1);
    assert_eq!(config.mqtt.auth.users[0].username, "tasmota");
    assert_eq!(config.http.public_url, "http://switch.lan:8081");
    assert_eq!(config.bridge.device, "kitchen");
    assert_eq!(config.bridge.status_timeout, Duration::from_millis(1500));
}

#[test]
fn test_invalid_device_topic() {
    for device in ["", "a/b", "+", "kitchen#"] {
        let toml = format!("[bridge]\ndevice = \"{}\"\n", device);
        assert!(
            matches!(Config::parse(&toml), Err(ConfigError::Validation(_))),
            "device {:?} should be rejected",
            device
        );
    }
}

#[test]
fn test_zero_status_timeout() {
    let result = Config::parse("[bridge]\nstatus_timeout = \"0s\"\n");
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_zero_packet_size() {
    let result = Config::parse("[mqtt]\nmax_packet_size = 0\n");
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_zero_outbound_capacity() {
    let result = Config::parse("[mqtt]\noutbound_channel_capacity = 0\n");
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_user_empty_password() {
    let toml = r#"
[mqtt.auth]
enabled = true
users = [{ username = "tasmota", password = "" }]
"#;
    assert!(matches!(
        Config::parse(toml),
        Err(ConfigError::Validation(_))
    ));
}

#[test]
fn test_empty_password_ignored_when_auth_disabled() {
    let toml = r#"
[mqtt.auth]
users = [{ username = "tasmota", password = "" }]
"#;
    assert!(Config::parse(toml).is_ok());
}

#[test]
fn test_public_url_trailing_slash() {
    let result = Config::parse("[http]\npublic_url = \"http://localhost:8080/\"\n");
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_invalid_toml() {
    assert!(matches!(
        Config::parse("[bridge\ndevice = 1"),
        Err(ConfigError::Parse(_))
    ));
}

#[test]
fn test_load_missing_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::load(dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.bridge.status_timeout, Duration::from_secs(10));
    assert_eq!(config.mqtt.connect_timeout, Duration::from_secs(30));
}

#[test]
fn test_load_config_with_env_substitution() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("powerbridge.toml");

    std::env::set_var("PB_TEST_HTTP_HOST", "127.0.0.1");
    std::env::set_var("PB_TEST_HTTP_PORT", "8089");

    let content = r#"
[http]
bind = "${PB_TEST_HTTP_HOST}:${PB_TEST_HTTP_PORT}"

[bridge]
device = "${PB_TEST_DEVICE:-garage}"
"#;
    std::fs::write(&config_path, content).unwrap();

    let config = Config::load(&config_path).unwrap();
    assert_eq!(config.http.bind.to_string(), "127.0.0.1:8089");
    assert_eq!(config.bridge.device, "garage");

    std::env::remove_var("PB_TEST_HTTP_HOST");
    std::env::remove_var("PB_TEST_HTTP_PORT");
}

#[test]
fn test_load_config_with_env_override() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("powerbridge.toml");
    std::fs::write(&config_path, "[mqtt]\nmax_connections = 5\n").unwrap();

    std::env::set_var("POWERBRIDGE__MQTT__MAX_CONNECTIONS", "7");
    let config = Config::load(&config_path);
    std::env::remove_var("POWERBRIDGE__MQTT__MAX_CONNECTIONS");

    assert_eq!(config.unwrap().mqtt.max_connections, 7);
}

#[test]
fn test_load_rejects_invalid_values() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("powerbridge.toml");
    std::fs::write(&config_path, "[bridge]\ndevice = \"a/b\"\n").unwrap();

    assert!(matches!(
        Config::load(&config_path),
        Err(ConfigError::Validation(_))
    ));
}
