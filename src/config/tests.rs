//! Config module tests

use std::time::Duration;

use pretty_assertions::assert_eq;

use super::*;

#[test]
fn test_substitute_env_vars_simple() {
    std::env::set_var("QB_TEST_VAR_SIMPLE", "hello");
    let result = substitute_env_vars("value = \"${QB_TEST_VAR_SIMPLE}\"");
    assert_eq!(result, "value = \"hello\"");
    std::env::remove_var("QB_TEST_VAR_SIMPLE");
}

#[test]
fn test_substitute_env_vars_with_default() {
    std::env::remove_var("QB_TEST_VAR_UNSET");
    let result = substitute_env_vars("value = \"${QB_TEST_VAR_UNSET:-default_value}\"");
    assert_eq!(result, "value = \"default_value\"");

    std::env::set_var("QB_TEST_VAR_SET", "env_value");
    let result = substitute_env_vars("value = \"${QB_TEST_VAR_SET:-default_value}\"");
    assert_eq!(result, "value = \"env_value\"");
    std::env::remove_var("QB_TEST_VAR_SET");
}

#[test]
fn test_substitute_env_vars_missing_no_default() {
    std::env::remove_var("QB_TEST_VAR_MISSING");
    let result = substitute_env_vars("value = \"${QB_TEST_VAR_MISSING}\"");
    assert_eq!(result, "value = \"\"");
}

#[test]
fn test_default_config() {
    let config = Config::default();
    assert_eq!(config.log.level, "info");
    assert_eq!(config.broker_a.name, "broker-a");
    assert_eq!(config.broker_b.name, "broker-b");
    assert_eq!(config.forwarder.payload, PayloadMode::Text);
    assert!(config.forwarder.a_to_b.is_empty());
    assert_eq!(config.supervision.initial_backoff, Duration::from_secs(1));
    assert_eq!(config.supervision.max_backoff, Duration::from_secs(60));
    assert!(config.validate().is_ok());
}

#[test]
fn test_parse_full_config() {
    let config = Config::parse(
        r#"
[log]
level = "debug"

[broker_a]
name = "wmq"
address = "qm1.example.com(1414)"
username = "app"
password = "passw0rd"
connect_timeout = "5s"
queues = ["DEV.QUEUE.1"]
auto_create_queues = false

[broker_a.properties]
queue_manager = "QM1"
channel = "DEV.APP.SVRCONN"

[broker_b]
name = "amq"
address = "tcp://artemis:61616"

[forwarder]
payload = "verbatim"
wmq_to_amq = [
    { source_queue = "DEV.QUEUE.1", target_queue = "ORDERS" },
]
amq_to_wmq = [
    { sourceQueue = "REPLIES", targetQueue = "DEV.QUEUE.2" },
]

[supervision]
initial_backoff = "250ms"
max_backoff = "10s"
shutdown_timeout = "5s"
status_interval = "0s"
"#,
    )
    .unwrap();

    assert_eq!(config.log.level, "debug");
    assert_eq!(config.broker_a.name, "wmq");
    assert_eq!(config.broker_a.kind, BrokerKind::Memory);
    assert_eq!(config.broker_a.username.as_deref(), Some("app"));
    assert_eq!(config.broker_a.connect_timeout, Duration::from_secs(5));
    assert_eq!(config.broker_a.queues, vec!["DEV.QUEUE.1".to_string()]);
    assert!(!config.broker_a.auto_create_queues);
    assert!(config.broker_b.auto_create_queues);
    assert_eq!(
        config.broker_a.properties.get("queue_manager").map(String::as_str),
        Some("QM1")
    );
    assert_eq!(
        config.broker_a.properties.get("channel").map(String::as_str),
        Some("DEV.APP.SVRCONN")
    );
    assert!(config.broker_b.properties.is_empty());
    assert_eq!(config.broker_b.connect_timeout, Duration::from_secs(10));

    assert_eq!(config.forwarder.payload, PayloadMode::Verbatim);
    assert_eq!(
        config.forwarder.a_to_b,
        vec![QueueMapping::new("DEV.QUEUE.1", "ORDERS")]
    );
    assert_eq!(
        config.forwarder.b_to_a,
        vec![QueueMapping::new("REPLIES", "DEV.QUEUE.2")]
    );

    assert_eq!(config.supervision.initial_backoff, Duration::from_millis(250));
    assert!(config.supervision.status_interval.is_zero());

    let on_a: Vec<_> = config.queues_on(BrokerId::A).into_iter().collect();
    assert_eq!(on_a, vec!["DEV.QUEUE.1", "DEV.QUEUE.2"]);
    assert_eq!(config.broker(BrokerId::B).name, "amq");
}

#[test]
fn test_parse_canonical_direction_keys() {
    let config = Config::parse(
        r#"
[broker_a]
name = "a"

[broker_b]
name = "b"

[forwarder]
a_to_b = [{ source_queue = "IN", target_queue = "OUT" }]
"#,
    )
    .unwrap();
    assert_eq!(config.forwarder.a_to_b.len(), 1);
    assert!(config.forwarder.b_to_a.is_empty());
}

#[test]
fn test_validation_same_broker_names() {
    let result = Config::parse(
        r#"
[broker_a]
name = "mq"

[broker_b]
name = "mq"
"#,
    );
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_validation_empty_queue_name() {
    let result = Config::parse(
        r#"
[forwarder]
a_to_b = [{ source_queue = "", target_queue = "OUT" }]
"#,
    );
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_validation_backoff_bounds() {
    let result = Config::parse(
        r#"
[supervision]
initial_backoff = "2m"
max_backoff = "1m"
"#,
    );
    assert!(matches!(result, Err(ConfigError::Validation(_))));

    let result = Config::parse(
        r#"
[supervision]
initial_backoff = "0s"
"#,
    );
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_parse_invalid_toml() {
    let result = Config::parse("[forwarder\npayload = ");
    assert!(matches!(result, Err(ConfigError::Parse(_))));
}

#[test]
fn test_parse_unknown_payload_mode() {
    let result = Config::parse(
        r#"
[forwarder]
payload = "xml"
"#,
    );
    assert!(matches!(result, Err(ConfigError::Parse(_))));
}

#[test]
fn test_load_config_with_env_substitution() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("qbridge.toml");

    std::env::set_var("QB_TEST_WMQ_PASSWORD", "s3cret");

    let config_content = r#"
[broker_a]
name = "wmq"
username = "app"
password = "${QB_TEST_WMQ_PASSWORD}"

[broker_b]
name = "${QB_TEST_AMQ_NAME:-amq}"

[forwarder]
wmq_to_amq = [{ source_queue = "DEV.QUEUE.1", target_queue = "DEV.QUEUE.1" }]
"#;

    std::fs::write(&config_path, config_content).unwrap();

    let config = Config::load(&config_path).unwrap();
    assert_eq!(config.broker_a.password.as_deref(), Some("s3cret"));
    assert_eq!(config.broker_b.name, "amq");
    assert_eq!(config.forwarder.a_to_b.len(), 1);
    assert_eq!(config.supervision.max_backoff, Duration::from_secs(60));

    std::env::remove_var("QB_TEST_WMQ_PASSWORD");
}

#[test]
fn test_load_missing_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::load(dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.broker_a.name, "broker-a");
    assert_eq!(config.supervision.shutdown_timeout, Duration::from_secs(30));
}
