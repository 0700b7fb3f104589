use serial_test::serial;
use temp_env::with_vars;

use super::*;
use crate::Error;

fn cleanup_all_coord_env_vars() {
    for (key, _) in std::env::vars() {
        if key.starts_with("COORD__") || key == "CONFIG_PATH" {
            std::env::remove_var(&key);
        }
    }
}

#[test]
#[serial]
fn default_config_should_initialize_with_hardcoded_values() {
    let config = StoreConfig::default();

    assert_eq!(config.client.session_timeout_ms, 5000);
    assert_eq!(config.client.connect_timeout_ms, 1000);
    assert_eq!(config.retry.reconnect.max_retries, 0);
    assert_eq!(config.server.listen_addr, "127.0.0.1:0");
    assert!(config.watch.resync_on_reconnect);
}

#[test]
#[serial]
fn new_should_merge_environment_overrides() {
    cleanup_all_coord_env_vars();
    with_vars(
        vec![
            ("COORD__CLIENT__SESSION_TIMEOUT_MS", Some("7000")),
            ("COORD__CLIENT__CONNECT_STRING", Some("10.1.1.1:4711")),
        ],
        || {
            let config = StoreConfig::new().unwrap();

            assert_eq!(config.client.session_timeout_ms, 7000);
            assert_eq!(config.client.connect_string, "10.1.1.1:4711");
        },
    );
}

#[test]
#[serial]
fn config_path_file_should_be_loaded() {
    cleanup_all_coord_env_vars();
    let temp_dir = tempfile::tempdir().unwrap();
    let config_path = temp_dir.path().join("store.toml");
    std::fs::write(
        &config_path,
        r#"
        [retry.reconnect]
        base_delay_ms = 20
        max_delay_ms = 400
        "#,
    )
    .unwrap();

    with_vars(vec![("CONFIG_PATH", Some(config_path.to_str().unwrap()))], || {
        let config = StoreConfig::new().unwrap();

        assert_eq!(config.retry.reconnect.base_delay_ms, 20);
        assert_eq!(config.retry.reconnect.max_delay_ms, 400);
        // Untouched sections keep their defaults
        assert_eq!(config.client.session_timeout_ms, 5000);
    });
}

#[test]
#[serial]
fn with_override_config_should_merge_file_settings() {
    cleanup_all_coord_env_vars();
    let temp_dir = tempfile::tempdir().unwrap();
    let config_path = temp_dir.path().join("override.toml");
    std::fs::write(
        &config_path,
        r#"
        [client]
        operation_timeout_ms = 9000

        [server]
        tick_ms = 50
        "#,
    )
    .unwrap();

    let empty_vars: Vec<(&str, Option<&str>)> = vec![];
    with_vars(empty_vars, || {
        let base_config = StoreConfig::new().expect("success");
        let config = base_config
            .with_override_config(config_path.to_str().unwrap())
            .expect("override applies");

        assert_eq!(config.client.operation_timeout_ms, 9000);
        assert_eq!(config.server.tick_ms, 50);
        assert!(config.validate().is_ok());
    });
}

#[test]
fn validation_should_reject_missing_port() {
    let mut config = StoreConfig::default();
    config.client.connect_string = "localhost".to_string();

    assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
}

#[test]
fn validation_should_reject_operation_timeout_below_connect_timeout() {
    let mut config = StoreConfig::default();
    config.client.operation_timeout_ms = 10;

    assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
}

#[test]
fn validation_should_reject_inverted_backoff() {
    let mut config = StoreConfig::default();
    config.retry.reconnect.base_delay_ms = 500;
    config.retry.reconnect.max_delay_ms = 100;

    assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
}

#[test]
fn validation_should_reject_zero_session_buffer() {
    let mut config = StoreConfig::default();
    config.watch.session_event_buffer = 0;

    assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
}

#[test]
fn server_should_clamp_requested_session_timeout() {
    let server = ServerConfig {
        tick_ms: 100,
        max_session_timeout_ms: 10_000,
        ..Default::default()
    };

    assert_eq!(server.negotiate_session_timeout(50), 200);
    assert_eq!(server.negotiate_session_timeout(5000), 5000);
    assert_eq!(server.negotiate_session_timeout(60_000), 10_000);
}
