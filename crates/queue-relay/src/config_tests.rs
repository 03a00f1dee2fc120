//! Tests for runtime configuration loading and validation.

use super::*;
use std::io::Write;
use tempfile::TempDir;

fn environment(vars: &[(&str, &str)]) -> ::config::Environment {
    let source: ::config::Map<String, String> = vars
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();

    ::config::Environment::with_prefix(ENV_PREFIX)
        .separator(ENV_SEPARATOR)
        .source(Some(source))
}

fn write_file(dir: &TempDir, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    path
}

// ============================================================================
// Loading Tests
// ============================================================================

mod loading {
    use super::*;

    #[test]
    fn test_no_sources_gives_defaults() {
        let config = RuntimeConfig::load_with_environment(None, environment(&[])).unwrap();

        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn test_explicit_yaml_file_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "runtime.yaml",
            "pump:\n  max_concurrent_calls: 4\n  drain_once: true\nrelay:\n  store_path: /var/lib/relay\nlogging:\n  json_format: true\n",
        );

        let config = RuntimeConfig::load_with_environment(Some(&path), environment(&[])).unwrap();

        assert_eq!(config.pump.max_concurrent_calls, 4);
        assert!(config.pump.drain_once);
        assert_eq!(config.pump.max_batch_size, PumpConfig::default().max_batch_size);
        assert_eq!(config.relay.store_path, std::path::PathBuf::from("/var/lib/relay"));
        assert!(config.logging.json_format);
    }

    #[test]
    fn test_explicit_json_file_is_accepted() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "runtime.json", r#"{ "retry": { "max_attempts": 7 } }"#);

        let config = RuntimeConfig::load_with_environment(Some(&path), environment(&[])).unwrap();

        assert_eq!(config.retry.max_attempts, 7);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.yaml");

        let result = RuntimeConfig::load_with_environment(Some(&path), environment(&[]));

        assert!(matches!(result, Err(ConfigError::Load(_))));
    }

    #[test]
    fn test_environment_overrides_file() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "runtime.yaml", "pump:\n  max_batch_size: 5\n");

        let config = RuntimeConfig::load_with_environment(
            Some(&path),
            environment(&[
                ("QR__PUMP__MAX_BATCH_SIZE", "25"),
                ("QR__LOGGING__LEVEL", "debug"),
            ]),
        )
        .unwrap();

        assert_eq!(config.pump.max_batch_size, 25);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_wrong_type_is_an_error() {
        let result = RuntimeConfig::load_with_environment(
            None,
            environment(&[("QR__PUMP__MAX_BATCH_SIZE", "many")]),
        );

        assert!(matches!(result, Err(ConfigError::Load(_))));
    }

    #[test]
    fn test_loaded_values_are_validated() {
        let result = RuntimeConfig::load_with_environment(
            None,
            environment(&[("QR__PUMP__MAX_CONCURRENT_CALLS", "0")]),
        );

        assert!(matches!(
            result,
            Err(ConfigError::Invalid { ref field, .. }) if field == "pump.max_concurrent_calls"
        ));
    }
}

// ============================================================================
// Validation Tests
// ============================================================================

mod validation {
    use super::*;

    fn invalid_field(config: RuntimeConfig) -> String {
        match config.validate() {
            Err(ConfigError::Invalid { field, .. }) => field,
            other => panic!("expected an invalid field, got {:?}", other),
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(RuntimeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_batch_size_is_rejected() {
        let mut config = RuntimeConfig::default();
        config.pump.max_batch_size = 0;

        assert_eq!(invalid_field(config), "pump.max_batch_size");
    }

    #[test]
    fn test_zero_max_delivery_count_is_rejected() {
        let mut config = RuntimeConfig::default();
        config.pump.max_delivery_count = Some(0);

        assert_eq!(invalid_field(config), "pump.max_delivery_count");
    }

    #[test]
    fn test_relay_backoff_bounds_must_be_ordered() {
        let mut config = RuntimeConfig::default();
        config.relay.initial_backoff_ms = 60_000;
        config.relay.max_backoff_ms = 1_000;

        assert_eq!(invalid_field(config), "relay.max_backoff_ms");
    }

    #[test]
    fn test_shrinking_backoff_is_rejected() {
        let mut config = RuntimeConfig::default();
        config.retry.backoff_multiplier = 0.5;

        assert_eq!(invalid_field(config), "retry.backoff_multiplier");
    }

    #[test]
    fn test_empty_log_level_is_rejected() {
        let mut config = RuntimeConfig::default();
        config.logging.level = "  ".to_string();

        assert_eq!(invalid_field(config), "logging.level");
    }
}

// ============================================================================
// Conversion Tests
// ============================================================================

mod conversion {
    use super::*;

    #[test]
    fn test_retry_config_maps_to_policy() {
        let config = RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 200,
            max_delay_ms: 2_000,
            backoff_multiplier: 3.0,
            use_jitter: false,
        };

        let policy = config.policy();

        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_delay, Duration::from_millis(200));
        assert_eq!(policy.max_delay, Duration::from_secs(2));
        assert_eq!(policy.backoff_multiplier, 3.0);
        assert!(!policy.use_jitter);
    }

    #[test]
    fn test_remediation_timeout_accessor() {
        let config = RemediationConfig::default();

        assert_eq!(config.receive_timeout(), Duration::from_secs(1));
    }
}
