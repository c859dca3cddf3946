//! Additional comprehensive tests for configuration parsing and validation

use super::{ConfigParser, ConfigValidator, EnvManager};
use crate::{
    cli::Cli,
    models::{ServerConfig, TestConfig},
    types::TransportKind,
};
use clap::Parser;
use proptest::prelude::*;
use std::collections::HashMap;

fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| map.get(key).cloned()
}

/// Test edge cases in configuration values
mod config_edge_cases {
    use super::*;

    #[test]
    fn test_config_boundary_values() {
        let mut config = TestConfig::default();
        config.duration_secs = 120;
        config.parallel_connections = 16;
        config.static_grace_period_secs = 10.0;
        config.protocol_overhead_factor = 1.20;
        config.latency_samples = 5;
        assert!(config.validate().is_ok());

        config.parallel_connections = 17;
        assert!(config.validate().is_err());
        config.parallel_connections = 16;

        config.protocol_overhead_factor = 0.99;
        assert!(config.validate().is_err());
        config.protocol_overhead_factor = 1.0;

        config.latency_samples = 4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_with_many_servers() {
        let mut config = TestConfig::default();
        config.servers = (0..100).map(|i| format!("https://speed{}.example.com", i)).collect();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_rejects_non_http_servers() {
        let mut config = TestConfig::default();
        config.servers = vec!["ws://example.com".to_string()];
        assert!(config.validate().is_err());

        config.servers = vec!["".to_string()];
        assert!(config.validate().is_err());

        config.servers.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplex_path_must_be_absolute() {
        let mut config = TestConfig::default();
        config.duplex_path = "ws".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_server_config_rejects_zero_caps() {
        let config = ServerConfig {
            max_duplex_download_bytes: 0,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}

/// Test environment variable parsing edge cases
mod env_parsing_tests {
    use super::*;

    #[test]
    fn test_env_servers_with_paths_and_ports() {
        let servers = "https://example.com:8443/speed,http://localhost:3000";
        assert!(EnvManager::validate_env_var("SPEEDTEST_SERVERS", servers).is_ok());
    }

    #[test]
    fn test_env_boundary_values() {
        assert!(EnvManager::validate_env_var("SPEEDTEST_DURATION", "1").is_ok());
        assert!(EnvManager::validate_env_var("SPEEDTEST_DURATION", "120").is_ok());
        assert!(EnvManager::validate_env_var("SPEEDTEST_TIMEOUT", "1").is_ok());
        assert!(EnvManager::validate_env_var("SPEEDTEST_TIMEOUT", "300").is_ok());
        assert!(EnvManager::validate_env_var("SPEEDTEST_OVERHEAD_FACTOR", "1.0").is_ok());
        assert!(EnvManager::validate_env_var("SPEEDTEST_OVERHEAD_FACTOR", "1.2").is_ok());
    }

    #[test]
    fn test_env_boolean_validation() {
        assert!(EnvManager::validate_env_var("SPEEDTEST_ENABLE_COLOR", "true").is_ok());
        assert!(EnvManager::validate_env_var("SPEEDTEST_ENABLE_COLOR", "false").is_ok());

        // Only lowercase true/false parse as bool
        for value in ["TRUE", "True", "yes", "1", "0"] {
            assert!(EnvManager::validate_env_var("SPEEDTEST_ENABLE_COLOR", value).is_err(), "{}", value);
        }
    }

    #[test]
    fn test_env_servers_list_trims_entries() {
        let mut config = TestConfig::default();
        config
            .merge_from_source(lookup_from(&[("SPEEDTEST_SERVERS", " http://a:3000 ,, http://b:3000 ")]))
            .unwrap();
        assert_eq!(config.servers, vec!["http://a:3000", "http://b:3000"]);
    }
}

/// Test configuration merging priorities
mod config_priority_tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        // env beats defaults
        let env = lookup_from(&[("SPEEDTEST_DURATION", "25"), ("SPEEDTEST_TRANSPORT", "duplex")]);
        let config = ConfigParser::new(Cli::parse_from(["speedtest", "run"]))
            .resolve_test_config(&env)
            .unwrap();
        assert_eq!(config.duration_secs, 25);
        assert_eq!(config.transport, TransportKind::Duplex);

        // CLI beats env
        let config = ConfigParser::new(Cli::parse_from(["speedtest", "run", "-d", "35", "-t", "streaming"]))
            .resolve_test_config(&env)
            .unwrap();
        assert_eq!(config.duration_secs, 35);
        assert_eq!(config.transport, TransportKind::Streaming);
    }

    #[test]
    fn test_serve_flags_do_not_touch_run_config() {
        let config = ConfigParser::new(Cli::parse_from(["speedtest", "serve", "--bind", "127.0.0.1:1"]))
            .resolve_test_config(|_| None)
            .unwrap();
        assert_eq!(config.servers, TestConfig::default().servers);
    }

    #[test]
    fn test_env_file_values_do_not_override_process_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "SPEEDTEST_PRIORITY_PROBE=from-file\n").unwrap();

        std::env::set_var("SPEEDTEST_PRIORITY_PROBE", "from-env");
        EnvManager::load_env_file_from(&path, false).unwrap();
        assert_eq!(std::env::var("SPEEDTEST_PRIORITY_PROBE").unwrap(), "from-env");
        std::env::remove_var("SPEEDTEST_PRIORITY_PROBE");
    }
}

/// Test error message quality and helpfulness
mod error_message_tests {
    use super::*;

    #[test]
    fn test_error_messages_are_helpful() {
        let err = EnvManager::validate_env_var("SPEEDTEST_SERVERS", "not-a-url").unwrap_err();
        let error_msg = err.to_string();
        assert!(error_msg.contains("SPEEDTEST_SERVERS"));
        assert!(error_msg.contains("not-a-url"));

        let err = EnvManager::validate_env_var("SPEEDTEST_CONNECTIONS", "0").unwrap_err();
        assert!(err.to_string().contains("between 1 and 16"));

        let err = TestConfig {
            duration_secs: 0,
            ..TestConfig::default()
        }
        .validate()
        .unwrap_err();
        assert!(err.to_string().contains("Duration"));
    }
}

/// Property checks over the accepted ranges
mod property_tests {
    use super::*;

    proptest! {
        #[test]
        fn prop_in_range_values_validate(
            duration in 1u64..=120,
            connections in 1usize..=16,
            factor in 1.0f64..=1.20,
            grace in 0.0f64..=10.0,
        ) {
            let config = TestConfig {
                duration_secs: duration,
                parallel_connections: connections,
                protocol_overhead_factor: factor,
                static_grace_period_secs: grace,
                ..TestConfig::default()
            };
            prop_assert!(config.validate().is_ok());
            prop_assert!(ConfigValidator::validate_comprehensive(&config).is_ok());
        }

        #[test]
        fn prop_connections_above_cap_rejected(connections in 17usize..1000) {
            let config = TestConfig {
                parallel_connections: connections,
                ..TestConfig::default()
            };
            prop_assert!(config.validate().is_err());
        }
    }
}

/// Test concurrent configuration operations
mod concurrency_tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_concurrent_validation() {
        let handles: Vec<_> = (0..10)
            .map(|i| {
                thread::spawn(move || {
                    let config = TestConfig {
                        servers: vec![format!("https://speed{}.example.com", i)],
                        duration_secs: (i % 120 + 1) as u64,
                        parallel_connections: i % 16 + 1,
                        ..TestConfig::default()
                    };
                    assert!(config.validate().is_ok());
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
    }
}
