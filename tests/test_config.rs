//! Tests for network configuration parsing
//!
//! This file tests the config module including:
//! - Loading the bundled JSON config file
//! - Handling invalid JSON
//! - Handling missing files
//! - Rejecting out-of-range values
//! - Handling missing optional fields with defaults

use neural_layers::config::{load_config, NetworkConfig};
use std::fs;
use tempfile::TempDir;

fn write_config(dir: &TempDir, contents: &str) -> String {
    let path = dir.path().join("network.json");
    fs::write(&path, contents).expect("Failed to write config");
    path.to_string_lossy().into_owned()
}

// ============================================================================
// Valid Config Loading Tests
// ============================================================================

mod valid_config_tests {
    use super::*;

    #[test]
    fn test_load_bundled_config() {
        let config = load_config("config/network.json").expect("Failed to load network config");

        assert_eq!(config.batch, 8);
        assert_eq!(config.learning_rate, 0.001);
        assert_eq!(config.momentum, 0.9);
        assert_eq!(config.decay, 0.0005);
        assert!(config.try_fix_nan);
        assert_eq!(config.seed, 42);
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, r#"{ "batch": 16 }"#);
        let config = load_config(&path).unwrap();

        assert_eq!(
            config,
            NetworkConfig {
                batch: 16,
                ..NetworkConfig::default()
            }
        );
    }

    #[test]
    fn test_update_args_follow_config() {
        let config = load_config("config/network.json").unwrap();
        let args = config.update_args();
        assert_eq!(args.batch, 8);
        assert_eq!(args.learning_rate, 0.001);
        assert_eq!(args.momentum, 0.9);
        assert_eq!(args.decay, 0.0005);
    }
}

// ============================================================================
// Invalid Config Tests
// ============================================================================

mod invalid_config_tests {
    use super::*;

    #[test]
    fn test_missing_file() {
        assert!(load_config("config/does_not_exist.json").is_err());
    }

    #[test]
    fn test_invalid_json() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "{ \"batch\": 4, ");
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn test_wrong_field_type() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, r#"{ "batch": "eight" }"#);
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn test_zero_batch_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, r#"{ "batch": 0 }"#);
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("batch"));
    }

    #[test]
    fn test_out_of_range_values_rejected() {
        let dir = TempDir::new().unwrap();
        for contents in [
            r#"{ "momentum": 1.5 }"#,
            r#"{ "momentum": -0.1 }"#,
            r#"{ "learning_rate": -0.01 }"#,
            r#"{ "decay": -1.0 }"#,
        ] {
            let path = write_config(&dir, contents);
            assert!(load_config(&path).is_err(), "accepted {}", contents);
        }
    }
}
