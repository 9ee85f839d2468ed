//! Network hyperparameters
//!
//! This module provides the configuration shared by every layer of a network:
//! batch size, momentum-SGD settings, the non-finite recovery switch and the
//! random seed.

use serde::Deserialize;
use std::error::Error;
use std::fs;

use crate::optimizers::UpdateArgs;

/// Network-wide settings, parsed from JSON.
///
/// Every field is optional in the file and falls back to [`NetworkConfig::default`].
///
/// # Example
///
/// ```json
/// {
///   "batch": 8,
///   "learning_rate": 0.001,
///   "momentum": 0.9,
///   "decay": 0.0005,
///   "try_fix_nan": true,
///   "seed": 42
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Samples per forward call (recurrent layers split it across time steps)
    pub batch: usize,

    /// Step size before division by `batch`
    pub learning_rate: f32,

    /// Fraction of the update accumulators kept after each step
    pub momentum: f32,

    /// L2 weight decay on connected weights
    pub decay: f32,

    /// Replace non-finite statistics and updates with zero
    pub try_fix_nan: bool,

    /// Seed for weight initialisation and dropout masks
    pub seed: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            batch: 1,
            learning_rate: 0.001,
            momentum: 0.9,
            decay: 0.0005,
            try_fix_nan: false,
            seed: 42,
        }
    }
}

impl NetworkConfig {
    /// Update arguments for one `Layer::update` pass.
    pub fn update_args(&self) -> UpdateArgs {
        UpdateArgs::new(self.batch, self.learning_rate, self.momentum, self.decay)
    }
}

/// Loads a network configuration from a JSON file.
///
/// # Returns
///
/// `Ok(NetworkConfig)` on success, or an error if the file cannot be read, the
/// JSON is invalid, or a value is out of range.
///
/// # Examples
///
/// ```no_run
/// use neural_layers::config::load_config;
///
/// let cfg = load_config("config/network.json").unwrap();
/// assert!(cfg.batch > 0);
/// ```
pub fn load_config(path: &str) -> Result<NetworkConfig, Box<dyn Error>> {
    let contents = fs::read_to_string(path)?;
    let config: NetworkConfig = serde_json::from_str(&contents)?;
    validate_config(&config)?;
    Ok(config)
}

pub(crate) fn validate_config(config: &NetworkConfig) -> Result<(), Box<dyn Error>> {
    if config.batch == 0 {
        return Err(Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "batch must be greater than 0",
        )));
    }

    if !(config.learning_rate >= 0.0) {
        return Err(Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "learning_rate must be non-negative",
        )));
    }

    if !(0.0..=1.0).contains(&config.momentum) {
        return Err(Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "momentum must be in range [0.0, 1.0]",
        )));
    }

    if !(config.decay >= 0.0) {
        return Err(Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "decay must be non-negative",
        )));
    }

    Ok(())
}
