//! Training configuration
//!
//! An immutable description of one training run, handed to
//! [`Network::train`](crate::network::Network::train). It can be built in code
//! or parsed from a JSON file.

use crate::error::{NetworkError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Configuration for one training run.
///
/// # Example
///
/// ```json
/// {
///   "dataset": "data/mnist",
///   "epochs": 10,
///   "batch_size": 64,
///   "learning_rate": 0.001,
///   "shuffle": true,
///   "seed": 1
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Directory holding IDX files or one image folder per digit.
    pub dataset: PathBuf,

    /// Passes over the full dataset (at least 1).
    pub epochs: usize,

    /// Samples per gradient-descent step (at least 1).
    pub batch_size: usize,

    /// Overrides the network's learning rate when present.
    #[serde(default)]
    pub learning_rate: Option<f32>,

    /// Reshuffle the sample order at the start of every epoch.
    #[serde(default)]
    pub shuffle: bool,

    /// Shuffle seed; a time-based seed is used when absent.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl TrainingConfig {
    pub fn new(dataset: impl Into<PathBuf>, epochs: usize, batch_size: usize) -> Self {
        Self {
            dataset: dataset.into(),
            epochs,
            batch_size,
            learning_rate: None,
            shuffle: false,
            seed: None,
        }
    }

    pub fn with_learning_rate(mut self, learning_rate: f32) -> Self {
        self.learning_rate = Some(learning_rate);
        self
    }

    /// Shuffle every epoch using `seed`.
    pub fn with_shuffle(mut self, seed: u64) -> Self {
        self.shuffle = true;
        self.seed = Some(seed);
        self
    }

    /// Check numeric ranges. The dataset location is checked when it is opened.
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(NetworkError::InvalidConfig(
                "epochs must be at least 1".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(NetworkError::InvalidConfig(
                "batch_size must be at least 1".into(),
            ));
        }
        if let Some(learning_rate) = self.learning_rate {
            if !(learning_rate > 0.0 && learning_rate.is_finite()) {
                return Err(NetworkError::InvalidConfig(format!(
                    "learning_rate must be positive, got {}",
                    learning_rate
                )));
            }
        }
        Ok(())
    }
}

/// Loads and validates a training configuration from a JSON file.
///
/// # Examples
///
/// ```no_run
/// use digit_recognition::config::load_config;
///
/// let cfg = load_config("config/digit_training.json").unwrap();
/// assert!(cfg.epochs >= 1);
/// ```
pub fn load_config(path: impl AsRef<Path>) -> Result<TrainingConfig> {
    let contents = fs::read_to_string(path)?;
    let config: TrainingConfig = serde_json::from_str(&contents)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_for_optional_fields() {
        let config: TrainingConfig =
            serde_json::from_str(r#"{"dataset": "d", "epochs": 2, "batch_size": 8}"#).unwrap();
        assert_eq!(config, TrainingConfig::new("d", 2, 8));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = TrainingConfig::new("d", 1, 1)
            .with_learning_rate(0.5)
            .with_shuffle(3);
        assert_eq!(config.learning_rate, Some(0.5));
        assert!(config.shuffle);
        assert_eq!(config.seed, Some(3));
    }

    #[test]
    fn test_validate_rejects_zero_epochs() {
        assert!(TrainingConfig::new("d", 0, 8).validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        assert!(TrainingConfig::new("d", 1, 0).validate().is_err());
    }

    #[test]
    fn test_validate_rejects_non_positive_rate() {
        let config = TrainingConfig::new("d", 1, 1).with_learning_rate(0.0);
        assert!(matches!(
            config.validate(),
            Err(NetworkError::InvalidConfig(_))
        ));
        let config = TrainingConfig::new("d", 1, 1).with_learning_rate(f32::NAN);
        assert!(config.validate().is_err());
    }
}
