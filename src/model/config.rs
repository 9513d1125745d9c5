//! Hyperparameters of the network.

use crate::asg::PoolMode;
use crate::nn::{Activation, Classifier};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("`{0}` must be at least 1")]
    Zero(&'static str),
    #[error("`{name}` must be a finite non-negative number, got {value}")]
    InvalidRate { name: &'static str, value: f32 },
    #[error("`momentum` must lie in [0, 1), got {0}")]
    InvalidMomentum(f32),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Immutable configuration of one network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CnnConfig {
    pub learning_rate: f32,
    pub sequence_length: usize,
    pub batch_size: usize,
    pub number_of_filters: usize,
    pub filter_length: usize,
    pub activation: Activation,
    pub classifier: Classifier,
    pub pooling_mode: PoolMode,
    pub regularization_coefficient: f32,
    pub dense_neurons: usize,
    pub pool_size: usize,
    pub momentum: f32,
    pub perform_normalization: bool,
    /// Seed for weight initialization; entropy when absent.
    pub seed: Option<u64>,
}

impl Default for CnnConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.01,
            sequence_length: 38400,
            batch_size: 10,
            number_of_filters: 1,
            filter_length: 15,
            activation: Activation::Tanh,
            classifier: Classifier::Softmax,
            pooling_mode: PoolMode::Max,
            regularization_coefficient: 0.001,
            dense_neurons: 16,
            pool_size: 2,
            momentum: 0.9,
            perform_normalization: true,
            seed: None,
        }
    }
}

impl CnnConfig {
    pub fn with_learning_rate(mut self, learning_rate: f32) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    pub fn with_sequence_length(mut self, sequence_length: usize) -> Self {
        self.sequence_length = sequence_length;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_filters(mut self, number_of_filters: usize, filter_length: usize) -> Self {
        self.number_of_filters = number_of_filters;
        self.filter_length = filter_length;
        self
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    pub fn with_pooling(mut self, pool_size: usize, pooling_mode: PoolMode) -> Self {
        self.pool_size = pool_size;
        self.pooling_mode = pooling_mode;
        self
    }

    pub fn with_regularization(mut self, coefficient: f32) -> Self {
        self.regularization_coefficient = coefficient;
        self
    }

    pub fn with_dense_neurons(mut self, dense_neurons: usize) -> Self {
        self.dense_neurons = dense_neurons;
        self
    }

    pub fn with_momentum(mut self, momentum: f32) -> Self {
        self.momentum = momentum;
        self
    }

    pub fn with_normalization(mut self, perform_normalization: bool) -> Self {
        self.perform_normalization = perform_normalization;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Rejects values no network can be built from.
    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("sequence_length", self.sequence_length),
            ("batch_size", self.batch_size),
            ("number_of_filters", self.number_of_filters),
            ("filter_length", self.filter_length),
            ("dense_neurons", self.dense_neurons),
            ("pool_size", self.pool_size),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Zero(*name));
        }

        for (name, value) in [
            ("learning_rate", self.learning_rate),
            ("regularization_coefficient", self.regularization_coefficient),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::InvalidRate { name, value });
            }
        }

        if !(0.0..1.0).contains(&self.momentum) {
            return Err(ConfigError::InvalidMomentum(self.momentum));
        }
        Ok(())
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CnnConfig::default();
        config.validate().unwrap();
        assert_eq!(config.sequence_length, 38400);
        assert_eq!(config.pool_size, 2);
        assert!(config.perform_normalization);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = CnnConfig::from_json_str(r#"{"batch_size": 4, "pooling_mode": "average"}"#).unwrap();
        assert_eq!(config.batch_size, 4);
        assert_eq!(config.pooling_mode, PoolMode::Average);
        assert_eq!(config.dense_neurons, 16);

        let round = CnnConfig::from_json_str(&config.to_json().unwrap()).unwrap();
        assert_eq!(round, config);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let zero = CnnConfig::default().with_batch_size(0);
        assert!(matches!(zero.validate(), Err(ConfigError::Zero("batch_size"))));

        let momentum = CnnConfig::default().with_momentum(1.0);
        assert!(matches!(momentum.validate(), Err(ConfigError::InvalidMomentum(_))));

        let rate = CnnConfig::default().with_learning_rate(f32::NAN);
        assert!(matches!(rate.validate(), Err(ConfigError::InvalidRate { name: "learning_rate", .. })));
    }
}
