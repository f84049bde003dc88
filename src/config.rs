//! Training configuration
//!
//! Parameters of the minibatch SGD loop, loadable from JSON.
//!
//! # Example
//!
//! ```json
//! {
//!   "max_iter": 500,
//!   "start_iter": 0,
//!   "batch_size": 16,
//!   "seed": 42,
//!   "normalize_input_range": true
//! }
//! ```

use crate::error::{DnnError, Result};
use serde::{Deserialize, Serialize};
use std::fs;

fn default_max_iter() -> usize {
    1000
}

fn default_batch_size() -> usize {
    10
}

fn default_true() -> bool {
    true
}

/// Configuration of a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Number of iterations; values below 1 run a single iteration.
    #[serde(default = "default_max_iter")]
    pub max_iter: usize,

    /// Offset added to the iteration counter handed to the layers, so a
    /// resumed run continues the learning-rate schedule.
    #[serde(default)]
    pub start_iter: usize,

    /// Samples per minibatch (>= 1).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Sampler seed; a time-based seed is used when absent.
    #[serde(default)]
    pub seed: Option<u64>,

    /// Rescale image values to [-1, 1] when the network starts with a
    /// convolution layer (classifier wrapper only).
    #[serde(default = "default_true")]
    pub normalize_input_range: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            max_iter: default_max_iter(),
            start_iter: 0,
            batch_size: default_batch_size(),
            seed: None,
            normalize_input_range: true,
        }
    }
}

impl TrainingConfig {
    /// Iteration budget with the lower clamp applied.
    pub fn effective_max_iter(&self) -> usize {
        self.max_iter.max(1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size < 1 {
            return Err(DnnError::Config("batch_size must be >= 1".to_string()));
        }
        Ok(())
    }
}

/// Loads and validates a training configuration from a JSON file.
///
/// # Examples
///
/// ```no_run
/// use rust_cnn::config::load_config;
///
/// let cfg = load_config("config/train.json").unwrap();
/// assert!(cfg.batch_size >= 1);
/// ```
pub fn load_config(path: &str) -> Result<TrainingConfig> {
    let contents = fs::read_to_string(path)?;
    let config: TrainingConfig = serde_json::from_str(&contents)?;
    config.validate()?;
    Ok(config)
}
