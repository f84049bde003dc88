//! Learning-rate decay policies
//!
//! Every trainable layer carries an initial learning rate and a [`DecayPolicy`].
//! At backward iteration `t` (1-based) the step size is:
//!
//! - **Hyperbolic**: `lr / t`
//! - **SqrtInverse**: `lr / sqrt(t)`
//! - **LogInverse**: `lr / (1 + ln t)`
//!
//! All three equal `lr` at `t = 1` and decrease strictly afterwards.

use crate::error::{DnnError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Decay schedule applied to a layer's initial learning rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DecayPolicy {
    #[serde(rename = "hyperbolic")]
    Hyperbolic,
    #[default]
    #[serde(rename = "sqrt_inv")]
    SqrtInverse,
    #[serde(rename = "log_inv")]
    LogInverse,
}

impl DecayPolicy {
    /// Step size for iteration `t`.
    ///
    /// # Errors
    ///
    /// `InvalidIteration` when `t == 0`.
    pub fn step_size(self, init_learn_rate: f32, t: usize) -> Result<f32> {
        if t < 1 {
            return Err(DnnError::InvalidIteration(t));
        }
        let t = t as f32;
        Ok(match self {
            DecayPolicy::Hyperbolic => init_learn_rate / t,
            DecayPolicy::SqrtInverse => init_learn_rate / t.sqrt(),
            DecayPolicy::LogInverse => init_learn_rate / (1.0 + t.ln()),
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DecayPolicy::Hyperbolic => "hyperbolic",
            DecayPolicy::SqrtInverse => "sqrt_inv",
            DecayPolicy::LogInverse => "log_inv",
        }
    }
}

impl fmt::Display for DecayPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DecayPolicy {
    type Err = DnnError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hyperbolic" => Ok(DecayPolicy::Hyperbolic),
            "sqrt_inv" => Ok(DecayPolicy::SqrtInverse),
            "log_inv" => Ok(DecayPolicy::LogInverse),
            _ => Err(DnnError::UnknownDecayPolicy(s.to_string())),
        }
    }
}
