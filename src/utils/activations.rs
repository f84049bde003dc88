//! Activation functions
//!
//! Elementwise nonlinearities applied after the affine part of a layer.
//! Derivatives are evaluated at the pre-activation value `z` (the cached `WX`),
//! not at the activated output.

use crate::error::DnnError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Activation selector for convolution and fully connected layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    /// Identity.
    None,
    #[default]
    Tanh,
    Sigmoid,
    Relu,
}

impl Activation {
    /// Applies the activation to a pre-activation value.
    #[inline]
    pub fn apply(self, z: f32) -> f32 {
        match self {
            Activation::None => z,
            Activation::Tanh => z.tanh(),
            Activation::Sigmoid => sigmoid(z),
            Activation::Relu => relu(z),
        }
    }

    /// Derivative of the activation at pre-activation value `z`.
    #[inline]
    pub fn derivative(self, z: f32) -> f32 {
        match self {
            Activation::None => 1.0,
            Activation::Tanh => tanh_derivative(z),
            Activation::Sigmoid => {
                let s = sigmoid(z);
                s * (1.0 - s)
            }
            Activation::Relu => relu_derivative(z),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Activation::None => "none",
            Activation::Tanh => "tanh",
            Activation::Sigmoid => "sigmoid",
            Activation::Relu => "relu",
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Activation {
    type Err = DnnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Activation::None),
            "tanh" => Ok(Activation::Tanh),
            "sigmoid" => Ok(Activation::Sigmoid),
            "relu" => Ok(Activation::Relu),
            _ => Err(DnnError::UnknownActivation(s.to_string())),
        }
    }
}

/// Logistic sigmoid: 1 / (1 + exp(-z)).
pub fn sigmoid(z: f32) -> f32 {
    1.0 / (1.0 + (-z).exp())
}

/// ReLU: max(0, z).
pub fn relu(z: f32) -> f32 {
    if z > 0.0 {
        z
    } else {
        0.0
    }
}

/// Subgradient 0 at the origin.
pub fn relu_derivative(z: f32) -> f32 {
    if z > 0.0 {
        1.0
    } else {
        0.0
    }
}

/// 1 - tanh²(z).
pub fn tanh_derivative(z: f32) -> f32 {
    let t = z.tanh();
    1.0 - t * t
}
