//! Convolutional network training core
//!
//! Layers, a network container with auxiliary fan-in links, and a minibatch
//! SGD training loop for convolutional classifiers.
//!
//! # Modules
//!
//! - `tensor`: Row-major 2D `f32` buffer used for activations, gradients and weights
//! - `layers`: Layer trait and implementations (Convolution, FullyConnected, etc.)
//! - `network`: Layer chain with validation, lookup, forward/backward drivers and release
//! - `training`: Minibatch sampling, forward/backward iteration and evaluation
//! - `model`: Classifier wrapper mapping labels to etalons
//! - `utils`: RNG, activation functions and learning-rate decay policies
//! - `config`: Training configuration
//! - `architecture`: JSON network descriptions and network building
//! - `error`: Error type shared by all modules

pub mod architecture;
pub mod config;
pub mod error;
pub mod layers;
pub mod model;
pub mod network;
pub mod tensor;
pub mod training;
pub mod utils;

pub use error::{DnnError, Result};
pub use layers::{Layer, LayerKind, PlaneShape};
pub use network::{release_network, ForwardTrace, LayerId, Network};
pub use tensor::Tensor;
