//! Shared utilities
//!
//! Random number generation, activation functions and learning-rate decay
//! policies used by the layers and the training loop.

pub mod activations;
pub mod lr_scheduler;
pub mod rng;

pub use activations::Activation;
pub use lr_scheduler::DecayPolicy;
pub use rng::SimpleRng;
