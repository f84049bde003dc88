//! Layer abstractions
//!
//! The [`Layer`] trait plus one implementation per [`LayerKind`] that the
//! network container can chain. Recurrent layers are recognised by the
//! container's composition rules but no implementation ships with the crate.

mod r#trait;
pub mod conv2d;
pub mod cropping;
pub mod dense;
mod fft;
pub mod input;
pub mod multi_target;
pub mod subsampling;

pub use conv2d::{ConvMethod, ConvolutionLayer, SharedWeights};
pub use cropping::CroppingLayer;
pub use dense::FullyConnectedLayer;
pub use input::InputDataLayer;
pub use multi_target::{MultiTargetLayer, MAX_TARGETS};
pub use r#trait::{Layer, LayerHeader, LayerKind, PlaneShape};
pub use subsampling::SubsamplingLayer;
