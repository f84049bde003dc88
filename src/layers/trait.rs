//! Layer trait definition
//!
//! Every layer kind implements [`Layer`]. A layer owns its parameters and
//! forward caches; its position in a network (previous/next layer, auxiliary
//! links) is owned by [`crate::network::Network`].
//!
//! Shape conventions:
//!
//! - `forward` input is `(input_size × batch)`, output `(output_size × batch)`
//! - `backward` gradients are `(batch × output_size)` in, `(batch × input_size)` out

use crate::error::{DnnError, Result};
use crate::tensor::Tensor;
use crate::utils::DecayPolicy;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;

/// Learning rate recorded on layers that have no trainable parameters.
pub(crate) const NOMINAL_LEARN_RATE: f32 = 1.0;

/// Closed set of layer kinds understood by the network container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    InputData,
    Convolution,
    Subsampling,
    FullyConnected,
    Recurrent,
    Cropping,
    MultiTarget,
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LayerKind::InputData => "input_data",
            LayerKind::Convolution => "convolution",
            LayerKind::Subsampling => "subsampling",
            LayerKind::FullyConnected => "fully_connected",
            LayerKind::Recurrent => "recurrent",
            LayerKind::Cropping => "cropping",
            LayerKind::MultiTarget => "multi_target",
        };
        f.write_str(s)
    }
}

/// `planes × height × width` feature map geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaneShape {
    pub planes: usize,
    pub height: usize,
    pub width: usize,
}

impl PlaneShape {
    pub const fn new(planes: usize, height: usize, width: usize) -> Self {
        Self {
            planes,
            height,
            width,
        }
    }

    /// Flat vector of `n` features (`n × 1 × 1`).
    pub const fn flat(n: usize) -> Self {
        Self::new(n, 1, 1)
    }

    /// Number of values in one sample.
    pub const fn size(&self) -> usize {
        self.planes * self.height * self.width
    }

    pub const fn plane_len(&self) -> usize {
        self.height * self.width
    }

    pub const fn is_unit_spatial(&self) -> bool {
        self.height == 1 && self.width == 1
    }
}

impl fmt::Display for PlaneShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}x{}", self.planes, self.height, self.width)
    }
}

/// Fields common to every layer.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerHeader {
    pub name: String,
    pub kind: LayerKind,
    pub input: PlaneShape,
    pub output: PlaneShape,
    pub init_learn_rate: f32,
    pub decay: DecayPolicy,
}

impl LayerHeader {
    /// Validated header.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` when a dimension is zero, the output is larger than
    /// the input in either spatial dimension, or the learning rate is not
    /// above `f32::EPSILON`.
    pub fn new(
        name: impl Into<String>,
        kind: LayerKind,
        input: PlaneShape,
        output: PlaneShape,
        init_learn_rate: f32,
        decay: DecayPolicy,
    ) -> Result<Self> {
        let name = name.into();
        let dims = [
            input.planes,
            input.height,
            input.width,
            output.planes,
            output.height,
            output.width,
        ];
        if dims.iter().any(|&d| d < 1) {
            return Err(DnnError::InvalidParameter(format!(
                "layer '{}': all dimensions must be >= 1 (input {}, output {})",
                name, input, output
            )));
        }
        if input.height < output.height || input.width < output.width {
            return Err(DnnError::InvalidParameter(format!(
                "layer '{}': output {} larger than input {}",
                name, output, input
            )));
        }
        if init_learn_rate.is_nan() || init_learn_rate <= f32::EPSILON {
            return Err(DnnError::InvalidParameter(format!(
                "layer '{}': learning rate {} must be > {}",
                name,
                init_learn_rate,
                f32::EPSILON
            )));
        }
        Ok(Self {
            name,
            kind,
            input,
            output,
            init_learn_rate,
            decay,
        })
    }

    /// Header for a layer without trainable parameters.
    pub(crate) fn weightless(
        name: impl Into<String>,
        kind: LayerKind,
        input: PlaneShape,
        output: PlaneShape,
    ) -> Result<Self> {
        Self::new(
            name,
            kind,
            input,
            output,
            NOMINAL_LEARN_RATE,
            DecayPolicy::default(),
        )
    }

    /// Checks a forward input of shape `(input_size × batch)`.
    pub(crate) fn check_forward(&self, input: &Tensor) -> Result<()> {
        if input.rows() != self.input.size() {
            return Err(DnnError::dims(
                format!("forward of '{}'", self.name),
                format!("{} input rows", self.input.size()),
                input.rows(),
            ));
        }
        if input.cols() == 0 {
            return Err(DnnError::dims(
                format!("forward of '{}'", self.name),
                "batch >= 1",
                0,
            ));
        }
        Ok(())
    }

    /// Checks the iteration counter and the shapes of a backward call.
    pub(crate) fn check_backward(
        &self,
        iteration: usize,
        input: &Tensor,
        grad_output: &Tensor,
    ) -> Result<()> {
        if iteration < 1 {
            return Err(DnnError::InvalidIteration(iteration));
        }
        self.check_forward(input)?;
        let expected = (input.cols(), self.output.size());
        if grad_output.shape() != expected {
            return Err(DnnError::dims(
                format!("backward of '{}'", self.name),
                format!("{}x{} gradient", expected.0, expected.1),
                format!("{}x{}", grad_output.rows(), grad_output.cols()),
            ));
        }
        Ok(())
    }

    /// Step size for `iteration` under this layer's decay policy.
    pub(crate) fn step_size(&self, iteration: usize) -> Result<f32> {
        self.decay.step_size(self.init_learn_rate, iteration)
    }
}

/// Core trait for network layers.
///
/// # Example
///
/// ```ignore
/// let mut x = Tensor::zeros(layer.input_size(), batch);
/// let y = layer.forward(&mut x)?;
/// let dy = Tensor::zeros(batch, layer.output_size());
/// let dx = layer.backward(1, &x, &dy)?;
/// ```
pub trait Layer {
    fn header(&self) -> &LayerHeader;

    /// Forward propagation.
    ///
    /// `input` is `(input_size × batch)`. A layer may rewrite `input` in place
    /// (the convolution layer normalises it); the rewritten tensor is what the
    /// matching `backward` call must receive.
    ///
    /// # Errors
    ///
    /// `DimensionMismatch` on a wrong input shape, `NonFinite` when the result
    /// contains NaN or infinity.
    fn forward(&mut self, input: &mut Tensor) -> Result<Tensor>;

    /// Backward propagation and in-place parameter update.
    ///
    /// `input` is the (possibly rewritten) forward input, `grad_output` is
    /// `dE/dY` with shape `(batch × output_size)`. Returns `dE/dX` with shape
    /// `(batch × input_size)`. Parameters are updated only if every gradient
    /// is finite.
    fn backward(&mut self, iteration: usize, input: &Tensor, grad_output: &Tensor)
        -> Result<Tensor>;

    /// Snapshot of the weight tensor, if the layer has one.
    fn weights(&self) -> Option<Tensor> {
        None
    }

    fn parameter_count(&self) -> usize {
        0
    }

    /// Drops the layer and everything it owns exclusively.
    fn release(self: Box<Self>) {
        log::debug!("released layer '{}' ({})", self.name(), self.kind());
    }

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn name(&self) -> &str {
        &self.header().name
    }

    fn kind(&self) -> LayerKind {
        self.header().kind
    }

    fn input_shape(&self) -> PlaneShape {
        self.header().input
    }

    fn output_shape(&self) -> PlaneShape {
        self.header().output
    }

    fn input_size(&self) -> usize {
        self.header().input.size()
    }

    fn output_size(&self) -> usize {
        self.header().output.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(input: PlaneShape, output: PlaneShape, lr: f32) -> Result<LayerHeader> {
        LayerHeader::new(
            "h",
            LayerKind::Convolution,
            input,
            output,
            lr,
            DecayPolicy::Hyperbolic,
        )
    }

    #[test]
    fn test_header_valid() {
        let h = header(PlaneShape::new(1, 8, 8), PlaneShape::new(4, 6, 6), 0.1).unwrap();
        assert_eq!(h.input.size(), 64);
        assert_eq!(h.output.size(), 144);
    }

    #[test]
    fn test_header_rejects_zero_dims() {
        assert!(header(PlaneShape::new(0, 8, 8), PlaneShape::new(1, 6, 6), 0.1).is_err());
        assert!(header(PlaneShape::new(1, 8, 8), PlaneShape::new(1, 0, 6), 0.1).is_err());
    }

    #[test]
    fn test_header_rejects_growing_output() {
        assert!(header(PlaneShape::new(1, 4, 4), PlaneShape::new(1, 5, 4), 0.1).is_err());
    }

    #[test]
    fn test_header_rejects_tiny_learning_rate() {
        assert!(header(PlaneShape::new(1, 4, 4), PlaneShape::new(1, 2, 2), 0.0).is_err());
        assert!(header(PlaneShape::new(1, 4, 4), PlaneShape::new(1, 2, 2), f32::NAN).is_err());
    }

    #[test]
    fn test_check_backward_rejects_iteration_zero() {
        let h = header(PlaneShape::new(1, 3, 3), PlaneShape::new(1, 1, 1), 0.1).unwrap();
        let x = Tensor::zeros(9, 2);
        let g = Tensor::zeros(2, 1);
        assert!(matches!(
            h.check_backward(0, &x, &g),
            Err(DnnError::InvalidIteration(0))
        ));
        assert!(h.check_backward(1, &x, &g).is_ok());
        assert!(h.check_backward(1, &x, &Tensor::zeros(1, 2)).is_err());
    }
}
