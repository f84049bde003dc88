//! Multi-target layer
//!
//! Collects the outputs of several earlier layers into one output vector, so a
//! network can be trained against targets for more than one head. Its input is
//! the concatenation of its auxiliary sources; forward and backward are
//! identities.

use super::r#trait::{Layer, LayerHeader, LayerKind, PlaneShape};
use crate::error::Result;
use crate::tensor::Tensor;
use std::any::Any;

/// Upper bound on the number of sources.
pub const MAX_TARGETS: usize = 100;

pub struct MultiTargetLayer {
    header: LayerHeader,
}

impl MultiTargetLayer {
    /// `total_size` is the summed flattened output size of the sources.
    pub fn new(name: impl Into<String>, total_size: usize) -> Result<Self> {
        let shape = PlaneShape::flat(total_size);
        let header = LayerHeader::weightless(name, LayerKind::MultiTarget, shape, shape)?;
        Ok(Self { header })
    }
}

impl Layer for MultiTargetLayer {
    fn header(&self) -> &LayerHeader {
        &self.header
    }

    fn forward(&mut self, input: &mut Tensor) -> Result<Tensor> {
        self.header.check_forward(input)?;
        Ok(input.clone())
    }

    fn backward(&mut self, iteration: usize, input: &Tensor, grad_output: &Tensor) -> Result<Tensor> {
        self.header.check_backward(iteration, input, grad_output)?;
        Ok(grad_output.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
