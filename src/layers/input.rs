//! Input data layer
//!
//! First layer of every network: declares the image geometry and the sequence
//! length used by the sampler. Forward and backward are identities.

use super::r#trait::{Layer, LayerHeader, LayerKind, PlaneShape};
use crate::error::{DnnError, Result};
use crate::tensor::Tensor;
use std::any::Any;

pub struct InputDataLayer {
    header: LayerHeader,
    seq_length: usize,
}

impl InputDataLayer {
    pub fn new(name: impl Into<String>, shape: PlaneShape) -> Result<Self> {
        Self::with_seq_length(name, shape, 1)
    }

    /// `seq_length` consecutive images form one sample window; the sampler
    /// never starts a window in the last `seq_length - 1` images.
    pub fn with_seq_length(name: impl Into<String>, shape: PlaneShape, seq_length: usize) -> Result<Self> {
        let header = LayerHeader::weightless(name, LayerKind::InputData, shape, shape)?;
        if seq_length < 1 {
            return Err(DnnError::InvalidParameter(format!(
                "layer '{}': sequence length must be >= 1",
                header.name
            )));
        }
        log::debug!("input layer '{}': {}, seq_length {}", header.name, shape, seq_length);
        Ok(Self { header, seq_length })
    }

    pub fn seq_length(&self) -> usize {
        self.seq_length
    }
}

impl Layer for InputDataLayer {
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
