//! Cropping layer
//!
//! Keeps the centred `output.height × output.width` window of every plane.
//! When the margin is odd the extra row or column is dropped at the bottom or
//! right.

use super::r#trait::{Layer, LayerHeader, LayerKind, PlaneShape};
use crate::error::{DnnError, Result};
use crate::tensor::Tensor;
use std::any::Any;

pub struct CroppingLayer {
    header: LayerHeader,
}

impl CroppingLayer {
    pub fn new(name: impl Into<String>, input: PlaneShape, height: usize, width: usize) -> Result<Self> {
        let output = PlaneShape::new(input.planes, height, width);
        let header = LayerHeader::weightless(name, LayerKind::Cropping, input, output)?;
        log::debug!("cropping layer '{}': {} -> {}", header.name, input, output);
        Ok(Self { header })
    }

    fn offset(&self) -> (usize, usize) {
        let (inp, outp) = (self.header.input, self.header.output);
        ((inp.height - outp.height) / 2, (inp.width - outp.width) / 2)
    }

    /// Maps an output row index to the input row it copies.
    fn source_row(&self, j: usize) -> usize {
        let (inp, outp) = (self.header.input, self.header.output);
        let (dy, dx) = self.offset();
        let p = j / outp.plane_len();
        let y = (j % outp.plane_len()) / outp.width;
        let x = j % outp.width;
        p * inp.plane_len() + (y + dy) * inp.width + x + dx
    }
}

impl Layer for CroppingLayer {
    fn header(&self) -> &LayerHeader {
        &self.header
    }

    fn forward(&mut self, input: &mut Tensor) -> Result<Tensor> {
        self.header.check_forward(input)?;
        let rows: Vec<usize> = (0..self.header.output.size()).map(|j| self.source_row(j)).collect();
        input.select_rows(&rows)
    }

    fn backward(&mut self, iteration: usize, input: &Tensor, grad_output: &Tensor) -> Result<Tensor> {
        self.header.check_backward(iteration, input, grad_output)?;
        let mut grad_input = Tensor::zeros(input.cols(), self.header.input.size());
        for s in 0..input.cols() {
            for j in 0..self.header.output.size() {
                grad_input.set(s, self.source_row(j), grad_output.get(s, j));
            }
        }
        if grad_input.has_non_finite() {
            return Err(DnnError::NonFinite {
                layer: self.header.name.clone(),
                stage: "backward",
            });
        }
        Ok(grad_input)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
