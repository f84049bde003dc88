//! Subsampling (average pooling) layer
//!
//! Each `scale × scale` block of a plane is averaged, multiplied by a
//! trainable per-plane coefficient and shifted by a trainable per-plane bias.
//! Rows and columns that do not fill a whole block are ignored.

use super::r#trait::{Layer, LayerHeader, LayerKind, PlaneShape};
use crate::error::{DnnError, Result};
use crate::tensor::Tensor;
use crate::utils::DecayPolicy;
use std::any::Any;

/// Average pooling with weights `n_planes × 2` (`[coefficient, bias]`).
pub struct SubsamplingLayer {
    header: LayerHeader,
    scale: usize,
    weights: Tensor,
    pooled: Option<Tensor>,
}

impl SubsamplingLayer {
    pub fn new(
        name: impl Into<String>,
        input: PlaneShape,
        scale: usize,
        init_learn_rate: f32,
        decay: DecayPolicy,
    ) -> Result<Self> {
        let name = name.into();
        if scale < 1 || scale > input.height || scale > input.width {
            return Err(DnnError::InvalidParameter(format!(
                "layer '{}': subsampling scale {} invalid for input {}",
                name, scale, input
            )));
        }
        let output = PlaneShape::new(input.planes, input.height / scale, input.width / scale);
        let header = LayerHeader::new(name, LayerKind::Subsampling, input, output, init_learn_rate, decay)?;

        let mut weights = Tensor::zeros(input.planes, 2);
        for p in 0..input.planes {
            weights.set(p, 0, 1.0);
        }
        log::debug!("subsampling layer '{}': {} -> {}, scale {}", header.name, input, output, scale);
        Ok(Self {
            header,
            scale,
            weights,
            pooled: None,
        })
    }

    pub fn scale(&self) -> usize {
        self.scale
    }

    /// Block averages of one sample column.
    fn pool(&self, input: &Tensor, s: usize, out: &mut Tensor) {
        let (inp, outp) = (self.header.input, self.header.output);
        let inv = 1.0 / (self.scale * self.scale) as f32;
        for p in 0..inp.planes {
            for oy in 0..outp.height {
                for ox in 0..outp.width {
                    let mut acc = 0.0;
                    for dy in 0..self.scale {
                        for dx in 0..self.scale {
                            let row = p * inp.plane_len() + (oy * self.scale + dy) * inp.width + ox * self.scale + dx;
                            acc += input.get(row, s);
                        }
                    }
                    out.set(p * outp.plane_len() + oy * outp.width + ox, s, acc * inv);
                }
            }
        }
    }
}

impl Layer for SubsamplingLayer {
    fn header(&self) -> &LayerHeader {
        &self.header
    }

    fn forward(&mut self, input: &mut Tensor) -> Result<Tensor> {
        self.header.check_forward(input)?;
        let outp = self.header.output;
        let mut pooled = Tensor::zeros(outp.size(), input.cols());
        for s in 0..input.cols() {
            self.pool(input, s, &mut pooled);
        }
        let mut y = pooled.clone();
        for p in 0..outp.planes {
            let (coef, bias) = (self.weights.get(p, 0), self.weights.get(p, 1));
            for r in p * outp.plane_len()..(p + 1) * outp.plane_len() {
                for v in y.row_mut(r) {
                    *v = coef * *v + bias;
                }
            }
        }
        if y.has_non_finite() {
            return Err(DnnError::NonFinite {
                layer: self.header.name.clone(),
                stage: "forward",
            });
        }
        self.pooled = Some(pooled);
        Ok(y)
    }

    fn backward(&mut self, iteration: usize, input: &Tensor, grad_output: &Tensor) -> Result<Tensor> {
        self.header.check_backward(iteration, input, grad_output)?;
        let batch = input.cols();
        let pooled = match &self.pooled {
            Some(p) if p.cols() == batch => p,
            _ => return Err(DnnError::MissingForwardState(self.header.name.clone())),
        };
        let step = self.header.step_size(iteration)?;
        let (inp, outp) = (self.header.input, self.header.output);
        let inv = 1.0 / (self.scale * self.scale) as f32;

        let mut grad_input = Tensor::zeros(batch, inp.size());
        let mut grad_w = Tensor::zeros(inp.planes, 2);
        for s in 0..batch {
            for p in 0..outp.planes {
                let coef = self.weights.get(p, 0);
                for oy in 0..outp.height {
                    for ox in 0..outp.width {
                        let j = p * outp.plane_len() + oy * outp.width + ox;
                        let g = grad_output.get(s, j);
                        grad_w.set(p, 0, grad_w.get(p, 0) + g * pooled.get(j, s));
                        grad_w.set(p, 1, grad_w.get(p, 1) + g);
                        for dy in 0..self.scale {
                            for dx in 0..self.scale {
                                let q = p * inp.plane_len() + (oy * self.scale + dy) * inp.width + ox * self.scale + dx;
                                grad_input.set(s, q, g * coef * inv);
                            }
                        }
                    }
                }
            }
        }
        grad_w.scale(1.0 / batch as f32);

        if grad_input.has_non_finite() || grad_w.has_non_finite() {
            return Err(DnnError::NonFinite {
                layer: self.header.name.clone(),
                stage: "backward",
            });
        }
        self.weights.add_scaled(&grad_w, -step)?;
        Ok(grad_input)
    }

    fn weights(&self) -> Option<Tensor> {
        Some(self.weights.clone())
    }

    fn parameter_count(&self) -> usize {
        self.weights.len()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
