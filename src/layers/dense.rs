//! Fully connected layer
//!
//! Affine map `y = f(W·x + b)` over a flat `n_inputs` vector. The input may be
//! the previous layer's flattened output or the concatenated outputs of
//! several auxiliary source layers.

use super::r#trait::{Layer, LayerHeader, LayerKind, PlaneShape};
use crate::error::{DnnError, Result};
use crate::tensor::Tensor;
use crate::utils::{Activation, DecayPolicy, SimpleRng};
use std::any::Any;

/// Fully connected layer with weights stored as `n_outputs × (n_inputs + 1)`,
/// bias in the last column.
///
/// # Example
///
/// ```ignore
/// use rust_cnn::layers::FullyConnectedLayer;
/// use rust_cnn::utils::{DecayPolicy, SimpleRng};
///
/// let mut rng = SimpleRng::new(42);
/// let fc = FullyConnectedLayer::new("fc", 144, 10, 0.1, DecayPolicy::SqrtInverse, &mut rng)?;
/// assert_eq!(fc.parameter_count(), 10 * 145);
/// ```
pub struct FullyConnectedLayer {
    header: LayerHeader,
    weights: Tensor,
    activation: Activation,
    wx: Option<Tensor>,
    last_grad: Option<Tensor>,
}

impl FullyConnectedLayer {
    /// Create a layer with Xavier initialisation.
    ///
    /// Weights are uniform in `[-limit, limit]` with
    /// `limit = sqrt(6 / (n_inputs + n_outputs))`; biases start at zero.
    pub fn new(
        name: impl Into<String>,
        n_inputs: usize,
        n_outputs: usize,
        init_learn_rate: f32,
        decay: DecayPolicy,
        rng: &mut SimpleRng,
    ) -> Result<Self> {
        let header = LayerHeader::new(
            name,
            LayerKind::FullyConnected,
            PlaneShape::flat(n_inputs),
            PlaneShape::flat(n_outputs),
            init_learn_rate,
            decay,
        )?;

        let limit = (6.0f32 / (n_inputs + n_outputs) as f32).sqrt();
        let mut weights = Tensor::zeros(n_outputs, n_inputs + 1);
        for o in 0..n_outputs {
            for w in weights.row_mut(o)[..n_inputs].iter_mut() {
                *w = rng.gen_range_f32(-limit, limit);
            }
        }

        log::debug!(
            "fully connected layer '{}': {} -> {}, lr {}, {}",
            header.name,
            n_inputs,
            n_outputs,
            init_learn_rate,
            decay
        );

        Ok(Self {
            header,
            weights,
            activation: Activation::default(),
            wx: None,
            last_grad: None,
        })
    }

    /// Replaces the weights with an explicit `n_outputs × (n_inputs + 1)` tensor.
    pub fn with_weights(mut self, weights: Tensor) -> Result<Self> {
        let expected = (self.header.output.size(), self.header.input.size() + 1);
        if weights.shape() != expected {
            return Err(DnnError::dims(
                format!("weights of '{}'", self.header.name),
                format!("{}x{}", expected.0, expected.1),
                format!("{}x{}", weights.rows(), weights.cols()),
            ));
        }
        self.weights = weights;
        Ok(self)
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    /// Weight gradient applied by the last backward call.
    pub fn last_weight_gradient(&self) -> Option<&Tensor> {
        self.last_grad.as_ref()
    }

    fn linear_part(&self) -> Result<Tensor> {
        self.weights.columns(0, self.header.input.size())
    }
}

impl Layer for FullyConnectedLayer {
    fn header(&self) -> &LayerHeader {
        &self.header
    }

    fn forward(&mut self, input: &mut Tensor) -> Result<Tensor> {
        self.header.check_forward(input)?;
        let n_in = self.header.input.size();
        let mut wx = self.linear_part()?.matmul(input)?;
        for o in 0..wx.rows() {
            let bias = self.weights.get(o, n_in);
            for v in wx.row_mut(o) {
                *v += bias;
            }
        }

        let mut y = wx.clone();
        let activation = self.activation;
        y.map_inplace(|z| activation.apply(z));
        if y.has_non_finite() {
            log::warn!("non-finite output in fully connected layer '{}'", self.header.name);
            return Err(DnnError::NonFinite {
                layer: self.header.name.clone(),
                stage: "forward",
            });
        }
        self.wx = Some(wx);
        Ok(y)
    }

    fn backward(&mut self, iteration: usize, input: &Tensor, grad_output: &Tensor) -> Result<Tensor> {
        self.header.check_backward(iteration, input, grad_output)?;
        let batch = input.cols();
        let wx = match &self.wx {
            Some(wx) if wx.cols() == batch => wx,
            _ => return Err(DnnError::MissingForwardState(self.header.name.clone())),
        };
        let step = self.header.step_size(iteration)?;

        let mut delta = grad_output.clone();
        if self.activation != Activation::None {
            for s in 0..batch {
                for (o, d) in delta.row_mut(s).iter_mut().enumerate() {
                    *d *= self.activation.derivative(wx.get(o, s));
                }
            }
        }

        let n_in = self.header.input.size();
        let grad_input = delta.matmul(&self.linear_part()?)?;
        let grad_linear = delta.transpose().matmul(&input.transpose())?;

        let mut grad_w = Tensor::zeros(self.weights.rows(), n_in + 1);
        for o in 0..grad_w.rows() {
            let row = grad_w.row_mut(o);
            row[..n_in].copy_from_slice(grad_linear.row(o));
            row[n_in] = (0..batch).map(|s| delta.get(s, o)).sum();
        }
        grad_w.scale(1.0 / batch as f32);

        if grad_input.has_non_finite() || grad_w.has_non_finite() {
            log::warn!("non-finite gradient in fully connected layer '{}'", self.header.name);
            return Err(DnnError::NonFinite {
                layer: self.header.name.clone(),
                stage: "backward",
            });
        }

        self.weights.add_scaled(&grad_w, -step)?;
        self.last_grad = Some(grad_w);
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
