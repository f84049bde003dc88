//! Convolution layer
//!
//! Valid (unpadded, stride 1) 2D convolution with one square `K×K` filter per
//! output plane, shared across the input planes connected to it. The forward
//! pass is available as a direct spatial loop or through the FFT; both produce
//! `(Σ x·w + b) / K²` at every output position.
//!
//! Weights are stored as an `n_output_planes × (K² + 1)` tensor whose last
//! column is the bias. Two layers can share one weight tensor (weight tying).

use super::fft::FftConvolver;
use super::r#trait::{Layer, LayerHeader, LayerKind, PlaneShape};
use crate::error::{DnnError, Result};
use crate::tensor::Tensor;
use crate::utils::{Activation, DecayPolicy, SimpleRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

/// Weight tensor handle shared between tied layers.
pub type SharedWeights = Rc<RefCell<Tensor>>;

/// Forward evaluation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConvMethod {
    #[default]
    Direct,
    Fft,
}

/// Plain-data geometry handed to the parallel workers.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ConvGeometry {
    pub input: PlaneShape,
    pub output: PlaneShape,
    pub n_input: usize,
    pub n_output: usize,
    pub kernel: usize,
}

/// Convolution layer with optional weight tying and plane connectivity mask.
///
/// # Example
///
/// ```ignore
/// use rust_cnn::layers::{ConvolutionLayer, PlaneShape};
/// use rust_cnn::utils::{DecayPolicy, SimpleRng};
///
/// let mut rng = SimpleRng::new(42);
/// let conv = ConvolutionLayer::new(
///     "conv1", PlaneShape::new(1, 28, 28), 8, 5, 0.05, DecayPolicy::SqrtInverse, &mut rng,
/// )?;
/// assert_eq!(conv.output_shape(), PlaneShape::new(8, 24, 24));
/// ```
pub struct ConvolutionLayer {
    header: LayerHeader,
    kernel_size: usize,
    weights: SharedWeights,
    connect_mask: Vec<bool>,
    activation: Activation,
    method: ConvMethod,
    normalize_input: bool,
    enable_cache: bool,
    wx: Option<Tensor>,
    y: Option<Tensor>,
    jacobian: Option<Tensor>,
    last_grad: Option<Tensor>,
}

impl ConvolutionLayer {
    /// Creates a convolution layer with freshly initialised weights.
    ///
    /// Initial weights are uniform in [-1, 1]; each filter then has its mean
    /// removed (`row_sum / K²` subtracted from every tap) and its bias set to 0.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` if `kernel_size < 1`, the kernel does not fit the
    /// input, or `n_output_planes == 0`; `InvalidLearningRate` if the rate is
    /// outside `(0, 1]`.
    pub fn new(
        name: impl Into<String>,
        input: PlaneShape,
        n_output_planes: usize,
        kernel_size: usize,
        init_learn_rate: f32,
        decay: DecayPolicy,
        rng: &mut SimpleRng,
    ) -> Result<Self> {
        let name = name.into();
        if kernel_size < 1 {
            return Err(DnnError::InvalidParameter(format!(
                "layer '{}': kernel size must be >= 1",
                name
            )));
        }
        if !(init_learn_rate > 0.0 && init_learn_rate <= 1.0) {
            return Err(DnnError::InvalidLearningRate(init_learn_rate));
        }
        if kernel_size > input.height || kernel_size > input.width {
            return Err(DnnError::InvalidParameter(format!(
                "layer '{}': kernel {} does not fit input {}",
                name, kernel_size, input
            )));
        }
        let output = PlaneShape::new(
            n_output_planes,
            input.height - kernel_size + 1,
            input.width - kernel_size + 1,
        );
        let header = LayerHeader::new(
            name,
            LayerKind::Convolution,
            input,
            output,
            init_learn_rate,
            decay,
        )?;

        let taps = kernel_size * kernel_size;
        let mut weights = Tensor::zeros(n_output_planes, taps + 1);
        for o in 0..n_output_planes {
            let row = weights.row_mut(o);
            for w in row[..taps].iter_mut() {
                *w = rng.gen_range_f32(-1.0, 1.0);
            }
            let mean = row[..taps].iter().sum::<f32>() / taps as f32;
            for w in row[..taps].iter_mut() {
                *w -= mean;
            }
            row[taps] = 0.0;
        }

        log::debug!(
            "convolution layer '{}': {} -> {}, kernel {}, lr {}, {}",
            header.name,
            input,
            output,
            kernel_size,
            init_learn_rate,
            decay
        );

        Ok(Self {
            header,
            kernel_size,
            weights: Rc::new(RefCell::new(weights)),
            connect_mask: vec![true; n_output_planes * input.planes],
            activation: Activation::default(),
            method: ConvMethod::default(),
            normalize_input: true,
            enable_cache: true,
            wx: None,
            y: None,
            jacobian: None,
            last_grad: None,
        })
    }

    /// Replaces the weights with an explicit `n_output_planes × (K² + 1)` tensor.
    pub fn with_weights(mut self, weights: Tensor) -> Result<Self> {
        self.check_weight_shape(&weights)?;
        self.weights = Rc::new(RefCell::new(weights));
        Ok(self)
    }

    /// Ties this layer to another layer's weight tensor.
    ///
    /// Backward calls on either layer update the shared tensor.
    pub fn with_shared_weights(mut self, shared: SharedWeights) -> Result<Self> {
        self.check_weight_shape(&shared.borrow())?;
        self.weights = shared;
        Ok(self)
    }

    /// Sets the plane connectivity mask (`n_output_planes × n_input_planes`,
    /// row-major; `true` means connected).
    pub fn with_connect_mask(mut self, mask: Vec<bool>) -> Result<Self> {
        let expected = self.header.output.planes * self.header.input.planes;
        if mask.len() != expected {
            return Err(DnnError::dims(
                format!("connect mask of '{}'", self.header.name),
                expected,
                mask.len(),
            ));
        }
        self.connect_mask = mask;
        Ok(self)
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    pub fn with_method(mut self, method: ConvMethod) -> Self {
        self.method = method;
        self
    }

    /// Turns the per-plane input normalisation on or off (default on).
    pub fn with_input_normalization(mut self, enabled: bool) -> Self {
        self.normalize_input = enabled;
        self
    }

    /// Keeps the `dY/dX` buffer between backward calls (default on).
    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.enable_cache = enabled;
        if !enabled {
            self.jacobian = None;
        }
        self
    }

    pub fn kernel_size(&self) -> usize {
        self.kernel_size
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    pub fn method(&self) -> ConvMethod {
        self.method
    }

    pub fn set_method(&mut self, method: ConvMethod) {
        self.method = method;
    }

    pub fn connect_mask(&self) -> &[bool] {
        &self.connect_mask
    }

    /// Handle to the weight tensor for tying another layer to this one.
    pub fn shared_weights(&self) -> SharedWeights {
        Rc::clone(&self.weights)
    }

    pub fn is_tied_with(&self, other: &ConvolutionLayer) -> bool {
        Rc::ptr_eq(&self.weights, &other.weights)
    }

    /// Pre-activation values of the last forward call, `(output_size × batch)`.
    pub fn cached_wx(&self) -> Option<&Tensor> {
        self.wx.as_ref()
    }

    /// Activated output of the last forward call.
    pub fn cached_output(&self) -> Option<&Tensor> {
        self.y.as_ref()
    }

    /// `dY/dX` from the last backward call when caching is enabled.
    pub fn cached_jacobian(&self) -> Option<&Tensor> {
        self.jacobian.as_ref()
    }

    /// Weight gradient applied by the last backward call.
    pub fn last_weight_gradient(&self) -> Option<&Tensor> {
        self.last_grad.as_ref()
    }

    fn geometry(&self) -> ConvGeometry {
        ConvGeometry {
            input: self.header.input,
            output: self.header.output,
            n_input: self.header.input.planes,
            n_output: self.header.output.planes,
            kernel: self.kernel_size,
        }
    }

    fn check_weight_shape(&self, weights: &Tensor) -> Result<()> {
        let expected = (
            self.header.output.planes,
            self.kernel_size * self.kernel_size + 1,
        );
        if weights.shape() != expected {
            return Err(DnnError::dims(
                format!("weights of '{}'", self.header.name),
                format!("{}x{}", expected.0, expected.1),
                format!("{}x{}", weights.rows(), weights.cols()),
            ));
        }
        Ok(())
    }

    /// Builds `dWX/dX` into `buf`, reusing its allocation when shapes agree.
    fn fill_jacobian(&self, weights: &Tensor, buf: Option<Tensor>) -> Tensor {
        let g = self.geometry();
        let (out_size, in_size) = (g.output.size(), g.input.size());
        let mut jac = match buf {
            Some(mut t) if t.shape() == (out_size, in_size) => {
                t.fill(0.0);
                t
            }
            _ => Tensor::zeros(out_size, in_size),
        };
        let k = g.kernel;
        let inv_k2 = 1.0 / (k * k) as f32;
        let (in_w, out_w) = (g.input.width, g.output.width);
        for o in 0..g.n_output {
            let taps = weights.row(o);
            for i in (0..g.n_input).filter(|&i| self.connect_mask[o * g.n_input + i]) {
                for oy in 0..g.output.height {
                    for ox in 0..out_w {
                        let row = o * g.output.plane_len() + oy * out_w + ox;
                        for ky in 0..k {
                            for kx in 0..k {
                                let col = i * g.input.plane_len() + (oy + ky) * in_w + ox + kx;
                                jac.set(row, col, taps[ky * k + kx] * inv_k2);
                            }
                        }
                    }
                }
            }
        }
        jac
    }
}

/// Rescales every plane of every sample to `(x - mean) · 0.5 / (1e-5 + std)`.
fn normalize_planes(input: &mut Tensor, shape: PlaneShape) {
    let batch = input.cols();
    let plane_len = shape.plane_len();
    for s in 0..batch {
        for p in 0..shape.planes {
            let rows = p * plane_len..(p + 1) * plane_len;
            let n = plane_len as f64;
            let mean = rows.clone().map(|r| input.get(r, s) as f64).sum::<f64>() / n;
            let var = rows
                .clone()
                .map(|r| {
                    let d = input.get(r, s) as f64 - mean;
                    d * d
                })
                .sum::<f64>()
                / n;
            let scale = 0.5 / (1e-5 + var.sqrt());
            for r in rows {
                let v = (input.get(r, s) as f64 - mean) * scale;
                input.set(r, s, v as f32);
            }
        }
    }
}

/// Direct valid correlation of one sample.
fn convolve_direct(g: &ConvGeometry, x: &[f32], weights: &Tensor, mask: &[bool], out: &mut [f32]) {
    let k = g.kernel;
    let inv_k2 = 1.0 / (k * k) as f32;
    let (in_w, out_h, out_w) = (g.input.width, g.output.height, g.output.width);
    let in_plane = g.input.plane_len();
    for (o, out_plane) in out.chunks_exact_mut(out_h * out_w).enumerate() {
        let taps = weights.row(o);
        let bias = taps[k * k];
        for oy in 0..out_h {
            for ox in 0..out_w {
                let mut acc = 0.0f32;
                for i in (0..g.n_input).filter(|&i| mask[o * g.n_input + i]) {
                    let plane = &x[i * in_plane..(i + 1) * in_plane];
                    for ky in 0..k {
                        let src = &plane[(oy + ky) * in_w + ox..(oy + ky) * in_w + ox + k];
                        let w = &taps[ky * k..(ky + 1) * k];
                        for (a, b) in src.iter().zip(w) {
                            acc += a * b;
                        }
                    }
                }
                out_plane[oy * out_w + ox] = (acc + bias) * inv_k2;
            }
        }
    }
}

/// Weight-gradient contribution of one sample, `n_output × (K² + 1)` flattened.
fn sample_weight_gradient(g: &ConvGeometry, x: &[f32], delta: &[f32], mask: &[bool]) -> Vec<f32> {
    let k = g.kernel;
    let taps = k * k;
    let inv_k2 = 1.0 / taps as f32;
    let (in_w, out_h, out_w) = (g.input.width, g.output.height, g.output.width);
    let in_plane = g.input.plane_len();
    let mut grad = vec![0.0f32; g.n_output * (taps + 1)];
    for o in 0..g.n_output {
        let row = &mut grad[o * (taps + 1)..(o + 1) * (taps + 1)];
        for oy in 0..out_h {
            for ox in 0..out_w {
                let d = delta[o * out_h * out_w + oy * out_w + ox];
                if d == 0.0 {
                    continue;
                }
                for ky in 0..k {
                    for kx in 0..k {
                        let offset = (oy + ky) * in_w + ox + kx;
                        let sum: f32 = (0..g.n_input)
                            .filter(|&i| mask[o * g.n_input + i])
                            .map(|i| x[i * in_plane + offset])
                            .sum();
                        row[ky * k + kx] += d * sum * inv_k2;
                    }
                }
                row[taps] += d * inv_k2;
            }
        }
    }
    grad
}

impl Layer for ConvolutionLayer {
    fn header(&self) -> &LayerHeader {
        &self.header
    }

    fn forward(&mut self, input: &mut Tensor) -> Result<Tensor> {
        self.header.check_forward(input)?;
        if self.normalize_input {
            normalize_planes(input, self.header.input);
        }

        let g = self.geometry();
        let weights = self.weights.borrow().clone();
        let mask = self.connect_mask.as_slice();
        let samples = input.transpose();
        let mut wx_t = Tensor::zeros(input.cols(), g.output.size());

        match self.method {
            ConvMethod::Direct => {
                wx_t.as_mut_slice()
                    .par_chunks_mut(g.output.size())
                    .zip(samples.as_slice().par_chunks(g.input.size()))
                    .for_each(|(out, x)| convolve_direct(&g, x, &weights, mask, out));
            }
            ConvMethod::Fft => {
                let convolver = FftConvolver::new(g, &weights);
                wx_t.as_mut_slice()
                    .par_chunks_mut(g.output.size())
                    .zip(samples.as_slice().par_chunks(g.input.size()))
                    .for_each(|(out, x)| convolver.convolve(x, mask, out));
            }
        }

        let wx = wx_t.transpose();
        let mut y = wx.clone();
        let activation = self.activation;
        y.map_inplace(|z| activation.apply(z));
        if y.has_non_finite() {
            log::warn!("non-finite output in convolution layer '{}'", self.header.name);
            return Err(DnnError::NonFinite {
                layer: self.header.name.clone(),
                stage: "forward",
            });
        }

        self.wx = Some(wx);
        self.y = Some(y.clone());
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
                for (j, d) in delta.row_mut(s).iter_mut().enumerate() {
                    *d *= self.activation.derivative(wx.get(j, s));
                }
            }
        }

        let g = self.geometry();
        let weights = self.weights.borrow().clone();
        let cached = if self.enable_cache { self.jacobian.take() } else { None };
        let jacobian = self.fill_jacobian(&weights, cached);
        let grad_input = delta.matmul(&jacobian)?;

        let mask = self.connect_mask.as_slice();
        let samples = input.transpose();
        let partials: Vec<Vec<f32>> = samples
            .as_slice()
            .par_chunks(g.input.size())
            .zip(delta.as_slice().par_chunks(g.output.size()))
            .map(|(x, d)| sample_weight_gradient(&g, x, d, mask))
            .collect();

        let mut grad_w = Tensor::zeros(weights.rows(), weights.cols());
        for partial in &partials {
            for (acc, &p) in grad_w.as_mut_slice().iter_mut().zip(partial) {
                *acc += p;
            }
        }
        grad_w.scale(1.0 / batch as f32);

        if self.enable_cache {
            self.jacobian = Some(jacobian);
        }

        if grad_input.has_non_finite() || grad_w.has_non_finite() {
            log::warn!("non-finite gradient in convolution layer '{}'", self.header.name);
            return Err(DnnError::NonFinite {
                layer: self.header.name.clone(),
                stage: "backward",
            });
        }

        self.weights.borrow_mut().add_scaled(&grad_w, -step)?;
        self.last_grad = Some(grad_w);
        Ok(grad_input)
    }

    fn weights(&self) -> Option<Tensor> {
        Some(self.weights.borrow().clone())
    }

    fn parameter_count(&self) -> usize {
        self.header.output.planes * (self.kernel_size * self.kernel_size + 1)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn layer(input: PlaneShape, out_planes: usize, k: usize) -> ConvolutionLayer {
        let mut rng = SimpleRng::new(42);
        ConvolutionLayer::new("conv", input, out_planes, k, 0.1, DecayPolicy::SqrtInverse, &mut rng)
            .unwrap()
    }

    #[test]
    fn test_output_shape() {
        let conv = layer(PlaneShape::new(1, 28, 28), 8, 5);
        assert_eq!(conv.output_shape(), PlaneShape::new(8, 24, 24));
        assert_eq!(conv.parameter_count(), 8 * 26);
    }

    #[test]
    fn test_invalid_parameters() {
        let mut rng = SimpleRng::new(1);
        let shape = PlaneShape::new(1, 8, 8);
        assert!(matches!(
            ConvolutionLayer::new("c", shape, 2, 0, 0.1, DecayPolicy::Hyperbolic, &mut rng),
            Err(DnnError::InvalidParameter(_))
        ));
        assert!(matches!(
            ConvolutionLayer::new("c", shape, 2, 3, 0.0, DecayPolicy::Hyperbolic, &mut rng),
            Err(DnnError::InvalidLearningRate(_))
        ));
        assert!(matches!(
            ConvolutionLayer::new("c", shape, 2, 3, 1.5, DecayPolicy::Hyperbolic, &mut rng),
            Err(DnnError::InvalidLearningRate(_))
        ));
        assert!(ConvolutionLayer::new("c", shape, 2, 9, 0.1, DecayPolicy::Hyperbolic, &mut rng).is_err());
        assert!(ConvolutionLayer::new("c", shape, 2, 3, 1.0, DecayPolicy::Hyperbolic, &mut rng).is_ok());
    }

    #[test]
    fn test_initial_filters_are_zero_mean() {
        let conv = layer(PlaneShape::new(2, 10, 10), 6, 3);
        let w = conv.weights().unwrap();
        for o in 0..6 {
            let row = w.row(o);
            let sum: f32 = row[..9].iter().sum();
            assert!(sum.abs() < 1e-5);
            assert_eq!(row[9], 0.0);
            assert!(row[..9].iter().all(|v| v.abs() <= 2.0));
        }
    }

    #[test]
    fn test_known_direct_output() {
        // 3x3 input, 2x2 all-ones kernel, bias 1
        let weights = Tensor::from_vec(1, 5, vec![1.0, 1.0, 1.0, 1.0, 1.0]).unwrap();
        let mut conv = layer(PlaneShape::new(1, 3, 3), 1, 2)
            .with_weights(weights)
            .unwrap()
            .with_activation(Activation::None)
            .with_input_normalization(false);
        let mut x = Tensor::from_vec(9, 1, (1..=9).map(|v| v as f32).collect()).unwrap();
        let y = conv.forward(&mut x).unwrap();
        // windows: 1+2+4+5=12, 2+3+5+6=16, 4+5+7+8=24, 5+6+8+9=28; (s + 1) / 4
        assert_eq!(y.shape(), (4, 1));
        assert_relative_eq!(y.get(0, 0), 13.0 / 4.0);
        assert_relative_eq!(y.get(1, 0), 17.0 / 4.0);
        assert_relative_eq!(y.get(2, 0), 25.0 / 4.0);
        assert_relative_eq!(y.get(3, 0), 29.0 / 4.0);
    }

    #[test]
    fn test_input_normalization_in_place() {
        let mut conv = layer(PlaneShape::new(1, 4, 4), 1, 3);
        let mut x = Tensor::from_vec(16, 1, (0..16).map(|v| v as f32 * 3.0 + 7.0).collect()).unwrap();
        conv.forward(&mut x).unwrap();
        let mean: f32 = x.as_slice().iter().sum::<f32>() / 16.0;
        let var: f32 = x.as_slice().iter().map(|v| (v - mean).powi(2)).sum::<f32>() / 16.0;
        assert!(mean.abs() < 1e-5);
        assert_relative_eq!(var.sqrt(), 0.5, epsilon = 1e-4);
    }

    #[test]
    fn test_connect_mask_disconnects_planes() {
        let mut conv = layer(PlaneShape::new(2, 5, 5), 2, 3)
            .with_connect_mask(vec![true, false, false, true])
            .unwrap()
            .with_input_normalization(false)
            .with_activation(Activation::None);
        // second plane only: output plane 0 sees nothing but the bias
        let mut data = vec![0.0f32; 50];
        for v in data[25..].iter_mut() {
            *v = 1.0;
        }
        let mut x = Tensor::from_vec(50, 1, data).unwrap();
        let y = conv.forward(&mut x).unwrap();
        for r in 0..9 {
            assert_eq!(y.get(r, 0), 0.0);
        }
        assert!(conv.with_connect_mask(vec![true; 3]).is_err());
    }

    #[test]
    fn test_backward_requires_forward() {
        let mut conv = layer(PlaneShape::new(1, 5, 5), 1, 3);
        let x = Tensor::zeros(25, 2);
        let g = Tensor::zeros(2, 9);
        assert!(matches!(
            conv.backward(1, &x, &g),
            Err(DnnError::MissingForwardState(_))
        ));
    }

    #[test]
    fn test_backward_iteration_zero_rejected_before_update() {
        let mut conv = layer(PlaneShape::new(1, 5, 5), 1, 3);
        let mut x = Tensor::filled(25, 1, 0.3);
        x.set(4, 0, 1.0);
        conv.forward(&mut x).unwrap();
        let before = conv.weights().unwrap();
        let g = Tensor::filled(1, 9, 1.0);
        assert!(matches!(
            conv.backward(0, &x, &g),
            Err(DnnError::InvalidIteration(0))
        ));
        assert_eq!(conv.weights().unwrap(), before);
    }

    #[test]
    fn test_non_finite_forward_is_reported() {
        let mut conv = layer(PlaneShape::new(1, 3, 3), 1, 2).with_input_normalization(false);
        let mut x = Tensor::zeros(9, 1);
        x.set(0, 0, f32::NAN);
        assert!(matches!(
            conv.forward(&mut x),
            Err(DnnError::NonFinite { stage: "forward", .. })
        ));
    }

    #[test]
    fn test_jacobian_cache_reused() {
        let mut conv = layer(PlaneShape::new(1, 5, 5), 2, 3);
        let mut x = Tensor::from_vec(25, 1, (0..25).map(|v| (v % 7) as f32).collect()).unwrap();
        conv.forward(&mut x).unwrap();
        conv.backward(1, &x, &Tensor::filled(1, 18, 0.1)).unwrap();
        assert_eq!(conv.cached_jacobian().unwrap().shape(), (18, 25));

        let mut uncached = layer(PlaneShape::new(1, 5, 5), 2, 3).with_cache(false);
        let mut x2 = Tensor::from_vec(25, 1, (0..25).map(|v| (v % 7) as f32).collect()).unwrap();
        uncached.forward(&mut x2).unwrap();
        uncached.backward(1, &x2, &Tensor::filled(1, 18, 0.1)).unwrap();
        assert!(uncached.cached_jacobian().is_none());
    }

    #[test]
    fn test_tied_layers_share_updates() {
        let first = layer(PlaneShape::new(1, 6, 6), 2, 3);
        let mut rng = SimpleRng::new(9);
        let mut second =
            ConvolutionLayer::new("tied", PlaneShape::new(2, 4, 4), 2, 3, 0.1, DecayPolicy::Hyperbolic, &mut rng)
                .unwrap()
                .with_shared_weights(first.shared_weights())
                .unwrap();
        assert!(second.is_tied_with(&first));

        let mut x = Tensor::from_vec(32, 1, (0..32).map(|v| (v % 5) as f32).collect()).unwrap();
        second.forward(&mut x).unwrap();
        second.backward(1, &x, &Tensor::filled(1, 8, 0.5)).unwrap();
        assert_eq!(first.weights().unwrap(), second.weights().unwrap());

        let mut rng = SimpleRng::new(3);
        let mismatched =
            ConvolutionLayer::new("bad", PlaneShape::new(1, 6, 6), 3, 3, 0.1, DecayPolicy::Hyperbolic, &mut rng)
                .unwrap();
        assert!(mismatched.with_shared_weights(first.shared_weights()).is_err());
    }
}
