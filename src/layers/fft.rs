//! Frequency-domain evaluation of the convolution forward pass
//!
//! Planes are zero-padded to a 2·3·5-smooth size at least `input + K - 1` in
//! each dimension, so the circular product equals the linear one on the window
//! that is read back. The kernel is flipped before transforming, which turns
//! the frequency-domain product into the same correlation the direct path
//! computes.

use super::conv2d::ConvGeometry;
use crate::tensor::Tensor;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

/// Smallest `m >= n` whose only prime factors are 2, 3 and 5.
pub(crate) fn optimal_dft_size(n: usize) -> usize {
    let mut m = n.max(1);
    loop {
        let mut r = m;
        for p in [2, 3, 5] {
            while r % p == 0 {
                r /= p;
            }
        }
        if r == 1 {
            return m;
        }
        m += 1;
    }
}

/// Kernel spectra and FFT plans for one forward call.
///
/// Built once per call and shared read-only between the per-sample workers.
pub(crate) struct FftConvolver {
    geom: ConvGeometry,
    rows: usize,
    cols: usize,
    row_forward: Arc<dyn Fft<f32>>,
    row_inverse: Arc<dyn Fft<f32>>,
    col_forward: Arc<dyn Fft<f32>>,
    col_inverse: Arc<dyn Fft<f32>>,
    kernel_spectra: Vec<Vec<Complex<f32>>>,
    biases: Vec<f32>,
}

impl FftConvolver {
    pub(crate) fn new(geom: ConvGeometry, weights: &Tensor) -> Self {
        let k = geom.kernel;
        let rows = optimal_dft_size(geom.input.height + k - 1);
        let cols = optimal_dft_size(geom.input.width + k - 1);

        let mut planner = FftPlanner::<f32>::new();
        let mut convolver = Self {
            geom,
            rows,
            cols,
            row_forward: planner.plan_fft_forward(cols),
            row_inverse: planner.plan_fft_inverse(cols),
            col_forward: planner.plan_fft_forward(rows),
            col_inverse: planner.plan_fft_inverse(rows),
            kernel_spectra: Vec::with_capacity(geom.n_output),
            biases: Vec::with_capacity(geom.n_output),
        };

        for o in 0..geom.n_output {
            let taps = weights.row(o);
            let mut buf = vec![Complex::new(0.0, 0.0); rows * cols];
            for ky in 0..k {
                for kx in 0..k {
                    // flipped kernel
                    buf[(k - 1 - ky) * cols + (k - 1 - kx)].re = taps[ky * k + kx];
                }
            }
            convolver.transform(&mut buf, false);
            convolver.kernel_spectra.push(buf);
            convolver.biases.push(taps[k * k]);
        }
        convolver
    }

    /// Convolves one sample `x` (`input.size()` values, plane-major) into
    /// `out` (`output.size()` values), applying bias and the `1/K²` scale.
    pub(crate) fn convolve(&self, x: &[f32], mask: &[bool], out: &mut [f32]) {
        let g = &self.geom;
        let k = g.kernel;
        let (in_h, in_w) = (g.input.height, g.input.width);
        let (out_h, out_w) = (g.output.height, g.output.width);
        let n = self.rows * self.cols;
        let inv_n = 1.0 / n as f32;
        let inv_k2 = 1.0 / (k * k) as f32;

        let spectra: Vec<Vec<Complex<f32>>> = x
            .chunks_exact(in_h * in_w)
            .map(|plane| {
                let mut buf = vec![Complex::new(0.0, 0.0); n];
                for (y, src) in plane.chunks_exact(in_w).enumerate() {
                    for (dst, &v) in buf[y * self.cols..y * self.cols + in_w].iter_mut().zip(src) {
                        dst.re = v;
                    }
                }
                self.transform(&mut buf, false);
                buf
            })
            .collect();

        let mut acc = vec![Complex::new(0.0, 0.0); n];
        for (o, out_plane) in out.chunks_exact_mut(out_h * out_w).enumerate() {
            acc.fill(Complex::new(0.0, 0.0));
            let mut connected = false;
            for (i, spectrum) in spectra.iter().enumerate() {
                if !mask[o * g.n_input + i] {
                    continue;
                }
                connected = true;
                for (a, &s) in acc.iter_mut().zip(spectrum) {
                    *a += s;
                }
            }
            if connected {
                for (a, &h) in acc.iter_mut().zip(&self.kernel_spectra[o]) {
                    *a *= h;
                }
                self.transform(&mut acc, true);
            }

            for oy in 0..out_h {
                let src = &acc[(oy + k - 1) * self.cols + (k - 1)..];
                for (ox, dst) in out_plane[oy * out_w..(oy + 1) * out_w].iter_mut().enumerate() {
                    *dst = (src[ox].re * inv_n + self.biases[o]) * inv_k2;
                }
            }
        }
    }

    /// Unnormalised 2D transform: rows, then columns.
    fn transform(&self, buf: &mut [Complex<f32>], inverse: bool) {
        let (row_plan, col_plan) = if inverse {
            (&self.row_inverse, &self.col_inverse)
        } else {
            (&self.row_forward, &self.col_forward)
        };
        row_plan.process(buf);

        let (rows, cols) = (self.rows, self.cols);
        let mut columns = vec![Complex::new(0.0, 0.0); rows * cols];
        for r in 0..rows {
            for c in 0..cols {
                columns[c * rows + r] = buf[r * cols + c];
            }
        }
        col_plan.process(&mut columns);
        for c in 0..cols {
            for r in 0..rows {
                buf[r * cols + c] = columns[c * rows + r];
            }
        }
    }
}
