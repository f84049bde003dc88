//! Dense 2D tensor primitive
//!
//! Row-major `f32` matrix used for activations, gradients and weights.
//! Shape conventions used by the layers:
//!
//! - forward inputs/outputs are `(features × batch)`, one column per sample
//! - gradients are `(batch × features)`, one row per sample
//! - weights are `(out × in + 1)` with the bias in the last column
//!
//! Operations that produce a result allocate a new tensor; in-place variants
//! take `&mut self`.

use crate::error::{DnnError, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Row-major 2D buffer of `f32`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl Tensor {
    /// Tensor of the given shape filled with zeros.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self::filled(rows, cols, 0.0)
    }

    pub fn filled(rows: usize, cols: usize, value: f32) -> Self {
        Self {
            rows,
            cols,
            data: vec![value; rows * cols],
        }
    }

    /// Wraps a row-major buffer, checking that its length matches the shape.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(DnnError::dims(
                "Tensor::from_vec",
                format!("{} elements ({}x{})", rows * cols, rows, cols),
                format!("{} elements", data.len()),
            ));
        }
        Ok(Self { rows, cols, data })
    }

    /// Builds a tensor from equally sized rows.
    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self> {
        let cols = rows.first().map_or(0, |r| r.len());
        let mut data = Vec::with_capacity(rows.len() * cols);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != cols {
                return Err(DnnError::dims(
                    format!("Tensor::from_rows row {}", i),
                    cols,
                    row.len(),
                ));
            }
            data.extend_from_slice(row);
        }
        Ok(Self {
            rows: rows.len(),
            cols,
            data,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.data[row * self.cols + col]
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, value: f32) {
        self.data[row * self.cols + col] = value;
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    pub fn row(&self, row: usize) -> &[f32] {
        &self.data[row * self.cols..(row + 1) * self.cols]
    }

    pub fn row_mut(&mut self, row: usize) -> &mut [f32] {
        let cols = self.cols;
        &mut self.data[row * cols..(row + 1) * cols]
    }

    /// Returns the transposed copy.
    pub fn transpose(&self) -> Tensor {
        let mut out = Tensor::zeros(self.cols, self.rows);
        for r in 0..self.rows {
            for c in 0..self.cols {
                out.data[c * self.rows + r] = self.data[r * self.cols + c];
            }
        }
        out
    }

    /// Matrix product `self × other`.
    ///
    /// Output rows are computed in parallel; each row is accumulated in a
    /// fixed order so results do not depend on the thread count.
    pub fn matmul(&self, other: &Tensor) -> Result<Tensor> {
        if self.cols != other.rows {
            return Err(DnnError::dims(
                "matmul",
                format!("lhs cols == rhs rows ({})", self.cols),
                format!("{}x{} × {}x{}", self.rows, self.cols, other.rows, other.cols),
            ));
        }
        let mut out = Tensor::zeros(self.rows, other.cols);
        if out.is_empty() {
            return Ok(out);
        }
        let n = other.cols;
        out.data
            .par_chunks_mut(n)
            .enumerate()
            .for_each(|(i, out_row)| {
                let lhs_row = &self.data[i * self.cols..(i + 1) * self.cols];
                for (k, &a) in lhs_row.iter().enumerate() {
                    if a == 0.0 {
                        continue;
                    }
                    let rhs_row = &other.data[k * n..(k + 1) * n];
                    for (o, &b) in out_row.iter_mut().zip(rhs_row) {
                        *o += a * b;
                    }
                }
            });
        Ok(out)
    }

    /// `self += alpha * other`.
    pub fn add_scaled(&mut self, other: &Tensor, alpha: f32) -> Result<()> {
        self.check_same_shape(other, "add_scaled")?;
        for (a, &b) in self.data.iter_mut().zip(&other.data) {
            *a += alpha * b;
        }
        Ok(())
    }

    /// Elementwise difference `self - other`.
    pub fn sub(&self, other: &Tensor) -> Result<Tensor> {
        self.check_same_shape(other, "sub")?;
        let data = self
            .data
            .iter()
            .zip(&other.data)
            .map(|(&a, &b)| a - b)
            .collect();
        Ok(Tensor {
            rows: self.rows,
            cols: self.cols,
            data,
        })
    }

    pub fn scale(&mut self, alpha: f32) {
        for v in &mut self.data {
            *v *= alpha;
        }
    }

    pub fn map_inplace<F: Fn(f32) -> f32>(&mut self, f: F) {
        for v in &mut self.data {
            *v = f(*v);
        }
    }

    pub fn fill(&mut self, value: f32) {
        self.data.fill(value);
    }

    /// Frobenius norm, accumulated in `f64`.
    pub fn norm(&self) -> f32 {
        self.data
            .iter()
            .map(|&v| (v as f64) * (v as f64))
            .sum::<f64>()
            .sqrt() as f32
    }

    pub fn has_non_finite(&self) -> bool {
        self.data.iter().any(|v| !v.is_finite())
    }

    /// Index of the largest entry in each column (first maximum wins).
    pub fn argmax_columns(&self) -> Vec<usize> {
        (0..self.cols)
            .map(|c| {
                let mut best = 0;
                for r in 1..self.rows {
                    if self.get(r, c) > self.get(best, c) {
                        best = r;
                    }
                }
                best
            })
            .collect()
    }

    /// Index of the largest entry in each row (first maximum wins).
    pub fn argmax_rows(&self) -> Vec<usize> {
        (0..self.rows)
            .map(|r| {
                let row = self.row(r);
                let mut best = 0;
                for (i, &v) in row.iter().enumerate().skip(1) {
                    if v > row[best] {
                        best = i;
                    }
                }
                best
            })
            .collect()
    }

    /// Stacks tensors with the same column count on top of each other.
    pub fn vstack(parts: &[&Tensor]) -> Result<Tensor> {
        let cols = parts.first().map_or(0, |t| t.cols);
        let mut rows = 0;
        let mut data = Vec::new();
        for part in parts {
            if part.cols != cols {
                return Err(DnnError::dims("vstack", cols, part.cols));
            }
            rows += part.rows;
            data.extend_from_slice(&part.data);
        }
        Ok(Tensor { rows, cols, data })
    }

    /// Copies columns `start..end`.
    pub fn columns(&self, start: usize, end: usize) -> Result<Tensor> {
        if start > end || end > self.cols {
            return Err(DnnError::dims(
                "columns",
                format!("range within 0..{}", self.cols),
                format!("{}..{}", start, end),
            ));
        }
        let width = end - start;
        let mut data = Vec::with_capacity(self.rows * width);
        for r in 0..self.rows {
            data.extend_from_slice(&self.row(r)[start..end]);
        }
        Ok(Tensor {
            rows: self.rows,
            cols: width,
            data,
        })
    }

    /// Gathers the given rows into a new tensor.
    pub fn select_rows(&self, indices: &[usize]) -> Result<Tensor> {
        let mut data = Vec::with_capacity(indices.len() * self.cols);
        for &i in indices {
            if i >= self.rows {
                return Err(DnnError::dims(
                    "select_rows",
                    format!("row < {}", self.rows),
                    i,
                ));
            }
            data.extend_from_slice(self.row(i));
        }
        Ok(Tensor {
            rows: indices.len(),
            cols: self.cols,
            data,
        })
    }

    /// Same buffer, new shape.
    pub fn reshape(self, rows: usize, cols: usize) -> Result<Tensor> {
        Tensor::from_vec(rows, cols, self.data)
    }

    fn check_same_shape(&self, other: &Tensor, context: &str) -> Result<()> {
        if self.shape() != other.shape() {
            return Err(DnnError::dims(
                context,
                format!("{}x{}", self.rows, self.cols),
                format!("{}x{}", other.rows, other.cols),
            ));
        }
        Ok(())
    }
}
