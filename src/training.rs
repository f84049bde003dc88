//! Minibatch SGD training loop
//!
//! Each iteration samples a minibatch uniformly with replacement, runs the
//! network forward, feeds `prediction - target` backward through every layer
//! (which updates the weights in place), and records loss and top-1 accuracy.

use crate::config::TrainingConfig;
use crate::error::{DnnError, Result};
use crate::layers::InputDataLayer;
use crate::network::Network;
use crate::tensor::Tensor;
use crate::utils::SimpleRng;

/// Statistics of one training iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IterationStats {
    /// Counter handed to the layers (`n + start_iter`).
    pub iteration: usize,
    /// `‖prediction - target‖ / batch`.
    pub loss: f32,
    /// Percentage of samples whose predicted argmax matches the target argmax.
    pub top1: f32,
    /// Running mean of `loss` since the start of the run.
    pub mean_loss: f32,
    /// Running mean of `top1` since the start of the run.
    pub mean_top1: f32,
}

#[derive(Debug, Clone, Default)]
pub struct TrainingReport {
    pub history: Vec<IterationStats>,
}

impl TrainingReport {
    pub fn last(&self) -> Option<&IterationStats> {
        self.history.last()
    }

    pub fn iterations(&self) -> usize {
        self.history.len()
    }
}

/// `‖prediction - targetsᵀ‖_F / batch` for `prediction` of shape
/// `(n_out × batch)` and `targets` of shape `(batch × n_out)`.
pub fn batch_loss(prediction: &Tensor, targets: &Tensor) -> Result<f32> {
    let diff = prediction.transpose().sub(targets)?;
    Ok(diff.norm() / targets.rows().max(1) as f32)
}

/// Top-1 accuracy in percent.
pub fn top1_accuracy(prediction: &Tensor, targets: &Tensor) -> f32 {
    let predicted = prediction.argmax_columns();
    let expected = targets.argmax_rows();
    if expected.is_empty() {
        return 0.0;
    }
    let hits = predicted.iter().zip(&expected).filter(|(a, b)| a == b).count();
    100.0 * hits as f32 / expected.len() as f32
}

/// Sequence length declared by the network's input layer (1 otherwise).
pub fn seq_length(network: &Network) -> usize {
    network
        .first_layer()
        .as_any()
        .downcast_ref::<InputDataLayer>()
        .map_or(1, InputDataLayer::seq_length)
}

/// Trains `network` on `images` (`n × input_size`) against `responses`
/// (`n × output_size`).
///
/// # Errors
///
/// Shape mismatches between the data and the network, an invalid config, or
/// any error raised by a layer. Weights updated by earlier iterations stay
/// updated when a later iteration fails.
pub fn train_network(
    network: &mut Network,
    images: &Tensor,
    responses: &Tensor,
    config: &TrainingConfig,
    rng: &mut SimpleRng,
) -> Result<TrainingReport> {
    config.validate()?;
    if images.rows() != responses.rows() {
        return Err(DnnError::dims("training responses", images.rows(), responses.rows()));
    }
    if images.cols() != network.input_size() {
        return Err(DnnError::dims("training image size", network.input_size(), images.cols()));
    }
    if responses.cols() != network.output_size() {
        return Err(DnnError::dims("training response size", network.output_size(), responses.cols()));
    }
    let seq = seq_length(network);
    if images.rows() < seq {
        return Err(DnnError::InvalidParameter(format!(
            "{} images are fewer than the sequence length {}",
            images.rows(),
            seq
        )));
    }
    let n_windows = images.rows() - seq + 1;

    if config.max_iter < 1 {
        log::warn!("max_iter {} below 1, running a single iteration", config.max_iter);
    }
    let max_iter = config.effective_max_iter();
    let batch = config.batch_size;
    log::info!(
        "training {} layers on {} images: {} iterations, batch {}",
        network.len(),
        images.rows(),
        max_iter,
        batch
    );

    let mut report = TrainingReport {
        history: Vec::with_capacity(max_iter),
    };
    let (mut loss_sum, mut top1_sum) = (0.0f64, 0.0f64);
    let mut last_percent = 0;

    for n in 1..=max_iter {
        let indices = rng.sample_indices(batch, n_windows);
        let x0 = images.select_rows(&indices)?.transpose();
        let targets = responses.select_rows(&indices)?;

        let trace = network.forward(x0)?;
        let prediction = trace
            .output()
            .ok_or_else(|| DnnError::Corrupted("forward produced no output".to_string()))?;
        let loss_grad = prediction.transpose().sub(&targets)?;
        let loss = loss_grad.norm() / batch as f32;
        let top1 = top1_accuracy(prediction, &targets);

        let iteration = n + config.start_iter;
        network.backward(&trace, &loss_grad, iteration)?;

        loss_sum += loss as f64;
        top1_sum += top1 as f64;
        let stats = IterationStats {
            iteration,
            loss,
            top1,
            mean_loss: (loss_sum / n as f64) as f32,
            mean_top1: (top1_sum / n as f64) as f32,
        };
        report.history.push(stats);

        let percent = n * 100 / max_iter;
        if percent > last_percent {
            last_percent = percent;
            log::info!(
                "{:3}% iter {}: loss {:.4} (mean {:.4}), top1 {:.1}% (mean {:.1}%)",
                percent,
                iteration,
                loss,
                stats.mean_loss,
                top1,
                stats.mean_top1
            );
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_top1_accuracy() {
        // predictions as columns: sample0 -> class 1, sample1 -> class 0
        let prediction = Tensor::from_vec(2, 2, vec![0.1, 0.9, 0.8, 0.2]).unwrap();
        let targets = Tensor::from_vec(2, 2, vec![0.0, 1.0, 0.0, 1.0]).unwrap();
        assert_relative_eq!(top1_accuracy(&prediction, &targets), 50.0);
    }

    #[test]
    fn test_batch_loss() {
        let prediction = Tensor::from_vec(2, 1, vec![3.0, 4.0]).unwrap();
        let targets = Tensor::zeros(1, 2);
        assert_relative_eq!(batch_loss(&prediction, &targets).unwrap(), 5.0);
    }
}
