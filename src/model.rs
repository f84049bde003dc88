//! Classifier built on a trained network
//!
//! Wraps a [`Network`] together with its class labels and etalons (one target
//! vector per class). Training maps each label to its etalon row; prediction
//! picks the class whose etalon is nearest to the network output.

use crate::config::TrainingConfig;
use crate::error::{DnnError, Result};
use crate::layers::{Layer, LayerKind};
use crate::network::{ForwardTrace, Network};
use crate::tensor::Tensor;
use crate::training::{train_network, TrainingReport};
use crate::utils::SimpleRng;

/// Outputs of [`CnnClassifier::predict`].
#[derive(Debug, Clone)]
pub struct Prediction {
    /// Raw network output, `(output_size × n_samples)`.
    pub outputs: Tensor,
    /// Class label per sample.
    pub labels: Vec<i32>,
}

pub struct CnnClassifier {
    network: Network,
    class_labels: Vec<i32>,
    etalons: Tensor,
    normalize_input_range: bool,
    rng: SimpleRng,
    iterations_done: usize,
}

impl CnnClassifier {
    /// Validates the inputs, then trains `network` on `images` (`n × input_size`).
    ///
    /// `etalons` has one row per entry of `class_labels` and one column per
    /// network output.
    pub fn train(
        network: Network,
        images: &Tensor,
        labels: &[i32],
        class_labels: Vec<i32>,
        etalons: Tensor,
        config: &TrainingConfig,
    ) -> Result<(Self, TrainingReport)> {
        config.validate()?;
        if class_labels.is_empty() {
            return Err(DnnError::InvalidParameter("no class labels".to_string()));
        }
        if etalons.rows() != class_labels.len() {
            return Err(DnnError::dims("etalon rows", class_labels.len(), etalons.rows()));
        }
        if etalons.cols() != network.output_size() {
            return Err(DnnError::dims("etalon columns", network.output_size(), etalons.cols()));
        }
        if let Some(first) = first_computing_layer(&network) {
            if first.kind() == LayerKind::Convolution && first.input_shape().planes != 1 {
                return Err(DnnError::InvalidParameter(format!(
                    "first convolution layer '{}' must take a single plane",
                    first.name()
                )));
            }
        }

        let rng = config.seed.map_or_else(SimpleRng::from_time, SimpleRng::new);
        let mut model = Self {
            network,
            class_labels,
            etalons,
            normalize_input_range: config.normalize_input_range,
            rng,
            iterations_done: 0,
        };
        let report = model.update(images, labels, config)?;
        Ok((model, report))
    }

    /// Continues training with more labelled images.
    ///
    /// Labels must belong to the classes the model was created with.
    pub fn update(&mut self, images: &Tensor, labels: &[i32], config: &TrainingConfig) -> Result<TrainingReport> {
        if labels.len() != images.rows() {
            return Err(DnnError::dims("labels", images.rows(), labels.len()));
        }
        let rows = labels
            .iter()
            .map(|label| {
                self.class_index(*label)
                    .ok_or_else(|| DnnError::InvalidParameter(format!("unknown class label {}", label)))
            })
            .collect::<Result<Vec<usize>>>()?;
        let responses = self.etalons.select_rows(&rows)?;
        let images = self.prepare(images);

        let config = TrainingConfig {
            start_iter: config.start_iter + self.iterations_done,
            ..config.clone()
        };
        let report = train_network(&mut self.network, &images, &responses, &config, &mut self.rng)?;
        self.iterations_done += report.iterations();
        Ok(report)
    }

    /// Runs the network on `images` (`n × input_size`) and labels each sample.
    pub fn predict(&mut self, images: &Tensor) -> Result<Prediction> {
        if images.cols() != self.network.input_size() {
            return Err(DnnError::dims("prediction image size", self.network.input_size(), images.cols()));
        }
        let x0 = self.prepare(images).transpose();
        let ForwardTrace { mut outputs, .. } = self.network.forward(x0)?;
        let outputs = outputs
            .pop()
            .ok_or_else(|| DnnError::Corrupted("forward produced no output".to_string()))?;

        let labels = (0..outputs.cols())
            .map(|s| self.class_labels[self.nearest_etalon(&outputs, s)])
            .collect();
        Ok(Prediction { outputs, labels })
    }

    /// Releases the network, returning the number of layers released.
    pub fn release(self) -> Result<usize> {
        self.network.release()
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn network_mut(&mut self) -> &mut Network {
        &mut self.network
    }

    pub fn class_labels(&self) -> &[i32] {
        &self.class_labels
    }

    pub fn etalons(&self) -> &Tensor {
        &self.etalons
    }

    fn class_index(&self, label: i32) -> Option<usize> {
        self.class_labels.iter().position(|&c| c == label)
    }

    fn nearest_etalon(&self, outputs: &Tensor, sample: usize) -> usize {
        let mut best = (0, f32::INFINITY);
        for c in 0..self.etalons.rows() {
            let dist: f32 = self
                .etalons
                .row(c)
                .iter()
                .enumerate()
                .map(|(j, &e)| (outputs.get(j, sample) - e).powi(2))
                .sum();
            if dist < best.1 {
                best = (c, dist);
            }
        }
        best.0
    }

    /// Applies the input-range rescaling when the first computing layer is a
    /// convolution.
    fn prepare(&self, images: &Tensor) -> Tensor {
        let mut images = images.clone();
        if self.normalize_input_range && starts_with_convolution(&self.network) {
            normalize_range(&mut images);
        }
        images
    }
}

fn first_computing_layer(network: &Network) -> Option<&dyn Layer> {
    network
        .layer_ids()
        .into_iter()
        .filter_map(|id| network.layer(id))
        .find(|layer| layer.kind() != LayerKind::InputData)
}

/// True when the first layer after the input layer is a convolution.
pub fn starts_with_convolution(network: &Network) -> bool {
    first_computing_layer(network).is_some_and(|layer| layer.kind() == LayerKind::Convolution)
}

/// Maps the global value range of `data` linearly onto [-1, 1].
///
/// A constant tensor maps to all zeros.
pub fn normalize_range(data: &mut Tensor) {
    let (min, max) = data
        .as_slice()
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    if max <= min {
        data.fill(0.0);
        return;
    }
    let scale = 2.0 / (max - min);
    data.map_inplace(|v| (v - min) * scale - 1.0);
}
