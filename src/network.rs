//! Network container
//!
//! Layers live in an arena and are addressed by [`LayerId`]. The main chain is
//! kept as explicit `prev`/`next` links; auxiliary links let a fully connected
//! or multi-target layer read the concatenated outputs of earlier layers
//! (fan-in), which in turn makes those layers fan out.
//!
//! Layers are only ever appended at the tail, so arena index and chain
//! position coincide.

use crate::error::{DnnError, Result};
use crate::layers::{Layer, LayerKind, MAX_TARGETS};
use crate::tensor::Tensor;

/// Stable handle to a layer inside a [`Network`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayerId(usize);

impl LayerId {
    pub fn index(self) -> usize {
        self.0
    }
}

struct Node {
    layer: Box<dyn Layer>,
    prev: Option<usize>,
    next: Option<usize>,
    aux_inputs: Vec<usize>,
    aux_outputs: Vec<usize>,
}

/// Per-layer tensors recorded by [`Network::forward`] for the backward pass.
///
/// `inputs[k]` is the (possibly normalised) input layer `k` consumed and
/// `outputs[k]` what it produced.
#[derive(Debug, Clone)]
pub struct ForwardTrace {
    pub inputs: Vec<Tensor>,
    pub outputs: Vec<Tensor>,
}

impl ForwardTrace {
    /// Output of the last layer, `(output_size × batch)`.
    pub fn output(&self) -> Option<&Tensor> {
        self.outputs.last()
    }
}

/// Chain of layers with auxiliary fan-in/fan-out links.
pub struct Network {
    nodes: Vec<Node>,
    first: usize,
    last: usize,
    n_layers: usize,
}

impl Network {
    /// Starts a network from its first layer (normally an input data layer).
    pub fn new(first_layer: Box<dyn Layer>) -> Self {
        log::debug!(
            "network created with first layer '{}' ({})",
            first_layer.name(),
            first_layer.kind()
        );
        Self {
            nodes: vec![Node {
                layer: first_layer,
                prev: None,
                next: None,
                aux_inputs: Vec::new(),
                aux_outputs: Vec::new(),
            }],
            first: 0,
            last: 0,
            n_layers: 1,
        }
    }

    /// Appends a layer fed by the current last layer.
    pub fn add_layer(&mut self, layer: Box<dyn Layer>) -> Result<LayerId> {
        self.add_layer_with_inputs(layer, &[])
    }

    /// Appends a layer, optionally fed by the concatenated outputs of
    /// `inputs` instead of the previous layer.
    ///
    /// # Errors
    ///
    /// - `DuplicateName` if the name is taken
    /// - `LayerNotFound` if an input id does not exist
    /// - `InvalidFanIn` for a multi-target layer without 1..=100 inputs
    /// - `StructuralMismatch` when the shape rules for the layer kind fail
    ///
    /// The network is unchanged on error.
    pub fn add_layer_with_inputs(&mut self, layer: Box<dyn Layer>, inputs: &[LayerId]) -> Result<LayerId> {
        if self.nodes.iter().any(|n| n.layer.name() == layer.name()) {
            return Err(DnnError::DuplicateName(layer.name().to_string()));
        }
        if let Some(bad) = inputs.iter().find(|id| id.0 >= self.nodes.len()) {
            return Err(DnnError::LayerNotFound(format!("layer id {}", bad.0)));
        }
        self.check_composition(layer.as_ref(), inputs)?;

        let idx = self.nodes.len();
        let prev = self.last;
        self.nodes[prev].next = Some(idx);
        for id in inputs {
            self.nodes[id.0].aux_outputs.push(idx);
        }
        log::debug!(
            "added layer '{}' ({}) after '{}'",
            layer.name(),
            layer.kind(),
            self.nodes[prev].layer.name()
        );
        self.nodes.push(Node {
            layer,
            prev: Some(prev),
            next: None,
            aux_inputs: inputs.iter().map(|id| id.0).collect(),
            aux_outputs: Vec::new(),
        });
        self.last = idx;
        self.n_layers += 1;
        Ok(LayerId(idx))
    }

    fn check_composition(&self, layer: &dyn Layer, inputs: &[LayerId]) -> Result<()> {
        let mismatch = |reason: String| DnnError::StructuralMismatch {
            layer: layer.name().to_string(),
            reason,
        };
        let prev = &self.nodes[self.last].layer;
        let (inp, outp) = (layer.input_shape(), layer.output_shape());
        let aux_size: usize = inputs.iter().map(|id| self.nodes[id.0].layer.output_size()).sum();

        match layer.kind() {
            LayerKind::FullyConnected => {
                if !inp.is_unit_spatial() || !outp.is_unit_spatial() {
                    return Err(mismatch(format!(
                        "fully connected input {} and output {} must be 1x1",
                        inp, outp
                    )));
                }
                let expected = if inputs.is_empty() { prev.output_size() } else { aux_size };
                if inp.planes != expected {
                    return Err(mismatch(format!(
                        "expects {} inputs but its source provides {}",
                        inp.planes, expected
                    )));
                }
            }
            LayerKind::Convolution | LayerKind::Subsampling => {
                if inp != prev.output_shape() {
                    return Err(mismatch(format!(
                        "input {} does not match previous output {}",
                        inp,
                        prev.output_shape()
                    )));
                }
            }
            LayerKind::Recurrent => {
                if !inp.is_unit_spatial() || !outp.is_unit_spatial() {
                    return Err(mismatch(format!(
                        "recurrent input {} and output {} must be 1x1",
                        inp, outp
                    )));
                }
            }
            LayerKind::Cropping => {}
            LayerKind::MultiTarget => {
                if inputs.is_empty() || inputs.len() > MAX_TARGETS {
                    return Err(DnnError::InvalidFanIn(inputs.len()));
                }
                if inp.size() != aux_size {
                    return Err(mismatch(format!(
                        "input size {} differs from summed source size {}",
                        inp.size(),
                        aux_size
                    )));
                }
            }
            LayerKind::InputData => {
                return Err(mismatch("input data layers can only start a network".to_string()));
            }
        }

        if !inputs.is_empty() && !matches!(layer.kind(), LayerKind::FullyConnected | LayerKind::MultiTarget) {
            return Err(mismatch(format!("{} layers take no auxiliary inputs", layer.kind())));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.n_layers
    }

    /// Always false: a network holds at least its first layer.
    pub fn is_empty(&self) -> bool {
        self.n_layers == 0
    }

    pub fn first_layer(&self) -> &dyn Layer {
        self.nodes[self.first].layer.as_ref()
    }

    pub fn last_layer(&self) -> &dyn Layer {
        self.nodes[self.last].layer.as_ref()
    }

    pub fn input_size(&self) -> usize {
        self.first_layer().input_size()
    }

    pub fn output_size(&self) -> usize {
        self.last_layer().output_size()
    }

    /// Layer by id.
    pub fn layer(&self, id: LayerId) -> Option<&dyn Layer> {
        self.nodes.get(id.0).map(|n| n.layer.as_ref())
    }

    pub fn layer_mut(&mut self, id: LayerId) -> Option<&mut dyn Layer> {
        match self.nodes.get_mut(id.0) {
            Some(n) => Some(n.layer.as_mut()),
            None => None,
        }
    }

    /// First layer in chain order named `name`.
    pub fn get_layer(&self, name: &str) -> Option<&dyn Layer> {
        self.layer_id(name).and_then(|id| self.layer(id))
    }

    pub fn get_layer_mut(&mut self, name: &str) -> Option<&mut dyn Layer> {
        let id = self.layer_id(name)?;
        self.layer_mut(id)
    }

    pub fn layer_id(&self, name: &str) -> Option<LayerId> {
        self.chain().find(|&i| self.nodes[i].layer.name() == name).map(LayerId)
    }

    /// Typed access to a layer, e.g. to read a convolution layer's caches.
    pub fn layer_as<T: 'static>(&self, name: &str) -> Option<&T> {
        self.get_layer(name)?.as_any().downcast_ref::<T>()
    }

    pub fn aux_inputs(&self, id: LayerId) -> Vec<LayerId> {
        self.nodes.get(id.0).map_or_else(Vec::new, |n| n.aux_inputs.iter().map(|&i| LayerId(i)).collect())
    }

    pub fn aux_outputs(&self, id: LayerId) -> Vec<LayerId> {
        self.nodes.get(id.0).map_or_else(Vec::new, |n| n.aux_outputs.iter().map(|&i| LayerId(i)).collect())
    }

    /// Layer ids in chain order.
    pub fn layer_ids(&self) -> Vec<LayerId> {
        self.chain().map(LayerId).collect()
    }

    fn chain(&self) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(Some(self.first), move |&i| self.nodes[i].next)
    }

    /// Runs every layer in chain order on `input` (`input_size × batch`).
    pub fn forward(&mut self, input: Tensor) -> Result<ForwardTrace> {
        let mut inputs: Vec<Tensor> = Vec::with_capacity(self.nodes.len());
        let mut outputs: Vec<Tensor> = Vec::with_capacity(self.nodes.len());
        let mut staged = Some(input);

        for k in 0..self.nodes.len() {
            let mut x = match staged.take() {
                Some(x) => x,
                None if !self.nodes[k].aux_inputs.is_empty() => {
                    let parts: Vec<&Tensor> = self.nodes[k].aux_inputs.iter().map(|&i| &outputs[i]).collect();
                    Tensor::vstack(&parts)?
                }
                None => {
                    let prev = self.nodes[k]
                        .prev
                        .ok_or_else(|| DnnError::Corrupted(format!("layer {} has no predecessor", k)))?;
                    outputs[prev].clone()
                }
            };
            let y = self.nodes[k].layer.forward(&mut x)?;
            inputs.push(x);
            outputs.push(y);
        }
        Ok(ForwardTrace { inputs, outputs })
    }

    /// Runs every layer backward in reverse chain order, updating weights.
    ///
    /// `loss_grad` is `dE/dY` of the last layer, `(batch × output_size)`.
    /// A layer with auxiliary consumers receives the average of the slices of
    /// their input gradients that correspond to it; a layer whose successor
    /// reads auxiliary inputs instead of it receives zeros from the chain.
    pub fn backward(&mut self, trace: &ForwardTrace, loss_grad: &Tensor, iteration: usize) -> Result<()> {
        if iteration < 1 {
            return Err(DnnError::InvalidIteration(iteration));
        }
        let n = self.nodes.len();
        if trace.inputs.len() != n || trace.outputs.len() != n {
            return Err(DnnError::MissingForwardState(format!(
                "trace holds {} layers, network has {}",
                trace.inputs.len(),
                n
            )));
        }
        let batch = loss_grad.rows();
        let mut grad_inputs: Vec<Option<Tensor>> = vec![None; n];

        for k in (0..n).rev() {
            let grad_output = self.output_gradient(k, batch, loss_grad, &grad_inputs)?;
            let g = self.nodes[k].layer.backward(iteration, &trace.inputs[k], &grad_output)?;
            grad_inputs[k] = Some(g);
        }
        Ok(())
    }

    fn output_gradient(
        &self,
        k: usize,
        batch: usize,
        loss_grad: &Tensor,
        grad_inputs: &[Option<Tensor>],
    ) -> Result<Tensor> {
        let node = &self.nodes[k];
        let size = node.layer.output_size();
        let missing = |i: usize| DnnError::Corrupted(format!("no input gradient for layer {}", i));

        if !node.aux_outputs.is_empty() {
            let weight = 1.0 / node.aux_outputs.len() as f32;
            let mut acc = Tensor::zeros(batch, size);
            for &c in &node.aux_outputs {
                let consumer = &self.nodes[c];
                if !matches!(consumer.layer.kind(), LayerKind::FullyConnected | LayerKind::MultiTarget) {
                    continue;
                }
                let dx = grad_inputs[c].as_ref().ok_or_else(|| missing(c))?;
                let mut offset = 0;
                for &src in &consumer.aux_inputs {
                    let width = self.nodes[src].layer.output_size();
                    if src == k {
                        acc.add_scaled(&dx.columns(offset, offset + width)?, weight)?;
                    }
                    offset += width;
                }
            }
            return Ok(acc);
        }

        match node.next {
            None => {
                if loss_grad.shape() != (batch, size) {
                    return Err(DnnError::dims(
                        "loss gradient",
                        format!("{}x{}", batch, size),
                        format!("{}x{}", loss_grad.rows(), loss_grad.cols()),
                    ));
                }
                Ok(loss_grad.clone())
            }
            Some(next) if self.nodes[next].aux_inputs.is_empty() => {
                grad_inputs[next].clone().ok_or_else(|| missing(next))
            }
            Some(_) => Ok(Tensor::zeros(batch, size)),
        }
    }

    /// Releases every layer, walking the chain once.
    ///
    /// Returns the number of layers released.
    ///
    /// # Errors
    ///
    /// `Corrupted` if the chain does not visit exactly the recorded number of
    /// layers; the layers that were reached are still released.
    pub fn release(self) -> Result<usize> {
        let expected = self.n_layers;
        let mut slots: Vec<Option<Node>> = self.nodes.into_iter().map(Some).collect();
        let mut cursor = Some(self.first);
        let mut released = 0;

        while let Some(i) = cursor {
            let node = slots
                .get_mut(i)
                .and_then(Option::take)
                .ok_or_else(|| DnnError::Corrupted(format!("chain revisits or skips layer {}", i)))?;
            cursor = node.next;
            node.layer.release();
            released += 1;
        }

        if released != expected {
            return Err(DnnError::Corrupted(format!(
                "released {} layers, network recorded {}",
                released, expected
            )));
        }
        log::debug!("network released ({} layers)", released);
        Ok(released)
    }

    #[cfg(test)]
    pub(crate) fn corrupt_layer_count(&mut self, n_layers: usize) {
        self.n_layers = n_layers;
    }
}

/// Releases a network if there is one; `None` is a no-op returning 0.
pub fn release_network(network: Option<Network>) -> Result<usize> {
    match network {
        Some(net) => net.release(),
        None => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{ConvolutionLayer, FullyConnectedLayer, InputDataLayer, PlaneShape};
    use crate::utils::{DecayPolicy, SimpleRng};

    fn small_network() -> Network {
        let mut rng = SimpleRng::new(5);
        let input = InputDataLayer::new("input", PlaneShape::new(1, 6, 6)).unwrap();
        let mut net = Network::new(Box::new(input));
        let conv =
            ConvolutionLayer::new("conv", PlaneShape::new(1, 6, 6), 2, 3, 0.1, DecayPolicy::SqrtInverse, &mut rng)
                .unwrap();
        net.add_layer(Box::new(conv)).unwrap();
        let fc = FullyConnectedLayer::new("fc", 32, 3, 0.1, DecayPolicy::SqrtInverse, &mut rng).unwrap();
        net.add_layer(Box::new(fc)).unwrap();
        net
    }

    #[test]
    fn test_chain_and_lookup() {
        let net = small_network();
        assert_eq!(net.len(), 3);
        assert_eq!(net.input_size(), 36);
        assert_eq!(net.output_size(), 3);
        assert_eq!(net.get_layer("conv").unwrap().kind(), LayerKind::Convolution);
        assert!(net.get_layer("missing").is_none());
        assert!(net.layer_as::<ConvolutionLayer>("conv").is_some());
        assert!(net.layer_as::<ConvolutionLayer>("fc").is_none());
        let ids = net.layer_ids();
        assert_eq!(ids.iter().map(|id| id.index()).collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn test_release_counts_layers() {
        assert_eq!(small_network().release().unwrap(), 3);
        assert_eq!(release_network(None).unwrap(), 0);
    }

    #[test]
    fn test_release_detects_corrupted_count() {
        let mut net = small_network();
        net.corrupt_layer_count(5);
        assert!(matches!(net.release(), Err(DnnError::Corrupted(_))));
    }

    #[test]
    fn test_forward_backward_shapes() {
        let mut net = small_network();
        let input = Tensor::from_vec(36, 2, (0..72).map(|v| (v % 11) as f32).collect()).unwrap();
        let trace = net.forward(input).unwrap();
        assert_eq!(trace.output().unwrap().shape(), (3, 2));
        let loss_grad = Tensor::filled(2, 3, 0.1);
        net.backward(&trace, &loss_grad, 1).unwrap();
        assert!(matches!(
            net.backward(&trace, &loss_grad, 0),
            Err(DnnError::InvalidIteration(0))
        ));
    }
}
