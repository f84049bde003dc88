//! Network container tests
//!
//! Composition rules (a rejected layer leaves the network untouched), name
//! lookup, auxiliary fan-in/fan-out gradient routing, and release.

use rust_cnn::layers::{
    ConvolutionLayer, CroppingLayer, FullyConnectedLayer, InputDataLayer, LayerHeader, MultiTargetLayer,
    SubsamplingLayer,
};
use rust_cnn::utils::{Activation, DecayPolicy, SimpleRng};
use rust_cnn::{release_network, DnnError, Layer, LayerId, LayerKind, Network, PlaneShape, Result, Tensor};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Identity layer tagged as recurrent that records every gradient it receives
/// and counts its releases.
struct ProbeLayer {
    header: LayerHeader,
    received: Rc<RefCell<Vec<Tensor>>>,
    released: Rc<Cell<usize>>,
}

impl ProbeLayer {
    fn new(name: &str, shape: PlaneShape) -> Result<Self> {
        Ok(Self {
            header: LayerHeader::new(name, LayerKind::Recurrent, shape, shape, 0.1, DecayPolicy::Hyperbolic)?,
            received: Rc::new(RefCell::new(Vec::new())),
            released: Rc::new(Cell::new(0)),
        })
    }
}

impl Layer for ProbeLayer {
    fn header(&self) -> &LayerHeader {
        &self.header
    }

    fn forward(&mut self, input: &mut Tensor) -> Result<Tensor> {
        Ok(input.clone())
    }

    fn backward(&mut self, _iteration: usize, _input: &Tensor, grad_output: &Tensor) -> Result<Tensor> {
        self.received.borrow_mut().push(grad_output.clone());
        Ok(grad_output.clone())
    }

    fn release(self: Box<Self>) {
        self.released.set(self.released.get() + 1);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn input_network(shape: PlaneShape) -> Network {
    Network::new(Box::new(InputDataLayer::new("input", shape).unwrap()))
}

fn conv_network(rng: &mut SimpleRng) -> Network {
    let mut net = input_network(PlaneShape::new(1, 8, 8));
    let conv = ConvolutionLayer::new("conv", PlaneShape::new(1, 8, 8), 2, 3, 0.1, DecayPolicy::SqrtInverse, rng).unwrap();
    net.add_layer(Box::new(conv)).unwrap();
    net
}

// ============================================================================
// Composition rules
// ============================================================================

mod composition_tests {
    use super::*;

    #[test]
    fn test_fully_connected_size_mismatch() {
        let mut rng = SimpleRng::new(1);
        let mut net = conv_network(&mut rng);
        let fc = FullyConnectedLayer::new("fc", 71, 2, 0.1, DecayPolicy::SqrtInverse, &mut rng).unwrap();
        assert!(matches!(
            net.add_layer(Box::new(fc)),
            Err(DnnError::StructuralMismatch { .. })
        ));
        assert_eq!(net.len(), 2);

        let fc = FullyConnectedLayer::new("fc", 72, 2, 0.1, DecayPolicy::SqrtInverse, &mut rng).unwrap();
        net.add_layer(Box::new(fc)).unwrap();
        assert_eq!(net.len(), 3);
        assert_eq!(net.output_size(), 2);
    }

    #[test]
    fn test_convolution_shape_mismatch() {
        let mut rng = SimpleRng::new(2);
        let mut net = conv_network(&mut rng);
        // previous output is 2@6x6
        let wrong = ConvolutionLayer::new("c2", PlaneShape::new(1, 6, 6), 2, 3, 0.1, DecayPolicy::SqrtInverse, &mut rng)
            .unwrap();
        assert!(matches!(
            net.add_layer(Box::new(wrong)),
            Err(DnnError::StructuralMismatch { .. })
        ));
        let pool = SubsamplingLayer::new("pool", PlaneShape::new(2, 6, 7), 2, 0.1, DecayPolicy::SqrtInverse).unwrap();
        assert!(net.add_layer(Box::new(pool)).is_err());
        assert_eq!(net.len(), 2);

        let right = ConvolutionLayer::new("c2", PlaneShape::new(2, 6, 6), 2, 3, 0.1, DecayPolicy::SqrtInverse, &mut rng)
            .unwrap();
        net.add_layer(Box::new(right)).unwrap();
        assert_eq!(net.len(), 3);
    }

    #[test]
    fn test_input_layer_only_first() {
        let mut net = input_network(PlaneShape::new(1, 4, 4));
        let second = InputDataLayer::new("input2", PlaneShape::new(1, 4, 4)).unwrap();
        assert!(matches!(
            net.add_layer(Box::new(second)),
            Err(DnnError::StructuralMismatch { .. })
        ));
        assert_eq!(net.len(), 1);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut rng = SimpleRng::new(3);
        let mut net = conv_network(&mut rng);
        let dup = FullyConnectedLayer::new("conv", 72, 2, 0.1, DecayPolicy::SqrtInverse, &mut rng).unwrap();
        assert!(matches!(
            net.add_layer(Box::new(dup)),
            Err(DnnError::DuplicateName(name)) if name == "conv"
        ));
        assert_eq!(net.len(), 2);
    }

    #[test]
    fn test_multi_target_fan_in_bounds() {
        let mut rng = SimpleRng::new(4);
        let mut net = input_network(PlaneShape::flat(3));
        let fc = FullyConnectedLayer::new("fc", 3, 1, 0.1, DecayPolicy::SqrtInverse, &mut rng).unwrap();
        let fc_id = net.add_layer(Box::new(fc)).unwrap();

        let none = MultiTargetLayer::new("mt0", 1).unwrap();
        assert!(matches!(
            net.add_layer_with_inputs(Box::new(none), &[]),
            Err(DnnError::InvalidFanIn(0))
        ));

        let too_many = MultiTargetLayer::new("mt101", 101).unwrap();
        let ids = vec![fc_id; 101];
        assert!(matches!(
            net.add_layer_with_inputs(Box::new(too_many), &ids),
            Err(DnnError::InvalidFanIn(101))
        ));
        assert_eq!(net.len(), 2);

        let hundred = MultiTargetLayer::new("mt100", 100).unwrap();
        net.add_layer_with_inputs(Box::new(hundred), &vec![fc_id; 100]).unwrap();
        assert_eq!(net.len(), 3);
        assert_eq!(net.output_size(), 100);
    }

    #[test]
    fn test_multi_target_size_must_match_sources() {
        let mut rng = SimpleRng::new(5);
        let mut net = input_network(PlaneShape::flat(3));
        let fc = FullyConnectedLayer::new("fc", 3, 2, 0.1, DecayPolicy::SqrtInverse, &mut rng).unwrap();
        let fc_id = net.add_layer(Box::new(fc)).unwrap();
        let mt = MultiTargetLayer::new("mt", 3).unwrap();
        assert!(matches!(
            net.add_layer_with_inputs(Box::new(mt), &[fc_id]),
            Err(DnnError::StructuralMismatch { .. })
        ));
    }

    #[test]
    fn test_recurrent_requires_unit_spatial() {
        let mut net = input_network(PlaneShape::new(1, 2, 2));
        let probe = ProbeLayer::new("rnn", PlaneShape::new(1, 2, 2)).unwrap();
        assert!(matches!(
            net.add_layer(Box::new(probe)),
            Err(DnnError::StructuralMismatch { .. })
        ));
        assert_eq!(net.len(), 1);

        let mut flat = input_network(PlaneShape::flat(4));
        let probe = ProbeLayer::new("rnn", PlaneShape::flat(4)).unwrap();
        flat.add_layer(Box::new(probe)).unwrap();
        assert_eq!(flat.get_layer("rnn").unwrap().kind(), LayerKind::Recurrent);
    }

    #[test]
    fn test_cropping_has_no_shape_rule() {
        let mut rng = SimpleRng::new(6);
        let mut net = conv_network(&mut rng);
        let crop = CroppingLayer::new("crop", PlaneShape::new(3, 10, 10), 4, 4).unwrap();
        net.add_layer(Box::new(crop)).unwrap();
        assert_eq!(net.len(), 3);
    }

    #[test]
    fn test_unknown_input_id() {
        let mut rng = SimpleRng::new(7);
        let mut other = conv_network(&mut rng);
        let fc = FullyConnectedLayer::new("fc", 72, 2, 0.1, DecayPolicy::SqrtInverse, &mut rng).unwrap();
        other.add_layer(Box::new(fc)).unwrap();
        let fc2 = FullyConnectedLayer::new("fc2", 2, 2, 0.1, DecayPolicy::SqrtInverse, &mut rng).unwrap();
        let foreign = other.add_layer(Box::new(fc2)).unwrap();
        assert_eq!(foreign.index(), 3);

        let mut net = input_network(PlaneShape::flat(2));
        let fc = FullyConnectedLayer::new("fc", 2, 2, 0.1, DecayPolicy::SqrtInverse, &mut rng).unwrap();
        assert!(matches!(
            net.add_layer_with_inputs(Box::new(fc), &[foreign]),
            Err(DnnError::LayerNotFound(_))
        ));
        assert_eq!(net.len(), 1);
    }

    #[test]
    fn test_aux_inputs_only_for_fully_connected_and_multi_target() {
        let mut rng = SimpleRng::new(8);
        let mut net = conv_network(&mut rng);
        let conv_id = net.layer_id("conv").unwrap();
        let conv = ConvolutionLayer::new("c2", PlaneShape::new(2, 6, 6), 1, 3, 0.1, DecayPolicy::SqrtInverse, &mut rng)
            .unwrap();
        assert!(net.add_layer_with_inputs(Box::new(conv), &[conv_id]).is_err());
        assert_eq!(net.len(), 2);
    }
}

// ============================================================================
// Lookup
// ============================================================================

mod lookup_tests {
    use super::*;

    #[test]
    fn test_lookup_by_name_and_id() {
        let mut rng = SimpleRng::new(9);
        let mut net = conv_network(&mut rng);
        let fc = FullyConnectedLayer::new("fc", 72, 3, 0.1, DecayPolicy::SqrtInverse, &mut rng).unwrap();
        let fc_id = net.add_layer(Box::new(fc)).unwrap();

        assert_eq!(net.layer_id("fc"), Some(fc_id));
        assert_eq!(net.layer(fc_id).unwrap().name(), "fc");
        assert_eq!(net.first_layer().kind(), LayerKind::InputData);
        assert_eq!(net.last_layer().name(), "fc");
        assert!(net.get_layer("nope").is_none());
        assert!(net.layer_as::<FullyConnectedLayer>("fc").is_some());

        let layer = net.get_layer_mut("conv").unwrap();
        let conv = layer.as_any_mut().downcast_mut::<ConvolutionLayer>().unwrap();
        conv.set_method(rust_cnn::layers::ConvMethod::Fft);
        assert_eq!(
            net.layer_as::<ConvolutionLayer>("conv").unwrap().method(),
            rust_cnn::layers::ConvMethod::Fft
        );
    }
}

// ============================================================================
// Fan-in / fan-out gradient routing
// ============================================================================

mod fan_in_tests {
    use super::*;

    fn fc_with(name: &str, weights: Tensor, rng: &mut SimpleRng) -> FullyConnectedLayer {
        FullyConnectedLayer::new(name, 4, 2, 0.1, DecayPolicy::SqrtInverse, rng)
            .unwrap()
            .with_weights(weights)
            .unwrap()
            .with_activation(Activation::None)
    }

    #[test]
    fn test_fan_out_layer_receives_average_of_consumer_slices() {
        let mut rng = SimpleRng::new(10);
        let w1 = Tensor::from_vec(2, 5, vec![1.0, 2.0, 0.0, -1.0, 0.5, 0.0, 1.0, 1.0, 3.0, -0.5]).unwrap();
        let w2 = Tensor::from_vec(2, 5, vec![-2.0, 0.5, 1.0, 0.0, 0.0, 1.5, 0.0, -1.0, 2.0, 1.0]).unwrap();

        let mut net = input_network(PlaneShape::flat(4));
        let probe = ProbeLayer::new("probe", PlaneShape::flat(4)).unwrap();
        let received = Rc::clone(&probe.received);
        let p = net.add_layer(Box::new(probe)).unwrap();
        let f1 = net.add_layer_with_inputs(Box::new(fc_with("f1", w1.clone(), &mut rng)), &[p]).unwrap();
        let f2 = net.add_layer_with_inputs(Box::new(fc_with("f2", w2.clone(), &mut rng)), &[p]).unwrap();
        let mt = MultiTargetLayer::new("heads", 4).unwrap();
        let mt_id = net.add_layer_with_inputs(Box::new(mt), &[f1, f2]).unwrap();

        assert_eq!(net.aux_outputs(p), vec![f1, f2]);
        assert_eq!(net.aux_inputs(mt_id), vec![f1, f2]);

        let x = Tensor::from_vec(4, 2, vec![0.1, 0.2, -0.3, 0.4, 0.5, -0.6, 0.7, 0.8]).unwrap();
        let trace = net.forward(x).unwrap();
        assert_eq!(trace.output().unwrap().shape(), (4, 2));

        let loss_grad = Tensor::from_vec(2, 4, vec![1.0, -1.0, 0.5, 2.0, 0.0, 1.0, -2.0, 1.0]).unwrap();
        net.backward(&trace, &loss_grad, 1).unwrap();

        let lin1 = w1.columns(0, 4).unwrap();
        let lin2 = w2.columns(0, 4).unwrap();
        let dx1 = loss_grad.columns(0, 2).unwrap().matmul(&lin1).unwrap();
        let dx2 = loss_grad.columns(2, 4).unwrap().matmul(&lin2).unwrap();

        let received = received.borrow();
        assert_eq!(received.len(), 1);
        let got = &received[0];
        assert_eq!(got.shape(), (2, 4));
        for s in 0..2 {
            for j in 0..4 {
                let expected = 0.5 * (dx1.get(s, j) + dx2.get(s, j));
                assert!((got.get(s, j) - expected).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_heads_forward_concatenates_sources() {
        let mut rng = SimpleRng::new(11);
        let w1 = Tensor::from_vec(2, 5, vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 0.0, 0.0]).unwrap();
        let w2 = Tensor::from_vec(2, 5, vec![0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, -1.0]).unwrap();

        let mut net = input_network(PlaneShape::flat(4));
        let input_id = net.layer_id("input").unwrap();
        let f1 = net.add_layer(Box::new(fc_with("f1", w1, &mut rng))).unwrap();
        let f2 = net
            .add_layer_with_inputs(Box::new(fc_with("f2", w2, &mut rng)), &[input_id])
            .unwrap();
        net.add_layer_with_inputs(Box::new(MultiTargetLayer::new("heads", 4).unwrap()), &[f1, f2])
            .unwrap();

        let x = Tensor::from_vec(4, 1, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let trace = net.forward(x).unwrap();
        assert_eq!(trace.output().unwrap().as_slice(), &[2.0, 2.0, 3.0, 3.0]);
    }
}

// ============================================================================
// Release
// ============================================================================

mod release_tests {
    use super::*;

    #[test]
    fn test_release_visits_each_layer_once() {
        let mut net = input_network(PlaneShape::flat(4));
        let first = ProbeLayer::new("p1", PlaneShape::flat(4)).unwrap();
        let second = ProbeLayer::new("p2", PlaneShape::flat(4)).unwrap();
        let (c1, c2) = (Rc::clone(&first.released), Rc::clone(&second.released));
        net.add_layer(Box::new(first)).unwrap();
        net.add_layer(Box::new(second)).unwrap();

        assert_eq!(net.release().unwrap(), 3);
        assert_eq!(c1.get(), 1);
        assert_eq!(c2.get(), 1);
    }

    #[test]
    fn test_release_absent_network() {
        assert_eq!(release_network(None).unwrap(), 0);
        let net = input_network(PlaneShape::flat(1));
        assert_eq!(release_network(Some(net)).unwrap(), 1);
    }

    #[test]
    fn test_failed_add_does_not_leak_into_release() {
        let mut rng = SimpleRng::new(12);
        let mut net = conv_network(&mut rng);
        let bad = FullyConnectedLayer::new("bad", 5, 1, 0.1, DecayPolicy::SqrtInverse, &mut rng).unwrap();
        assert!(net.add_layer(Box::new(bad)).is_err());
        assert_eq!(net.release().unwrap(), 2);
    }

    #[test]
    fn test_layer_ids_follow_chain() {
        let mut rng = SimpleRng::new(13);
        let net = conv_network(&mut rng);
        let ids: Vec<LayerId> = net.layer_ids();
        assert_eq!(ids.len(), net.len());
        assert_eq!(ids[0].index(), 0);
        assert_eq!(ids[1].index(), 1);
    }
}
