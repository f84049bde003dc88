//! Network description files
//!
//! JSON description of a layer chain, validated on load and turned into a
//! [`Network`] by [`build_network`]. Each layer's input geometry is taken from
//! the layer before it (or from its named auxiliary inputs), so only the
//! input layer spells out an image shape.
//!
//! # Example
//!
//! ```json
//! {
//!   "layers": [
//!     { "layer_type": "input", "name": "input", "planes": 1, "height": 8, "width": 8 },
//!     { "layer_type": "convolution", "name": "conv1", "output_planes": 4, "kernel_size": 3,
//!       "learn_rate": 0.05, "decay": "sqrt_inv", "activation": "tanh" },
//!     { "layer_type": "fully_connected", "name": "fc", "output_size": 2,
//!       "learn_rate": 0.1, "activation": "none" }
//!   ]
//! }
//! ```

use crate::error::{DnnError, Result};
use crate::layers::{
    ConvMethod, ConvolutionLayer, CroppingLayer, FullyConnectedLayer, InputDataLayer, Layer,
    MultiTargetLayer, PlaneShape, SubsamplingLayer,
};
use crate::network::{LayerId, Network};
use crate::utils::{Activation, DecayPolicy, SimpleRng};
use serde::Deserialize;
use std::fs;

const LAYER_TYPES: [&str; 6] = [
    "input",
    "convolution",
    "subsampling",
    "fully_connected",
    "cropping",
    "multi_target",
];

/// One layer of a network description.
///
/// Required fields by `layer_type`:
///
/// - **input**: `planes`, `height`, `width`; optional `seq_length` (default 1)
/// - **convolution**: `output_planes`, `kernel_size`, `learn_rate`; optional
///   `decay`, `activation`, `method` (`direct`/`fft`), `connect_mask`,
///   `normalize_input`, `tied_to`
/// - **subsampling**: `scale`, `learn_rate`; optional `decay`
/// - **fully_connected**: `output_size`, `learn_rate`; optional `decay`,
///   `activation`, `inputs`
/// - **cropping**: `height`, `width`
/// - **multi_target**: `inputs`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LayerConfig {
    pub layer_type: String,
    /// Defaults to `layer<index>`.
    pub name: Option<String>,

    pub planes: Option<usize>,
    pub height: Option<usize>,
    pub width: Option<usize>,
    pub seq_length: Option<usize>,

    pub output_planes: Option<usize>,
    pub kernel_size: Option<usize>,
    pub method: Option<ConvMethod>,
    pub connect_mask: Option<Vec<bool>>,
    pub normalize_input: Option<bool>,
    /// Name of an earlier convolution layer whose weights are shared.
    pub tied_to: Option<String>,

    pub scale: Option<usize>,

    pub output_size: Option<usize>,
    /// Names of earlier layers whose outputs are concatenated as input.
    pub inputs: Option<Vec<String>>,

    pub learn_rate: Option<f32>,
    pub decay: Option<String>,
    pub activation: Option<String>,
}

impl LayerConfig {
    fn name_or_default(&self, index: usize) -> String {
        self.name.clone().unwrap_or_else(|| format!("layer{}", index))
    }

    fn decay_policy(&self) -> Result<DecayPolicy> {
        self.decay.as_deref().map_or(Ok(DecayPolicy::default()), str::parse)
    }

    fn activation_or(&self, default: Activation) -> Result<Activation> {
        self.activation.as_deref().map_or(Ok(default), str::parse)
    }
}

/// A full network description.
#[derive(Debug, Clone, Deserialize)]
pub struct ArchitectureConfig {
    pub layers: Vec<LayerConfig>,
}

fn require<T: Copy>(value: Option<T>, index: usize, layer: &LayerConfig, field: &str) -> Result<T> {
    value.ok_or_else(|| {
        DnnError::Config(format!(
            "Layer {}: {} layer requires '{}'",
            index, layer.layer_type, field
        ))
    })
}

/// Loads and validates a network description from a JSON file.
///
/// # Examples
///
/// ```no_run
/// use rust_cnn::architecture::load_architecture;
///
/// let arch = load_architecture("config/lenet.json").unwrap();
/// assert!(!arch.layers.is_empty());
/// ```
pub fn load_architecture(path: &str) -> Result<ArchitectureConfig> {
    let contents = fs::read_to_string(path)?;
    let config: ArchitectureConfig = serde_json::from_str(&contents)?;
    validate_architecture(&config)?;
    Ok(config)
}

/// Checks field presence, value ranges and name references.
///
/// Shape compatibility between layers is checked by [`build_network`], which
/// applies the network's composition rules.
pub fn validate_architecture(config: &ArchitectureConfig) -> Result<()> {
    let first = config
        .layers
        .first()
        .ok_or_else(|| DnnError::Config("Architecture must have at least one layer".to_string()))?;
    if first.layer_type != "input" {
        return Err(DnnError::Config(format!(
            "Layer 0: first layer must be 'input', got '{}'",
            first.layer_type
        )));
    }

    let mut names: Vec<String> = Vec::with_capacity(config.layers.len());
    for (i, layer) in config.layers.iter().enumerate() {
        validate_layer(layer, i)?;
        for reference in layer.inputs.iter().flatten().chain(layer.tied_to.iter()) {
            if !names.contains(reference) {
                return Err(DnnError::Config(format!(
                    "Layer {}: '{}' does not name an earlier layer",
                    i, reference
                )));
            }
        }
        let name = layer.name_or_default(i);
        if names.contains(&name) {
            return Err(DnnError::DuplicateName(name));
        }
        names.push(name);
    }
    Ok(())
}

fn validate_layer(layer: &LayerConfig, index: usize) -> Result<()> {
    let positive = |value: usize, field: &str| -> Result<()> {
        if value == 0 {
            return Err(DnnError::Config(format!(
                "Layer {}: '{}' must be positive",
                index, field
            )));
        }
        Ok(())
    };

    match layer.layer_type.as_str() {
        "input" => {
            positive(require(layer.planes, index, layer, "planes")?, "planes")?;
            positive(require(layer.height, index, layer, "height")?, "height")?;
            positive(require(layer.width, index, layer, "width")?, "width")?;
            if let Some(seq) = layer.seq_length {
                positive(seq, "seq_length")?;
            }
            if index != 0 {
                return Err(DnnError::Config(format!(
                    "Layer {}: input layers can only start a network",
                    index
                )));
            }
        }
        "convolution" => {
            positive(require(layer.output_planes, index, layer, "output_planes")?, "output_planes")?;
            positive(require(layer.kernel_size, index, layer, "kernel_size")?, "kernel_size")?;
            require(layer.learn_rate, index, layer, "learn_rate")?;
        }
        "subsampling" => {
            positive(require(layer.scale, index, layer, "scale")?, "scale")?;
            require(layer.learn_rate, index, layer, "learn_rate")?;
        }
        "fully_connected" => {
            positive(require(layer.output_size, index, layer, "output_size")?, "output_size")?;
            require(layer.learn_rate, index, layer, "learn_rate")?;
        }
        "cropping" => {
            positive(require(layer.height, index, layer, "height")?, "height")?;
            positive(require(layer.width, index, layer, "width")?, "width")?;
        }
        "multi_target" => {
            if layer.inputs.as_ref().map_or(true, Vec::is_empty) {
                return Err(DnnError::Config(format!(
                    "Layer {}: multi_target layer requires 'inputs'",
                    index
                )));
            }
        }
        other => {
            return Err(DnnError::Config(format!(
                "Layer {}: Invalid layer type '{}'. Must be one of: {}",
                index,
                other,
                LAYER_TYPES.join(", ")
            )));
        }
    }

    layer.decay_policy()?;
    layer.activation_or(Activation::default())?;
    Ok(())
}

/// Builds a network from a validated description.
///
/// # Errors
///
/// Any configuration error, layer construction error, or composition rule
/// violation raised while appending a layer.
pub fn build_network(config: &ArchitectureConfig, rng: &mut SimpleRng) -> Result<Network> {
    validate_architecture(config)?;

    let first = &config.layers[0];
    let shape = PlaneShape::new(
        require(first.planes, 0, first, "planes")?,
        require(first.height, 0, first, "height")?,
        require(first.width, 0, first, "width")?,
    );
    let input = InputDataLayer::with_seq_length(
        first.name_or_default(0),
        shape,
        first.seq_length.unwrap_or(1),
    )?;
    let mut network = Network::new(Box::new(input));

    for (i, cfg) in config.layers.iter().enumerate().skip(1) {
        let name = cfg.name_or_default(i);
        let net = &mut network;
        let inputs = resolve_inputs(net, cfg)?;
        let prev_shape = net.last_layer().output_shape();
        let aux_size: usize = inputs
            .iter()
            .filter_map(|&id| net.layer(id))
            .map(|l| l.output_size())
            .sum();

        let layer: Box<dyn Layer> = match cfg.layer_type.as_str() {
            "convolution" => {
                let mut conv = ConvolutionLayer::new(
                    name,
                    prev_shape,
                    require(cfg.output_planes, i, cfg, "output_planes")?,
                    require(cfg.kernel_size, i, cfg, "kernel_size")?,
                    require(cfg.learn_rate, i, cfg, "learn_rate")?,
                    cfg.decay_policy()?,
                    rng,
                )?
                .with_activation(cfg.activation_or(Activation::Tanh)?)
                .with_method(cfg.method.unwrap_or_default())
                .with_input_normalization(cfg.normalize_input.unwrap_or(true));
                if let Some(mask) = &cfg.connect_mask {
                    conv = conv.with_connect_mask(mask.clone())?;
                }
                if let Some(target) = &cfg.tied_to {
                    let shared = net
                        .layer_as::<ConvolutionLayer>(target)
                        .ok_or_else(|| {
                            DnnError::Config(format!(
                                "Layer {}: '{}' is not a convolution layer",
                                i, target
                            ))
                        })?
                        .shared_weights();
                    conv = conv.with_shared_weights(shared)?;
                }
                Box::new(conv)
            }
            "subsampling" => Box::new(SubsamplingLayer::new(
                name,
                prev_shape,
                require(cfg.scale, i, cfg, "scale")?,
                require(cfg.learn_rate, i, cfg, "learn_rate")?,
                cfg.decay_policy()?,
            )?),
            "fully_connected" => {
                let n_inputs = if inputs.is_empty() { prev_shape.size() } else { aux_size };
                Box::new(
                    FullyConnectedLayer::new(
                        name,
                        n_inputs,
                        require(cfg.output_size, i, cfg, "output_size")?,
                        require(cfg.learn_rate, i, cfg, "learn_rate")?,
                        cfg.decay_policy()?,
                        rng,
                    )?
                    .with_activation(cfg.activation_or(Activation::Tanh)?),
                )
            }
            "cropping" => Box::new(CroppingLayer::new(
                name,
                prev_shape,
                require(cfg.height, i, cfg, "height")?,
                require(cfg.width, i, cfg, "width")?,
            )?),
            "multi_target" => Box::new(MultiTargetLayer::new(name, aux_size)?),
            other => {
                return Err(DnnError::Config(format!(
                    "Layer {}: Invalid layer type '{}'",
                    i, other
                )))
            }
        };
        net.add_layer_with_inputs(layer, &inputs)?;
    }
    Ok(network)
}

fn resolve_inputs(network: &Network, cfg: &LayerConfig) -> Result<Vec<LayerId>> {
    cfg.inputs
        .iter()
        .flatten()
        .map(|name| {
            network
                .layer_id(name)
                .ok_or_else(|| DnnError::LayerNotFound(name.clone()))
        })
        .collect()
}
