//! Architecture configuration structures
//!
//! This module provides configuration structures for describing a layer stack
//! in JSON and building it. Building constructs the layers in order and reports
//! each one; wiring them into a training loop is left to the caller.

use crate::config::{validate_config, NetworkConfig};
use crate::layers::{
    AvgPoolLayer, BatchNormLayer, ConnectedLayer, CostLayer, CostType, DropBlock, DropoutLayer,
    Layer, RnnLayer, RnnOptions, Shape,
};
use crate::report::Reporter;
use crate::utils::{Activation, SimpleRng};
use serde::Deserialize;
use std::error::Error;
use std::fs;

/// Configuration for a single layer.
///
/// Different layer types require different fields:
///
/// - **connected**: `inputs`, `outputs`; optional `activation` (default linear),
///   `batch_normalize`
/// - **rnn**: `inputs`, `hidden`, `outputs`, `steps`; optional `activation`,
///   `batch_normalize`, `log`, `shortcut`
/// - **batchnorm**: `width`, `height`, `channels`
/// - **avgpool**: `width`, `height`, `channels`
/// - **dropout**: `probability` and either `inputs` or `width`/`height`/`channels`;
///   optional `dropblock`, `dropblock_size_rel`, `dropblock_size_abs`
///   (dropblock requires the spatial fields)
/// - **cost**: either `inputs` or `width`/`height`/`channels`; optional
///   `cost_type` (default sse), `scale` (default 1)
///
/// # Examples
///
/// ```json
/// {
///   "layer_type": "rnn",
///   "inputs": 8,
///   "hidden": 16,
///   "outputs": 8,
///   "steps": 4,
///   "activation": "leaky"
/// }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LayerConfig {
    /// Type of layer: "connected", "rnn", "batchnorm", "avgpool", "dropout" or "cost"
    pub layer_type: String,

    // Connected / RNN parameters
    pub inputs: Option<usize>,
    pub outputs: Option<usize>,
    /// Hidden state size of an RNN layer
    pub hidden: Option<usize>,
    /// Time steps an RNN layer unrolls per forward call
    pub steps: Option<usize>,
    pub activation: Option<Activation>,
    pub batch_normalize: Option<bool>,
    /// RNN self-layer activation override: 1 = logistic, 2 = loggy
    pub log: Option<u8>,
    /// RNN hidden state persists across steps instead of resetting
    pub shortcut: Option<bool>,

    // Spatial geometry
    pub width: Option<usize>,
    pub height: Option<usize>,
    pub channels: Option<usize>,

    // Dropout parameters
    /// Probability of dropping each element, range [0.0, 1.0)
    pub probability: Option<f32>,
    pub dropblock: Option<bool>,
    pub dropblock_size_rel: Option<f32>,
    pub dropblock_size_abs: Option<usize>,

    // Cost parameters
    /// "sse", "masked" or "smooth"; unknown names fall back to sse
    pub cost_type: Option<String>,
    /// Multiplier applied to the gradient handed upstream
    pub scale: Option<f32>,
}

impl LayerConfig {
    /// Spatial shape, when all three dimensions are given.
    pub fn shape(&self) -> Option<Shape> {
        Some(Shape::new(self.width?, self.height?, self.channels?))
    }
}

/// Configuration for a complete layer stack.
///
/// # Example
///
/// ```json
/// {
///   "net": { "batch": 4, "learning_rate": 0.01 },
///   "layers": [
///     { "layer_type": "connected", "inputs": 16, "outputs": 8, "activation": "relu" },
///     { "layer_type": "dropout", "inputs": 8, "probability": 0.2 },
///     { "layer_type": "connected", "inputs": 8, "outputs": 2 },
///     { "layer_type": "cost", "inputs": 2, "cost_type": "sse" }
///   ]
/// }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ArchitectureConfig {
    /// Network-wide hyperparameters
    #[serde(default)]
    pub net: NetworkConfig,

    /// Sequence of layer configurations defining the network structure
    pub layers: Vec<LayerConfig>,
}

/// Loads an architecture configuration from a JSON file.
///
/// # Returns
///
/// `Ok(ArchitectureConfig)` on success, or an error if the file cannot be
/// read, the JSON is invalid, or validation fails.
///
/// # Examples
///
/// ```no_run
/// use neural_layers::architecture::load_architecture;
///
/// let arch = load_architecture("config/architectures/rnn.json").unwrap();
/// assert!(!arch.layers.is_empty());
/// ```
pub fn load_architecture(path: &str) -> Result<ArchitectureConfig, Box<dyn Error>> {
    let contents = fs::read_to_string(path)?;
    let config: ArchitectureConfig = serde_json::from_str(&contents)?;
    validate_architecture(&config)?;
    Ok(config)
}

fn invalid_data(message: String) -> Box<dyn Error> {
    Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message))
}

fn require<T>(value: Option<T>, index: usize, layer_type: &str, field: &str) -> Result<T, Box<dyn Error>> {
    value.ok_or_else(|| {
        invalid_data(format!(
            "Layer {}: {} layer requires '{}'",
            index, layer_type, field
        ))
    })
}

fn require_positive(
    value: Option<usize>,
    index: usize,
    layer_type: &str,
    field: &str,
) -> Result<usize, Box<dyn Error>> {
    let value = require(value, index, layer_type, field)?;
    if value == 0 {
        return Err(invalid_data(format!(
            "Layer {}: {} must be greater than 0",
            index, field
        )));
    }
    Ok(value)
}

fn require_shape(layer: &LayerConfig, index: usize) -> Result<Shape, Box<dyn Error>> {
    let layer_type = layer.layer_type.as_str();
    Ok(Shape::new(
        require_positive(layer.width, index, layer_type, "width")?,
        require_positive(layer.height, index, layer_type, "height")?,
        require_positive(layer.channels, index, layer_type, "channels")?,
    ))
}

/// Per-sample shape of layers that accept either `inputs` or a spatial shape.
fn flat_or_shape(layer: &LayerConfig, index: usize) -> Result<Shape, Box<dyn Error>> {
    if has_geometry(layer) {
        return require_shape(layer, index);
    }
    Ok(Shape::flat(require_positive(
        layer.inputs,
        index,
        &layer.layer_type,
        "inputs",
    )?))
}

fn has_geometry(layer: &LayerConfig) -> bool {
    layer.width.is_some() || layer.height.is_some() || layer.channels.is_some()
}

/// Gets the per-sample input and output sizes of a layer configuration.
fn layer_sizes(layer: &LayerConfig, index: usize) -> Result<(usize, usize), Box<dyn Error>> {
    let layer_type = layer.layer_type.to_lowercase();

    match layer_type.as_str() {
        "connected" | "rnn" => Ok((
            require_positive(layer.inputs, index, &layer_type, "inputs")?,
            require_positive(layer.outputs, index, &layer_type, "outputs")?,
        )),
        "batchnorm" => {
            let n = require_shape(layer, index)?.len();
            Ok((n, n))
        }
        "avgpool" => {
            let shape = require_shape(layer, index)?;
            Ok((shape.len(), shape.channels))
        }
        "dropout" | "cost" => {
            let n = flat_or_shape(layer, index)?.len();
            Ok((n, n))
        }
        _ => Err(invalid_data(format!(
            "Layer {}: Invalid layer type '{}'. Must be one of: connected, rnn, batchnorm, avgpool, dropout, cost",
            index, layer.layer_type
        ))),
    }
}

/// Validates an architecture configuration.
///
/// Checks that:
/// - The network settings are in range
/// - Architecture has at least one layer
/// - Each layer has the required fields for its type
/// - Layer connections are valid (output size of layer i matches input size of layer i+1)
fn validate_architecture(config: &ArchitectureConfig) -> Result<(), Box<dyn Error>> {
    validate_config(&config.net)?;

    if config.layers.is_empty() {
        return Err(invalid_data(
            "Architecture must have at least one layer".to_string(),
        ));
    }

    let mut sizes = Vec::with_capacity(config.layers.len());
    for (i, layer) in config.layers.iter().enumerate() {
        validate_layer(layer, i, &config.net)?;
        sizes.push(layer_sizes(layer, i)?);
    }

    for (i, pair) in sizes.windows(2).enumerate() {
        let current_output = pair[0].1;
        let next_input = pair[1].0;
        if current_output != next_input {
            return Err(invalid_data(format!(
                "Layer connection mismatch: Layer {} output size ({}) does not match Layer {} input size ({})",
                i,
                current_output,
                i + 1,
                next_input
            )));
        }
    }

    Ok(())
}

/// Validates the type-specific parameters of a single layer.
fn validate_layer(
    layer: &LayerConfig,
    index: usize,
    net: &NetworkConfig,
) -> Result<(), Box<dyn Error>> {
    let layer_type = layer.layer_type.to_lowercase();

    match layer_type.as_str() {
        "rnn" => {
            require_positive(layer.hidden, index, &layer_type, "hidden")?;
            let steps = require_positive(layer.steps, index, &layer_type, "steps")?;
            if net.batch % steps != 0 {
                return Err(invalid_data(format!(
                    "Layer {}: batch {} is not divisible by steps {}",
                    index, net.batch, steps
                )));
            }
        }
        "dropout" => {
            let probability = require(layer.probability, index, &layer_type, "probability")?;
            if !(0.0..1.0).contains(&probability) {
                return Err(invalid_data(format!(
                    "Layer {}: probability must be in range [0.0, 1.0)",
                    index
                )));
            }
            if layer.dropblock.unwrap_or(false) {
                require_shape(layer, index)?;
            }
        }
        _ => {}
    }

    Ok(())
}

/// Builds the layer stack described by `config`.
///
/// Each layer is constructed with the network batch and the shared `rng`, then
/// reported through `reporter`.
///
/// # Arguments
///
/// * `config` - Architecture configuration defining the layer sequence
/// * `rng` - Random number generator for weight initialization and dropout seeds
/// * `reporter` - Receives one summary line per layer and recovered notices
///
/// # Errors
///
/// Returns an error if the configuration is invalid or a layer constructor fails.
///
/// # Examples
///
/// ```no_run
/// use neural_layers::architecture::{build_model, load_architecture};
/// use neural_layers::report::TracingReporter;
/// use neural_layers::utils::SimpleRng;
///
/// let config = load_architecture("config/architectures/rnn.json").unwrap();
/// let mut rng = SimpleRng::new(config.net.seed);
/// let layers = build_model(&config, &mut rng, &mut TracingReporter).unwrap();
/// assert_eq!(layers.len(), config.layers.len());
/// ```
pub fn build_model(
    config: &ArchitectureConfig,
    rng: &mut SimpleRng,
    reporter: &mut dyn Reporter,
) -> Result<Vec<Box<dyn Layer>>, Box<dyn Error>> {
    validate_architecture(config)?;

    let batch = config.net.batch;
    let mut layers: Vec<Box<dyn Layer>> = Vec::with_capacity(config.layers.len());

    for (i, layer_config) in config.layers.iter().enumerate() {
        let layer_type = layer_config.layer_type.to_lowercase();
        let activation = layer_config.activation.unwrap_or_default();
        let batch_normalize = layer_config.batch_normalize.unwrap_or(false);

        let layer: Box<dyn Layer> = match layer_type.as_str() {
            "connected" => Box::new(ConnectedLayer::new(
                batch,
                1,
                require(layer_config.inputs, i, &layer_type, "inputs")?,
                require(layer_config.outputs, i, &layer_type, "outputs")?,
                activation,
                batch_normalize,
                rng,
            )?),
            "rnn" => Box::new(RnnLayer::new(
                RnnOptions {
                    batch,
                    inputs: require(layer_config.inputs, i, &layer_type, "inputs")?,
                    hidden: require(layer_config.hidden, i, &layer_type, "hidden")?,
                    outputs: require(layer_config.outputs, i, &layer_type, "outputs")?,
                    steps: require(layer_config.steps, i, &layer_type, "steps")?,
                    activation,
                    batch_normalize,
                    log: layer_config.log.unwrap_or(0),
                    shortcut: layer_config.shortcut.unwrap_or(false),
                },
                rng,
            )?),
            "batchnorm" => Box::new(BatchNormLayer::new(batch, require_shape(layer_config, i)?)?),
            "avgpool" => Box::new(AvgPoolLayer::new(batch, require_shape(layer_config, i)?)?),
            "dropout" => {
                let probability = require(layer_config.probability, i, &layer_type, "probability")?;
                if layer_config.dropblock.unwrap_or(false) {
                    let dropblock = DropBlock {
                        size_rel: layer_config.dropblock_size_rel.unwrap_or(0.0),
                        size_abs: layer_config.dropblock_size_abs.unwrap_or(0),
                    };
                    Box::new(DropoutLayer::with_dropblock(
                        batch,
                        require_shape(layer_config, i)?,
                        probability,
                        dropblock,
                        rng,
                    )?)
                } else if has_geometry(layer_config) {
                    let shape = require_shape(layer_config, i)?;
                    Box::new(DropoutLayer::with_shape(batch, shape, probability, rng)?)
                } else {
                    let inputs = flat_or_shape(layer_config, i)?.len();
                    Box::new(DropoutLayer::new(batch, inputs, probability, rng)?)
                }
            }
            "cost" => {
                let name = layer_config.cost_type.as_deref().unwrap_or("sse");
                let cost_type = CostType::from_name(name).unwrap_or_else(|| {
                    reporter.notice(&format!(
                        "Layer {}: couldn't find cost type {}, going with sse",
                        i, name
                    ));
                    CostType::Sse
                });
                let scale = layer_config.scale.unwrap_or(1.0);
                if has_geometry(layer_config) {
                    let shape = require_shape(layer_config, i)?;
                    Box::new(CostLayer::with_shape(batch, shape, cost_type, scale)?)
                } else {
                    let inputs = flat_or_shape(layer_config, i)?.len();
                    Box::new(CostLayer::new(batch, inputs, cost_type, scale)?)
                }
            }
            _ => {
                return Err(invalid_data(format!(
                    "Layer {}: Invalid layer type '{}'",
                    i, layer_config.layer_type
                )));
            }
        };

        reporter.layer_built(i, &layer.describe());
        layers.push(layer);
    }

    Ok(layers)
}
