//! Connected (fully connected) layer
//!
//! Computes `output = activation(W · input + b)` per sample. With
//! `batch_normalize` the bias moves into a [`BatchNorm`] engine that runs
//! between the matrix product and the activation.
//!
//! The layer keeps `steps` output and delta regions so a recurrent parent can
//! run it at every time step before back-propagating through all of them.

use crate::accelerator::{Accelerator, AcceleratorError, DeviceMirror};
use crate::error::LayerError;
use crate::layers::batchnorm::{backward_bias, BatchNorm};
use crate::layers::{Layer, LayerKind};
use crate::optimizers::UpdateArgs;
use crate::state::NetworkState;
use crate::utils::{Activation, SimpleRng};

/// Fully connected layer with weights stored row-major as `outputs × inputs`.
///
/// # Fields
///
/// * `weights` - `weights[o * inputs + i]` connects input `i` to output `o`
/// * `biases` - One per output; unused when batch normalization owns the bias
/// * `output`, `delta` - `outputs × batch` elements per step
///
/// # Example
///
/// ```
/// use neural_layers::layers::{ConnectedLayer, Layer};
/// use neural_layers::utils::{Activation, SimpleRng};
///
/// let mut rng = SimpleRng::new(42);
/// let layer = ConnectedLayer::new(4, 1, 10, 3, Activation::Relu, false, &mut rng).unwrap();
/// assert_eq!(layer.inputs(), 10);
/// assert_eq!(layer.outputs(), 3);
/// assert_eq!(layer.parameter_count(), 33);
/// ```
#[derive(Debug)]
pub struct ConnectedLayer {
    inputs: usize,
    outputs: usize,
    batch: usize,
    steps: usize,
    activation: Activation,

    weights: Vec<f32>,
    biases: Vec<f32>,
    weight_updates: Vec<f32>,
    bias_updates: Vec<f32>,

    output: Vec<f32>,
    delta: Vec<f32>,

    norm: Option<BatchNorm>,
    device: DeviceMirror,
}

impl ConnectedLayer {
    /// Create a connected layer.
    ///
    /// Weights are drawn uniformly from `[-sqrt(2 / inputs), sqrt(2 / inputs)]`;
    /// biases start at zero.
    ///
    /// # Arguments
    ///
    /// * `batch` - Samples per step
    /// * `steps` - Number of per-step output regions to keep (1 for plain use)
    /// * `inputs` - Elements per input sample
    /// * `outputs` - Elements per output sample
    /// * `activation` - Element-wise nonlinearity applied last
    /// * `batch_normalize` - Insert a batch-norm engine before the activation
    /// * `rng` - Source for weight initialization
    pub fn new(
        batch: usize,
        steps: usize,
        inputs: usize,
        outputs: usize,
        activation: Activation,
        batch_normalize: bool,
        rng: &mut SimpleRng,
    ) -> Result<Self, LayerError> {
        if batch == 0 || steps == 0 {
            return Err(LayerError::InvalidParameter(format!(
                "connected layer needs batch > 0 and steps > 0, got batch={} steps={}",
                batch, steps
            )));
        }
        if inputs == 0 || outputs == 0 {
            return Err(LayerError::InvalidGeometry {
                width: 1,
                height: 1,
                channels: if inputs == 0 { inputs } else { outputs },
            });
        }

        let scale = (2.0f32 / inputs as f32).sqrt();
        let weights = (0..inputs * outputs)
            .map(|_| rng.gen_range_f32(-scale, scale))
            .collect();

        Ok(Self {
            inputs,
            outputs,
            batch,
            steps,
            activation,
            weights,
            biases: vec![0.0; outputs],
            weight_updates: vec![0.0; inputs * outputs],
            bias_updates: vec![0.0; outputs],
            output: vec![0.0; outputs * batch * steps],
            delta: vec![0.0; outputs * batch * steps],
            norm: batch_normalize.then(|| BatchNorm::new(outputs, 1, batch, steps)),
            device: DeviceMirror::default(),
        })
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    pub fn weights_mut(&mut self) -> &mut [f32] {
        &mut self.weights
    }

    pub fn biases(&self) -> &[f32] {
        &self.biases
    }

    pub fn biases_mut(&mut self) -> &mut [f32] {
        &mut self.biases
    }

    pub fn weight_updates(&self) -> &[f32] {
        &self.weight_updates
    }

    pub fn bias_updates(&self) -> &[f32] {
        match &self.norm {
            Some(norm) => norm.bias_updates(),
            None => &self.bias_updates,
        }
    }

    pub fn norm(&self) -> Option<&BatchNorm> {
        self.norm.as_ref()
    }

    pub fn norm_mut(&mut self) -> Option<&mut BatchNorm> {
        self.norm.as_mut()
    }

    fn step_range(&self, step: usize) -> std::ops::Range<usize> {
        assert!(step < self.steps, "step {} out of range 0..{}", step, self.steps);
        let n = self.outputs * self.batch;
        step * n..(step + 1) * n
    }

    pub fn output_at(&self, step: usize) -> &[f32] {
        &self.output[self.step_range(step)]
    }

    pub fn delta_at(&self, step: usize) -> &[f32] {
        &self.delta[self.step_range(step)]
    }

    pub fn delta_at_mut(&mut self, step: usize) -> &mut [f32] {
        let range = self.step_range(step);
        &mut self.delta[range]
    }

    /// Runs the forward pass into the output region of `step`.
    pub fn forward_at(&mut self, step: usize, state: NetworkState<'_>) {
        let range = self.step_range(step);
        let input = state.input;
        assert_eq!(
            input.len(),
            self.inputs * self.batch,
            "input len mismatch: expected {}, got {}",
            self.inputs * self.batch,
            input.len()
        );

        let output = &mut self.output[range];
        for b in 0..self.batch {
            let sample = &input[b * self.inputs..(b + 1) * self.inputs];
            for o in 0..self.outputs {
                let row = &self.weights[o * self.inputs..(o + 1) * self.inputs];
                output[b * self.outputs + o] =
                    row.iter().zip(sample).map(|(w, x)| w * x).sum::<f32>();
            }
        }

        match self.norm.as_mut() {
            Some(norm) => norm.forward(step, output, state.train, state.try_fix_nan),
            None => {
                for out in output.chunks_exact_mut(self.outputs) {
                    for (value, bias) in out.iter_mut().zip(&self.biases) {
                        *value += bias;
                    }
                }
            }
        }

        self.activation.activate_slice(output);
    }

    /// Back-propagates the delta region of `step`.
    ///
    /// `state.input` must be the input that was used by the forward pass at
    /// `step`. The gradient with respect to it is added into `state.delta`.
    pub fn backward_at(&mut self, step: usize, state: NetworkState<'_>) {
        let range = self.step_range(step);
        let input = state.input;
        assert_eq!(
            input.len(),
            self.inputs * self.batch,
            "input len mismatch: expected {}, got {}",
            self.inputs * self.batch,
            input.len()
        );

        let delta = &mut self.delta[range.clone()];
        self.activation.gradient_slice(&self.output[range], delta);

        match self.norm.as_mut() {
            Some(norm) => norm.backward(step, delta, state.try_fix_nan),
            None => backward_bias(&mut self.bias_updates, delta, self.batch, self.outputs, 1),
        }

        for b in 0..self.batch {
            let sample = &input[b * self.inputs..(b + 1) * self.inputs];
            for o in 0..self.outputs {
                let d = delta[b * self.outputs + o];
                if d == 0.0 {
                    continue;
                }
                let row = &mut self.weight_updates[o * self.inputs..(o + 1) * self.inputs];
                for (update, x) in row.iter_mut().zip(sample) {
                    *update += d * x;
                }
            }
        }

        if let Some(upstream) = state.delta {
            assert_eq!(
                upstream.len(),
                input.len(),
                "upstream delta len mismatch: expected {}, got {}",
                input.len(),
                upstream.len()
            );
            for b in 0..self.batch {
                let grad = &mut upstream[b * self.inputs..(b + 1) * self.inputs];
                for o in 0..self.outputs {
                    let d = delta[b * self.outputs + o];
                    let row = &self.weights[o * self.inputs..(o + 1) * self.inputs];
                    for (g, w) in grad.iter_mut().zip(row) {
                        *g += d * w;
                    }
                }
            }
        }
    }
}

impl Layer for ConnectedLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Connected
    }

    fn forward(&mut self, state: NetworkState<'_>) {
        self.forward_at(0, state);
    }

    fn backward(&mut self, state: NetworkState<'_>) {
        self.backward_at(0, state);
    }

    fn update(&mut self, args: &UpdateArgs) {
        match self.norm.as_mut() {
            Some(norm) => norm.update(args),
            None => args.apply(&mut self.biases, &mut self.bias_updates),
        }
        args.apply_decay(&self.weights, &mut self.weight_updates);
        args.apply(&mut self.weights, &mut self.weight_updates);
    }

    fn inputs(&self) -> usize {
        self.inputs
    }

    fn outputs(&self) -> usize {
        self.outputs
    }

    fn batch(&self) -> usize {
        self.batch
    }

    fn output(&self) -> &[f32] {
        &self.output
    }

    fn delta(&self) -> &[f32] {
        &self.delta
    }

    fn delta_mut(&mut self) -> &mut [f32] {
        &mut self.delta
    }

    fn parameter_count(&self) -> usize {
        let affine = match &self.norm {
            Some(norm) => 2 * norm.channels(),
            None => self.biases.len(),
        };
        self.weights.len() + affine
    }

    fn describe(&self) -> String {
        format!(
            "connected                    {:4}  ->  {:4}  {}{}",
            self.inputs,
            self.outputs,
            self.activation.name(),
            if self.norm.is_some() { "  bn" } else { "" }
        )
    }

    fn push(&mut self, device: &mut dyn Accelerator) -> Result<(), AcceleratorError> {
        self.device
            .push_all(device, &[&self.weights[..], &self.biases[..]])?;
        if let Some(norm) = self.norm.as_mut() {
            norm.push(device)?;
        }
        Ok(())
    }

    fn pull(&mut self, device: &dyn Accelerator) -> Result<(), AcceleratorError> {
        self.device
            .pull_all(device, &mut [&mut self.weights[..], &mut self.biases[..]])?;
        if let Some(norm) = self.norm.as_mut() {
            norm.pull(device)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(inputs: usize, outputs: usize, batch: usize) -> ConnectedLayer {
        let mut rng = SimpleRng::new(42);
        ConnectedLayer::new(batch, 1, inputs, outputs, Activation::Linear, false, &mut rng)
            .unwrap()
    }

    #[test]
    fn test_connected_layer_creation() {
        let layer = layer(10, 5, 2);
        assert_eq!(layer.weights().len(), 50);
        assert_eq!(layer.biases().len(), 5);
        assert_eq!(layer.output().len(), 10);
        assert_eq!(layer.parameter_count(), 55);
    }

    #[test]
    fn test_initialization_range() {
        let layer = layer(8, 4, 1);
        let limit = (2.0f32 / 8.0).sqrt();
        for &weight in layer.weights() {
            assert!(
                weight >= -limit && weight <= limit,
                "Weight {} outside range [{}, {}]",
                weight,
                -limit,
                limit
            );
        }
        assert!(layer.biases().iter().all(|&b| b == 0.0));
    }

    #[test]
    fn test_rejects_zero_sizes() {
        let mut rng = SimpleRng::new(1);
        assert!(ConnectedLayer::new(0, 1, 2, 2, Activation::Linear, false, &mut rng).is_err());
        assert!(ConnectedLayer::new(1, 1, 0, 2, Activation::Linear, false, &mut rng).is_err());
    }

    #[test]
    fn test_forward_matrix_product() {
        let mut layer = layer(2, 2, 1);
        layer.weights_mut().copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        layer.biases_mut().copy_from_slice(&[0.5, -0.5]);

        let mut workspace: Vec<f32> = Vec::new();
        layer.forward(NetworkState::train(&[1.0, 1.0], &mut workspace));

        assert_eq!(layer.output(), &[3.5, 6.5]);
    }

    #[test]
    fn test_backward_gradients() {
        let mut layer = layer(2, 1, 1);
        layer.weights_mut().copy_from_slice(&[2.0, -1.0]);
        let input = [3.0f32, 4.0];
        let mut workspace: Vec<f32> = Vec::new();
        layer.forward(NetworkState::train(&input, &mut workspace));

        layer.delta_mut()[0] = 0.5;
        let mut upstream = vec![0.0f32; 2];
        layer.backward(NetworkState::train(&input, &mut workspace).with_delta(&mut upstream));

        assert_eq!(layer.weight_updates(), &[1.5, 2.0]);
        assert_eq!(layer.bias_updates(), &[0.5]);
        assert_eq!(upstream, vec![1.0, -0.5]);
    }

    #[test]
    fn test_steps_use_separate_regions() {
        let mut rng = SimpleRng::new(3);
        let mut layer =
            ConnectedLayer::new(1, 2, 1, 1, Activation::Linear, false, &mut rng).unwrap();
        layer.weights_mut()[0] = 2.0;
        let mut workspace: Vec<f32> = Vec::new();
        layer.forward_at(0, NetworkState::train(&[1.0], &mut workspace));
        layer.forward_at(1, NetworkState::train(&[5.0], &mut workspace));

        assert_eq!(layer.output_at(0), &[2.0]);
        assert_eq!(layer.output_at(1), &[10.0]);
        assert_eq!(layer.output().len(), 2);
    }

    #[test]
    fn test_batch_normalize_moves_bias_into_engine() {
        let mut rng = SimpleRng::new(5);
        let layer = ConnectedLayer::new(2, 1, 3, 4, Activation::Linear, true, &mut rng).unwrap();
        assert!(layer.norm().is_some());
        assert_eq!(layer.parameter_count(), 12 + 8);
    }

    #[test]
    fn test_batch_normalize_backward_matches_finite_differences() {
        let (batch, inputs, outputs) = (4, 3, 2);
        let mut rng = SimpleRng::new(8);
        let mut layer =
            ConnectedLayer::new(batch, 1, inputs, outputs, Activation::Tanh, true, &mut rng)
                .unwrap();
        if let Some(norm) = layer.norm_mut() {
            norm.scale_mut().copy_from_slice(&[1.5, -0.5]);
            norm.bias_mut().copy_from_slice(&[0.2, -0.1]);
        }
        let x: Vec<f32> = (0..batch * inputs).map(|_| rng.gen_range_f32(-1.0, 1.0)).collect();
        let g: Vec<f32> = (0..batch * outputs).map(|_| rng.gen_range_f32(-1.0, 1.0)).collect();
        let mut workspace: Vec<f32> = Vec::new();

        let mut weighted = |layer: &mut ConnectedLayer, input: &[f32]| -> f32 {
            layer.forward(NetworkState::train(input, &mut workspace));
            layer.output().iter().zip(&g).map(|(a, b)| a * b).sum()
        };

        weighted(&mut layer, &x);
        layer.delta_mut().copy_from_slice(&g);
        let mut analytic = vec![0.0f32; x.len()];
        let mut scratch: Vec<f32> = Vec::new();
        layer.backward(NetworkState::train(&x, &mut scratch).with_delta(&mut analytic));

        let h = 3e-3f32;
        for i in 0..x.len() {
            let mut plus = x.clone();
            plus[i] += h;
            let mut minus = x.clone();
            minus[i] -= h;
            let numeric = (weighted(&mut layer, &plus) - weighted(&mut layer, &minus)) / (2.0 * h);
            approx::assert_relative_eq!(analytic[i], numeric, epsilon = 5e-3, max_relative = 2e-2);
        }
    }

    #[test]
    fn test_update_applies_decay() {
        let mut layer = layer(1, 1, 1);
        layer.weights_mut()[0] = 1.0;
        layer.update(&UpdateArgs::new(1, 1.0, 0.0, 0.1));
        // updates = -0.1 * 1 * 1.0; weight += -0.1
        assert!((layer.weights()[0] - 0.9).abs() < 1e-6);
    }
}
