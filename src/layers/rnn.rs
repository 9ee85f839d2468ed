//! Recurrent layer
//!
//! An [`RnnLayer`] unrolls `steps` time steps over three connected sub-layers:
//!
//! ```text
//!            input_t ──► input_layer ──┐
//!                                      ├─► h_{t+1} ──► output_layer ──► output_t
//!   h_t ──► self_layer ────────────────┘
//! ```
//!
//! Hidden states live in one buffer of `steps + 1` slots of `hidden × batch`
//! elements; slot 0 is the head. Sub-layers keep one output/delta region per
//! step and are addressed with explicit step indices.

use crate::accelerator::{Accelerator, AcceleratorError};
use crate::error::LayerError;
use crate::layers::{ConnectedLayer, Layer, LayerKind};
use crate::optimizers::UpdateArgs;
use crate::state::NetworkState;
use crate::utils::{Activation, SimpleRng};

/// Construction parameters of an [`RnnLayer`].
///
/// * `batch` - Network batch; split evenly into `steps` sequences
/// * `log` - `1` gives the self layer a logistic activation, `2` loggy,
///   anything else keeps `activation`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RnnOptions {
    pub batch: usize,
    pub inputs: usize,
    pub hidden: usize,
    pub outputs: usize,
    pub steps: usize,
    pub activation: Activation,
    pub batch_normalize: bool,
    pub log: u8,
    pub shortcut: bool,
}

#[derive(Debug)]
pub struct RnnLayer {
    inputs: usize,
    hidden: usize,
    outputs: usize,
    batch: usize,
    steps: usize,
    shortcut: bool,

    input_layer: ConnectedLayer,
    self_layer: ConnectedLayer,
    output_layer: ConnectedLayer,

    state: Vec<f32>,
    carry: Vec<f32>,
}

impl RnnLayer {
    pub fn new(options: RnnOptions, rng: &mut SimpleRng) -> Result<Self, LayerError> {
        let RnnOptions {
            batch,
            inputs,
            hidden,
            outputs,
            steps,
            activation,
            batch_normalize,
            log,
            shortcut,
        } = options;

        if steps == 0 || batch == 0 || batch % steps != 0 {
            return Err(LayerError::InvalidParameter(format!(
                "rnn batch {} must be a positive multiple of steps {}",
                batch, steps
            )));
        }
        let batch = batch / steps;

        let self_activation = match log {
            1 => Activation::Logistic,
            2 => Activation::Loggy,
            _ => activation,
        };

        let input_layer = ConnectedLayer::new(
            batch,
            steps,
            inputs,
            hidden,
            activation,
            batch_normalize,
            rng,
        )?;
        let self_layer = ConnectedLayer::new(
            batch,
            steps,
            hidden,
            hidden,
            self_activation,
            batch_normalize,
            rng,
        )?;
        let output_layer = ConnectedLayer::new(
            batch,
            steps,
            hidden,
            outputs,
            activation,
            batch_normalize,
            rng,
        )?;

        Ok(Self {
            inputs,
            hidden,
            outputs,
            batch,
            steps,
            shortcut,
            input_layer,
            self_layer,
            output_layer,
            state: vec![0.0; hidden * batch * (steps + 1)],
            carry: vec![0.0; hidden * batch],
        })
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn hidden(&self) -> usize {
        self.hidden
    }

    /// Sequences per step (network batch divided by `steps`).
    pub fn step_batch(&self) -> usize {
        self.batch
    }

    pub fn shortcut(&self) -> bool {
        self.shortcut
    }

    pub fn input_layer(&self) -> &ConnectedLayer {
        &self.input_layer
    }

    pub fn input_layer_mut(&mut self) -> &mut ConnectedLayer {
        &mut self.input_layer
    }

    pub fn self_layer(&self) -> &ConnectedLayer {
        &self.self_layer
    }

    pub fn self_layer_mut(&mut self) -> &mut ConnectedLayer {
        &mut self.self_layer
    }

    pub fn output_layer(&self) -> &ConnectedLayer {
        &self.output_layer
    }

    pub fn output_layer_mut(&mut self) -> &mut ConnectedLayer {
        &mut self.output_layer
    }

    fn slot(&self, index: usize) -> std::ops::Range<usize> {
        let n = self.hidden * self.batch;
        index * n..(index + 1) * n
    }

    /// Hidden state slot `index` (`0..=steps`).
    pub fn hidden_state(&self, index: usize) -> &[f32] {
        &self.state[self.slot(index)]
    }

    /// Clears the hidden state carried between inference calls.
    pub fn reset_state(&mut self) {
        self.state.fill(0.0);
    }
}

impl Layer for RnnLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Rnn
    }

    fn forward(&mut self, mut state: NetworkState<'_>) {
        let step_inputs = self.inputs * self.batch;
        let input = state.input;
        assert_eq!(
            input.len(),
            step_inputs * self.steps,
            "input len mismatch: expected {}, got {}",
            step_inputs * self.steps,
            input.len()
        );

        self.output_layer.delta_mut().fill(0.0);
        self.self_layer.delta_mut().fill(0.0);
        self.input_layer.delta_mut().fill(0.0);
        if state.train {
            let head = self.slot(0);
            self.state[head].fill(0.0);
        }

        let mut current = 0;
        for t in 0..self.steps {
            let step_input = &input[t * step_inputs..(t + 1) * step_inputs];
            self.input_layer
                .forward_at(t, state.nested(step_input, None));

            let current_range = self.slot(current);
            self.self_layer
                .forward_at(t, state.nested(&self.state[current_range.clone()], None));

            // Inference keeps rewriting slot 0 so hidden state survives the call.
            let next = if state.train { current + 1 } else { current };
            let next_range = self.slot(next);
            if self.shortcut {
                if next != current {
                    self.state.copy_within(current_range, next_range.start);
                }
            } else {
                self.state[next_range.clone()].fill(0.0);
            }

            let slot = &mut self.state[next_range.clone()];
            let from_input = self.input_layer.output_at(t);
            let from_self = self.self_layer.output_at(t);
            for ((h, a), b) in slot.iter_mut().zip(from_input).zip(from_self) {
                *h += a + b;
            }

            self.output_layer
                .forward_at(t, state.nested(&self.state[next_range], None));
            current = next;
        }
    }

    fn backward(&mut self, mut state: NetworkState<'_>) {
        let step_inputs = self.inputs * self.batch;
        let input = state.input;
        assert_eq!(
            input.len(),
            step_inputs * self.steps,
            "input len mismatch: expected {}, got {}",
            step_inputs * self.steps,
            input.len()
        );
        let mut upstream = state.delta.take();

        for t in (0..self.steps).rev() {
            let previous = self.slot(t);
            let next = self.slot(t + 1);

            // h_{t+1} = [h_t] + input_layer(x_t) + self_layer(h_t)
            if self.shortcut {
                self.state.copy_within(previous.clone(), next.start);
            } else {
                self.state[next.clone()].fill(0.0);
            }
            let from_input = self.input_layer.output_at(t);
            let from_self = self.self_layer.output_at(t);
            for ((h, a), b) in self.state[next.clone()]
                .iter_mut()
                .zip(from_input)
                .zip(from_self)
            {
                *h += a + b;
            }

            self.output_layer.backward_at(
                t,
                state.nested(&self.state[next], Some(self.self_layer.delta_at_mut(t))),
            );

            // Both summands of h_{t+1} receive the same gradient.
            self.input_layer
                .delta_at_mut(t)
                .copy_from_slice(self.self_layer.delta_at(t));

            if self.shortcut && t > 0 {
                let (earlier, later) = self
                    .self_layer
                    .delta_mut()
                    .split_at_mut(t * self.hidden * self.batch);
                let previous_delta = &mut earlier[(t - 1) * self.hidden * self.batch..];
                for (p, d) in previous_delta.iter_mut().zip(&later[..self.hidden * self.batch]) {
                    *p += d;
                }
            }

            self.carry.fill(0.0);
            let carry = if t > 0 {
                Some(&mut self.carry[..])
            } else {
                None
            };
            self.self_layer
                .backward_at(t, state.nested(&self.state[previous], carry));
            if t > 0 {
                for (p, c) in self.self_layer.delta_at_mut(t - 1).iter_mut().zip(&self.carry) {
                    *p += c;
                }
            }

            let step_input = &input[t * step_inputs..(t + 1) * step_inputs];
            let step_delta = upstream
                .as_deref_mut()
                .map(|delta| &mut delta[t * step_inputs..(t + 1) * step_inputs]);
            self.input_layer
                .backward_at(t, state.nested(step_input, step_delta));
        }
    }

    fn update(&mut self, args: &UpdateArgs) {
        self.input_layer.update(args);
        self.self_layer.update(args);
        self.output_layer.update(args);
    }

    fn inputs(&self) -> usize {
        self.inputs
    }

    fn outputs(&self) -> usize {
        self.outputs
    }

    /// Total samples per call: `steps` × sequences per step.
    fn batch(&self) -> usize {
        self.batch * self.steps
    }

    fn output(&self) -> &[f32] {
        self.output_layer.output()
    }

    fn delta(&self) -> &[f32] {
        self.output_layer.delta()
    }

    fn delta_mut(&mut self) -> &mut [f32] {
        self.output_layer.delta_mut()
    }

    fn parameter_count(&self) -> usize {
        self.input_layer.parameter_count()
            + self.self_layer.parameter_count()
            + self.output_layer.parameter_count()
    }

    fn workspace_size(&self) -> usize {
        self.input_layer
            .workspace_size()
            .max(self.self_layer.workspace_size())
            .max(self.output_layer.workspace_size())
    }

    fn describe(&self) -> String {
        format!(
            "RNN Layer: {} inputs, {} outputs",
            self.inputs, self.outputs
        )
    }

    fn push(&mut self, device: &mut dyn Accelerator) -> Result<(), AcceleratorError> {
        self.input_layer.push(device)?;
        self.self_layer.push(device)?;
        self.output_layer.push(device)
    }

    fn pull(&mut self, device: &dyn Accelerator) -> Result<(), AcceleratorError> {
        self.input_layer.pull(device)?;
        self.self_layer.pull(device)?;
        self.output_layer.pull(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(batch: usize, steps: usize) -> RnnOptions {
        RnnOptions {
            batch,
            inputs: 3,
            hidden: 4,
            outputs: 2,
            steps,
            activation: Activation::Linear,
            batch_normalize: false,
            log: 0,
            shortcut: false,
        }
    }

    #[test]
    fn test_rnn_creation() {
        let mut rng = SimpleRng::new(42);
        let layer = RnnLayer::new(options(6, 3), &mut rng).unwrap();
        assert_eq!(layer.step_batch(), 2);
        assert_eq!(layer.batch(), 6);
        assert_eq!(layer.output().len(), 2 * 6);
        assert_eq!(layer.hidden_state(3).len(), 8);
        assert_eq!(layer.input_layer().steps(), 3);
        assert_eq!(layer.describe(), "RNN Layer: 3 inputs, 2 outputs");
    }

    #[test]
    fn test_rejects_indivisible_batch() {
        let mut rng = SimpleRng::new(42);
        assert!(matches!(
            RnnLayer::new(options(5, 2), &mut rng),
            Err(LayerError::InvalidParameter(_))
        ));
        assert!(RnnLayer::new(options(4, 0), &mut rng).is_err());
    }

    #[test]
    fn test_log_option_selects_self_activation() {
        let mut rng = SimpleRng::new(42);
        let layer = RnnLayer::new(
            RnnOptions {
                log: 2,
                ..options(2, 1)
            },
            &mut rng,
        )
        .unwrap();
        assert_eq!(layer.self_layer().activation(), Activation::Loggy);
        assert_eq!(layer.input_layer().activation(), Activation::Linear);
    }

    #[test]
    fn test_training_forward_fills_every_slot() {
        let mut rng = SimpleRng::new(7);
        let mut layer = RnnLayer::new(options(2, 2), &mut rng).unwrap();
        let input = [1.0f32, 0.5, -0.5, 0.25, 0.0, 1.0];
        let mut workspace: Vec<f32> = Vec::new();
        layer.forward(NetworkState::train(&input, &mut workspace));

        // Slot 1 is input_layer(x_0) + self_layer(0); self biases start at zero.
        assert_eq!(layer.hidden_state(0), &[0.0; 4]);
        assert_eq!(layer.hidden_state(1), layer.input_layer().output_at(0));
    }

    #[test]
    fn test_parameter_count_sums_sub_layers() {
        let mut rng = SimpleRng::new(42);
        let layer = RnnLayer::new(options(1, 1), &mut rng).unwrap();
        assert_eq!(layer.parameter_count(), (3 * 4 + 4) + (4 * 4 + 4) + (4 * 2 + 2));
    }
}
