//! Batch normalization
//!
//! [`BatchNorm`] is the statistics engine reused by every layer with
//! `batch_normalize` enabled; [`BatchNormLayer`] wraps it as a standalone stage.
//!
//! # Algorithm
//!
//! Buffers are laid out `[batch][channel][spatial]`. In training mode each
//! channel is normalized with the mean and (population) variance of its
//! `batch × spatial` elements:
//!
//! 1. `mean`, `variance` per channel
//! 2. `rolling = 0.9 · rolling + 0.1 · batch_statistic`
//! 3. snapshot `x` (pre-normalization)
//! 4. `y = (y − mean) / sqrt(variance + ε)`
//! 5. snapshot `x_norm`
//! 6. `y = y · scale + bias`
//!
//! Inference mode normalizes with the rolling statistics and applies step 6 only.
//!
//! Backward applies the affine derivative first (`scale_updates`, `bias_updates`,
//! `delta *= scale`) and then the mean/variance chain rule. The order matters:
//! `delta` is rewritten in place between the two phases.
//!
//! All per-call buffers (`x`, `x_norm`, `mean`, `variance`) hold one region per
//! time step so a recurrent layer can run the engine at several steps before
//! its backward pass.

use crate::accelerator::{fix_nan_and_inf, Accelerator, AcceleratorError, DeviceMirror};
use crate::error::LayerError;
use crate::layers::{Layer, LayerKind, Shape};
use crate::optimizers::UpdateArgs;
use crate::state::NetworkState;

/// Added to the variance before the square root.
pub const EPSILON: f32 = 1e-5;

/// Weight of the previous rolling statistic in the exponential average.
pub const ROLLING_DECAY: f32 = 0.9;

/// Per-channel normalization state and learned affine parameters.
#[derive(Debug)]
pub struct BatchNorm {
    channels: usize,
    spatial: usize,
    batch: usize,
    steps: usize,

    scale: Vec<f32>,
    bias: Vec<f32>,
    scale_updates: Vec<f32>,
    bias_updates: Vec<f32>,

    rolling_mean: Vec<f32>,
    rolling_variance: Vec<f32>,

    // One region per time step.
    mean: Vec<f32>,
    variance: Vec<f32>,
    x: Vec<f32>,
    x_norm: Vec<f32>,

    mean_delta: Vec<f32>,
    variance_delta: Vec<f32>,

    device: DeviceMirror,
}

impl BatchNorm {
    /// Creates an engine with `scale = 1`, `bias = 0` and zeroed statistics.
    pub fn new(channels: usize, spatial: usize, batch: usize, steps: usize) -> Self {
        let per_step = channels * spatial * batch;
        Self {
            channels,
            spatial,
            batch,
            steps,
            scale: vec![1.0; channels],
            bias: vec![0.0; channels],
            scale_updates: vec![0.0; channels],
            bias_updates: vec![0.0; channels],
            rolling_mean: vec![0.0; channels],
            rolling_variance: vec![0.0; channels],
            mean: vec![0.0; channels * steps],
            variance: vec![0.0; channels * steps],
            x: vec![0.0; per_step * steps],
            x_norm: vec![0.0; per_step * steps],
            mean_delta: vec![0.0; channels],
            variance_delta: vec![0.0; channels],
            device: DeviceMirror::default(),
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn spatial(&self) -> usize {
        self.spatial
    }

    fn step_len(&self) -> usize {
        self.channels * self.spatial * self.batch
    }

    fn step_range(&self, step: usize) -> std::ops::Range<usize> {
        assert!(step < self.steps, "step {} out of range 0..{}", step, self.steps);
        let n = self.step_len();
        step * n..(step + 1) * n
    }

    fn stat_range(&self, step: usize) -> std::ops::Range<usize> {
        step * self.channels..(step + 1) * self.channels
    }

    /// Normalizes `output` in place and applies the affine transform.
    ///
    /// # Panics
    ///
    /// Panics if `output` does not hold exactly one step's elements or `step`
    /// is out of range.
    pub fn forward(&mut self, step: usize, output: &mut [f32], train: bool, try_fix_nan: bool) {
        let range = self.step_range(step);
        assert_eq!(
            output.len(),
            range.len(),
            "output len mismatch: expected {}, got {}",
            range.len(),
            output.len()
        );
        let stats = self.stat_range(step);
        let (batch, channels, spatial) = (self.batch, self.channels, self.spatial);

        if train {
            let mean = &mut self.mean[stats.clone()];
            let variance = &mut self.variance[stats.clone()];
            channel_mean(output, batch, channels, spatial, mean);
            channel_variance(output, mean, batch, channels, spatial, variance);

            for c in 0..channels {
                self.rolling_mean[c] =
                    ROLLING_DECAY * self.rolling_mean[c] + (1.0 - ROLLING_DECAY) * mean[c];
                self.rolling_variance[c] = ROLLING_DECAY * self.rolling_variance[c]
                    + (1.0 - ROLLING_DECAY) * variance[c];
            }
            if try_fix_nan {
                fix_nan_and_inf(mean);
                fix_nan_and_inf(variance);
                fix_nan_and_inf(&mut self.rolling_mean);
                fix_nan_and_inf(&mut self.rolling_variance);
            }

            self.x[range.clone()].copy_from_slice(output);
            normalize(output, mean, variance, batch, channels, spatial);
            self.x_norm[range].copy_from_slice(output);
        } else {
            normalize(
                output,
                &self.rolling_mean,
                &self.rolling_variance,
                batch,
                channels,
                spatial,
            );
        }

        scale_bias(output, &self.scale, batch, channels, spatial);
        add_bias(output, &self.bias, batch, channels, spatial);
    }

    /// Back-propagates through the affine transform and the normalization.
    ///
    /// Accumulates `bias_updates` and `scale_updates`, then rewrites `delta`
    /// in place into the gradient with respect to the pre-normalization input.
    /// Uses the snapshots and batch statistics of the training forward at `step`.
    pub fn backward(&mut self, step: usize, delta: &mut [f32], try_fix_nan: bool) {
        let range = self.step_range(step);
        assert_eq!(
            delta.len(),
            range.len(),
            "delta len mismatch: expected {}, got {}",
            range.len(),
            delta.len()
        );
        let stats = self.stat_range(step);
        let (batch, channels, spatial) = (self.batch, self.channels, self.spatial);
        let x = &self.x[range.clone()];
        let x_norm = &self.x_norm[range];
        let mean = &self.mean[stats.clone()];
        let variance = &self.variance[stats];

        backward_bias(&mut self.bias_updates, delta, batch, channels, spatial);
        backward_scale(x_norm, delta, batch, channels, spatial, &mut self.scale_updates);
        scale_bias(delta, &self.scale, batch, channels, spatial);

        mean_delta(delta, variance, batch, channels, spatial, &mut self.mean_delta);
        variance_delta(
            x,
            delta,
            mean,
            variance,
            batch,
            channels,
            spatial,
            &mut self.variance_delta,
        );
        normalize_delta(
            x,
            mean,
            variance,
            &self.mean_delta,
            &self.variance_delta,
            batch,
            channels,
            spatial,
            delta,
        );

        if try_fix_nan {
            fix_nan_and_inf(&mut self.scale_updates);
            fix_nan_and_inf(&mut self.bias_updates);
        }
    }

    /// Momentum-SGD step on `scale` and `bias`.
    pub fn update(&mut self, args: &UpdateArgs) {
        args.apply(&mut self.bias, &mut self.bias_updates);
        args.apply(&mut self.scale, &mut self.scale_updates);
    }

    /// Reallocates the per-step snapshots for a new spatial size.
    pub fn resize(&mut self, spatial: usize) {
        self.spatial = spatial;
        let len = self.step_len() * self.steps;
        self.x = vec![0.0; len];
        self.x_norm = vec![0.0; len];
    }

    /// Sweeps every statistic and parameter buffer for non-finite values.
    pub fn sanitize(&mut self) -> usize {
        [
            &mut self.scale[..],
            &mut self.bias[..],
            &mut self.scale_updates[..],
            &mut self.bias_updates[..],
            &mut self.mean[..],
            &mut self.variance[..],
            &mut self.rolling_mean[..],
            &mut self.rolling_variance[..],
        ]
        .into_iter()
        .map(|buffer| fix_nan_and_inf(buffer))
        .sum()
    }

    /// Mirrors `scale`, `bias`, `rolling_mean` and `rolling_variance`.
    pub fn push(&mut self, device: &mut dyn Accelerator) -> Result<(), AcceleratorError> {
        self.device.push_all(
            device,
            &[
                &self.scale[..],
                &self.bias[..],
                &self.rolling_mean[..],
                &self.rolling_variance[..],
            ],
        )
    }

    pub fn pull(&mut self, device: &dyn Accelerator) -> Result<(), AcceleratorError> {
        self.device.pull_all(
            device,
            &mut [
                &mut self.scale[..],
                &mut self.bias[..],
                &mut self.rolling_mean[..],
                &mut self.rolling_variance[..],
            ],
        )
    }

    pub fn scale(&self) -> &[f32] {
        &self.scale
    }

    pub fn scale_mut(&mut self) -> &mut [f32] {
        &mut self.scale
    }

    pub fn bias(&self) -> &[f32] {
        &self.bias
    }

    pub fn bias_mut(&mut self) -> &mut [f32] {
        &mut self.bias
    }

    pub fn scale_updates(&self) -> &[f32] {
        &self.scale_updates
    }

    pub fn bias_updates(&self) -> &[f32] {
        &self.bias_updates
    }

    pub fn rolling_mean(&self) -> &[f32] {
        &self.rolling_mean
    }

    pub fn rolling_mean_mut(&mut self) -> &mut [f32] {
        &mut self.rolling_mean
    }

    pub fn rolling_variance(&self) -> &[f32] {
        &self.rolling_variance
    }

    pub fn rolling_variance_mut(&mut self) -> &mut [f32] {
        &mut self.rolling_variance
    }

    /// Batch mean computed by the training forward at `step`.
    pub fn mean(&self, step: usize) -> &[f32] {
        &self.mean[self.stat_range(step)]
    }

    /// Batch variance computed by the training forward at `step`.
    pub fn variance(&self, step: usize) -> &[f32] {
        &self.variance[self.stat_range(step)]
    }

    pub fn x(&self, step: usize) -> &[f32] {
        &self.x[self.step_range(step)]
    }

    pub fn x_norm(&self, step: usize) -> &[f32] {
        &self.x_norm[self.step_range(step)]
    }
}

#[inline]
fn index(b: usize, c: usize, k: usize, channels: usize, spatial: usize) -> usize {
    (b * channels + c) * spatial + k
}

fn channel_mean(x: &[f32], batch: usize, channels: usize, spatial: usize, mean: &mut [f32]) {
    let n = (batch * spatial) as f32;
    for c in 0..channels {
        let mut sum = 0.0f32;
        for b in 0..batch {
            for k in 0..spatial {
                sum += x[index(b, c, k, channels, spatial)];
            }
        }
        mean[c] = sum / n;
    }
}

fn channel_variance(
    x: &[f32],
    mean: &[f32],
    batch: usize,
    channels: usize,
    spatial: usize,
    variance: &mut [f32],
) {
    let n = (batch * spatial) as f32;
    for c in 0..channels {
        let mut sum = 0.0f32;
        for b in 0..batch {
            for k in 0..spatial {
                let diff = x[index(b, c, k, channels, spatial)] - mean[c];
                sum += diff * diff;
            }
        }
        variance[c] = sum / n;
    }
}

fn normalize(
    x: &mut [f32],
    mean: &[f32],
    variance: &[f32],
    batch: usize,
    channels: usize,
    spatial: usize,
) {
    for b in 0..batch {
        for c in 0..channels {
            let std = (variance[c] + EPSILON).sqrt();
            for k in 0..spatial {
                let i = index(b, c, k, channels, spatial);
                x[i] = (x[i] - mean[c]) / std;
            }
        }
    }
}

fn scale_bias(x: &mut [f32], scale: &[f32], batch: usize, channels: usize, spatial: usize) {
    for b in 0..batch {
        for c in 0..channels {
            for k in 0..spatial {
                x[index(b, c, k, channels, spatial)] *= scale[c];
            }
        }
    }
}

fn add_bias(x: &mut [f32], bias: &[f32], batch: usize, channels: usize, spatial: usize) {
    for b in 0..batch {
        for c in 0..channels {
            for k in 0..spatial {
                x[index(b, c, k, channels, spatial)] += bias[c];
            }
        }
    }
}

/// `bias_updates[c] += Σ delta` over batch and spatial positions.
pub(crate) fn backward_bias(
    bias_updates: &mut [f32],
    delta: &[f32],
    batch: usize,
    channels: usize,
    spatial: usize,
) {
    for b in 0..batch {
        for c in 0..channels {
            let start = index(b, c, 0, channels, spatial);
            bias_updates[c] += delta[start..start + spatial].iter().sum::<f32>();
        }
    }
}

fn backward_scale(
    x_norm: &[f32],
    delta: &[f32],
    batch: usize,
    channels: usize,
    spatial: usize,
    scale_updates: &mut [f32],
) {
    for c in 0..channels {
        let mut sum = 0.0f32;
        for b in 0..batch {
            for k in 0..spatial {
                let i = index(b, c, k, channels, spatial);
                sum += delta[i] * x_norm[i];
            }
        }
        scale_updates[c] += sum;
    }
}

fn mean_delta(
    delta: &[f32],
    variance: &[f32],
    batch: usize,
    channels: usize,
    spatial: usize,
    mean_delta: &mut [f32],
) {
    for c in 0..channels {
        let mut sum = 0.0f32;
        for b in 0..batch {
            for k in 0..spatial {
                sum += delta[index(b, c, k, channels, spatial)];
            }
        }
        mean_delta[c] = -sum / (variance[c] + EPSILON).sqrt();
    }
}

#[allow(clippy::too_many_arguments)]
fn variance_delta(
    x: &[f32],
    delta: &[f32],
    mean: &[f32],
    variance: &[f32],
    batch: usize,
    channels: usize,
    spatial: usize,
    variance_delta: &mut [f32],
) {
    for c in 0..channels {
        let mut sum = 0.0f32;
        for b in 0..batch {
            for k in 0..spatial {
                let i = index(b, c, k, channels, spatial);
                sum += delta[i] * (x[i] - mean[c]);
            }
        }
        variance_delta[c] = -0.5 * sum * (variance[c] + EPSILON).powf(-1.5);
    }
}

#[allow(clippy::too_many_arguments)]
fn normalize_delta(
    x: &[f32],
    mean: &[f32],
    variance: &[f32],
    mean_delta: &[f32],
    variance_delta: &[f32],
    batch: usize,
    channels: usize,
    spatial: usize,
    delta: &mut [f32],
) {
    let n = (batch * spatial) as f32;
    for b in 0..batch {
        for c in 0..channels {
            let std = (variance[c] + EPSILON).sqrt();
            for k in 0..spatial {
                let i = index(b, c, k, channels, spatial);
                delta[i] = delta[i] / std
                    + variance_delta[c] * 2.0 * (x[i] - mean[c]) / n
                    + mean_delta[c] / n;
            }
        }
    }
}

/// Standalone batch-normalization stage.
///
/// Copies its input to `output` and runs the [`BatchNorm`] engine over it.
///
/// # Example
///
/// ```
/// use neural_layers::layers::{BatchNormLayer, Layer, Shape};
/// use neural_layers::state::NetworkState;
///
/// let mut layer = BatchNormLayer::new(2, Shape::new(1, 1, 1)).unwrap();
/// let mut workspace: Vec<f32> = Vec::new();
/// layer.forward(NetworkState::train(&[1.0, 3.0], &mut workspace));
/// assert!((layer.output()[0] + 1.0).abs() < 1e-3);
/// assert!((layer.output()[1] - 1.0).abs() < 1e-3);
/// ```
#[derive(Debug)]
pub struct BatchNormLayer {
    shape: Shape,
    batch: usize,
    output: Vec<f32>,
    delta: Vec<f32>,
    norm: BatchNorm,
}

impl BatchNormLayer {
    pub fn new(batch: usize, shape: Shape) -> Result<Self, LayerError> {
        shape.validate()?;
        if batch == 0 {
            return Err(LayerError::InvalidParameter(
                "batchnorm batch must be greater than 0".to_string(),
            ));
        }
        let size = shape.len() * batch;
        Ok(Self {
            shape,
            batch,
            output: vec![0.0; size],
            delta: vec![0.0; size],
            norm: BatchNorm::new(shape.channels, shape.spatial(), batch, 1),
        })
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn norm(&self) -> &BatchNorm {
        &self.norm
    }

    pub fn norm_mut(&mut self) -> &mut BatchNorm {
        &mut self.norm
    }
}

impl Layer for BatchNormLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::BatchNorm
    }

    fn forward(&mut self, state: NetworkState<'_>) {
        assert_eq!(
            state.input.len(),
            self.output.len(),
            "input len mismatch: expected {}, got {}",
            self.output.len(),
            state.input.len()
        );
        self.output.copy_from_slice(state.input);
        self.norm
            .forward(0, &mut self.output, state.train, state.try_fix_nan);
    }

    fn backward(&mut self, state: NetworkState<'_>) {
        self.norm.backward(0, &mut self.delta, state.try_fix_nan);
        if let Some(upstream) = state.delta {
            for (u, &d) in upstream.iter_mut().zip(&self.delta) {
                *u += d;
            }
        }
    }

    fn update(&mut self, args: &UpdateArgs) {
        self.norm.update(args);
    }

    fn resize(&mut self, width: usize, height: usize) -> Result<(), LayerError> {
        let shape = Shape::new(width, height, self.shape.channels);
        shape.validate()?;
        self.shape = shape;
        let size = shape.len() * self.batch;
        self.output = vec![0.0; size];
        self.delta = vec![0.0; size];
        self.norm.resize(shape.spatial());
        Ok(())
    }

    fn inputs(&self) -> usize {
        self.shape.len()
    }

    fn outputs(&self) -> usize {
        self.shape.len()
    }

    fn batch(&self) -> usize {
        self.batch
    }

    fn output_shape(&self) -> Shape {
        self.shape
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
        2 * self.shape.channels
    }

    fn describe(&self) -> String {
        format!(
            "batchnorm                    {} x {} x {} image",
            self.shape.width, self.shape.height, self.shape.channels
        )
    }

    fn push(&mut self, device: &mut dyn Accelerator) -> Result<(), AcceleratorError> {
        self.norm.push(device)
    }

    fn pull(&mut self, device: &dyn Accelerator) -> Result<(), AcceleratorError> {
        self.norm.pull(device)
    }
}
