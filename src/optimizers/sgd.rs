//! Momentum SGD over accumulated update buffers.
//!
//! Layers accumulate descent directions into `*_updates` buffers during
//! backward. An update step adds `learning_rate / batch` times the accumulator
//! to the parameter and then scales the accumulator by `momentum`, so the next
//! accumulation starts from a decayed residual rather than zero.

/// Hyperparameters of one update call.
///
/// * `batch` - Number of samples the accumulators were summed over
/// * `learning_rate` - Step size before batch normalisation
/// * `momentum` - Fraction of the accumulator kept for the next step
/// * `decay` - L2 weight decay, applied to weight matrices only
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpdateArgs {
    pub batch: usize,
    pub learning_rate: f32,
    pub momentum: f32,
    pub decay: f32,
}

impl UpdateArgs {
    pub fn new(batch: usize, learning_rate: f32, momentum: f32, decay: f32) -> Self {
        Self {
            batch,
            learning_rate,
            momentum,
            decay,
        }
    }

    /// `learning_rate / batch`.
    pub fn step_size(&self) -> f32 {
        self.learning_rate / self.batch.max(1) as f32
    }

    /// `parameters += step_size * updates`, then `updates *= momentum`.
    ///
    /// # Panics
    ///
    /// Panics if `parameters` and `updates` have different lengths.
    pub fn apply(&self, parameters: &mut [f32], updates: &mut [f32]) {
        assert_eq!(
            parameters.len(),
            updates.len(),
            "Parameters and updates must have the same length"
        );
        let rate = self.step_size();
        for (param, update) in parameters.iter_mut().zip(updates.iter_mut()) {
            *param += rate * *update;
            *update *= self.momentum;
        }
    }

    /// `updates -= decay * batch * weights`.
    pub fn apply_decay(&self, weights: &[f32], updates: &mut [f32]) {
        assert_eq!(
            weights.len(),
            updates.len(),
            "Weights and updates must have the same length"
        );
        let factor = -self.decay * self.batch as f32;
        if factor == 0.0 {
            return;
        }
        for (update, &weight) in updates.iter_mut().zip(weights) {
            *update += factor * weight;
        }
    }
}
