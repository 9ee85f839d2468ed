//! Layer trait definition for network stages
//!
//! This module defines the contract every layer kind implements: forward,
//! backward, an optional momentum-SGD update and an optional in-place resize.
//! Layers own their `output` and `delta` buffers; everything else arrives
//! through a [`NetworkState`] for the duration of one call.

use std::fmt;

use crate::accelerator::{Accelerator, AcceleratorError};
use crate::error::LayerError;
use crate::optimizers::UpdateArgs;
use crate::state::NetworkState;

/// Discriminant selecting which algorithm a layer runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerKind {
    Connected,
    Rnn,
    BatchNorm,
    AvgPool,
    Dropout,
    Cost,
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connected => "connected",
            Self::Rnn => "rnn",
            Self::BatchNorm => "batchnorm",
            Self::AvgPool => "avgpool",
            Self::Dropout => "dropout",
            Self::Cost => "cost",
        };
        f.write_str(name)
    }
}

/// Spatial geometry of one sample: width × height × channels, row-major
/// with channels outermost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Shape {
    pub width: usize,
    pub height: usize,
    pub channels: usize,
}

impl Shape {
    pub fn new(width: usize, height: usize, channels: usize) -> Self {
        Self {
            width,
            height,
            channels,
        }
    }

    /// A 1×1 shape holding `n` channels (flat vectors).
    pub fn flat(n: usize) -> Self {
        Self::new(1, 1, n)
    }

    pub fn spatial(&self) -> usize {
        self.width * self.height
    }

    pub fn len(&self) -> usize {
        self.width * self.height * self.channels
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fails with [`LayerError::InvalidGeometry`] if any dimension is zero.
    pub fn validate(&self) -> Result<(), LayerError> {
        if self.is_empty() {
            return Err(LayerError::InvalidGeometry {
                width: self.width,
                height: self.height,
                channels: self.channels,
            });
        }
        Ok(())
    }
}

/// Core trait for network layers.
///
/// A driver calls `forward` on every layer in order with `state.input` set to
/// the previous layer's output, then `backward` in reverse order with
/// `state.delta` pointing at the previous layer's delta. Backward accumulates
/// with `+=`, so the driver zeroes every `delta` before a training forward.
///
/// # Example
///
/// ```ignore
/// let mut workspace = vec![0.0f32; layer.workspace_size()];
/// layer.forward(NetworkState::train(&input, &mut workspace));
///
/// layer.delta_mut().copy_from_slice(&grad_from_downstream);
/// let mut grad_input = vec![0.0f32; input.len()];
/// layer.backward(NetworkState::train(&input, &mut workspace).with_delta(&mut grad_input));
/// layer.update(&UpdateArgs::new(batch, 0.01, 0.9, 0.0005));
/// ```
pub trait Layer {
    fn kind(&self) -> LayerKind;

    /// Computes `output` from `state.input`, overwriting previous contents.
    fn forward(&mut self, state: NetworkState<'_>);

    /// Consumes `delta` (already filled by the downstream layer) and adds the
    /// gradient with respect to the input into `state.delta`, if present.
    fn backward(&mut self, state: NetworkState<'_>);

    /// Applies one momentum-SGD step to trainable parameters.
    fn update(&mut self, _args: &UpdateArgs) {}

    /// Recomputes shape-derived sizes and reallocates buffers for a new
    /// spatial input size. Parameters and running statistics are preserved.
    fn resize(&mut self, _width: usize, _height: usize) -> Result<(), LayerError> {
        Ok(())
    }

    /// Elements per sample consumed from `state.input`.
    fn inputs(&self) -> usize;

    /// Elements per sample produced into `output`.
    fn outputs(&self) -> usize;

    fn batch(&self) -> usize;

    fn output_shape(&self) -> Shape {
        Shape::flat(self.outputs())
    }

    fn output(&self) -> &[f32];

    fn delta(&self) -> &[f32];

    fn delta_mut(&mut self) -> &mut [f32];

    fn parameter_count(&self) -> usize {
        0
    }

    /// Scratch elements this layer needs from `NetworkState::workspace`.
    fn workspace_size(&self) -> usize {
        0
    }

    /// Scalar loss of the last forward pass, for cost layers.
    fn cost(&self) -> Option<f32> {
        None
    }

    /// One-line summary for construction reports.
    fn describe(&self) -> String;

    /// Mirrors persistent parameters to the device.
    fn push(&mut self, _device: &mut dyn Accelerator) -> Result<(), AcceleratorError> {
        Ok(())
    }

    /// Copies device parameters back into host buffers.
    fn pull(&mut self, _device: &dyn Accelerator) -> Result<(), AcceleratorError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_sizes() {
        let shape = Shape::new(4, 3, 2);
        assert_eq!(shape.spatial(), 12);
        assert_eq!(shape.len(), 24);
        assert!(shape.validate().is_ok());
        assert_eq!(Shape::flat(7), Shape::new(1, 1, 7));
    }

    #[test]
    fn test_shape_validate_rejects_zero_dimension() {
        let err = Shape::new(0, 3, 2).validate().unwrap_err();
        assert_eq!(
            err,
            LayerError::InvalidGeometry {
                width: 0,
                height: 3,
                channels: 2
            }
        );
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(LayerKind::Rnn.to_string(), "rnn");
        assert_eq!(LayerKind::AvgPool.to_string(), "avgpool");
    }
}
