//! Error type for layer construction and resizing.
//!
//! Device-boundary failures stay in [`crate::accelerator::AcceleratorError`],
//! which `Layer::push` and `Layer::pull` return directly.

use thiserror::Error;

/// Errors raised while building or resizing a layer.
///
/// Construction errors are fatal for the layer being built: a constructor that
/// returns `Err` never hands out a partially initialised layer.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LayerError {
    #[error("invalid geometry: width={width}, height={height}, channels={channels}")]
    InvalidGeometry {
        width: usize,
        height: usize,
        channels: usize,
    },
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = LayerError::InvalidGeometry {
            width: 0,
            height: 2,
            channels: 3,
        };
        assert_eq!(err.to_string(), "invalid geometry: width=0, height=2, channels=3");
        let err = LayerError::InvalidParameter("probability must be in [0, 1)".to_string());
        assert_eq!(err.to_string(), "invalid parameter: probability must be in [0, 1)");
    }
}
