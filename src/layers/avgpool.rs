//! Global average pooling
//!
//! Reduces every channel of a `width × height × channels` sample to its mean,
//! producing `channels` outputs per sample.

use crate::error::LayerError;
use crate::layers::{Layer, LayerKind, Shape};
use crate::state::NetworkState;

#[derive(Debug)]
pub struct AvgPoolLayer {
    shape: Shape,
    batch: usize,
    output: Vec<f32>,
    delta: Vec<f32>,
}

impl AvgPoolLayer {
    pub fn new(batch: usize, shape: Shape) -> Result<Self, LayerError> {
        shape.validate()?;
        if batch == 0 {
            return Err(LayerError::InvalidParameter(
                "avgpool batch must be greater than 0".to_string(),
            ));
        }
        let size = shape.channels * batch;
        Ok(Self {
            shape,
            batch,
            output: vec![0.0; size],
            delta: vec![0.0; size],
        })
    }

    pub fn input_shape(&self) -> Shape {
        self.shape
    }
}

impl Layer for AvgPoolLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::AvgPool
    }

    fn forward(&mut self, state: NetworkState<'_>) {
        let spatial = self.shape.spatial();
        assert_eq!(
            state.input.len(),
            self.shape.len() * self.batch,
            "input len mismatch: expected {}, got {}",
            self.shape.len() * self.batch,
            state.input.len()
        );

        for (out, plane) in self
            .output
            .iter_mut()
            .zip(state.input.chunks_exact(spatial))
        {
            *out = plane.iter().sum::<f32>() / spatial as f32;
        }
    }

    fn backward(&mut self, state: NetworkState<'_>) {
        let Some(upstream) = state.delta else {
            return;
        };
        let spatial = self.shape.spatial();
        assert_eq!(
            upstream.len(),
            self.shape.len() * self.batch,
            "upstream delta len mismatch: expected {}, got {}",
            self.shape.len() * self.batch,
            upstream.len()
        );

        for (d, plane) in self.delta.iter().zip(upstream.chunks_exact_mut(spatial)) {
            let share = d / spatial as f32;
            for u in plane {
                *u += share;
            }
        }
    }

    /// Output size is independent of the spatial extent; only `inputs` changes.
    fn resize(&mut self, width: usize, height: usize) -> Result<(), LayerError> {
        let shape = Shape::new(width, height, self.shape.channels);
        shape.validate()?;
        self.shape = shape;
        Ok(())
    }

    fn inputs(&self) -> usize {
        self.shape.len()
    }

    fn outputs(&self) -> usize {
        self.shape.channels
    }

    fn batch(&self) -> usize {
        self.batch
    }

    fn output_shape(&self) -> Shape {
        Shape::new(1, 1, self.shape.channels)
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

    fn describe(&self) -> String {
        format!(
            "avg                     {:4} x{:4} x{:4}   ->  {:4}",
            self.shape.width, self.shape.height, self.shape.channels, self.shape.channels
        )
    }
}
