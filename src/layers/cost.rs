//! Cost layer
//!
//! Compares `state.input` against `state.truth` element-wise, keeps the
//! per-element loss in `output` and the descent direction `truth - input` in
//! `delta`. Both passes are skipped when no truth is supplied.

use crate::error::LayerError;
use crate::layers::{Layer, LayerKind, Shape};
use crate::state::NetworkState;

/// Truth value marking a position the masked cost ignores.
pub const SECRET_NUM: f32 = -1234.0;

/// Element-wise loss selected by a cost layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CostType {
    /// Sum of squared errors.
    #[default]
    Sse,
    /// Squared error that skips positions whose truth is [`SECRET_NUM`].
    Masked,
    /// Smooth-L1: squared below an absolute error of 1, linear above.
    Smooth,
}

impl CostType {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sse" => Some(Self::Sse),
            "masked" => Some(Self::Masked),
            "smooth" => Some(Self::Smooth),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Sse => "sse",
            Self::Masked => "masked",
            Self::Smooth => "smooth",
        }
    }
}

/// `delta = truth - pred`, `error = delta²`.
fn l2(pred: impl Iterator<Item = f32>, truth: &[f32], delta: &mut [f32], error: &mut [f32]) {
    for (((p, &t), d), e) in pred.zip(truth).zip(delta.iter_mut()).zip(error.iter_mut()) {
        let diff = t - p;
        *d = diff;
        *e = diff * diff;
    }
}

fn smooth_l1(pred: &[f32], truth: &[f32], delta: &mut [f32], error: &mut [f32]) {
    for (((&p, &t), d), e) in pred.iter().zip(truth).zip(delta.iter_mut()).zip(error.iter_mut()) {
        let diff = t - p;
        let abs = diff.abs();
        if abs < 1.0 {
            *e = diff * diff;
            *d = diff;
        } else {
            *e = 2.0 * abs - 1.0;
            *d = diff.signum();
        }
    }
}

#[derive(Debug)]
pub struct CostLayer {
    shape: Shape,
    // Built from a spatial shape; flat layers ignore `resize`.
    spatial: bool,
    batch: usize,
    cost_type: CostType,
    scale: f32,
    cost: f32,
    output: Vec<f32>,
    delta: Vec<f32>,
}

impl CostLayer {
    /// Creates a cost layer over `inputs` values per sample.
    ///
    /// `scale` multiplies the gradient handed upstream. `resize` leaves a
    /// flat cost layer unchanged.
    pub fn new(
        batch: usize,
        inputs: usize,
        cost_type: CostType,
        scale: f32,
    ) -> Result<Self, LayerError> {
        Self::build(batch, Shape::flat(inputs), false, cost_type, scale)
    }

    /// Creates a cost layer that follows a spatial input through `resize`.
    pub fn with_shape(
        batch: usize,
        shape: Shape,
        cost_type: CostType,
        scale: f32,
    ) -> Result<Self, LayerError> {
        Self::build(batch, shape, true, cost_type, scale)
    }

    fn build(
        batch: usize,
        shape: Shape,
        spatial: bool,
        cost_type: CostType,
        scale: f32,
    ) -> Result<Self, LayerError> {
        shape.validate()?;
        if batch == 0 {
            return Err(LayerError::InvalidParameter(
                "cost batch must be greater than 0".to_string(),
            ));
        }
        let size = shape.len() * batch;
        Ok(Self {
            shape,
            spatial,
            batch,
            cost_type,
            scale,
            cost: 0.0,
            output: vec![0.0; size],
            delta: vec![0.0; size],
        })
    }

    pub fn cost_type(&self) -> CostType {
        self.cost_type
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }
}

impl Layer for CostLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Cost
    }

    fn forward(&mut self, state: NetworkState<'_>) {
        let Some(truth) = state.truth else {
            return;
        };
        let input = state.input;
        assert_eq!(
            input.len(),
            self.output.len(),
            "input len mismatch: expected {}, got {}",
            self.output.len(),
            input.len()
        );
        assert_eq!(
            truth.len(),
            self.output.len(),
            "truth len mismatch: expected {}, got {}",
            self.output.len(),
            truth.len()
        );

        match self.cost_type {
            CostType::Sse => l2(input.iter().copied(), truth, &mut self.delta, &mut self.output),
            // Ignored positions predict the sentinel itself, so they add nothing.
            CostType::Masked => l2(
                input
                    .iter()
                    .zip(truth)
                    .map(|(&x, &t)| if t == SECRET_NUM { SECRET_NUM } else { x }),
                truth,
                &mut self.delta,
                &mut self.output,
            ),
            CostType::Smooth => smooth_l1(input, truth, &mut self.delta, &mut self.output),
        }
        self.cost = self.output.iter().sum();
    }

    fn backward(&mut self, state: NetworkState<'_>) {
        if state.truth.is_none() {
            return;
        }
        if let Some(upstream) = state.delta {
            assert_eq!(
                upstream.len(),
                self.delta.len(),
                "upstream delta len mismatch: expected {}, got {}",
                self.delta.len(),
                upstream.len()
            );
            for (u, d) in upstream.iter_mut().zip(&self.delta) {
                *u += self.scale * d;
            }
        }
    }

    fn resize(&mut self, width: usize, height: usize) -> Result<(), LayerError> {
        if !self.spatial {
            return Ok(());
        }
        let shape = Shape::new(width, height, self.shape.channels);
        shape.validate()?;
        self.shape = shape;
        let size = shape.len() * self.batch;
        self.output = vec![0.0; size];
        self.delta = vec![0.0; size];
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

    fn cost(&self) -> Option<f32> {
        Some(self.cost)
    }

    fn describe(&self) -> String {
        format!("cost                                           {:4}", self.shape.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cost_type_names() {
        for cost_type in [CostType::Sse, CostType::Masked, CostType::Smooth] {
            assert_eq!(CostType::from_name(cost_type.name()), Some(cost_type));
        }
        assert_eq!(CostType::from_name("l1"), None);
    }

    #[test]
    fn test_sse_forward() {
        let mut layer = CostLayer::new(1, 3, CostType::Sse, 1.0).unwrap();
        let input = [1.0f32, 2.0, 3.0];
        let truth = [1.0f32, 0.0, 5.0];
        let mut workspace: Vec<f32> = Vec::new();
        layer.forward(NetworkState::train(&input, &mut workspace).with_truth(&truth));

        assert_eq!(layer.delta(), &[0.0, -2.0, 2.0]);
        assert_eq!(layer.output(), &[0.0, 4.0, 4.0]);
        assert_eq!(layer.cost(), Some(8.0));
    }

    #[test]
    fn test_smooth_l1_branches() {
        let mut layer = CostLayer::new(1, 3, CostType::Smooth, 1.0).unwrap();
        let input = [0.0f32, 0.0, 0.0];
        let truth = [0.5f32, 3.0, -2.0];
        let mut workspace: Vec<f32> = Vec::new();
        layer.forward(NetworkState::train(&input, &mut workspace).with_truth(&truth));

        assert_eq!(layer.output(), &[0.25, 5.0, 3.0]);
        assert_eq!(layer.delta(), &[0.5, 1.0, -1.0]);
    }

    #[test]
    fn test_backward_scales_into_upstream() {
        let mut layer = CostLayer::new(1, 2, CostType::Sse, 0.5).unwrap();
        let input = [0.0f32, 0.0];
        let truth = [2.0f32, -4.0];
        let mut workspace: Vec<f32> = Vec::new();
        layer.forward(NetworkState::train(&input, &mut workspace).with_truth(&truth));

        let mut upstream = vec![1.0f32, 1.0];
        layer.backward(
            NetworkState::train(&input, &mut workspace)
                .with_truth(&truth)
                .with_delta(&mut upstream),
        );
        assert_eq!(upstream, vec![2.0, -1.0]);
    }

    #[test]
    fn test_resize() {
        let mut layer = CostLayer::with_shape(2, Shape::new(2, 2, 3), CostType::Sse, 1.0).unwrap();
        layer.resize(4, 4).unwrap();
        assert_eq!(layer.inputs(), 48);
        assert_eq!(layer.output().len(), 96);
    }

    #[test]
    fn test_resize_keeps_flat_layer() {
        let mut layer = CostLayer::new(1, 10, CostType::Sse, 1.0).unwrap();
        layer.resize(3, 3).unwrap();
        assert_eq!(layer.inputs(), 10);
        assert_eq!(layer.output().len(), 10);
    }

    #[test]
    #[should_panic(expected = "upstream delta len mismatch")]
    fn test_backward_rejects_short_upstream() {
        let mut layer = CostLayer::new(1, 3, CostType::Sse, 1.0).unwrap();
        let input = [0.0f32; 3];
        let truth = [1.0f32; 3];
        let mut workspace: Vec<f32> = Vec::new();
        layer.forward(NetworkState::train(&input, &mut workspace).with_truth(&truth));

        let mut upstream = vec![0.0f32; 2];
        layer.backward(
            NetworkState::train(&input, &mut workspace)
                .with_truth(&truth)
                .with_delta(&mut upstream),
        );
    }
}
