// Integration tests for global average pooling.

use approx::assert_abs_diff_eq;
use neural_layers::layers::{AvgPoolLayer, Layer, Shape};
use neural_layers::state::NetworkState;
use neural_layers::utils::SimpleRng;

#[test]
fn test_backward_conserves_gradient_per_channel() {
    let shape = Shape::new(5, 3, 4);
    let batch = 2;
    let mut layer = AvgPoolLayer::new(batch, shape).unwrap();
    let mut rng = SimpleRng::new(42);
    let input: Vec<f32> = (0..shape.len() * batch).map(|_| rng.gen_range_f32(-1.0, 1.0)).collect();
    let mut workspace: Vec<f32> = Vec::new();
    layer.forward(NetworkState::train(&input, &mut workspace));

    let delta: Vec<f32> = (0..shape.channels * batch).map(|i| i as f32 - 3.5).collect();
    layer.delta_mut().copy_from_slice(&delta);
    let mut upstream = vec![0.0f32; input.len()];
    layer.backward(NetworkState::train(&input, &mut workspace).with_delta(&mut upstream));

    for (plane, &d) in upstream.chunks_exact(shape.spatial()).zip(&delta) {
        assert_abs_diff_eq!(plane.iter().sum::<f32>(), d, epsilon = 1e-5);
        let share = d / shape.spatial() as f32;
        assert!(plane.iter().all(|&u| (u - share).abs() < 1e-6));
    }
}

#[test]
fn test_forward_is_channel_mean() {
    let mut layer = AvgPoolLayer::new(1, Shape::new(3, 1, 2)).unwrap();
    let input = [1.0f32, 2.0, 6.0, -3.0, 0.0, 3.0];
    let mut workspace: Vec<f32> = Vec::new();
    layer.forward(NetworkState::inference(&input, &mut workspace));
    assert_abs_diff_eq!(layer.output()[0], 3.0, epsilon = 1e-6);
    assert_abs_diff_eq!(layer.output()[1], 0.0, epsilon = 1e-6);
    assert_eq!(layer.output_shape(), Shape::new(1, 1, 2));
}

#[test]
fn test_resize_changes_inputs_only() {
    let mut layer = AvgPoolLayer::new(2, Shape::new(4, 4, 3)).unwrap();
    layer.resize(2, 8).unwrap();
    assert_eq!(layer.inputs(), 48);
    assert_eq!(layer.outputs(), 3);

    let input = vec![2.0f32; 96];
    let mut workspace: Vec<f32> = Vec::new();
    layer.forward(NetworkState::train(&input, &mut workspace));
    assert_eq!(layer.output(), &[2.0; 6]);
}
