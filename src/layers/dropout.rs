//! Dropout layer implementation for regularization
//!
//! In training mode each element is zeroed with probability `p` and survivors
//! are rescaled by `1 / (1 - p)` (inverted dropout). The random draw of every
//! element is cached in `rand` so backward replays exactly the same mask.
//! Inference is a passthrough.
//!
//! With DropBlock enabled, square spatial blocks are zeroed per
//! (sample, channel) plane instead of independent elements.

use crate::error::LayerError;
use crate::layers::{Layer, LayerKind, Shape};
use crate::state::NetworkState;
use crate::utils::SimpleRng;

/// Block size settings for DropBlock.
///
/// * `size_abs` - Block side in pixels; takes precedence when non-zero
/// * `size_rel` - Block side as a fraction of `min(width, height)`
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DropBlock {
    pub size_rel: f32,
    pub size_abs: usize,
}

impl DropBlock {
    /// Side of the dropped square for a `width × height` plane, in `1..=min(w, h)`.
    pub fn block_size(&self, width: usize, height: usize) -> usize {
        let side = width.min(height);
        let block = if self.size_abs > 0 {
            self.size_abs
        } else {
            (self.size_rel * side as f32).round() as usize
        };
        block.clamp(1, side)
    }
}

/// Dropout layer for regularization.
///
/// # Fields
///
/// * `probability` - Chance of dropping each element, in `[0, 1)`
/// * `scale` - `1 / (1 - probability)`
/// * `rand` - Per-element draw of the last training forward. An element was
///   dropped iff `rand[i] < probability`
/// * `mask_active` - Whether the last forward ran in training mode
///
/// # Example
///
/// ```
/// use neural_layers::layers::{DropoutLayer, Layer};
/// use neural_layers::state::NetworkState;
/// use neural_layers::utils::SimpleRng;
///
/// let mut rng = SimpleRng::new(42);
/// let mut layer = DropoutLayer::new(1, 4, 0.5, &mut rng).unwrap();
/// let mut workspace: Vec<f32> = Vec::new();
/// layer.forward(NetworkState::inference(&[1.0, 2.0, 3.0, 4.0], &mut workspace));
/// assert_eq!(layer.output(), &[1.0, 2.0, 3.0, 4.0]);
/// ```
#[derive(Debug)]
pub struct DropoutLayer {
    shape: Shape,
    // Built from a spatial shape; flat layers ignore `resize`.
    spatial: bool,
    batch: usize,
    probability: f32,
    scale: f32,
    dropblock: Option<DropBlock>,

    rand: Vec<f32>,
    sample_scale: Vec<f32>,
    mask_active: bool,

    output: Vec<f32>,
    delta: Vec<f32>,
    rng: SimpleRng,
}

impl DropoutLayer {
    /// Creates an element-wise dropout layer over `inputs` values per sample.
    ///
    /// The layer seeds its own generator from `rng`, so sibling layers draw
    /// different masks. Its size does not depend on the spatial input size,
    /// so `resize` leaves it unchanged.
    pub fn new(
        batch: usize,
        inputs: usize,
        probability: f32,
        rng: &mut SimpleRng,
    ) -> Result<Self, LayerError> {
        Self::build(batch, Shape::flat(inputs), false, probability, None, rng)
    }

    /// Creates an element-wise dropout layer over `shape`-sized samples that
    /// follows the input through `resize`.
    pub fn with_shape(
        batch: usize,
        shape: Shape,
        probability: f32,
        rng: &mut SimpleRng,
    ) -> Result<Self, LayerError> {
        Self::build(batch, shape, true, probability, None, rng)
    }

    /// Creates a DropBlock layer over `shape`-sized samples.
    ///
    /// Fails with [`LayerError::InvalidGeometry`] if any dimension is zero.
    pub fn with_dropblock(
        batch: usize,
        shape: Shape,
        probability: f32,
        dropblock: DropBlock,
        rng: &mut SimpleRng,
    ) -> Result<Self, LayerError> {
        Self::build(batch, shape, true, probability, Some(dropblock), rng)
    }

    fn build(
        batch: usize,
        shape: Shape,
        spatial: bool,
        probability: f32,
        dropblock: Option<DropBlock>,
        rng: &mut SimpleRng,
    ) -> Result<Self, LayerError> {
        shape.validate()?;
        if batch == 0 {
            return Err(LayerError::InvalidParameter(
                "dropout batch must be greater than 0".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&probability) {
            return Err(LayerError::InvalidParameter(format!(
                "dropout probability must be in range [0.0, 1.0), got {}",
                probability
            )));
        }

        let size = shape.len() * batch;
        let seed = (u64::from(rng.next_u32()) << 32) | u64::from(rng.next_u32());
        Ok(Self {
            shape,
            spatial,
            batch,
            probability,
            scale: 1.0 / (1.0 - probability),
            dropblock,
            rand: vec![0.0; size],
            sample_scale: vec![1.0; batch],
            mask_active: false,
            output: vec![0.0; size],
            delta: vec![0.0; size],
            rng: SimpleRng::new(seed),
        })
    }

    pub fn probability(&self) -> f32 {
        self.probability
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn dropblock(&self) -> Option<DropBlock> {
        self.dropblock
    }

    /// Cached draws of the last training forward.
    pub fn rand(&self) -> &[f32] {
        &self.rand
    }

    pub fn mask_active(&self) -> bool {
        self.mask_active
    }

    fn is_dropped(&self, i: usize) -> bool {
        self.rand[i] < self.probability
    }

    fn scale_at(&self, i: usize) -> f32 {
        match self.dropblock {
            Some(_) => self.sample_scale[i / self.shape.len()],
            None => self.scale,
        }
    }

    fn draw_elements(&mut self) {
        for r in self.rand.iter_mut() {
            *r = self.rng.next_f32();
        }
    }

    /// Marks dropped blocks with `0.0` and kept elements with `1.0`.
    fn draw_blocks(&mut self, dropblock: DropBlock) {
        let Shape {
            width,
            height,
            channels,
        } = self.shape;
        let block = dropblock.block_size(width, height);
        let valid = (width - block + 1) * (height - block + 1);
        let gamma = self.probability * (width * height) as f32 / ((block * block * valid) as f32);

        self.rand.fill(1.0);
        for plane in self.rand.chunks_exact_mut(width * height) {
            for y in 0..=height - block {
                for x in 0..=width - block {
                    if self.rng.next_f32() < gamma {
                        for by in y..y + block {
                            plane[by * width + x..by * width + x + block].fill(0.0);
                        }
                    }
                }
            }
        }

        let sample = width * height * channels;
        for (b, scale) in self.sample_scale.iter_mut().enumerate() {
            let kept = self.rand[b * sample..(b + 1) * sample]
                .iter()
                .filter(|&&r| r > 0.0)
                .count();
            *scale = if kept == 0 {
                1.0
            } else {
                sample as f32 / kept as f32
            };
        }
    }
}

impl Layer for DropoutLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Dropout
    }

    fn forward(&mut self, state: NetworkState<'_>) {
        assert_eq!(
            state.input.len(),
            self.output.len(),
            "input len mismatch: expected {}, got {}",
            self.output.len(),
            state.input.len()
        );

        if !state.train {
            self.output.copy_from_slice(state.input);
            self.mask_active = false;
            return;
        }

        match self.dropblock {
            Some(dropblock) => self.draw_blocks(dropblock),
            None => self.draw_elements(),
        }
        for i in 0..self.output.len() {
            self.output[i] = if self.is_dropped(i) {
                0.0
            } else {
                state.input[i] * self.scale_at(i)
            };
        }
        self.mask_active = true;
    }

    fn backward(&mut self, state: NetworkState<'_>) {
        let Some(upstream) = state.delta else {
            return;
        };
        assert_eq!(
            upstream.len(),
            self.delta.len(),
            "upstream delta len mismatch: expected {}, got {}",
            self.delta.len(),
            upstream.len()
        );

        if !self.mask_active {
            for (u, d) in upstream.iter_mut().zip(&self.delta) {
                *u += d;
            }
            return;
        }
        for (i, u) in upstream.iter_mut().enumerate() {
            if !self.is_dropped(i) {
                *u += self.delta[i] * self.scale_at(i);
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
        self.rand = vec![0.0; size];
        self.output = vec![0.0; size];
        self.delta = vec![0.0; size];
        self.mask_active = false;
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

    fn describe(&self) -> String {
        let n = self.shape.len();
        match self.dropblock {
            Some(dropblock) => format!(
                "dropblock       p = {:.2}   block = {}   {:4}  ->  {:4}",
                self.probability,
                dropblock.block_size(self.shape.width, self.shape.height),
                n,
                n
            ),
            None => format!("dropout       p = {:.2}   {:4}  ->  {:4}", self.probability, n, n),
        }
    }
}
