//! Per-invocation context handed to every layer call.

/// Everything a layer needs for one forward or backward call that it does not own.
///
/// A fresh `NetworkState` is built by the driver for each layer invocation and
/// passed by value. Layers read `input`, accumulate into `delta`, and may use
/// `workspace` as scratch; none of these buffers is retained past the call.
///
/// * `input` - Buffer the layer reads from (the previous layer's output)
/// * `delta` - Gradient buffer of the upstream layer, `None` when nothing
///   upstream needs a gradient (first layer of a network)
/// * `truth` - Ground truth, only consumed by cost layers
/// * `train` - Batch statistics and dropout masks when `true`, rolling
///   statistics and passthrough when `false`
/// * `workspace` - Scratch region shared by whichever layer is executing
/// * `try_fix_nan` - Sweep non-finite statistics and updates back to zero
pub struct NetworkState<'a> {
    pub input: &'a [f32],
    pub delta: Option<&'a mut [f32]>,
    pub truth: Option<&'a [f32]>,
    pub train: bool,
    pub workspace: &'a mut [f32],
    pub try_fix_nan: bool,
}

impl<'a> NetworkState<'a> {
    /// Training-mode state with no upstream gradient and no ground truth.
    pub fn train(input: &'a [f32], workspace: &'a mut [f32]) -> Self {
        Self {
            input,
            delta: None,
            truth: None,
            train: true,
            workspace,
            try_fix_nan: false,
        }
    }

    /// Inference-mode state with no upstream gradient and no ground truth.
    pub fn inference(input: &'a [f32], workspace: &'a mut [f32]) -> Self {
        Self {
            train: false,
            ..Self::train(input, workspace)
        }
    }

    pub fn with_delta(mut self, delta: &'a mut [f32]) -> Self {
        self.delta = Some(delta);
        self
    }

    pub fn with_truth(mut self, truth: &'a [f32]) -> Self {
        self.truth = Some(truth);
        self
    }

    pub fn with_fix_nan(mut self, try_fix_nan: bool) -> Self {
        self.try_fix_nan = try_fix_nan;
        self
    }

    /// Derives a state for a nested layer call.
    ///
    /// The nested state shares the mode flags and the workspace but reads from
    /// `input` and deposits into `delta`. Ground truth is never forwarded.
    pub fn nested<'b>(
        &'b mut self,
        input: &'b [f32],
        delta: Option<&'b mut [f32]>,
    ) -> NetworkState<'b> {
        NetworkState {
            input,
            delta,
            truth: None,
            train: self.train,
            workspace: &mut *self.workspace,
            try_fix_nan: self.try_fix_nan,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders_set_mode_flags() {
        let input = [1.0f32, 2.0];
        let mut workspace = [0.0f32; 4];
        let state = NetworkState::inference(&input, &mut workspace);
        assert!(!state.train);
        assert!(state.delta.is_none());
        assert!(state.truth.is_none());
        assert!(!state.try_fix_nan);
    }

    #[test]
    fn test_nested_drops_truth_and_keeps_flags() {
        let input = [1.0f32, 2.0];
        let truth = [0.0f32, 1.0];
        let inner_input = [3.0f32];
        let mut workspace = [0.0f32; 4];
        let mut state = NetworkState::train(&input, &mut workspace)
            .with_truth(&truth)
            .with_fix_nan(true);

        let nested = state.nested(&inner_input, None);
        assert!(nested.train);
        assert!(nested.try_fix_nan);
        assert!(nested.truth.is_none());
        assert_eq!(nested.input, &[3.0]);
        assert_eq!(nested.workspace.len(), 4);
    }
}
