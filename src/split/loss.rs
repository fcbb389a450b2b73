use ndarray::{Array2, ArrayView2};

/// A loss produced inside a recorded forward pass, which can be pushed back through the stage
/// that recorded it with `ClientStage::backward_loss`.
#[derive(Debug, Clone)]
pub struct TrackedLoss {
    value: f32,
    d_logits: Array2<f32>,
    recording: u64,
}

impl TrackedLoss {
    pub(crate) fn new(value: f32, d_logits: Array2<f32>, recording: u64) -> Self {
        Self {
            value,
            d_logits,
            recording,
        }
    }

    /// The value of the loss.
    pub fn value(&self) -> f32 {
        self.value
    }

    /// The gradient of the loss with respect to the logits it was computed from.
    pub fn d_logits(&self) -> ArrayView2<'_, f32> {
        self.d_logits.view()
    }

    /// The id of the forward pass this loss belongs to.
    pub fn recording(&self) -> u64 {
        self.recording
    }
}
