use ndarray::{Array2, ArrayView1, ArrayView2};

use crate::error::Result;

/// A loss over a batch of logits and the class labels they should predict.
pub trait LossFn {
    fn loss(&self, logits: ArrayView2<f32>, labels: ArrayView1<usize>) -> Result<f32>;
    fn loss_prime(&self, logits: ArrayView2<f32>, labels: ArrayView1<usize>) -> Result<Array2<f32>>;
}
