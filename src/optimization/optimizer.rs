use crate::{SplitErr, error::Result};

/// The update rule applied to the flat parameter buffer of a stage once its gradient is
/// complete, whether it was backpropagated or written by an estimator.
pub trait Optimizer {
    /// The amount of parameters this optimizer keeps per parameter state for, if any.
    fn state_len(&self) -> Option<usize> {
        None
    }

    /// Moves `values` against `grad`, both of the same length.
    fn apply(&mut self, values: &mut [f32], grad: &[f32]);

    /// Applies the update rule after checking that the buffers and the state line up.
    ///
    /// # Arguments
    /// * `values` - The parameters of a stage.
    /// * `grad` - The gradient of those parameters.
    ///
    /// # Returns
    /// `SizeMismatch` if the gradient does not match the parameters or the optimizer state.
    fn step(&mut self, values: &mut [f32], grad: &[f32]) -> Result<()> {
        let expected = self.state_len().unwrap_or(values.len());
        if grad.len() != expected || values.len() != expected {
            return Err(SplitErr::SizeMismatch {
                what: "gradient",
                got: grad.len(),
                expected,
            });
        }

        self.apply(values, grad);
        Ok(())
    }
}
