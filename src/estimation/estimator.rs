use ndarray::{ArrayView1, ArrayView4};

use crate::error::Result;

/// A scalar training objective over a stage's flat parameter vector, evaluated on a fixed batch.
pub trait Objective {
    /// The batch the objective is evaluated on.
    fn input(&self) -> ArrayView4<'_, f32>;

    /// The class labels of the batch.
    fn labels(&self) -> ArrayView1<'_, usize>;

    /// The amount of parameters the objective depends on.
    fn dim(&self) -> usize;

    /// Evaluates the objective at an arbitrary point of parameter space without recording
    /// anything.
    ///
    /// # Arguments
    /// * `params` - A point with exactly `dim` values.
    fn loss_at(&self, params: &[f32]) -> Result<f32>;
}

/// Writes an estimate of an objective's gradient from loss values alone.
pub trait GradEstimator {
    /// Estimates the gradient of `objective` at `params`.
    ///
    /// Every entry of `grad` is **overwritten**, whatever it held before.
    ///
    /// # Arguments
    /// * `objective` - The objective, evaluated at perturbed points.
    /// * `params` - The current parameters.
    /// * `loss` - The objective's value at `params`, already computed by the caller.
    /// * `grad` - The gradient buffer, of the same length as `params`.
    fn estimate(
        &mut self,
        objective: &dyn Objective,
        params: &[f32],
        loss: f32,
        grad: &mut [f32],
    ) -> Result<()>;
}
