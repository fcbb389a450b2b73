use std::num::NonZeroUsize;

use log::trace;
use ndarray::{Array1, ArrayView1, ArrayViewMut1};
use ndarray_rand::{RandomExt, rand_distr::StandardNormal};
use rand::{SeedableRng, rngs::StdRng};

use super::{GradEstimator, Objective};
use crate::{SplitErr, error::Result};

/// A zeroth-order gradient estimator built on Stein's identity for Gaussian smoothing.
///
/// For `u ~ N(0, I)`, the smoothed objective `E[f(θ + σu)]` has gradient
/// `E[(f(θ + σu) - f(θ)) u] / σ`, which is estimated by averaging over `samples` directions.
/// With `antithetic` sampling every direction is also evaluated at `θ - σu` and the
/// difference `f(θ + σu) - f(θ - σu)` replaces the one sided one.
#[derive(Debug, Clone)]
pub struct SteinEstimator {
    sigma: f32,
    samples: NonZeroUsize,
    antithetic: bool,
    rng: StdRng,
}

impl SteinEstimator {
    /// Creates a new `SteinEstimator`.
    ///
    /// # Arguments
    /// * `sigma` - The scale of the perturbations.
    /// * `samples` - The amount of directions averaged per estimate.
    /// * `antithetic` - Whether to evaluate each direction on both sides of the point.
    /// * `seed` - The seed of the perturbation sampler.
    ///
    /// # Returns
    /// A new `SteinEstimator` or an error if `sigma` is not a positive number.
    pub fn new(sigma: f32, samples: NonZeroUsize, antithetic: bool, seed: u64) -> Result<Self> {
        if !sigma.is_finite() || sigma <= 0. {
            return Err(SplitErr::Estimator(format!(
                "the smoothing scale must be positive, got {sigma}"
            )));
        }

        Ok(Self {
            sigma,
            samples,
            antithetic,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn sigma(&self) -> f32 {
        self.sigma
    }

    pub fn samples(&self) -> usize {
        self.samples.get()
    }

    /// Evaluates the objective at `params + scale * u`.
    fn loss_along(
        &self,
        objective: &dyn Objective,
        params: ArrayView1<f32>,
        u: ArrayView1<f32>,
        scale: f32,
        point: &mut Array1<f32>,
    ) -> Result<f32> {
        point.assign(&params);
        point.scaled_add(scale, &u);

        let Some(slice) = point.as_slice() else {
            return Err(SplitErr::Estimator(
                "the perturbed point is not contiguous".into(),
            ));
        };

        finite(objective.loss_at(slice)?)
    }
}

impl GradEstimator for SteinEstimator {
    fn estimate(
        &mut self,
        objective: &dyn Objective,
        params: &[f32],
        loss: f32,
        grad: &mut [f32],
    ) -> Result<()> {
        let dim = objective.dim();
        for (what, got) in [("estimator params", params.len()), ("estimator grad", grad.len())] {
            if got != dim {
                return Err(SplitErr::SizeMismatch {
                    what,
                    got,
                    expected: dim,
                });
            }
        }
        let loss = finite(loss)?;

        let theta = ArrayView1::from(params);
        let mut acc = Array1::zeros(dim);

        let mut point = Array1::zeros(dim);
        for i in 0..self.samples.get() {
            let u: Array1<f32> = Array1::random_using(dim, StandardNormal, &mut self.rng);

            let plus = self.loss_along(objective, theta, u.view(), self.sigma, &mut point)?;
            let coeff = if self.antithetic {
                let minus = self.loss_along(objective, theta, u.view(), -self.sigma, &mut point)?;
                (plus - minus) / (2. * self.sigma)
            } else {
                (plus - loss) / self.sigma
            };

            trace!(sample = i, loss = plus, coeff = coeff; "stein sample");
            acc.scaled_add(coeff, &u);
        }

        acc /= self.samples.get() as f32;
        ArrayViewMut1::from(grad).assign(&acc);
        Ok(())
    }
}

fn finite(loss: f32) -> Result<f32> {
    if !loss.is_finite() {
        return Err(SplitErr::NonFiniteLoss { loss });
    }

    Ok(loss)
}
