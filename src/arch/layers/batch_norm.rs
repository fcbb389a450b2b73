use ndarray::{Array1, Array4, ArrayView1, ArrayView4, ArrayViewMut1, Axis, Zip};

use crate::{
    SplitErr,
    arch::Phase,
    error::{Result, ensure_shape},
    initialization::ParamKind,
    params::{LayoutBuilder, Slot},
};

const EPSILON: f32 = 1e-5;
const MOMENTUM: f32 = 0.1;

/// Per channel batch normalization over NCHW batches.
///
/// While training it normalizes with the statistics of the batch and folds them into running
/// statistics, which are the ones used when evaluating. Running statistics are buffers, not
/// parameters: they are never exposed to optimizers or estimators.
#[derive(Debug, Clone)]
pub struct BatchNorm2d {
    channels: usize,
    weight: Slot,
    bias: Slot,
    running_mean: Array1<f32>,
    running_var: Array1<f32>,

    // Forward metadata
    cache: Option<NormCache>,
}

/// The statistics of a batch measured without recording, waiting to be folded into the running
/// statistics of the layer that measured them.
#[derive(Debug, Clone)]
pub struct NormUpdate {
    mean: Array1<f32>,
    var: Array1<f32>,
    samples: usize,
}

#[derive(Debug, Clone)]
struct NormCache {
    x_hat: Array4<f32>,
    inv_std: Array1<f32>,
    batch_stats: bool,
}

impl BatchNorm2d {
    /// Creates a new `BatchNorm2d` and registers its scale and shift.
    ///
    /// # Arguments
    /// * `builder` - The layout of the stage this layer belongs to.
    /// * `name` - The prefix of the parameter names.
    /// * `channels` - The amount of normalized channels.
    pub fn new(builder: &mut LayoutBuilder, name: &str, channels: usize) -> Self {
        let weight = builder.register(format!("{name}.weight"), &[channels], ParamKind::NormScale);
        let bias = builder.register(format!("{name}.bias"), &[channels], ParamKind::NormShift);

        Self {
            channels,
            weight,
            bias,
            running_mean: Array1::zeros(channels),
            running_var: Array1::ones(channels),
            cache: None,
        }
    }

    pub fn running_mean(&self) -> ArrayView1<'_, f32> {
        self.running_mean.view()
    }

    pub fn running_var(&self) -> ArrayView1<'_, f32> {
        self.running_var.view()
    }

    /// Normalizes `x`, keeps what `backward` needs and, while training, updates the running
    /// statistics.
    pub fn forward(
        &mut self,
        params: &[f32],
        x: ArrayView4<f32>,
        phase: Phase,
    ) -> Result<Array4<f32>> {
        let (out, cache, stats) = self.compute(params, x, phase)?;

        if let Some((mean, var)) = stats {
            self.fold(&mean, &var, x.len() / self.channels);
        }

        self.cache = Some(cache);
        Ok(out)
    }

    /// Normalizes `x` leaving both the metadata and the running statistics untouched.
    pub fn infer(&self, params: &[f32], x: ArrayView4<f32>, phase: Phase) -> Result<Array4<f32>> {
        self.compute(params, x, phase).map(|(out, _, _)| out)
    }

    /// Normalizes `x` like `infer`, pushing the batch statistics into `updates` while training
    /// so they can be committed later with `commit`.
    pub fn infer_tracked(
        &self,
        params: &[f32],
        x: ArrayView4<f32>,
        phase: Phase,
        updates: &mut Vec<NormUpdate>,
    ) -> Result<Array4<f32>> {
        let (out, _, stats) = self.compute(params, x, phase)?;

        if let Some((mean, var)) = stats {
            updates.push(NormUpdate {
                mean,
                var,
                samples: x.len() / self.channels,
            });
        }

        Ok(out)
    }

    /// Folds statistics measured by `infer_tracked` into the running statistics.
    pub fn commit(&mut self, update: NormUpdate) -> Result<()> {
        ensure_shape(
            "batch normalization statistics",
            update.mean.shape(),
            &[self.channels],
        )?;

        self.fold(&update.mean, &update.var, update.samples);
        Ok(())
    }

    /// Commits the next update of a sequence measured by a tracked pass over several layers.
    pub fn commit_next<I>(&mut self, updates: &mut I) -> Result<()>
    where
        I: Iterator<Item = NormUpdate>,
    {
        match updates.next() {
            Some(update) => self.commit(update),
            None => Err(SplitErr::SizeMismatch {
                what: "batch normalization updates",
                got: 0,
                expected: 1,
            }),
        }
    }

    fn fold(&mut self, mean: &Array1<f32>, var: &Array1<f32>, samples: usize) {
        let n = samples as f32;
        let unbias = if n > 1. { n / (n - 1.) } else { 1. };

        Zip::from(&mut self.running_mean)
            .and(mean)
            .for_each(|r, &m| *r = (1. - MOMENTUM) * *r + MOMENTUM * m);
        Zip::from(&mut self.running_var)
            .and(var)
            .for_each(|r, &v| *r = (1. - MOMENTUM) * *r + MOMENTUM * v * unbias);
    }

    /// Accumulates the scale and shift gradients and returns the gradient with respect to the
    /// input of the last `forward`.
    pub fn backward(
        &self,
        params: &[f32],
        grad: &mut [f32],
        d: ArrayView4<f32>,
    ) -> Result<Array4<f32>> {
        let Some(cache) = &self.cache else {
            return Err(SplitErr::NoGraph {
                stage: "batch normalization",
            });
        };
        ensure_shape("batch normalization gradient", d.shape(), cache.x_hat.shape())?;

        let gamma = self.weight.of(params);
        let (mut dgamma, mut dbeta) = self.view_grad(grad)?;
        let n = (d.len() / self.channels) as f32;
        let mut dx = Array4::zeros(d.raw_dim());

        for c in 0..self.channels {
            let d_c = d.index_axis(Axis(1), c);
            let x_hat_c = cache.x_hat.index_axis(Axis(1), c);

            let sum_d = d_c.sum();
            let sum_d_x_hat = (&d_c * &x_hat_c).sum();
            dgamma[c] += sum_d_x_hat;
            dbeta[c] += sum_d;

            let scale = gamma[c] * cache.inv_std[c];
            let mut dx_c = dx.index_axis_mut(Axis(1), c);

            if cache.batch_stats {
                let k = scale / n;
                Zip::from(&mut dx_c)
                    .and(&d_c)
                    .and(&x_hat_c)
                    .for_each(|dx, &d, &xh| *dx = k * (n * d - sum_d - xh * sum_d_x_hat));
            } else {
                Zip::from(&mut dx_c).and(&d_c).for_each(|dx, &d| *dx = scale * d);
            }
        }

        Ok(dx)
    }

    #[allow(clippy::type_complexity)]
    fn compute(
        &self,
        params: &[f32],
        x: ArrayView4<f32>,
        phase: Phase,
    ) -> Result<(Array4<f32>, NormCache, Option<(Array1<f32>, Array1<f32>)>)> {
        let (batch, channels, h, w) = x.dim();
        ensure_shape(
            "batch normalization input",
            &[channels],
            &[self.channels],
        )?;

        let batch_stats = phase == Phase::Train;
        let stats = if batch_stats {
            let n = batch * h * w;
            if n == 0 {
                return Err(SplitErr::SizeMismatch {
                    what: "batch normalization samples",
                    got: 0,
                    expected: 1,
                });
            }

            let mut mean = Array1::zeros(channels);
            let mut var = Array1::zeros(channels);

            for (c, x_c) in x.axis_iter(Axis(1)).enumerate() {
                let m = x_c.sum() / n as f32;
                mean[c] = m;
                var[c] = x_c.fold(0., |acc, &v| acc + (v - m).powi(2)) / n as f32;
            }

            Some((mean, var))
        } else {
            None
        };

        let (mean, var) = match &stats {
            Some((mean, var)) => (mean.view(), var.view()),
            None => (self.running_mean.view(), self.running_var.view()),
        };
        let inv_std = var.mapv(|v| 1. / (v + EPSILON).sqrt());

        let gamma = self.weight.of(params);
        let beta = self.bias.of(params);

        let mut x_hat = x.to_owned();
        let mut out = Array4::zeros(x.raw_dim());

        for (c, (mut x_hat_c, mut out_c)) in x_hat
            .axis_iter_mut(Axis(1))
            .zip(out.axis_iter_mut(Axis(1)))
            .enumerate()
        {
            let (m, s) = (mean[c], inv_std[c]);
            let (g, b) = (gamma[c], beta[c]);

            Zip::from(&mut x_hat_c)
                .and(&mut out_c)
                .for_each(|xh, o| {
                    *xh = (*xh - m) * s;
                    *o = g * *xh + b;
                });
        }

        let cache = NormCache {
            x_hat,
            inv_std,
            batch_stats,
        };

        Ok((out, cache, stats))
    }

    /// Gives a view of the raw gradient slice as the delta scale and delta shift of this layer.
    fn view_grad<'a>(
        &self,
        grad: &'a mut [f32],
    ) -> Result<(ArrayViewMut1<'a, f32>, ArrayViewMut1<'a, f32>)> {
        let start = self.weight.range().start;
        let end = self.bias.range().end;
        let (dgamma_raw, dbeta_raw) = grad[start..end].split_at_mut(self.weight.len());

        let dgamma = ArrayViewMut1::from_shape(self.channels, dgamma_raw)?;
        let dbeta = ArrayViewMut1::from_shape(self.channels, dbeta_raw)?;
        Ok((dgamma, dbeta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;
    use ndarray_rand::{RandomExt, rand_distr::Uniform};
    use rand::{SeedableRng, rngs::StdRng};

    fn norm() -> (BatchNorm2d, Vec<f32>) {
        let mut builder = LayoutBuilder::new();
        let norm = BatchNorm2d::new(&mut builder, "bn", 3);
        // Non trivial scale and shift so both paths of the gradient are exercised.
        let params = vec![1.5, 0.5, -1., 0.1, -0.2, 0.3];
        assert_eq!(builder.finish().size(), params.len());
        (norm, params)
    }

    fn input(seed: u64) -> Array4<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array::random_using((4, 3, 2, 2), Uniform::new(-2., 2.).unwrap(), &mut rng)
    }

    #[test]
    fn train_phase_normalizes_each_channel() {
        let (norm, _) = norm();
        let params = [1., 1., 1., 0., 0., 0.];
        let out = norm.infer(&params, input(0).view(), Phase::Train).unwrap();

        for out_c in out.axis_iter(Axis(1)) {
            let mean = out_c.mean().unwrap();
            let var = out_c.mapv(|v| (v - mean).powi(2)).mean().unwrap();
            assert!(mean.abs() < 1e-5);
            assert!((var - 1.).abs() < 1e-3);
        }
    }

    #[test]
    fn forward_updates_running_statistics_infer_does_not() {
        let (mut norm, params) = norm();
        let x = input(1);

        norm.infer(&params, x.view(), Phase::Train).unwrap();
        assert_eq!(norm.running_mean(), Array1::<f32>::zeros(3));

        norm.forward(&params, x.view(), Phase::Train).unwrap();
        assert_ne!(norm.running_mean(), Array1::<f32>::zeros(3));
    }

    #[test]
    fn committed_statistics_match_a_recorded_forward() {
        let (mut recorded, params) = norm();
        let (mut tracked, _) = norm();
        let x = input(5);

        let mut updates = Vec::new();
        let out = tracked
            .infer_tracked(&params, x.view(), Phase::Train, &mut updates)
            .unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(tracked.running_mean(), Array1::<f32>::zeros(3));

        let expected = recorded.forward(&params, x.view(), Phase::Train).unwrap();
        tracked.commit(updates.remove(0)).unwrap();

        assert_eq!(out, expected);
        assert_eq!(tracked.running_mean(), recorded.running_mean());
        assert_eq!(tracked.running_var(), recorded.running_var());
    }

    #[test]
    fn eval_phase_tracks_nothing() {
        let (norm, params) = norm();
        let mut updates = Vec::new();

        norm.infer_tracked(&params, input(6).view(), Phase::Eval, &mut updates).unwrap();
        assert!(updates.is_empty());
    }

    #[test]
    fn eval_phase_uses_running_statistics() {
        let (norm, _) = norm();
        let params = [1., 1., 1., 0., 0., 0.];
        let x = input(2);

        // Fresh running statistics are the identity transform (up to epsilon).
        let out = norm.infer(&params, x.view(), Phase::Eval).unwrap();
        Zip::from(&out).and(&x).for_each(|&o, &x| assert!((o - x).abs() < 1e-4));
    }

    #[test]
    fn rejects_wrong_channels() {
        let (norm, params) = norm();
        let x = Array4::zeros((1, 2, 2, 2));

        assert!(matches!(
            norm.infer(&params, x.view(), Phase::Train),
            Err(SplitErr::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn gradients_match_finite_differences() {
        for phase in [Phase::Train, Phase::Eval] {
            let (mut norm, mut params) = norm();
            let x = input(3);
            let r = input(4);

            norm.forward(&params, x.view(), phase).unwrap();
            let mut grad = vec![0.; params.len()];
            let dx = norm.backward(&params, &mut grad, r.view()).unwrap();

            // Evaluation in the training phase ignores the running statistics, and the
            // evaluation phase never moves them, so `infer` sees what the recorded pass saw.
            let objective = |params: &[f32], x: &Array4<f32>| {
                (norm.infer(params, x.view(), phase).unwrap() * &r).sum()
            };
            let eps = 1e-2;

            for i in 0..params.len() {
                let orig = params[i];
                params[i] = orig + eps;
                let up = objective(&params, &x);
                params[i] = orig - eps;
                let down = objective(&params, &x);
                params[i] = orig;

                let numeric = (up - down) / (2. * eps);
                assert!((numeric - grad[i]).abs() < 2e-2, "param {i}: {numeric} vs {}", grad[i]);
            }

            for idx in [[0, 0, 0, 0], [3, 2, 1, 1], [2, 1, 0, 1]] {
                let mut xp = x.clone();
                xp[idx] += eps;
                let up = objective(&params, &xp);
                xp[idx] -= 2. * eps;
                let down = objective(&params, &xp);

                let numeric = (up - down) / (2. * eps);
                assert!(
                    (numeric - dx[idx]).abs() < 2e-2,
                    "input {idx:?}: {numeric} vs {}",
                    dx[idx]
                );
            }
        }
    }
}
