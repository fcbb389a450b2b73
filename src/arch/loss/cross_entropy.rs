use ndarray::{Array2, ArrayView1, ArrayView2, Axis};

use super::LossFn;
use crate::{SplitErr, error::Result};

/// Softmax cross entropy averaged over the batch.
#[derive(Debug, Default, Clone, Copy)]
pub struct CrossEntropy;

impl CrossEntropy {
    /// Returns a new `CrossEntropy`.
    pub fn new() -> Self {
        Self
    }

    fn check(&self, logits: ArrayView2<f32>, labels: ArrayView1<usize>) -> Result<()> {
        let (batch, classes) = logits.dim();
        if labels.len() != batch {
            return Err(SplitErr::SizeMismatch {
                what: "labels",
                got: labels.len(),
                expected: batch,
            });
        }

        if let Some(&label) = labels.iter().find(|&&label| label >= classes) {
            return Err(SplitErr::LabelOutOfRange { label, classes });
        }

        Ok(())
    }
}

impl LossFn for CrossEntropy {
    fn loss(&self, logits: ArrayView2<f32>, labels: ArrayView1<usize>) -> Result<f32> {
        self.check(logits, labels)?;
        if labels.is_empty() {
            return Ok(0.);
        }

        let total: f32 = logits
            .outer_iter()
            .zip(labels)
            .map(|(row, &label)| log_sum_exp(row) - row[label])
            .sum();

        Ok(total / labels.len() as f32)
    }

    fn loss_prime(
        &self,
        logits: ArrayView2<f32>,
        labels: ArrayView1<usize>,
    ) -> Result<Array2<f32>> {
        self.check(logits, labels)?;

        let batch = logits.nrows().max(1) as f32;
        let mut d = softmax(logits);
        for (mut row, &label) in d.axis_iter_mut(Axis(0)).zip(labels) {
            row[label] -= 1.;
        }

        d /= batch;
        Ok(d)
    }
}

fn log_sum_exp(row: ArrayView1<f32>) -> f32 {
    let max = row.fold(f32::NEG_INFINITY, |acc, &z| acc.max(z));
    max + row.mapv(|z| (z - max).exp()).sum().ln()
}

/// Row-wise softmax.
pub fn softmax(logits: ArrayView2<f32>) -> Array2<f32> {
    let mut out = logits.to_owned();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let max = row.fold(f32::NEG_INFINITY, |acc, &z| acc.max(z));
        row.mapv_inplace(|z| (z - max).exp());
        let sum = row.sum();
        row /= sum;
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn uniform_logits_cost_log_classes() {
        let logits = Array2::zeros((3, 4));
        let labels = array![0, 1, 3];

        let loss = CrossEntropy.loss(logits.view(), labels.view()).unwrap();
        assert!((loss - 4f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn stable_on_large_logits() {
        let logits = array![[1000., 0.], [0., -1000.]];
        let labels = array![0, 1];

        let loss = CrossEntropy.loss(logits.view(), labels.view()).unwrap();
        assert!(loss.is_finite());
        assert!((loss - 500.).abs() < 1e-2);
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let logits = array![[0.3, -1.2, 0.8], [2.0, 0.1, -0.4]];
        let labels = array![2, 0];
        let d = CrossEntropy.loss_prime(logits.view(), labels.view()).unwrap();

        let eps = 1e-2;
        for ((i, j), &analytic) in d.indexed_iter() {
            let mut plus = logits.clone();
            plus[[i, j]] += eps;
            let mut minus = logits.clone();
            minus[[i, j]] -= eps;

            let lp = CrossEntropy.loss(plus.view(), labels.view()).unwrap();
            let lm = CrossEntropy.loss(minus.view(), labels.view()).unwrap();
            let numeric = (lp - lm) / (2. * eps);
            assert!((numeric - analytic).abs() < 1e-3, "{numeric} vs {analytic}");
        }
    }

    #[test]
    fn rejects_bad_labels() {
        let logits = Array2::zeros((2, 3));

        assert!(matches!(
            CrossEntropy.loss(logits.view(), array![0, 3].view()),
            Err(SplitErr::LabelOutOfRange { label: 3, classes: 3 })
        ));
        assert!(matches!(
            CrossEntropy.loss_prime(logits.view(), array![0].view()),
            Err(SplitErr::SizeMismatch { .. })
        ));
    }
}
