use std::num::NonZeroUsize;

use ndarray::{Array1, Array4, ArrayView1, ArrayView4, Axis};
use ndarray_rand::{RandomExt, rand_distr::StandardNormal};
use rand::{Rng, seq::SliceRandom};

use crate::{SplitErr, error::Result};

/// An in-memory classification dataset: a batch-major NCHW input tensor and one label per
/// sample.
#[derive(Debug, Clone)]
pub struct Dataset {
    inputs: Array4<f32>,
    labels: Array1<usize>,
    classes: usize,
}

impl Dataset {
    /// Creates a new `Dataset`.
    ///
    /// # Arguments
    /// * `inputs` - The samples, stacked along the first axis.
    /// * `labels` - The class of every sample.
    /// * `classes` - The amount of classes.
    ///
    /// # Returns
    /// A new `Dataset` or an error if the labels do not match the samples.
    pub fn new(inputs: Array4<f32>, labels: Array1<usize>, classes: usize) -> Result<Self> {
        let len = inputs.len_of(Axis(0));
        if labels.len() != len {
            return Err(SplitErr::SizeMismatch {
                what: "dataset labels",
                got: labels.len(),
                expected: len,
            });
        }

        if let Some(&label) = labels.iter().find(|&&label| label >= classes) {
            return Err(SplitErr::LabelOutOfRange { label, classes });
        }

        Ok(Self {
            inputs,
            labels,
            classes,
        })
    }

    /// Generates a class separable dataset: every class has a random prototype image and each
    /// sample is its class prototype plus gaussian noise.
    ///
    /// # Arguments
    /// * `size` - The amount of samples.
    /// * `classes` - The amount of classes, samples are spread evenly among them.
    /// * `shape` - The `(channels, height, width)` of every sample.
    /// * `noise` - The standard deviation of the per sample noise.
    /// * `rng` - The random number generator.
    pub fn synthetic<R: Rng>(
        size: usize,
        classes: usize,
        shape: (usize, (usize, usize)),
        noise: f32,
        rng: &mut R,
    ) -> Result<Self> {
        if classes == 0 {
            return Err(SplitErr::InvalidArch(
                "a dataset needs at least one class".into(),
            ));
        }

        let (channels, (h, w)) = shape;
        let prototypes =
            Array4::<f32>::random_using((classes, channels, h, w), StandardNormal, rng);
        let labels = Array1::from_shape_fn(size, |i| i % classes);

        let mut inputs =
            Array4::<f32>::random_using((size, channels, h, w), StandardNormal, rng) * noise;
        for (mut sample, &label) in inputs.outer_iter_mut().zip(&labels) {
            sample += &prototypes.index_axis(Axis(0), label);
        }

        Self::new(inputs, labels, classes)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn classes(&self) -> usize {
        self.classes
    }

    pub fn inputs(&self) -> ArrayView4<'_, f32> {
        self.inputs.view()
    }

    pub fn labels(&self) -> ArrayView1<'_, usize> {
        self.labels.view()
    }

    /// Permutes the samples and their labels together.
    pub fn shuffle<R: Rng>(&mut self, rng: &mut R) {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.shuffle(rng);

        self.inputs = self.inputs.select(Axis(0), &order);
        self.labels = self.labels.select(Axis(0), &order);
    }

    /// Iterates over consecutive batches, the last one may be smaller.
    pub fn batches(
        &self,
        batch_size: NonZeroUsize,
    ) -> impl Iterator<Item = (ArrayView4<'_, f32>, ArrayView1<'_, usize>)> {
        let size = batch_size.get();
        self.inputs
            .axis_chunks_iter(Axis(0), size)
            .zip(self.labels.axis_chunks_iter(Axis(0), size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{SeedableRng, rngs::StdRng};

    fn dataset() -> Dataset {
        let mut rng = StdRng::seed_from_u64(1);
        Dataset::synthetic(10, 3, (2, (4, 4)), 0.1, &mut rng).unwrap()
    }

    #[test]
    fn batches_cover_every_sample() {
        let dataset = dataset();
        let sizes: Vec<_> = dataset
            .batches(NonZeroUsize::new(4).unwrap())
            .map(|(x, y)| {
                assert_eq!(x.len_of(Axis(0)), y.len());
                y.len()
            })
            .collect();

        assert_eq!(sizes, [4, 4, 2]);
    }

    #[test]
    fn shuffle_keeps_samples_with_their_labels() {
        let mut dataset = dataset();
        let before: Vec<(usize, f32)> = dataset
            .labels()
            .iter()
            .zip(dataset.inputs().outer_iter())
            .map(|(&y, x)| (y, x.sum()))
            .collect();

        dataset.shuffle(&mut StdRng::seed_from_u64(9));

        for (&y, x) in dataset.labels().iter().zip(dataset.inputs().outer_iter()) {
            assert!(before.contains(&(y, x.sum())));
        }
    }

    #[test]
    fn rejects_inconsistent_labels() {
        let inputs = Array4::zeros((2, 1, 1, 1));

        assert!(matches!(
            Dataset::new(inputs.clone(), Array1::from(vec![0]), 2),
            Err(SplitErr::SizeMismatch { .. })
        ));
        assert!(matches!(
            Dataset::new(inputs, Array1::from(vec![0, 2]), 2),
            Err(SplitErr::LabelOutOfRange { label: 2, classes: 2 })
        ));
    }
}
