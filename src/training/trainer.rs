use crate::{dataset::Dataset, error::Result};

use super::StepStats;

/// A split learning trainer.
pub trait Trainer {
    /// Trains for the configured amount of epochs.
    ///
    /// # Returns
    /// The averaged statistics of every epoch.
    fn train(&mut self) -> Result<Vec<StepStats>>;

    /// Measures the accuracy of the network on a dataset, using the running statistics.
    fn evaluate(&mut self, dataset: &Dataset) -> Result<f32>;

    /// Measures the accuracy of the network on the dataset it trains with.
    fn training_accuracy(&mut self) -> Result<f32>;
}
