use std::{cell::RefCell, rc::Rc};

use rand::{Rng, SeedableRng, rngs::StdRng};

use super::{SplitTrainer, TrainMode, Trainer};
use crate::{
    dataset::Dataset,
    error::Result,
    estimation::{GradEstimator, SteinEstimator},
    optimization::{GradientDescent, GradientDescentWithMomentum, Optimizer},
    specs::{EstimatorSpec, ModeSpec, OptimizerSpec, TrainerSpec},
    split::{ClientStage, ServerStage, SplitNetwork},
};

/// Builds `Trainer`s given a specification.
#[derive(Default)]
pub struct TrainerBuilder;

impl TrainerBuilder {
    /// Creates a new `TrainerBuilder`.
    pub fn new() -> Self {
        Self
    }

    /// Builds a new `Trainer` following a spec.
    ///
    /// # Arguments
    /// * `spec` - The specification for the trainer.
    ///
    /// # Returns
    /// The trainer, or an error if any of its parts is invalid.
    pub fn build(&self, spec: &TrainerSpec) -> Result<Box<dyn Trainer>> {
        let mut rng = self.generate_rng(spec.seed);
        let network = self.resolve_network(spec, &mut rng)?;
        let dataset = Dataset::synthetic(
            spec.dataset.size,
            spec.client.classes,
            (spec.client.in_channels, spec.client.input_hw),
            spec.dataset.noise,
            &mut rng,
        )?;

        self.resolve_optimizer(spec, network, dataset, rng)
    }

    /// Builds the network a spec describes, drawing its parameters from `rng`.
    pub fn resolve_network(&self, spec: &TrainerSpec, rng: &mut StdRng) -> Result<SplitNetwork> {
        let estimator = self.resolve_estimator(spec.estimator, rng)?;
        let param_rng = Rc::new(RefCell::new(StdRng::seed_from_u64(rng.random())));

        let client = ClientStage::new(&spec.client, estimator, param_rng.clone())?;
        let server = ServerStage::new(&spec.server, param_rng)?;
        SplitNetwork::new(client, server)
    }

    fn resolve_estimator(
        &self,
        spec: EstimatorSpec,
        rng: &mut StdRng,
    ) -> Result<Box<dyn GradEstimator>> {
        match spec {
            EstimatorSpec::Stein {
                sigma,
                samples,
                antithetic,
                seed,
            } => {
                let seed = seed.unwrap_or_else(|| rng.random());
                let estimator = SteinEstimator::new(sigma, samples, antithetic, seed)?;
                Ok(Box::new(estimator))
            }
        }
    }

    fn resolve_optimizer(
        &self,
        spec: &TrainerSpec,
        network: SplitNetwork,
        dataset: Dataset,
        rng: StdRng,
    ) -> Result<Box<dyn Trainer>> {
        let client_len = network.client().params().len();
        let server_len = network.server().params().len();

        let trainer = match spec.optimizer {
            OptimizerSpec::GradientDescent { learning_rate } => {
                let client = GradientDescent::new(learning_rate);
                let server = GradientDescent::new(learning_rate);
                self.terminate_build(spec, network, (client, server), dataset, rng)
            }
            OptimizerSpec::GradientDescentWithMomentum {
                learning_rate,
                momentum,
            } => {
                let client = GradientDescentWithMomentum::new(client_len, learning_rate, momentum);
                let server = GradientDescentWithMomentum::new(server_len, learning_rate, momentum);
                self.terminate_build(spec, network, (client, server), dataset, rng)
            }
        };

        Ok(trainer)
    }

    fn terminate_build<O>(
        &self,
        spec: &TrainerSpec,
        network: SplitNetwork,
        (client_optimizer, server_optimizer): (O, O),
        dataset: Dataset,
        rng: StdRng,
    ) -> Box<dyn Trainer>
    where
        O: Optimizer + 'static,
    {
        let trainer = SplitTrainer::new(
            network,
            client_optimizer,
            server_optimizer,
            self.resolve_mode(spec.mode),
            dataset,
            spec.epochs,
            spec.batch_size,
            rng,
        );

        Box::new(trainer)
    }

    fn resolve_mode(&self, spec: ModeSpec) -> TrainMode {
        match spec {
            ModeSpec::Backprop => TrainMode::Backprop,
            ModeSpec::LocalLoss => TrainMode::LocalLoss,
            ModeSpec::EstimateGrad => TrainMode::EstimateGrad,
        }
    }

    fn generate_rng(&self, seed: Option<u64>) -> StdRng {
        match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        }
    }
}
