use std::num::NonZeroUsize;

use log::{debug, info};
use ndarray::{ArrayView1, ArrayView4, Axis};
use rand::Rng;

use super::{StepStats, Trainer};
use crate::{
    arch::{
        Phase,
        loss::{CrossEntropy, LossFn},
    },
    dataset::Dataset,
    error::Result,
    optimization::Optimizer,
    split::{ServerStage, SplitNetwork},
};

/// How the client half of a split network learns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainMode {
    /// The client backpropagates the gradient the server sends across the cut.
    Backprop,
    /// The client backpropagates its own auxiliary loss and ignores the server's gradient.
    LocalLoss,
    /// The client's gradient is estimated from auxiliary loss values alone.
    EstimateGrad,
}

/// Trains a `SplitNetwork`, the server always by backpropagation and the client following a
/// `TrainMode`.
pub struct SplitTrainer<O, R>
where
    O: Optimizer,
    R: Rng,
{
    network: SplitNetwork,
    client_optimizer: O,
    server_optimizer: O,
    mode: TrainMode,
    dataset: Dataset,

    epochs: NonZeroUsize,
    batch_size: NonZeroUsize,
    rng: R,
}

impl<O, R> SplitTrainer<O, R>
where
    O: Optimizer,
    R: Rng,
{
    /// Returns a new `SplitTrainer`.
    ///
    /// # Arguments
    /// * `network` - The network that will be trained.
    /// * `client_optimizer` - The optimizer of the client parameters.
    /// * `server_optimizer` - The optimizer of the server parameters.
    /// * `mode` - How the client learns.
    /// * `dataset` - The dataset the network will be trained with.
    /// * `epochs` - The amount of epochs per `train` call.
    /// * `batch_size` - The amount of samples per step.
    /// * `rng` - The generator used to shuffle the dataset.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        network: SplitNetwork,
        client_optimizer: O,
        server_optimizer: O,
        mode: TrainMode,
        dataset: Dataset,
        epochs: NonZeroUsize,
        batch_size: NonZeroUsize,
        rng: R,
    ) -> Self {
        Self {
            network,
            client_optimizer,
            server_optimizer,
            mode,
            dataset,
            epochs,
            batch_size,
            rng,
        }
    }

    pub fn network(&self) -> &SplitNetwork {
        &self.network
    }

    pub fn mode(&self) -> TrainMode {
        self.mode
    }

    /// Makes one optimization step on a batch.
    ///
    /// # Arguments
    /// * `x` - The inputs of the batch.
    /// * `y` - The labels of the batch.
    pub fn step(&mut self, x: ArrayView4<f32>, y: ArrayView1<usize>) -> Result<StepStats> {
        train_step(
            &mut self.network,
            &mut self.client_optimizer,
            &mut self.server_optimizer,
            self.mode,
            x,
            y,
        )
    }

    /// Runs one epoch over the shuffled dataset.
    pub fn train_epoch(&mut self) -> Result<StepStats> {
        let Self {
            network,
            client_optimizer,
            server_optimizer,
            mode,
            dataset,
            batch_size,
            rng,
            ..
        } = self;
        dataset.shuffle(rng);

        let mut stats = StepStats::default();
        for (i, (x, y)) in dataset.batches(*batch_size).enumerate() {
            let step = train_step(network, client_optimizer, server_optimizer, *mode, x, y)?;
            debug!(batch = i, loss = step.loss; "step");
            stats.merge(step);
        }

        Ok(stats)
    }
}

/// Makes one optimization step of both halves on a batch.
fn train_step<O: Optimizer>(
    network: &mut SplitNetwork,
    client_optimizer: &mut O,
    server_optimizer: &mut O,
    mode: TrainMode,
    x: ArrayView4<f32>,
    y: ArrayView1<usize>,
) -> Result<StepStats> {
    network.zero_grad();

    let (loss, aux_loss) = match mode {
        TrainMode::Backprop => {
            let out = network.forward(x)?;
            let loss = CrossEntropy.loss(out.output.view(), y)?;
            let d_logits = CrossEntropy.loss_prime(out.output.view(), y)?;
            network.backward(d_logits.view())?;
            (loss, None)
        }
        TrainMode::LocalLoss => {
            let client = network.client_mut();
            let (activation, aux) = client.train(x, y)?;
            client.backward_loss(&aux)?;

            let loss = server_step(network.server_mut(), activation.view(), y)?;
            (loss, Some(aux.value()))
        }
        TrainMode::EstimateGrad => {
            let client = network.client_mut();
            let activation = client.estimate(x, y)?;
            let aux = client.last_loss();

            let loss = server_step(network.server_mut(), activation.view(), y)?;
            (loss, aux)
        }
    };

    network.client_mut().params_mut().step(client_optimizer)?;
    network.server_mut().params_mut().step(server_optimizer)?;

    Ok(StepStats {
        loss,
        aux_loss,
        samples: y.len(),
    })
}

/// Forwards and backpropagates the server alone, the gradient of the cut is dropped.
fn server_step(
    server: &mut ServerStage,
    activation: ArrayView4<f32>,
    y: ArrayView1<usize>,
) -> Result<f32> {
    let logits = server.forward(activation)?;
    let loss = CrossEntropy.loss(logits.view(), y)?;
    let d_logits = CrossEntropy.loss_prime(logits.view(), y)?;
    server.backward(d_logits.view())?;
    Ok(loss)
}

impl<O, R> Trainer for SplitTrainer<O, R>
where
    O: Optimizer,
    R: Rng,
{
    fn train(&mut self) -> Result<Vec<StepStats>> {
        let epochs = self.epochs.get();
        let mut history = Vec::with_capacity(epochs);

        for epoch in 0..epochs {
            let stats = self.train_epoch()?;
            info!(
                epoch = epoch,
                loss = stats.loss,
                aux_loss = stats.aux_loss.unwrap_or(f32::NAN);
                "finished epoch"
            );
            history.push(stats);
        }

        Ok(history)
    }

    fn evaluate(&mut self, dataset: &Dataset) -> Result<f32> {
        self.network.set_phase(Phase::Eval);
        let accuracy = evaluate(&self.network, dataset, self.batch_size);
        self.network.set_phase(Phase::Train);
        accuracy
    }

    fn training_accuracy(&mut self) -> Result<f32> {
        self.network.set_phase(Phase::Eval);
        let accuracy = evaluate(&self.network, &self.dataset, self.batch_size);
        self.network.set_phase(Phase::Train);
        accuracy
    }
}

/// Measures the share of samples whose highest logit is their label.
///
/// # Arguments
/// * `network` - The network, evaluated in its current phase without recording.
/// * `dataset` - The labelled samples.
/// * `batch_size` - The amount of samples per forward pass.
pub fn evaluate(
    network: &SplitNetwork,
    dataset: &Dataset,
    batch_size: NonZeroUsize,
) -> Result<f32> {
    if dataset.is_empty() {
        return Ok(0.);
    }

    let mut hits = 0;
    for (x, y) in dataset.batches(batch_size) {
        let out = network.infer(x)?;
        hits += out
            .output
            .axis_iter(Axis(0))
            .zip(y)
            .filter(|(logits, label)| argmax(logits.view()) == **label)
            .count();
    }

    Ok(hits as f32 / dataset.len() as f32)
}

fn argmax(row: ArrayView1<f32>) -> usize {
    row.iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, &v)| {
            if v > best.1 { (i, v) } else { best }
        })
        .0
}
