use std::{cell::RefCell, rc::Rc};

use log::debug;
use ndarray::{Array2, Array4, ArrayView1, ArrayView4};
use rand::Rng;

use super::TrackedLoss;
use crate::{
    SplitErr,
    arch::{
        Head, Phase, Sequential, Stage,
        layers::{BatchNorm2d, Conv2d, Layer, NormUpdate, Relu},
        loss::{CrossEntropy, LossFn},
        make_stage,
    },
    error::{Result, ensure_shape},
    estimation::{GradEstimator, Objective},
    params::{LayoutBuilder, ParamStore},
    specs::ClientSpec,
};

/// The layers of the client half: a convolutional stem, one residual stage and the auxiliary
/// classification head used for local losses.
#[derive(Debug, Clone)]
pub struct ClientNet {
    in_channels: usize,
    input_hw: (usize, usize),

    stem: Sequential,
    stage: Stage,
    aux: Head,
}

impl ClientNet {
    /// Creates a new `ClientNet` and registers its parameters.
    ///
    /// # Arguments
    /// * `builder` - The layout of the client stage.
    /// * `spec` - The shape of the client half.
    pub fn new(builder: &mut LayoutBuilder, spec: &ClientSpec) -> Result<Self> {
        let width = spec.width;
        let stem_conv = Conv2d::new(
            builder,
            "layer1.0",
            spec.in_channels,
            width,
            3,
            1,
            1,
            spec.input_hw,
        )?;
        let stem_norm = BatchNorm2d::new(builder, "layer1.1", width);
        let stage = make_stage(builder, "layer2", width, width, 1, stem_conv.output_hw())?;
        let aux = Head::new(builder, "fc", width, spec.aux_pool, spec.classes)?;

        let stem = Sequential::new([
            Layer::Conv(stem_conv),
            Layer::Norm(stem_norm),
            Layer::Relu(Relu::new()),
        ]);

        Ok(Self {
            in_channels: spec.in_channels,
            input_hw: spec.input_hw,
            stem,
            stage,
            aux,
        })
    }

    /// The `(channels, height, width)` of the activation this net produces.
    pub fn output_shape(&self) -> (usize, (usize, usize)) {
        (self.stage.out_channels(), self.stage.output_hw())
    }

    pub fn classes(&self) -> usize {
        self.aux.classes()
    }

    fn check_input(&self, x: &ArrayView4<f32>) -> Result<()> {
        let (h, w) = self.input_hw;
        ensure_shape("client input", &x.shape()[1..], &[self.in_channels, h, w])
    }

    fn encode_forward(
        &mut self,
        params: &[f32],
        x: ArrayView4<f32>,
        phase: Phase,
    ) -> Result<Array4<f32>> {
        self.check_input(&x)?;

        let h = self.stem.forward(params, x, phase)?;
        self.stage.forward(params, h.view(), phase)
    }

    fn encode_infer(
        &self,
        params: &[f32],
        x: ArrayView4<f32>,
        phase: Phase,
    ) -> Result<Array4<f32>> {
        self.check_input(&x)?;

        let h = self.stem.infer(params, x, phase)?;
        self.stage.infer(params, h.view(), phase)
    }

    fn encode_tracked(
        &self,
        params: &[f32],
        x: ArrayView4<f32>,
        phase: Phase,
    ) -> Result<(Array4<f32>, Vec<NormUpdate>)> {
        self.check_input(&x)?;

        let mut updates = Vec::new();
        let h = self.stem.infer_tracked(params, x, phase, &mut updates)?;
        let out = self.stage.infer_tracked(params, h.view(), phase, &mut updates)?;
        Ok((out, updates))
    }

    /// Folds the batch statistics of a tracked pass into the running statistics.
    fn commit_stats(&mut self, updates: Vec<NormUpdate>) -> Result<()> {
        let mut updates = updates.into_iter();
        self.stem.commit(&mut updates)?;
        self.stage.commit(&mut updates)
    }

    fn encode_backward(
        &self,
        params: &[f32],
        grad: &mut [f32],
        d: ArrayView4<f32>,
    ) -> Result<Array4<f32>> {
        let d = self.stage.backward(params, grad, d)?;
        self.stem.backward(params, grad, d.view())
    }
}

/// A view of a client net and its parameters that can only run forward passes without
/// recording anything. Dropping it ends the no-graph region.
#[derive(Clone, Copy)]
pub struct Detached<'a> {
    net: &'a ClientNet,
    params: &'a [f32],
    phase: Phase,
}

impl<'a> Detached<'a> {
    pub fn new(net: &'a ClientNet, params: &'a [f32], phase: Phase) -> Self {
        Self { net, params, phase }
    }

    /// Computes the activation of a batch.
    pub fn encode(&self, input: ArrayView4<f32>) -> Result<Array4<f32>> {
        self.net.encode_infer(self.params, input, self.phase)
    }

    /// Computes the activation of a batch together with the batch statistics its
    /// normalizations measured, which are left for the owner of the net to commit.
    pub fn encode_tracked(&self, input: ArrayView4<f32>) -> Result<(Array4<f32>, Vec<NormUpdate>)> {
        self.net.encode_tracked(self.params, input, self.phase)
    }

    /// Computes the auxiliary logits of an activation.
    pub fn aux_logits(&self, activation: ArrayView4<f32>) -> Result<Array2<f32>> {
        self.net.aux.infer(self.params, activation)
    }

    /// Computes the activation of a batch and the auxiliary loss against its labels.
    pub fn loss(
        &self,
        input: ArrayView4<f32>,
        labels: ArrayView1<usize>,
    ) -> Result<(Array4<f32>, f32)> {
        let activation = self.encode(input)?;
        let logits = self.aux_logits(activation.view())?;
        let loss = CrossEntropy.loss(logits.view(), labels)?;
        Ok((activation, loss))
    }

    /// The same view evaluated at another point of parameter space.
    pub fn at<'p>(&self, params: &'p [f32]) -> Detached<'p>
    where
        'a: 'p,
    {
        Detached {
            net: self.net,
            params,
            phase: self.phase,
        }
    }
}

/// The client's auxiliary loss on a fixed batch as a function of the client parameters.
struct AuxObjective<'a> {
    detached: Detached<'a>,
    input: ArrayView4<'a, f32>,
    labels: ArrayView1<'a, usize>,
}

impl Objective for AuxObjective<'_> {
    fn input(&self) -> ArrayView4<'_, f32> {
        self.input.view()
    }

    fn labels(&self) -> ArrayView1<'_, usize> {
        self.labels.view()
    }

    fn dim(&self) -> usize {
        self.detached.params.len()
    }

    fn loss_at(&self, params: &[f32]) -> Result<f32> {
        if params.len() != self.dim() {
            return Err(SplitErr::SizeMismatch {
                what: "objective params",
                got: params.len(),
                expected: self.dim(),
            });
        }

        let (_, loss) = self.detached.at(params).loss(self.input, self.labels)?;
        Ok(loss)
    }
}

/// How a call to the client stage runs.
#[derive(Debug, Clone, Copy)]
pub enum ClientPass<'a> {
    /// Records the encoder so a gradient from the server can be pushed back.
    Encode,
    /// Records the encoder and the auxiliary loss against `labels`.
    Train { labels: ArrayView1<'a, usize> },
    /// Runs without recording and lets the estimator write the client gradient.
    EstimateGrad { labels: ArrayView1<'a, usize> },
}

/// What a call to the client stage returns, depending on its pass.
#[derive(Debug)]
pub enum ClientOutput {
    Encoded(Array4<f32>),
    Trained {
        activation: Array4<f32>,
        loss: TrackedLoss,
    },
    Estimated {
        activation: Array4<f32>,
    },
}

impl ClientOutput {
    pub fn activation(&self) -> ArrayView4<'_, f32> {
        match self {
            ClientOutput::Encoded(activation)
            | ClientOutput::Trained { activation, .. }
            | ClientOutput::Estimated { activation } => activation.view(),
        }
    }

    pub fn into_activation(self) -> Array4<f32> {
        match self {
            ClientOutput::Encoded(activation)
            | ClientOutput::Trained { activation, .. }
            | ClientOutput::Estimated { activation } => activation,
        }
    }

    /// The tracked loss, only present after a standard training pass.
    pub fn loss(&self) -> Option<&TrackedLoss> {
        match self {
            ClientOutput::Trained { loss, .. } => Some(loss),
            _ => None,
        }
    }
}

/// The forward pass currently held by the stage. Each of its two outputs can be
/// backpropagated once.
#[derive(Debug, Clone, Copy)]
struct Recording {
    id: u64,
    with_aux: bool,
    activation_spent: bool,
    loss_spent: bool,
}

/// The client half of a split network, owning its parameters, its gradient buffer and the
/// estimator that writes the gradient when no graph is recorded.
pub struct ClientStage {
    net: ClientNet,
    store: ParamStore,
    estimator: Box<dyn GradEstimator>,
    phase: Phase,

    recording: Option<Recording>,
    next_recording: u64,
    last_loss: Option<f32>,
}

impl ClientStage {
    /// Creates a new `ClientStage` with freshly initialized parameters.
    ///
    /// # Arguments
    /// * `spec` - The shape of the client half.
    /// * `estimator` - The estimator used by the estimate-grad pass.
    /// * `rng` - The generator the parameters are sampled from.
    ///
    /// # Returns
    /// A new `ClientStage` or an error if the spec describes an invalid net.
    pub fn new<R>(
        spec: &ClientSpec,
        estimator: Box<dyn GradEstimator>,
        rng: Rc<RefCell<R>>,
    ) -> Result<Self>
    where
        R: Rng + 'static,
    {
        let mut builder = LayoutBuilder::new();
        let net = ClientNet::new(&mut builder, spec)?;
        let store = ParamStore::new(builder.finish(), rng)?;

        debug!(params = store.len(); "built client stage");
        Ok(Self {
            net,
            store,
            estimator,
            phase: Phase::Train,
            recording: None,
            next_recording: 0,
            last_loss: None,
        })
    }

    pub fn net(&self) -> &ClientNet {
        &self.net
    }

    pub fn params(&self) -> &ParamStore {
        &self.store
    }

    pub fn params_mut(&mut self) -> &mut ParamStore {
        &mut self.store
    }

    pub fn zero_grad(&mut self) {
        self.store.zero_grad();
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    /// The `(channels, height, width)` of the activation this stage produces.
    pub fn output_shape(&self) -> (usize, (usize, usize)) {
        self.net.output_shape()
    }

    /// The value of the auxiliary loss computed by the last training or estimate-grad pass.
    pub fn last_loss(&self) -> Option<f32> {
        self.last_loss
    }

    /// Whether the stage holds a forward pass whose activation can be backpropagated.
    pub fn is_recorded(&self) -> bool {
        self.recording.is_some_and(|r| !r.activation_spent)
    }

    /// A view that runs the client without recording anything.
    pub fn detached(&self) -> Detached<'_> {
        Detached::new(&self.net, self.store.values(), self.phase)
    }

    /// Computes the activation of a batch without recording anything.
    pub fn infer(&self, input: ArrayView4<f32>) -> Result<Array4<f32>> {
        self.detached().encode(input)
    }

    /// Runs the client stage.
    ///
    /// # Arguments
    /// * `input` - A batch in NCHW layout.
    /// * `labels` - The class of every sample, required to produce a loss.
    /// * `estimate_grad` - Whether the gradient is estimated instead of backpropagated.
    ///
    /// # Returns
    /// The activation, plus the tracked loss when training with labels, or `MissingLabels` if
    /// the gradient should be estimated without labels.
    pub fn forward(
        &mut self,
        input: ArrayView4<f32>,
        labels: Option<ArrayView1<usize>>,
        estimate_grad: bool,
    ) -> Result<ClientOutput> {
        let pass = match (labels, estimate_grad) {
            (None, false) => ClientPass::Encode,
            (None, true) => return Err(SplitErr::MissingLabels),
            (Some(labels), false) => ClientPass::Train { labels },
            (Some(labels), true) => ClientPass::EstimateGrad { labels },
        };

        self.run(input, pass)
    }

    /// Runs the client stage in the given pass.
    pub fn run(&mut self, input: ArrayView4<f32>, pass: ClientPass<'_>) -> Result<ClientOutput> {
        self.recording = None;
        self.last_loss = None;

        match pass {
            ClientPass::Encode => self.run_encode(input).map(ClientOutput::Encoded),
            ClientPass::Train { labels } => self
                .run_train(input, labels)
                .map(|(activation, loss)| ClientOutput::Trained { activation, loss }),
            ClientPass::EstimateGrad { labels } => self
                .run_estimate(input, labels)
                .map(|activation| ClientOutput::Estimated { activation }),
        }
    }

    /// Computes the activation of a batch, recording it for a later `backward`.
    pub fn encode(&mut self, input: ArrayView4<f32>) -> Result<Array4<f32>> {
        self.run(input, ClientPass::Encode)
            .map(ClientOutput::into_activation)
    }

    /// Computes the activation and the auxiliary loss of a batch, recording both.
    pub fn train(
        &mut self,
        input: ArrayView4<f32>,
        labels: ArrayView1<usize>,
    ) -> Result<(Array4<f32>, TrackedLoss)> {
        self.recording = None;
        self.last_loss = None;
        self.run_train(input, labels)
    }

    /// Computes the activation of a batch and overwrites the client gradient with the
    /// estimator's output.
    pub fn estimate(
        &mut self,
        input: ArrayView4<f32>,
        labels: ArrayView1<usize>,
    ) -> Result<Array4<f32>> {
        self.run(input, ClientPass::EstimateGrad { labels })
            .map(ClientOutput::into_activation)
    }

    /// Pushes the gradient of the activation of the recorded pass into the client gradient.
    ///
    /// # Arguments
    /// * `d_activation` - The gradient with respect to the activation, usually sent back by
    ///   the server.
    ///
    /// # Returns
    /// `NoGraph` if no pass is recorded or its activation was already backpropagated.
    pub fn backward(&mut self, d_activation: ArrayView4<f32>) -> Result<()> {
        let recording = match &mut self.recording {
            Some(recording) if !recording.activation_spent => recording,
            _ => return Err(SplitErr::NoGraph { stage: "client" }),
        };

        let (params, grad) = self.store.split_mut();
        self.net.encode_backward(params, grad, d_activation)?;
        recording.activation_spent = true;
        Ok(())
    }

    /// Pushes the gradient of a tracked auxiliary loss into the client gradient.
    pub fn backward_loss(&mut self, loss: &TrackedLoss) -> Result<()> {
        let recording = match &mut self.recording {
            Some(recording) if recording.with_aux => recording,
            _ => return Err(SplitErr::NoGraph { stage: "client" }),
        };
        if recording.id != loss.recording() {
            return Err(SplitErr::StaleLoss {
                got: loss.recording(),
                expected: recording.id,
            });
        }
        if recording.loss_spent {
            return Err(SplitErr::NoGraph { stage: "client" });
        }

        let (params, grad) = self.store.split_mut();
        let d_activation = self.net.aux.backward(params, grad, loss.d_logits())?;
        self.net.encode_backward(params, grad, d_activation.view())?;
        recording.loss_spent = true;
        Ok(())
    }

    fn run_encode(&mut self, input: ArrayView4<f32>) -> Result<Array4<f32>> {
        let activation = self
            .net
            .encode_forward(self.store.values(), input, self.phase)?;

        let id = self.record(false);
        debug!(batch = input.dim().0, recording = id; "client encoded");
        Ok(activation)
    }

    fn run_train(
        &mut self,
        input: ArrayView4<f32>,
        labels: ArrayView1<usize>,
    ) -> Result<(Array4<f32>, TrackedLoss)> {
        self.check_labels(input, labels)?;

        let params = self.store.values();
        let activation = self.net.encode_forward(params, input, self.phase)?;
        let logits = self.net.aux.forward(params, activation.view())?;
        let value = CrossEntropy.loss(logits.view(), labels)?;
        let d_logits = CrossEntropy.loss_prime(logits.view(), labels)?;

        let id = self.record(true);
        self.last_loss = Some(value);
        debug!(batch = input.dim().0, recording = id, loss = value; "client trained");

        Ok((activation, TrackedLoss::new(value, d_logits, id)))
    }

    fn run_estimate(
        &mut self,
        input: ArrayView4<f32>,
        labels: ArrayView1<usize>,
    ) -> Result<Array4<f32>> {
        self.check_labels(input, labels)?;

        let (params, grad) = self.store.split_mut();
        let detached = Detached::new(&self.net, params, self.phase);
        let (activation, updates) = detached.encode_tracked(input)?;
        let logits = detached.aux_logits(activation.view())?;
        let loss = CrossEntropy.loss(logits.view(), labels)?;

        let objective = AuxObjective {
            detached,
            input,
            labels,
        };
        if objective.dim() != grad.len() {
            return Err(SplitErr::SizeMismatch {
                what: "client grad",
                got: grad.len(),
                expected: objective.dim(),
            });
        }
        let mut estimate = vec![0.; grad.len()];
        self.estimator.estimate(&objective, params, loss, &mut estimate)?;
        grad.copy_from_slice(&estimate);

        // The unperturbed pass only moves the running statistics once the estimate succeeded.
        self.net.commit_stats(updates)?;
        self.last_loss = Some(loss);
        debug!(batch = input.dim().0, loss = loss; "client estimated gradient");
        Ok(activation)
    }

    fn check_labels(&self, input: ArrayView4<f32>, labels: ArrayView1<usize>) -> Result<()> {
        let batch = input.dim().0;
        if labels.len() != batch {
            return Err(SplitErr::SizeMismatch {
                what: "labels",
                got: labels.len(),
                expected: batch,
            });
        }

        let classes = self.net.classes();
        match labels.iter().find(|&&label| label >= classes) {
            Some(&label) => Err(SplitErr::LabelOutOfRange { label, classes }),
            None => Ok(()),
        }
    }

    fn record(&mut self, with_aux: bool) -> u64 {
        let id = self.next_recording;
        self.next_recording += 1;
        self.recording = Some(Recording {
            id,
            with_aux,
            activation_spent: false,
            loss_spent: false,
        });
        id
    }
}
