use std::{cell::RefCell, rc::Rc};

use log::debug;
use ndarray::{Array2, Array4, ArrayView2, ArrayView4};
use rand::Rng;

use crate::{
    SplitErr,
    arch::{Head, Phase, Stage, make_stage},
    error::{Result, ensure_shape},
    params::{LayoutBuilder, ParamStore},
    specs::ServerSpec,
};

/// The server half of a split network: the remaining residual stages and the output head.
#[derive(Debug)]
pub struct ServerStage {
    in_channels: usize,
    input_hw: (usize, usize),

    stages: Vec<Stage>,
    head: Head,
    store: ParamStore,
    phase: Phase,

    recorded: bool,
}

impl ServerStage {
    /// Creates a new `ServerStage` with freshly initialized parameters.
    ///
    /// # Arguments
    /// * `spec` - The shape of the server half.
    /// * `rng` - The generator the parameters are sampled from.
    ///
    /// # Returns
    /// A new `ServerStage` or an error if the spec describes an invalid net.
    pub fn new<R>(spec: &ServerSpec, rng: Rc<RefCell<R>>) -> Result<Self>
    where
        R: Rng + 'static,
    {
        let mut builder = LayoutBuilder::new();
        let mut channels = spec.in_channels;
        let mut hw = spec.input_hw;
        let mut stages = Vec::with_capacity(spec.widths.len());

        for (i, &width) in spec.widths.iter().enumerate() {
            let stage = make_stage(&mut builder, &format!("blk{}", i + 2), channels, width, 2, hw)?;
            channels = stage.out_channels();
            hw = stage.output_hw();
            stages.push(stage);
        }

        let head = Head::new(&mut builder, "outlayer", channels, (1, 1), spec.classes)?;
        let store = ParamStore::new(builder.finish(), rng)?;

        debug!(params = store.len(), stages = stages.len(); "built server stage");
        Ok(Self {
            in_channels: spec.in_channels,
            input_hw: spec.input_hw,
            stages,
            head,
            store,
            phase: Phase::Train,
            recorded: false,
        })
    }

    /// The `(channels, height, width)` of the activation this stage accepts.
    pub fn input_shape(&self) -> (usize, (usize, usize)) {
        (self.in_channels, self.input_hw)
    }

    pub fn classes(&self) -> usize {
        self.head.classes()
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

    fn check_activation(&self, activation: &ArrayView4<f32>) -> Result<()> {
        let (h, w) = self.input_hw;
        ensure_shape(
            "server activation",
            &activation.shape()[1..],
            &[self.in_channels, h, w],
        )
    }

    /// Computes the logits of an activation, recording the pass for `backward`.
    ///
    /// # Arguments
    /// * `activation` - The activation sent by the client, in NCHW layout.
    ///
    /// # Returns
    /// The logits, or `ShapeMismatch` if the activation does not have the declared shape.
    pub fn forward(&mut self, activation: ArrayView4<f32>) -> Result<Array2<f32>> {
        self.recorded = false;
        self.check_activation(&activation)?;

        let params = self.store.values();
        let mut h = activation.to_owned();
        for stage in self.stages.iter_mut() {
            h = stage.forward(params, h.view(), self.phase)?;
        }
        let logits = self.head.forward(params, h.view())?;

        self.recorded = true;
        debug!(batch = activation.dim().0; "server forwarded");
        Ok(logits)
    }

    /// Computes the logits of an activation without recording anything.
    pub fn infer(&self, activation: ArrayView4<f32>) -> Result<Array2<f32>> {
        self.check_activation(&activation)?;

        let params = self.store.values();
        let mut h = activation.to_owned();
        for stage in self.stages.iter() {
            h = stage.infer(params, h.view(), self.phase)?;
        }

        self.head.infer(params, h.view())
    }

    /// Accumulates the gradient of the recorded pass into the server parameters.
    ///
    /// # Arguments
    /// * `d_logits` - The gradient of the loss with respect to the logits.
    ///
    /// # Returns
    /// The gradient with respect to the activation, to be sent back to the client, or `NoGraph`
    /// if no pass is recorded or it was already backpropagated.
    pub fn backward(&mut self, d_logits: ArrayView2<f32>) -> Result<Array4<f32>> {
        if !self.recorded {
            return Err(SplitErr::NoGraph { stage: "server" });
        }

        let (params, grad) = self.store.split_mut();
        let mut d = self.head.backward(params, grad, d_logits)?;
        for stage in self.stages.iter().rev() {
            d = stage.backward(params, grad, d.view())?;
        }

        self.recorded = false;
        Ok(d)
    }
}
