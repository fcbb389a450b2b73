use ndarray::{Array4, ArrayView4};

use super::{BasicBlock, BatchNorm2d, Conv2d, NormUpdate, Relu};
use crate::{arch::Phase, error::Result};

/// The layers a feature pipeline is made of.
#[derive(Debug, Clone)]
pub enum Layer {
    Conv(Conv2d),
    Norm(BatchNorm2d),
    Relu(Relu),
    Block(Box<BasicBlock>),
}
use Layer::*;

impl Layer {
    pub fn block(block: BasicBlock) -> Self {
        Block(Box::new(block))
    }

    /// Makes a forward pass keeping the metadata the backward pass needs.
    pub fn forward(
        &mut self,
        params: &[f32],
        x: ArrayView4<f32>,
        phase: Phase,
    ) -> Result<Array4<f32>> {
        match self {
            Conv(l) => l.forward(params, x),
            Norm(l) => l.forward(params, x, phase),
            Relu(l) => Ok(l.forward(x)),
            Block(l) => l.forward(params, x, phase),
        }
    }

    /// Makes a forward pass without recording anything.
    pub fn infer(&self, params: &[f32], x: ArrayView4<f32>, phase: Phase) -> Result<Array4<f32>> {
        match self {
            Conv(l) => l.infer(params, x),
            Norm(l) => l.infer(params, x, phase),
            Relu(l) => Ok(l.infer(x)),
            Block(l) => l.infer(params, x, phase),
        }
    }

    /// Makes a forward pass without recording anything, collecting the batch statistics the
    /// normalizations would have folded in.
    pub fn infer_tracked(
        &self,
        params: &[f32],
        x: ArrayView4<f32>,
        phase: Phase,
        updates: &mut Vec<NormUpdate>,
    ) -> Result<Array4<f32>> {
        match self {
            Conv(l) => l.infer(params, x),
            Norm(l) => l.infer_tracked(params, x, phase, updates),
            Relu(l) => Ok(l.infer(x)),
            Block(l) => l.infer_tracked(params, x, phase, updates),
        }
    }

    /// Commits the statistics collected by `infer_tracked`, consuming them in the same order.
    pub fn commit<I>(&mut self, updates: &mut I) -> Result<()>
    where
        I: Iterator<Item = NormUpdate>,
    {
        match self {
            Norm(l) => l.commit_next(updates),
            Block(l) => l.commit(updates),
            Conv(_) | Relu(_) => Ok(()),
        }
    }

    pub fn backward(
        &self,
        params: &[f32],
        grad: &mut [f32],
        d: ArrayView4<f32>,
    ) -> Result<Array4<f32>> {
        match self {
            Conv(l) => l.backward(params, grad, d),
            Norm(l) => l.backward(params, grad, d),
            Relu(l) => l.backward(d),
            Block(l) => l.backward(params, grad, d),
        }
    }
}
