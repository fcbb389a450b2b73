use ndarray::{Array4, ArrayView4};

use super::{
    Phase,
    layers::{Layer, NormUpdate},
};
use crate::error::Result;

/// A sequential pipeline of feature layers: information flows forward when computing an output
/// and backward when computing the *deltas* of its layers.
#[derive(Debug, Clone)]
pub struct Sequential {
    layers: Vec<Layer>,
}

impl Sequential {
    /// Creates a new `Sequential`.
    ///
    /// # Arguments
    /// * `layers` - The layers the sequential is composed of.
    ///
    /// # Returns
    /// A new `Sequential` instance.
    pub fn new<I>(layers: I) -> Self
    where
        I: IntoIterator<Item = Layer>,
    {
        Self {
            layers: layers.into_iter().collect(),
        }
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Makes a forward pass through the pipeline, recording what each layer needs to
    /// backpropagate.
    ///
    /// # Arguments
    /// * `params` - The parameters of the stage the pipeline belongs to.
    /// * `x` - The input data.
    /// * `phase` - Whether the normalizations use batch or running statistics.
    ///
    /// # Returns
    /// The output of the last layer or an error if occurred.
    pub fn forward(
        &mut self,
        params: &[f32],
        x: ArrayView4<f32>,
        phase: Phase,
    ) -> Result<Array4<f32>> {
        let mut out = x.to_owned();
        for layer in self.layers.iter_mut() {
            out = layer.forward(params, out.view(), phase)?;
        }

        Ok(out)
    }

    /// Makes a forward pass through the pipeline without recording anything.
    pub fn infer(&self, params: &[f32], x: ArrayView4<f32>, phase: Phase) -> Result<Array4<f32>> {
        let mut out = x.to_owned();
        for layer in self.layers.iter() {
            out = layer.infer(params, out.view(), phase)?;
        }

        Ok(out)
    }

    /// Makes a forward pass without recording anything, collecting the batch statistics of
    /// every normalization into `updates`.
    pub fn infer_tracked(
        &self,
        params: &[f32],
        x: ArrayView4<f32>,
        phase: Phase,
        updates: &mut Vec<NormUpdate>,
    ) -> Result<Array4<f32>> {
        let mut out = x.to_owned();
        for layer in self.layers.iter() {
            out = layer.infer_tracked(params, out.view(), phase, updates)?;
        }

        Ok(out)
    }

    /// Folds statistics collected by `infer_tracked` into the running statistics of the
    /// pipeline.
    pub fn commit<I>(&mut self, updates: &mut I) -> Result<()>
    where
        I: Iterator<Item = NormUpdate>,
    {
        for layer in self.layers.iter_mut() {
            layer.commit(updates)?;
        }

        Ok(())
    }

    /// Backpropagates `d` through every layer in reverse, accumulating into `grad`.
    ///
    /// # Returns
    /// The gradient with respect to the input of the last `forward`.
    pub fn backward(
        &self,
        params: &[f32],
        grad: &mut [f32],
        d: ArrayView4<f32>,
    ) -> Result<Array4<f32>> {
        let mut d = d.to_owned();
        for layer in self.layers.iter().rev() {
            d = layer.backward(params, grad, d.view())?;
        }

        Ok(d)
    }
}
