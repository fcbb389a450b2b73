use std::{cell::RefCell, rc::Rc};

use ndarray::{ArrayViewD, IxDyn};
use rand::Rng;

use super::{ParamEntry, ParamLayout};
use crate::{
    SplitErr,
    error::Result,
    initialization::{ChainedParamGen, ParamGen},
    optimization::Optimizer,
};

/// A named view over a parameter and its gradient accumulator.
pub struct NamedParam<'a> {
    pub name: &'a str,
    pub value: ArrayViewD<'a, f32>,
    pub grad: ArrayViewD<'a, f32>,
}

/// The parameters of a stage: a flat value buffer, a gradient buffer of the same length and
/// the layout that names every portion of them.
///
/// Layers never own parameters, they only hold slots into these buffers. This keeps every
/// stage's state in two contiguous vectors that optimizers and gradient estimators can treat
/// as plain points in parameter space.
#[derive(Debug)]
pub struct ParamStore {
    layout: ParamLayout,
    values: Vec<f32>,
    grad: Vec<f32>,
}

impl ParamStore {
    /// Creates a new `ParamStore` and initializes every parameter following its kind.
    ///
    /// # Arguments
    /// * `layout` - The layout declared by the stage's layers.
    /// * `rng` - The random number generator shared by every generator.
    ///
    /// # Returns
    /// A new `ParamStore` or an error if a parameter could not be initialized.
    pub fn new<R>(layout: ParamLayout, rng: Rc<RefCell<R>>) -> Result<Self>
    where
        R: Rng + 'static,
    {
        let size = layout.size();
        let param_gens = layout
            .entries()
            .iter()
            .map(|entry| entry.kind().param_gen(rng.clone(), entry.len()))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let values = ChainedParamGen::new(param_gens)
            .sample(size)
            .unwrap_or_default();

        if values.len() != size {
            return Err(SplitErr::SizeMismatch {
                what: "initialized parameters",
                got: values.len(),
                expected: size,
            });
        }

        Ok(Self {
            layout,
            values,
            grad: vec![0.; size],
        })
    }

    pub fn layout(&self) -> &ParamLayout {
        &self.layout
    }

    /// Returns the amount of parameters.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [f32] {
        &mut self.values
    }

    pub fn grad(&self) -> &[f32] {
        &self.grad
    }

    pub fn grad_mut(&mut self) -> &mut [f32] {
        &mut self.grad
    }

    /// Borrows the values and the gradient at the same time.
    pub fn split_mut(&mut self) -> (&[f32], &mut [f32]) {
        (&self.values, &mut self.grad)
    }

    /// Resets the gradient accumulators.
    pub fn zero_grad(&mut self) {
        self.grad.fill(0.);
    }

    /// Views a parameter by name with its declared shape.
    pub fn get(&self, name: &str) -> Option<ArrayViewD<'_, f32>> {
        let entry = self.layout.entry(name)?;
        view(entry, &self.values)
    }

    /// Views the gradient accumulator of a parameter by name.
    pub fn grad_of(&self, name: &str) -> Option<ArrayViewD<'_, f32>> {
        let entry = self.layout.entry(name)?;
        view(entry, &self.grad)
    }

    /// Iterates every parameter with its gradient in registration order.
    pub fn iter(&self) -> impl Iterator<Item = NamedParam<'_>> {
        self.layout.entries().iter().filter_map(|entry| {
            Some(NamedParam {
                name: entry.name(),
                value: view(entry, &self.values)?,
                grad: view(entry, &self.grad)?,
            })
        })
    }

    /// Makes an optimization step with the accumulated gradient.
    ///
    /// # Arguments
    /// * `optimizer` - The optimizer owning the update rule for this stage.
    pub fn step<O>(&mut self, optimizer: &mut O) -> Result<()>
    where
        O: Optimizer + ?Sized,
    {
        optimizer.step(&mut self.values, &self.grad)
    }
}

fn view<'a>(entry: &ParamEntry, buf: &'a [f32]) -> Option<ArrayViewD<'a, f32>> {
    ArrayViewD::from_shape(IxDyn(entry.shape()), entry.slot().of(buf)).ok()
}
