use std::{cell::RefCell, rc::Rc};

use rand::Rng;

use super::{ConstParamGen, ParamGen, RandParamGen, error::Result};

/// The kind of a registered parameter, which decides how it is initialized.
///
/// Every layer tags its parameters when registering them in the layout, so the initialization
/// policy is a plain mapping from tag to generator applied once at stage construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// Convolution kernel, Kaiming normal calibrated to the output fan (`out * k * k`).
    ConvWeight { fan_out: usize },
    /// Normalization scale, starts at 1.
    NormScale,
    /// Normalization shift, starts at 0.
    NormShift,
    /// Fully connected weights, uniform in `±1/sqrt(fan_in)`.
    LinearWeight { fan_in: usize },
    /// Fully connected biases, uniform in `±1/sqrt(fan_in)`.
    LinearBias { fan_in: usize },
}

impl ParamKind {
    /// Builds the generator for a parameter of this kind.
    ///
    /// # Arguments
    /// * `rng` - The stage's random number generator.
    /// * `limit` - The amount of values of the parameter.
    ///
    /// # Returns
    /// A boxed generator or an error if the parameter's fan is invalid.
    pub fn param_gen<R>(&self, rng: Rc<RefCell<R>>, limit: usize) -> Result<Box<dyn ParamGen>>
    where
        R: Rng + 'static,
    {
        let param_gen: Box<dyn ParamGen> = match *self {
            ParamKind::ConvWeight { fan_out } => {
                Box::new(RandParamGen::kaiming(rng, limit, fan_out)?)
            }
            ParamKind::NormScale => Box::new(ConstParamGen::ones(limit)),
            ParamKind::NormShift => Box::new(ConstParamGen::zeros(limit)),
            ParamKind::LinearWeight { fan_in } | ParamKind::LinearBias { fan_in } => {
                Box::new(RandParamGen::fan_in_uniform(rng, limit, fan_in)?)
            }
        };

        Ok(param_gen)
    }
}
