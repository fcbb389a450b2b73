use ndarray::{Array2, ArrayView1, ArrayView2, ArrayViewMut1, ArrayViewMut2, Axis, linalg};

use crate::{
    SplitErr,
    error::{Result, ensure_shape},
    initialization::ParamKind,
    params::{LayoutBuilder, Slot},
};

/// A fully connected layer, `y = x W^T + b` with `W` stored as `(out, in)`.
#[derive(Debug, Clone)]
pub struct Linear {
    dim: (usize, usize),
    weight: Slot,
    bias: Slot,

    // Forward metadata
    x: Option<Array2<f32>>,
}

impl Linear {
    /// Creates a new `Linear` and registers its weights and biases, in that order.
    ///
    /// # Arguments
    /// * `builder` - The layout of the stage this layer belongs to.
    /// * `name` - The prefix of the parameter names.
    /// * `dim` - The input and output sizes.
    pub fn new(builder: &mut LayoutBuilder, name: &str, dim: (usize, usize)) -> Result<Self> {
        let (fan_in, fan_out) = dim;
        if fan_in == 0 || fan_out == 0 {
            return Err(SplitErr::InvalidArch(format!(
                "{name}: a linear layer needs positive sizes, got {dim:?}"
            )));
        }

        let weight = builder.register(
            format!("{name}.weight"),
            &[fan_out, fan_in],
            ParamKind::LinearWeight { fan_in },
        );
        let bias = builder.register(
            format!("{name}.bias"),
            &[fan_out],
            ParamKind::LinearBias { fan_in },
        );

        Ok(Self {
            dim,
            weight,
            bias,
            x: None,
        })
    }

    pub fn dim(&self) -> (usize, usize) {
        self.dim
    }

    pub fn forward(&mut self, params: &[f32], x: ArrayView2<f32>) -> Result<Array2<f32>> {
        let z = self.infer(params, x)?;
        self.x = Some(x.to_owned());
        Ok(z)
    }

    pub fn infer(&self, params: &[f32], x: ArrayView2<f32>) -> Result<Array2<f32>> {
        ensure_shape("linear input", &[x.ncols()], &[self.dim.0])?;

        let (w, b) = self.view_params(params)?;
        Ok(x.dot(&w.t()) + &b)
    }

    /// Accumulates the weight and bias gradients and returns the gradient with respect to the
    /// input of the last `forward`.
    pub fn backward(
        &self,
        params: &[f32],
        grad: &mut [f32],
        d: ArrayView2<f32>,
    ) -> Result<Array2<f32>> {
        let Some(x) = &self.x else {
            return Err(SplitErr::NoGraph { stage: "linear" });
        };
        ensure_shape("linear gradient", d.shape(), &[x.nrows(), self.dim.1])?;

        let (mut dw, mut db) = self.view_grad(grad)?;
        linalg::general_mat_mul(1.0, &d.t(), x, 1.0, &mut dw);
        db += &d.sum_axis(Axis(0));

        let (w, _) = self.view_params(params)?;
        Ok(d.dot(&w))
    }

    /// Gives a view of the raw gradient slice as the delta weights and delta biases of this layer.
    fn view_grad<'a>(
        &self,
        grad: &'a mut [f32],
    ) -> Result<(ArrayViewMut2<'a, f32>, ArrayViewMut1<'a, f32>)> {
        let (fan_in, fan_out) = self.dim;
        let start = self.weight.range().start;
        let end = self.bias.range().end;
        let (dw_raw, db_raw) = grad[start..end].split_at_mut(self.weight.len());

        let dw = ArrayViewMut2::from_shape((fan_out, fan_in), dw_raw)?;
        let db = ArrayViewMut1::from_shape(fan_out, db_raw)?;
        Ok((dw, db))
    }

    /// Gives a view of the raw parameter slice as the weights and biases of this layer.
    fn view_params<'a>(
        &self,
        params: &'a [f32],
    ) -> Result<(ArrayView2<'a, f32>, ArrayView1<'a, f32>)> {
        let (fan_in, fan_out) = self.dim;
        let w = ArrayView2::from_shape((fan_out, fan_in), self.weight.of(params))?;
        let b = ArrayView1::from_shape(fan_out, self.bias.of(params))?;
        Ok((w, b))
    }
}
