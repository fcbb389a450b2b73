use ndarray::{
    Array2, Array3, Array4, ArrayView2, ArrayView3, ArrayView4, ArrayViewMut2, Axis, ShapeError,
    linalg,
};
use rayon::prelude::*;

use crate::{
    SplitErr,
    error::{Result, ensure_shape},
    initialization::ParamKind,
    params::{LayoutBuilder, Slot},
};

/// A bias free two dimensional convolution over NCHW batches.
///
/// Each sample is unfolded into a column matrix (`im2col`) so the convolution becomes a single
/// matrix product against the `(out, in * k * k)` kernel. The column matrices are the forward
/// metadata backward needs, they are only kept by `forward`.
#[derive(Debug, Clone)]
pub struct Conv2d {
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    input_hw: (usize, usize),
    output_hw: (usize, usize),
    weight: Slot,

    // Forward metadata
    cols: Option<Vec<Array2<f32>>>,
}

impl Conv2d {
    /// Creates a new `Conv2d` and registers its kernel.
    ///
    /// # Arguments
    /// * `builder` - The layout of the stage this layer belongs to.
    /// * `name` - The prefix of the parameter names.
    /// * `in_channels` - The channels of the input.
    /// * `out_channels` - The channels of the output.
    /// * `kernel` - The side of the square kernel.
    /// * `stride` - The step between two consecutive windows.
    /// * `padding` - The zero padding added to every border.
    /// * `input_hw` - The spatial extent of the input.
    ///
    /// # Returns
    /// A new `Conv2d` or an error if the arguments describe an empty convolution.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        builder: &mut LayoutBuilder,
        name: &str,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        input_hw: (usize, usize),
    ) -> Result<Self> {
        if in_channels == 0 || out_channels == 0 || kernel == 0 || stride == 0 {
            return Err(SplitErr::InvalidArch(format!(
                "{name}: channels, kernel and stride must be positive"
            )));
        }

        let output_hw = conv_output_hw(input_hw, kernel, stride, padding)?;
        let weight = builder.register(
            format!("{name}.weight"),
            &[out_channels, in_channels, kernel, kernel],
            ParamKind::ConvWeight {
                fan_out: out_channels * kernel * kernel,
            },
        );

        Ok(Self {
            in_channels,
            out_channels,
            kernel,
            stride,
            padding,
            input_hw,
            output_hw,
            weight,
            cols: None,
        })
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn output_hw(&self) -> (usize, usize) {
        self.output_hw
    }

    /// Convolves `x` and keeps the unfolded input for `backward`.
    pub fn forward(&mut self, params: &[f32], x: ArrayView4<f32>) -> Result<Array4<f32>> {
        let (out, cols) = self.compute(params, x)?;
        self.cols = Some(cols);
        Ok(out)
    }

    /// Convolves `x` without keeping anything.
    pub fn infer(&self, params: &[f32], x: ArrayView4<f32>) -> Result<Array4<f32>> {
        self.compute(params, x).map(|(out, _)| out)
    }

    /// Accumulates the kernel gradient and returns the gradient with respect to the input of
    /// the last `forward`.
    pub fn backward(
        &self,
        params: &[f32],
        grad: &mut [f32],
        d: ArrayView4<f32>,
    ) -> Result<Array4<f32>> {
        let Some(cols) = &self.cols else {
            return Err(SplitErr::NoGraph {
                stage: "convolution",
            });
        };

        let batch = cols.len();
        let (ho, wo) = self.output_hw;
        let (h, w) = self.input_hw;
        ensure_shape(
            "convolution gradient",
            d.shape(),
            &[batch, self.out_channels, ho, wo],
        )?;

        let weight = self.view_weight(params)?;
        let mut dw = ArrayViewMut2::from_shape(weight.dim(), self.weight.of_mut(grad))?;

        for (b, cols) in cols.iter().enumerate() {
            let d_b = d.index_axis(Axis(0), b);
            let d_b = d_b.to_shape((self.out_channels, ho * wo))?;
            linalg::general_mat_mul(1.0, &d_b, &cols.t(), 1.0, &mut dw);
        }

        let dxs = (0..batch)
            .into_par_iter()
            .map(|b| -> std::result::Result<Array3<f32>, ShapeError> {
                let d_b = d.index_axis(Axis(0), b);
                let d_b = d_b.to_shape((self.out_channels, ho * wo))?;
                let dcols = weight.t().dot(&d_b);
                Ok(self.col2im(dcols.view()))
            })
            .collect::<std::result::Result<Vec<_>, ShapeError>>()?;

        let mut dx = Array4::zeros((batch, self.in_channels, h, w));
        for (mut dx_b, dx_s) in dx.axis_iter_mut(Axis(0)).zip(dxs) {
            dx_b.assign(&dx_s);
        }

        Ok(dx)
    }

    fn compute(
        &self,
        params: &[f32],
        x: ArrayView4<f32>,
    ) -> Result<(Array4<f32>, Vec<Array2<f32>>)> {
        let batch = x.len_of(Axis(0));
        let (h, w) = self.input_hw;
        ensure_shape("convolution input", x.shape(), &[batch, self.in_channels, h, w])?;

        let weight = self.view_weight(params)?;
        let (ho, wo) = self.output_hw;

        let (cols, outs): (Vec<_>, Vec<_>) = (0..batch)
            .into_par_iter()
            .map(|b| {
                let cols = self.im2col(x.index_axis(Axis(0), b));
                let out = weight.dot(&cols);
                (cols, out)
            })
            .unzip();

        let mut out = Array4::zeros((batch, self.out_channels, ho, wo));
        for (mut out_b, out_s) in out.axis_iter_mut(Axis(0)).zip(outs) {
            out_b.assign(&out_s.into_shape_with_order((self.out_channels, ho, wo))?);
        }

        Ok((out, cols))
    }

    /// Views the raw parameter slice as the `(out, in * k * k)` kernel matrix.
    fn view_weight<'a>(&self, params: &'a [f32]) -> Result<ArrayView2<'a, f32>> {
        let dim = (
            self.out_channels,
            self.in_channels * self.kernel * self.kernel,
        );
        Ok(ArrayView2::from_shape(dim, self.weight.of(params))?)
    }

    fn im2col(&self, x: ArrayView3<f32>) -> Array2<f32> {
        let k = self.kernel;
        let (ho, wo) = self.output_hw;
        let mut cols = Array2::zeros((self.in_channels * k * k, ho * wo));

        self.for_each_tap(|row, col, c, iy, ix| cols[[row, col]] = x[[c, iy, ix]]);
        cols
    }

    fn col2im(&self, cols: ArrayView2<f32>) -> Array3<f32> {
        let (h, w) = self.input_hw;
        let mut x = Array3::zeros((self.in_channels, h, w));

        self.for_each_tap(|row, col, c, iy, ix| x[[c, iy, ix]] += cols[[row, col]]);
        x
    }

    /// Visits every (column row, column, channel, input y, input x) pair that falls inside the
    /// unpadded input.
    fn for_each_tap<F>(&self, mut f: F)
    where
        F: FnMut(usize, usize, usize, usize, usize),
    {
        let k = self.kernel;
        let (h, w) = self.input_hw;
        let (ho, wo) = self.output_hw;
        let pad = self.padding as isize;

        for c in 0..self.in_channels {
            for ki in 0..k {
                for kj in 0..k {
                    let row = (c * k + ki) * k + kj;

                    for oy in 0..ho {
                        let iy = (oy * self.stride + ki) as isize - pad;
                        if iy < 0 || iy >= h as isize {
                            continue;
                        }

                        for ox in 0..wo {
                            let ix = (ox * self.stride + kj) as isize - pad;
                            if ix < 0 || ix >= w as isize {
                                continue;
                            }

                            f(row, oy * wo + ox, c, iy as usize, ix as usize);
                        }
                    }
                }
            }
        }
    }
}

/// Computes the spatial extent of a convolution's output.
fn conv_output_hw(
    (h, w): (usize, usize),
    kernel: usize,
    stride: usize,
    padding: usize,
) -> Result<(usize, usize)> {
    let side = |len: usize| {
        let padded = len + 2 * padding;
        if len == 0 || padded < kernel {
            return Err(SplitErr::InvalidArch(format!(
                "an extent of {len} is too small for a kernel of {kernel} with padding {padding}"
            )));
        }

        Ok((padded - kernel) / stride + 1)
    };

    Ok((side(h)?, side(w)?))
}
