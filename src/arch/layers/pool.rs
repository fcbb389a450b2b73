use std::ops::Range;

use ndarray::{Array4, ArrayView4, Axis, s};

use crate::{
    SplitErr,
    error::{Result, ensure_shape},
};

/// Averages every channel over a fixed grid of windows, whatever the input extent.
#[derive(Debug, Clone)]
pub struct AdaptiveAvgPool2d {
    output_hw: (usize, usize),

    // Forward metadata
    input_shape: Option<[usize; 4]>,
}

impl AdaptiveAvgPool2d {
    pub fn new(output_hw: (usize, usize)) -> Result<Self> {
        if output_hw.0 == 0 || output_hw.1 == 0 {
            return Err(SplitErr::InvalidArch(format!(
                "adaptive pooling needs a positive output extent, got {output_hw:?}"
            )));
        }

        Ok(Self {
            output_hw,
            input_shape: None,
        })
    }

    pub fn output_hw(&self) -> (usize, usize) {
        self.output_hw
    }

    pub fn forward(&mut self, x: ArrayView4<f32>) -> Result<Array4<f32>> {
        let out = self.infer(x)?;
        let (batch, channels, h, w) = x.dim();
        self.input_shape = Some([batch, channels, h, w]);
        Ok(out)
    }

    pub fn infer(&self, x: ArrayView4<f32>) -> Result<Array4<f32>> {
        let (batch, channels, h, w) = x.dim();
        if h == 0 || w == 0 {
            return Err(SplitErr::ShapeMismatch {
                what: "pooling input",
                got: x.shape().to_vec(),
                expected: vec![batch, channels, 1, 1],
            });
        }

        let (oh, ow) = self.output_hw;
        let mut out = Array4::zeros((batch, channels, oh, ow));

        for (i, rows) in windows(h, oh).enumerate() {
            for (j, cols) in windows(w, ow).enumerate() {
                let window = x.slice(s![.., .., rows.clone(), cols]);
                let count = window.len_of(Axis(2)) * window.len_of(Axis(3));
                let sums = window.sum_axis(Axis(3)).sum_axis(Axis(2));

                out.slice_mut(s![.., .., i, j]).assign(&(sums / count as f32));
            }
        }

        Ok(out)
    }

    pub fn backward(&self, d: ArrayView4<f32>) -> Result<Array4<f32>> {
        let Some(shape) = self.input_shape else {
            return Err(SplitErr::NoGraph { stage: "pooling" });
        };

        let [batch, channels, h, w] = shape;
        let (oh, ow) = self.output_hw;
        ensure_shape("pooling gradient", d.shape(), &[batch, channels, oh, ow])?;

        let mut dx = Array4::zeros(shape);

        for (i, rows) in windows(h, oh).enumerate() {
            for (j, cols) in windows(w, ow).enumerate() {
                let count = (rows.len() * cols.len()) as f32;
                let share = d.slice(s![.., .., i, j]).mapv(|g| g / count);

                let mut window = dx.slice_mut(s![.., .., rows.clone(), cols]);
                for ((b, c, _, _), g) in window.indexed_iter_mut() {
                    *g += share[[b, c]];
                }
            }
        }

        Ok(dx)
    }
}

/// Splits `len` into `out` possibly overlapping windows the way adaptive pooling does.
fn windows(len: usize, out: usize) -> impl Iterator<Item = Range<usize>> {
    (0..out).map(move |i| {
        let start = i * len / out;
        let end = ((i + 1) * len).div_ceil(out);
        start..end
    })
}
