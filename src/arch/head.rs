use ndarray::{Array2, Array4, ArrayView2, ArrayView4};

use super::layers::{AdaptiveAvgPool2d, Linear};
use crate::{
    SplitErr,
    error::{Result, ensure_shape},
    params::LayoutBuilder,
};

/// A classification head: adaptive average pooling, flattening and a fully connected layer.
#[derive(Debug, Clone)]
pub struct Head {
    channels: usize,
    pool: AdaptiveAvgPool2d,
    fc: Linear,

    // Forward metadata
    pooled_shape: Option<[usize; 4]>,
}

impl Head {
    /// Creates a new `Head`.
    ///
    /// # Arguments
    /// * `builder` - The layout of the stage this head belongs to.
    /// * `name` - The name of the linear layer.
    /// * `channels` - The channels of the features it receives.
    /// * `pool_hw` - The extent the features are pooled to before flattening.
    /// * `classes` - The amount of logits per sample.
    pub fn new(
        builder: &mut LayoutBuilder,
        name: &str,
        channels: usize,
        pool_hw: (usize, usize),
        classes: usize,
    ) -> Result<Self> {
        let pool = AdaptiveAvgPool2d::new(pool_hw)?;
        let features = channels * pool_hw.0 * pool_hw.1;
        let fc = Linear::new(builder, name, (features, classes))?;

        Ok(Self {
            channels,
            pool,
            fc,
            pooled_shape: None,
        })
    }

    pub fn classes(&self) -> usize {
        self.fc.dim().1
    }

    pub fn forward(&mut self, params: &[f32], x: ArrayView4<f32>) -> Result<Array2<f32>> {
        ensure_shape("head channels", &[x.dim().1], &[self.channels])?;

        let pooled = self.pool.forward(x)?;
        let shape = pooled.dim();
        let flat = flatten(pooled)?;
        let logits = self.fc.forward(params, flat.view())?;

        self.pooled_shape = Some([shape.0, shape.1, shape.2, shape.3]);
        Ok(logits)
    }

    pub fn infer(&self, params: &[f32], x: ArrayView4<f32>) -> Result<Array2<f32>> {
        ensure_shape("head channels", &[x.dim().1], &[self.channels])?;

        let flat = flatten(self.pool.infer(x)?)?;
        self.fc.infer(params, flat.view())
    }

    /// Accumulates the head's gradients and returns the gradient with respect to the features.
    pub fn backward(
        &self,
        params: &[f32],
        grad: &mut [f32],
        d: ArrayView2<f32>,
    ) -> Result<Array4<f32>> {
        let Some(shape) = self.pooled_shape else {
            return Err(SplitErr::NoGraph { stage: "head" });
        };

        let d_flat = self.fc.backward(params, grad, d)?;
        let d_pooled = d_flat.into_shape_with_order(shape)?;
        self.pool.backward(d_pooled.view())
    }
}

fn flatten(x: Array4<f32>) -> Result<Array2<f32>> {
    let (n, c, h, w) = x.dim();
    Ok(x.into_shape_with_order((n, c * h * w))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pools_flattens_and_projects() {
        let mut builder = LayoutBuilder::new();
        let mut head = Head::new(&mut builder, "fc", 2, (1, 1), 3).unwrap();
        let layout = builder.finish();
        assert_eq!(layout.size(), 2 * 3 + 3);

        // W = identity-like on the first two classes, zero biases
        let params = vec![1., 0., 0., 1., 1., 1., 0., 0., 0.];
        let mut x = Array4::zeros((1, 2, 2, 2));
        x.slice_mut(ndarray::s![0, 0, .., ..]).fill(2.);
        x.slice_mut(ndarray::s![0, 1, .., ..]).fill(-1.);

        let logits = head.forward(&params, x.view()).unwrap();
        assert_eq!(logits, ndarray::array![[2., -1., 1.]]);

        let mut grad = vec![0.; params.len()];
        let d = ndarray::array![[1., 0., 0.]];
        let dx = head.backward(&params, &mut grad, d.view()).unwrap();

        assert_eq!(dx.dim(), (1, 2, 2, 2));
        assert!(dx.slice(ndarray::s![0, 0, .., ..]).iter().all(|&v| v == 0.25));
        assert!(dx.slice(ndarray::s![0, 1, .., ..]).iter().all(|&v| v == 0.));
    }

    #[test]
    fn backward_without_forward_fails() {
        let mut builder = LayoutBuilder::new();
        let head = Head::new(&mut builder, "fc", 2, (1, 1), 3).unwrap();
        let params = vec![0.; builder.finish().size()];
        let mut grad = params.clone();

        let d = Array2::zeros((1, 3));
        assert!(matches!(
            head.backward(&params, &mut grad, d.view()),
            Err(SplitErr::NoGraph { .. })
        ));
    }
}
