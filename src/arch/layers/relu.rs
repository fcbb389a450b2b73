use ndarray::{Array4, ArrayView4, Zip};

use crate::{
    SplitErr,
    error::{Result, ensure_shape},
};

/// Rectified linear unit.
#[derive(Debug, Clone, Default)]
pub struct Relu {
    // Forward metadata
    a: Option<Array4<f32>>,
}

impl Relu {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn forward(&mut self, x: ArrayView4<f32>) -> Array4<f32> {
        let a = self.infer(x);
        self.a = Some(a.clone());
        a
    }

    pub fn infer(&self, x: ArrayView4<f32>) -> Array4<f32> {
        x.mapv(|z| z.max(0.))
    }

    pub fn backward(&self, d: ArrayView4<f32>) -> Result<Array4<f32>> {
        let Some(a) = &self.a else {
            return Err(SplitErr::NoGraph { stage: "relu" });
        };
        ensure_shape("relu gradient", d.shape(), a.shape())?;

        let mut dx = d.to_owned();
        Zip::from(&mut dx)
            .and(a)
            .for_each(|d, &a| if a <= 0. { *d = 0. });

        Ok(dx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    #[test]
    fn gates_the_gradient_with_the_activation() {
        let mut relu = Relu::new();
        let x = Array::from_shape_vec((1, 1, 2, 2), vec![-1., 2., 0., 3.]).unwrap();

        let a = relu.forward(x.view());
        assert_eq!(a.as_slice().unwrap(), [0., 2., 0., 3.]);

        let d = Array4::ones((1, 1, 2, 2));
        let dx = relu.backward(d.view()).unwrap();
        assert_eq!(dx.as_slice().unwrap(), [0., 1., 0., 1.]);
    }
}
