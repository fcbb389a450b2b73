use super::Optimizer;

/// Plain gradient descent with a fixed learning rate.
#[derive(Debug, Clone, Copy)]
pub struct GradientDescent {
    learning_rate: f32,
}

impl GradientDescent {
    /// Returns a new `GradientDescent`.
    ///
    /// # Arguments
    /// * `learning_rate` - The *length* of the steps taken against the gradient.
    pub fn new(learning_rate: f32) -> Self {
        Self { learning_rate }
    }
}

impl Optimizer for GradientDescent {
    fn apply(&mut self, values: &mut [f32], grad: &[f32]) {
        let lr = self.learning_rate;

        for (w, g) in values.iter_mut().zip(grad) {
            *w -= lr * g;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SplitErr;

    #[test]
    fn steps_against_the_gradient() {
        let mut optimizer = GradientDescent::new(0.5);
        let mut values = [1., 2.];

        optimizer.step(&mut values, &[2., -2.]).unwrap();
        assert_eq!(values, [0., 3.]);
    }

    #[test]
    fn rejects_mismatched_lengths() {
        let mut optimizer = GradientDescent::new(0.5);
        let mut values = [1., 2.];

        assert!(matches!(
            optimizer.step(&mut values, &[1.]),
            Err(SplitErr::SizeMismatch { .. })
        ));
        assert_eq!(values, [1., 2.]);
    }
}
