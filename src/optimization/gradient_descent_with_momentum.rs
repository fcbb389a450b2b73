use super::Optimizer;

/// Gradient descent with heavy ball momentum: every parameter keeps a velocity that decays by
/// `momentum` and absorbs the new gradient before the step.
#[derive(Debug)]
pub struct GradientDescentWithMomentum {
    learning_rate: f32,
    momentum: f32,
    velocity: Box<[f32]>,
}

impl GradientDescentWithMomentum {
    /// Creates a new `GradientDescentWithMomentum` optimizer.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters of the stage it will update.
    /// * `learning_rate` - The length of the steps taken along the velocity.
    /// * `momentum` - The share of the velocity carried to the next step.
    pub fn new(len: usize, learning_rate: f32, momentum: f32) -> Self {
        Self {
            learning_rate,
            momentum,
            velocity: vec![0.; len].into_boxed_slice(),
        }
    }
}

impl Optimizer for GradientDescentWithMomentum {
    fn state_len(&self) -> Option<usize> {
        Some(self.velocity.len())
    }

    fn apply(&mut self, values: &mut [f32], grad: &[f32]) {
        let lr = self.learning_rate;
        let mu = self.momentum;

        values
            .iter_mut()
            .zip(grad)
            .zip(self.velocity.iter_mut())
            .for_each(|((p, g), v)| {
                *v = (mu * *v) + g;
                *p -= lr * *v;
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn velocity_accumulates() {
        let mut optimizer = GradientDescentWithMomentum::new(1, 1., 0.5);
        let mut values = [0.];

        optimizer.step(&mut values, &[1.]).unwrap();
        assert_eq!(values, [-1.]);

        optimizer.step(&mut values, &[1.]).unwrap();
        assert_eq!(values, [-2.5]);
    }

    #[test]
    fn rejects_a_stage_of_another_size() {
        let mut optimizer = GradientDescentWithMomentum::new(3, 1., 0.5);
        let mut values = [0., 0.];

        assert!(optimizer.step(&mut values, &[1., 1.]).is_err());
    }
}
