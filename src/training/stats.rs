/// What a training step, or the average of several, measured.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StepStats {
    /// The server's loss.
    pub loss: f32,
    /// The client's auxiliary loss, when the mode computes one.
    pub aux_loss: Option<f32>,
    pub samples: usize,
}

impl StepStats {
    /// Folds another step into a sample weighted average.
    pub fn merge(&mut self, other: StepStats) {
        let total = self.samples + other.samples;
        if total == 0 {
            return;
        }

        let weigh = |a: f32, b: f32| {
            (a * self.samples as f32 + b * other.samples as f32) / total as f32
        };

        self.loss = weigh(self.loss, other.loss);
        self.aux_loss = match (self.aux_loss, other.aux_loss) {
            (Some(a), Some(b)) => Some(weigh(a, b)),
            (None, b) if self.samples == 0 => b,
            (a, _) => a,
        };
        self.samples = total;
    }
}
