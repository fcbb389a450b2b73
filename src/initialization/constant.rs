use super::ParamGen;

/// Fills a slot with a single value, as the scale and shift of a batch normalization start.
pub struct ConstParamGen {
    value: f32,
    remaining: usize,
}

impl ConstParamGen {
    /// # Arguments
    /// * `value` - The value every entry of the slot starts at.
    /// * `len` - The length of the slot.
    pub fn new(value: f32, len: usize) -> Self {
        Self {
            value,
            remaining: len,
        }
    }

    /// A slot of normalization scales, which start as the identity.
    pub fn ones(len: usize) -> Self {
        Self::new(1., len)
    }

    /// A slot of shifts, which start at the origin.
    pub fn zeros(len: usize) -> Self {
        Self::new(0., len)
    }
}

impl ParamGen for ConstParamGen {
    fn sample(&mut self, n: usize) -> Option<Vec<f32>> {
        if self.remaining == 0 {
            return None;
        }

        let n = n.min(self.remaining);
        self.remaining -= n;
        Some(vec![self.value; n])
    }
}
