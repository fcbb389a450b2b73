/// Fills the flat parameter buffer of a stage, one layout slot after the other.
pub trait ParamGen {
    /// Produces the next values of the buffer.
    ///
    /// # Arguments
    /// * `n` - The amount of values wanted.
    ///
    /// # Returns
    /// Up to `n` values, fewer when the slots left are shorter, or `None` once every slot of
    /// the generator is filled.
    fn sample(&mut self, n: usize) -> Option<Vec<f32>>;
}
