/// Whether a stage normalizes with the statistics of the current batch or with the running
/// statistics gathered while training.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Phase {
    #[default]
    Train,
    Eval,
}
