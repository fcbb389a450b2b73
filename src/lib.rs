//! Split learning for residual convolutional classifiers.
//!
//! A ResNet-18 is cut after its first residual stage: the `ClientStage` turns raw images into
//! an activation and the `ServerStage` completes the classification. The client can learn by
//! backpropagating the server's gradient, by backpropagating a local auxiliary loss, or by
//! estimating its gradient from loss values alone with a `GradEstimator`.

pub mod arch;
pub mod dataset;
pub mod error;
pub mod estimation;
pub mod initialization;
pub mod optimization;
pub mod params;
pub mod specs;
pub mod split;
pub mod training;

pub use error::{Result, SplitErr};
