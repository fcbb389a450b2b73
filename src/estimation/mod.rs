mod estimator;
mod stein;

pub use estimator::{GradEstimator, Objective};
pub use stein::SteinEstimator;
