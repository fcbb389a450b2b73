mod builder;
mod split_trainer;
mod stats;
mod trainer;

pub use builder::TrainerBuilder;
pub use split_trainer::{SplitTrainer, TrainMode, evaluate};
pub use stats::StepStats;
pub use trainer::Trainer;
