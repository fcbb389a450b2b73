mod client;
mod loss;
mod network;
mod server;

pub use client::{ClientNet, ClientOutput, ClientPass, ClientStage, Detached};
pub use loss::TrackedLoss;
pub use network::{NetworkOutput, SplitNetwork};
pub use server::ServerStage;
