mod head;
pub mod layers;
pub mod loss;
mod phase;
mod sequential;
mod stage;

pub use head::Head;
pub use phase::Phase;
pub use sequential::Sequential;
pub use stage::{Stage, make_stage};
