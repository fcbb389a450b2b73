mod layout;
mod store;

pub use layout::{LayoutBuilder, ParamEntry, ParamLayout, Slot};
pub use store::{NamedParam, ParamStore};
