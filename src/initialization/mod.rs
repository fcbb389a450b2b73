mod chained;
mod constant;
mod error;
mod kind;
mod param_gen;
mod random;

pub use chained::ChainedParamGen;
pub use constant::ConstParamGen;
pub use error::InitErr;
pub use kind::ParamKind;
pub use param_gen::ParamGen;
pub use random::RandParamGen;
