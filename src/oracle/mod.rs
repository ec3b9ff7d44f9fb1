pub mod reference;
pub mod types;

pub use reference::{reference_attention, ReferenceOracle};
pub use types::{QueryOracle, StepScore};
