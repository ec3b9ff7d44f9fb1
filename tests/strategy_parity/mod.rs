pub mod helpers;

pub mod causality;
pub mod equivalence;
pub mod stable_softmax;
