//! Streaming causal attention over a two-tier memory simulator

pub mod context;
pub mod engine;
pub mod scores;
pub mod softmax;

pub use context::{append, KeysTransposed, KvContext};
pub use engine::{run_attention, AttentionEngine, RunSummary, StepReport};
pub use scores::causal_logits;
pub use softmax::row_softmax;
