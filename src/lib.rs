//! # stagedattn
//!
//! **Streaming causal attention over explicitly staged memory tiers.**
//!
//! Keys and values are revealed one row at a time. At every step the engine
//! computes attention over exactly the rows revealed so far, using only the
//! primitives a two-tier memory simulator exposes, and every operand has to be
//! staged into the scratch tier before arithmetic may touch it.
//!
//! ## Layout
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  oracle      next_query / commit, host reference scoring │
//! └──────────────────────────┬──────────────────────────────┘
//! │  attention   context, causal logits, softmax, engine     │
//! └──────────────────────────┬──────────────────────────────┘
//! │  memory      tiers, handles, allocator, deferred queue   │
//! └──────────────────────────┬──────────────────────────────┘
//! │                      numr                                │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design
//!
//! - **Scoped handles**: every temporary is a [`memory::Scoped`] guard, so
//!   early returns release what they allocated
//! - **One engine, three strategies**: [`config::ContextStrategy`] selects how
//!   the K/V context is maintained; outputs are identical across strategies
//! - **Deferred arithmetic**: operations are validated when issued and executed
//!   with numr at [`memory::TierSimulator::synchronize`]

pub mod attention;
pub mod config;
pub mod error;
pub mod memory;
pub mod oracle;

pub use attention::{run_attention, AttentionEngine, RunSummary, StepReport};
pub use config::{ContextStrategy, EngineConfig, RunConfig, SimulatorConfig};
pub use error::{Error, Result};
pub use memory::{MatrixAllocator, MatrixId, PoolAllocator, Scoped, Tier, TierSimulator};
pub use oracle::{QueryOracle, ReferenceOracle, StepScore};
