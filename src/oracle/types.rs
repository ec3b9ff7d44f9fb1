//! Oracle trait and scoring types

use crate::error::Result;
use crate::memory::{MatrixAllocator, MatrixId, PoolAllocator, TierSimulator};

/// Source of per-step queries and sink for per-step answers.
///
/// The engine calls `next_query` exactly once per step, in sequence order,
/// and `commit` exactly once per step after synchronizing. The query stays
/// owned by the oracle; the committed answer becomes owned by it.
pub trait QueryOracle<A: MatrixAllocator = PoolAllocator> {
    /// Q_{0..i} for the next step, (i+1, d_k), bulk-resident.
    fn next_query(&mut self, sim: &TierSimulator<A>) -> Result<MatrixId>;

    /// Accept the full (i+1, d_v) output for the current step.
    fn commit(&mut self, sim: &TierSimulator<A>, answer: MatrixId) -> Result<()>;
}

/// Score of one committed answer against the host reference
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepScore {
    pub step: usize,
    pub max_abs_err: f32,
}
