//! Causal score computation: logits = Q_{0..i} · K_{0..i}ᵗ

use crate::error::Result;
use crate::memory::{MatrixAllocator, MatrixId, Scoped, Tier, TierSimulator};

/// Compute raw attention scores for one step.
///
/// `query` is the caller's bulk-tier (i+1, d) block and is never written: it
/// is copied, and the copy is staged to scratch. `keys_t` is the scratch
/// resident (d, i+1) transposed context. Returns the (i+1, i+1) logits in
/// scratch; no mask is applied because the context holds revealed rows only.
pub fn causal_logits<'s, A: MatrixAllocator>(
    sim: &'s TierSimulator<A>,
    query: MatrixId,
    keys_t: MatrixId,
) -> Result<Scoped<'s, A>> {
    let q_copy = sim.scoped("q_copy")?;
    sim.copy(query, q_copy.id(), Tier::Bulk)?;
    sim.move_to_scratch(q_copy.id())?;

    let logits = sim.scoped("logits")?;
    sim.matmul(q_copy.id(), keys_t, logits.id())?;
    q_copy.release()?;
    Ok(logits)
}
