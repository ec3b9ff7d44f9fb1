//! Row-wise softmax from primitive operations.
//!
//! Each row is extracted, exponentiated, summed and divided by its sum, then
//! appended beneath the rows already normalized. With `stable` set the row
//! maximum is subtracted first; a per-row shift cancels in the division, so the
//! weights are unchanged while large logits no longer overflow `exp`.

use super::context::append;
use crate::error::{Error, Result};
use crate::memory::{MatrixAllocator, MatrixId, Scoped, Tier, TierSimulator};

/// Normalize every row of the scratch-resident `logits` into a distribution.
pub fn row_softmax<'s, A: MatrixAllocator>(
    sim: &'s TierSimulator<A>,
    logits: MatrixId,
    stable: bool,
) -> Result<Scoped<'s, A>> {
    let (rows, _) = sim.shape(logits)?;

    let mut weights = None;
    for r in 0..rows {
        let row = sim.scoped("row")?;
        sim.get_row(logits, r, row.id(), Tier::Scratch)?;

        let row = if stable { shift_by_max(sim, row)? } else { row };

        let row_exp = sim.scoped("row_exp")?;
        sim.exp(row.id(), row_exp.id())?;
        row.release()?;

        let row_sum = sim.scoped("row_sum")?;
        sim.row_sum(row_exp.id(), row_sum.id())?;

        let row_soft = sim.scoped("row_soft")?;
        sim.broadcast_div(row_exp.id(), row_sum.id(), row_soft.id())?;
        row_exp.release()?;
        row_sum.release()?;

        weights = Some(append(sim, weights, row_soft, 0, Tier::Scratch, "attn")?);
    }

    weights.ok_or_else(|| Error::InvalidArgument {
        arg: "logits",
        reason: "no rows to normalize".into(),
    })
}

fn shift_by_max<'s, A: MatrixAllocator>(
    sim: &'s TierSimulator<A>,
    row: Scoped<'s, A>,
) -> Result<Scoped<'s, A>> {
    let row_max = sim.scoped("row_max")?;
    sim.row_max(row.id(), row_max.id())?;

    let shifted = sim.scoped("row_shifted")?;
    sim.broadcast_sub(row.id(), row_max.id(), shifted.id())?;
    row.release()?;
    row_max.release()?;
    Ok(shifted)
}
