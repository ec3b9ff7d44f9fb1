//! Growing K/V context
//!
//! Holds the keys and values revealed so far, K_{0..i} and V_{0..i}, in the
//! scratch tier. The context only ever contains revealed rows, so causality
//! needs no mask. Growth is by replacement: each append concatenates into a new
//! handle and releases both inputs.

use crate::config::ContextStrategy;
use crate::error::{Error, Result};
use crate::memory::{MatrixAllocator, MatrixId, Scoped, Tier, TierSimulator};

/// Append `piece` to `acc` along `axis`, consuming both.
///
/// With no accumulator the piece itself becomes the accumulator and no
/// concatenation is issued. `piece` must be a single row (axis 0) or a single
/// column (axis 1).
pub fn append<'s, A: MatrixAllocator>(
    sim: &'s TierSimulator<A>,
    acc: Option<Scoped<'s, A>>,
    piece: Scoped<'s, A>,
    axis: usize,
    tier: Tier,
    label: &str,
) -> Result<Scoped<'s, A>> {
    let shape = piece.shape()?;
    let single = match axis {
        0 => shape.0 == 1,
        1 => shape.1 == 1,
        _ => false,
    };
    if !single {
        return Err(Error::InvalidArgument {
            arg: "piece",
            reason: format!("expected a single slice along axis {axis}, got {shape:?}"),
        });
    }

    let Some(acc) = acc else {
        return Ok(piece);
    };

    let merged = sim.scoped(label)?;
    sim.concat(acc.id(), piece.id(), merged.id(), axis, tier)?;
    acc.release()?;
    piece.release()?;
    Ok(merged)
}

/// Copy a bulk-tier source row and stage the copy into scratch.
fn stage_row<'s, A: MatrixAllocator>(
    sim: &'s TierSimulator<A>,
    src: MatrixId,
    label: &str,
) -> Result<Scoped<'s, A>> {
    let row = sim.scoped(label)?;
    sim.copy(src, row.id(), Tier::Bulk)?;
    sim.move_to_scratch(row.id())?;
    Ok(row)
}

/// Transposed keys for the current step.
pub enum KeysTransposed<'s, A: MatrixAllocator> {
    /// Persistent transpose cache owned by the context
    Cached(MatrixId),
    /// Fresh transposed copy owned by the caller for this step
    Fresh(Scoped<'s, A>),
}

impl<A: MatrixAllocator> KeysTransposed<'_, A> {
    pub fn id(&self) -> MatrixId {
        match self {
            KeysTransposed::Cached(id) => *id,
            KeysTransposed::Fresh(scoped) => scoped.id(),
        }
    }

    /// Release the step-local copy; the cache is left untouched.
    pub fn release(self) -> Result<()> {
        match self {
            KeysTransposed::Cached(_) => Ok(()),
            KeysTransposed::Fresh(scoped) => scoped.release(),
        }
    }
}

/// K/V context for one streamed sequence.
pub struct KvContext<'s, A: MatrixAllocator> {
    sim: &'s TierSimulator<A>,
    strategy: ContextStrategy,
    keys: Vec<MatrixId>,
    values: Vec<MatrixId>,
    key_dim: usize,
    value_dim: usize,
    k: Option<Scoped<'s, A>>,
    v: Option<Scoped<'s, A>>,
    k_t: Option<Scoped<'s, A>>,
    rows: usize,
}

impl<'s, A: MatrixAllocator> KvContext<'s, A> {
    /// Create an empty context over bulk-tier key/value rows.
    ///
    /// Every key must be (1, d_k) and every value (1, d_v). An empty
    /// sequence is accepted and has nothing to advance over.
    pub fn new(
        sim: &'s TierSimulator<A>,
        keys: &[MatrixId],
        values: &[MatrixId],
        strategy: ContextStrategy,
    ) -> Result<Self> {
        if keys.len() != values.len() {
            return Err(Error::InvalidArgument {
                arg: "values",
                reason: format!("{} keys but {} values", keys.len(), values.len()),
            });
        }
        let key_dim = uniform_row_width(sim, keys)?;
        let value_dim = uniform_row_width(sim, values)?;

        Ok(Self {
            sim,
            strategy,
            keys: keys.to_vec(),
            values: values.to_vec(),
            key_dim,
            value_dim,
            k: None,
            v: None,
            k_t: None,
            rows: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn sequence_len(&self) -> usize {
        self.keys.len()
    }

    pub fn key_dim(&self) -> usize {
        self.key_dim
    }

    pub fn value_dim(&self) -> usize {
        self.value_dim
    }

    pub fn strategy(&self) -> ContextStrategy {
        self.strategy
    }

    /// Reveal row `step`, so the context holds rows 0..=step.
    pub fn advance(&mut self, step: usize) -> Result<()> {
        if step != self.rows || step >= self.keys.len() {
            return Err(Error::InvalidArgument {
                arg: "step",
                reason: format!(
                    "expected step {} of {}, got {step}",
                    self.rows,
                    self.keys.len()
                ),
            });
        }

        match self.strategy {
            ContextStrategy::Recompute => {
                let k = self.rebuild(&self.keys[..=step], "k_stack_bulk")?;
                let v = self.rebuild(&self.values[..=step], "v_stack_bulk")?;
                self.k = Some(k);
                self.v = Some(v);
            }
            ContextStrategy::Incremental | ContextStrategy::IncrementalTranspose => {
                let k_row = stage_row(self.sim, self.keys[step], "k_row")?;
                if self.strategy == ContextStrategy::IncrementalTranspose {
                    let k_col = self.sim.scoped("k_col")?;
                    self.sim.copy(k_row.id(), k_col.id(), Tier::Scratch)?;
                    self.sim.transpose(k_col.id(), Tier::Scratch)?;
                    self.k_t = Some(append(self.sim, self.k_t.take(), k_col, 1, Tier::Scratch, "k_t_cache")?);
                }
                self.k = Some(append(self.sim, self.k.take(), k_row, 0, Tier::Scratch, "k_stack")?);

                let v_row = stage_row(self.sim, self.values[step], "v_row")?;
                self.v = Some(append(self.sim, self.v.take(), v_row, 0, Tier::Scratch, "v_stack")?);
            }
        }

        self.rows += 1;
        Ok(())
    }

    /// Rebuild a stack from source rows in the bulk tier, then stage it.
    fn rebuild(&self, rows: &[MatrixId], label: &str) -> Result<Scoped<'s, A>> {
        let mut acc = None;
        for &src in rows {
            let row = self.sim.scoped("row_copy")?;
            self.sim.copy(src, row.id(), Tier::Bulk)?;
            acc = Some(append(self.sim, acc, row, 0, Tier::Bulk, label)?);
        }
        let stack = acc.ok_or_else(|| Error::InvalidArgument {
            arg: "rows",
            reason: "cannot rebuild an empty context".into(),
        })?;
        self.sim.move_to_scratch(stack.id())?;
        Ok(stack)
    }

    fn current(&self, which: &Option<Scoped<'s, A>>, name: &'static str) -> Result<MatrixId> {
        which.as_ref().map(|s| s.id()).ok_or_else(|| Error::InvalidArgument {
            arg: name,
            reason: "context is empty, call advance first".into(),
        })
    }

    /// K_{0..i}, (i+1, d_k), scratch-resident.
    pub fn keys(&self) -> Result<MatrixId> {
        self.current(&self.k, "keys")
    }

    /// V_{0..i}, (i+1, d_v), scratch-resident.
    pub fn values(&self) -> Result<MatrixId> {
        self.current(&self.v, "values")
    }

    /// K_{0..i} transposed, (d_k, i+1), scratch-resident.
    pub fn keys_transposed(&self) -> Result<KeysTransposed<'s, A>> {
        if self.strategy == ContextStrategy::IncrementalTranspose {
            return Ok(KeysTransposed::Cached(self.current(&self.k_t, "keys_transposed")?));
        }
        let k_t = self.sim.scoped("k_t")?;
        self.sim.copy(self.keys()?, k_t.id(), Tier::Scratch)?;
        self.sim.transpose(k_t.id(), Tier::Scratch)?;
        Ok(KeysTransposed::Fresh(k_t))
    }

    /// Drop whatever must not outlive the step.
    pub fn end_step(&mut self) -> Result<()> {
        if self.strategy == ContextStrategy::Recompute {
            self.release_stacks()?;
        }
        Ok(())
    }

    fn release_stacks(&mut self) -> Result<()> {
        for stack in [self.k.take(), self.v.take(), self.k_t.take()].into_iter().flatten() {
            stack.release()?;
        }
        Ok(())
    }

    /// Release all persistent state.
    pub fn finish(mut self) -> Result<()> {
        self.release_stacks()
    }
}

fn uniform_row_width<A: MatrixAllocator>(sim: &TierSimulator<A>, rows: &[MatrixId]) -> Result<usize> {
    let Some(&first) = rows.first() else {
        return Ok(0);
    };
    let (_, width) = sim.shape(first)?;
    for &id in rows {
        let shape = sim.shape(id)?;
        if shape != (1, width) {
            return Err(Error::ShapeMismatch {
                op: "context_row",
                lhs: shape,
                rhs: (1, width),
            });
        }
    }
    Ok(width)
}
