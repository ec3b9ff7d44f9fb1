//! Matrix handles, tiers and scoped ownership.

use std::fmt;

use super::allocator::MatrixAllocator;
use super::simulator::TierSimulator;
use crate::error::Result;

/// Opaque reference to a matrix buffer owned by a [`TierSimulator`].
///
/// Ids are never reused, so a stale id is always detectable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MatrixId(pub(crate) u64);

impl MatrixId {
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for MatrixId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "matrix#{}", self.0)
    }
}

/// Memory tier a matrix is resident in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// High-capacity, higher-latency tier (HBM)
    Bulk,
    /// Limited, low-latency tier that requires explicit staging (SRAM)
    Scratch,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Bulk => write!(f, "bulk"),
            Tier::Scratch => write!(f, "scratch"),
        }
    }
}

/// Scoped ownership of a [`MatrixId`].
///
/// The handle is released when the guard drops, which covers every early
/// return taken through `?`. Use [`Scoped::into_id`] to hand ownership to
/// someone else (e.g. committing an answer) and [`Scoped::release`] to
/// release eagerly and observe failures.
pub struct Scoped<'s, A: MatrixAllocator> {
    sim: &'s TierSimulator<A>,
    id: Option<MatrixId>,
}

impl<'s, A: MatrixAllocator> Scoped<'s, A> {
    pub(crate) fn new(sim: &'s TierSimulator<A>, id: MatrixId) -> Self {
        Self { sim, id: Some(id) }
    }

    /// Take ownership of an id allocated elsewhere.
    pub fn adopt(sim: &'s TierSimulator<A>, id: MatrixId) -> Self {
        Self::new(sim, id)
    }

    /// The guarded id.
    ///
    /// Guards are only emptied by consuming methods, so this is always set.
    pub fn id(&self) -> MatrixId {
        match self.id {
            Some(id) => id,
            None => unreachable!("scoped handle accessed after hand-off"),
        }
    }

    pub fn shape(&self) -> Result<(usize, usize)> {
        self.sim.shape(self.id())
    }

    /// Give up ownership without releasing.
    pub fn into_id(mut self) -> MatrixId {
        match self.id.take() {
            Some(id) => id,
            None => unreachable!("scoped handle handed off twice"),
        }
    }

    /// Release now, surfacing any error instead of logging it on drop.
    pub fn release(mut self) -> Result<()> {
        match self.id.take() {
            Some(id) => self.sim.release(id),
            None => Ok(()),
        }
    }
}

impl<A: MatrixAllocator> Drop for Scoped<'_, A> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            if let Err(e) = self.sim.release(id) {
                tracing::error!(%id, error = %e, "failed to release scoped matrix");
            }
        }
    }
}

impl<A: MatrixAllocator> fmt::Debug for Scoped<'_, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scoped").field("id", &self.id).finish()
    }
}
