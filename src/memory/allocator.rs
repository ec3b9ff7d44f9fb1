//! Labeled matrix handle allocator
//!
//! Issues unique, labeled [`MatrixId`]s and reclaims them on release.
//! The allocator tracks liveness so the simulator can reject stale handles and
//! a post-run audit can report leaks; it does not detect leaks on its own.

use crate::error::{Error, Result};
use crate::memory::MatrixId;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Statistics for a matrix allocator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    pub live_handles: usize,
    pub total_allocations: usize,
    pub total_frees: usize,
    pub peak_live: usize,
}

/// Matrix allocator trait
pub trait MatrixAllocator: Send + Sync + Clone {
    fn allocate(&self, label: &str) -> Result<MatrixId>;
    fn free(&self, id: MatrixId) -> Result<()>;
    fn is_live(&self, id: MatrixId) -> bool;
    fn label(&self, id: MatrixId) -> Option<String>;
    fn live_handles(&self) -> Vec<(MatrixId, String)>;
    fn stats(&self) -> AllocatorStats;
    fn reset(&self) -> Result<()>;

    fn live_count(&self) -> usize {
        self.stats().live_handles
    }
}

#[derive(Debug)]
enum HandleState {
    Live,
    Released,
}

struct AllocatorState {
    next_id: u64,
    handles: BTreeMap<MatrixId, (String, HandleState)>,
    live: usize,
    total_allocations: usize,
    total_frees: usize,
    peak_live: usize,
}

impl AllocatorState {
    fn new() -> Self {
        Self {
            next_id: 0,
            handles: BTreeMap::new(),
            live: 0,
            total_allocations: 0,
            total_frees: 0,
            peak_live: 0,
        }
    }
}

/// Pool allocator with shared state, cheap to clone.
///
/// Released entries are kept as tombstones so a second release is reported
/// as [`Error::DoubleRelease`] rather than an unknown handle.
#[derive(Clone)]
pub struct PoolAllocator {
    state: Arc<Mutex<AllocatorState>>,
}

impl PoolAllocator {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(AllocatorState::new())),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, AllocatorState>> {
        self.state.lock().map_err(|e| Error::InvalidArgument {
            arg: "allocator",
            reason: format!("matrix allocator mutex poisoned: {e}"),
        })
    }
}

impl Default for PoolAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl MatrixAllocator for PoolAllocator {
    fn allocate(&self, label: &str) -> Result<MatrixId> {
        let mut state = self.lock()?;
        let id = MatrixId(state.next_id);
        state.next_id += 1;
        state
            .handles
            .insert(id, (label.to_string(), HandleState::Live));

        state.live += 1;
        state.total_allocations += 1;
        if state.live > state.peak_live {
            state.peak_live = state.live;
        }

        Ok(id)
    }

    fn free(&self, id: MatrixId) -> Result<()> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        match state.handles.get_mut(&id) {
            None => Err(Error::UseAfterRelease { op: "free", id }),
            Some((label, HandleState::Released)) => Err(Error::DoubleRelease {
                id,
                label: label.clone(),
            }),
            Some((_, handle_state)) => {
                *handle_state = HandleState::Released;
                state.live -= 1;
                state.total_frees += 1;
                Ok(())
            }
        }
    }

    fn is_live(&self, id: MatrixId) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .handles
            .get(&id)
            .is_some_and(|(_, s)| matches!(s, HandleState::Live))
    }

    fn label(&self, id: MatrixId) -> Option<String> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .handles
            .get(&id)
            .map(|(label, _)| label.clone())
    }

    fn live_handles(&self) -> Vec<(MatrixId, String)> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .handles
            .iter()
            .filter(|(_, (_, s))| matches!(s, HandleState::Live))
            .map(|(id, (label, _))| (*id, label.clone()))
            .collect()
    }

    fn stats(&self) -> AllocatorStats {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        AllocatorStats {
            live_handles: state.live,
            total_allocations: state.total_allocations,
            total_frees: state.total_frees,
            peak_live: state.peak_live,
        }
    }

    fn reset(&self) -> Result<()> {
        let mut state = self.lock()?;
        // Ids keep increasing across resets so stale handles stay detectable.
        let next_id = state.next_id;
        *state = AllocatorState::new();
        state.next_id = next_id;
        Ok(())
    }
}
