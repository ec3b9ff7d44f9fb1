//! Two-tier memory simulator
//!
//! Matrices live in either the bulk tier or the scratch tier. Arithmetic
//! primitives only accept scratch-resident operands, so callers have to stage
//! data explicitly. Every call is validated when it is issued (liveness, tier
//! residency, shapes, scratch capacity) and queued; the numbers themselves are
//! produced with numr when [`TierSimulator::synchronize`] drains the queue.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use numr::ops::{BinaryOps, MatmulOps, ReduceOps, ShapeOps, UnaryOps};
use numr::runtime::cpu::{CpuClient, CpuDevice, CpuRuntime};
use numr::tensor::Tensor;

use super::allocator::{AllocatorStats, MatrixAllocator, PoolAllocator};
use super::handle::{MatrixId, Scoped, Tier};
use super::instruction::Instruction;
use crate::config::SimulatorConfig;
use crate::error::{Error, Result};

type Shape = (usize, usize);

/// Simulator counters
#[derive(Debug, Clone, Default)]
pub struct SimStats {
    /// Issued instructions by kind
    pub instructions: BTreeMap<&'static str, usize>,
    pub syncs: usize,
    pub scratch_elements: usize,
    pub scratch_handles: usize,
    pub peak_scratch_elements: usize,
    pub peak_scratch_handles: usize,
    pub allocator: AllocatorStats,
}

impl SimStats {
    pub fn count(&self, kind: &str) -> usize {
        self.instructions.get(kind).copied().unwrap_or(0)
    }
}

struct Slot {
    label: String,
    /// Set once the matrix has been written.
    layout: Option<(Tier, Shape)>,
    released: bool,
    data: Option<Tensor<CpuRuntime>>,
}

struct SimState {
    client: CpuClient,
    device: CpuDevice,
    slots: HashMap<MatrixId, Slot>,
    queue: Vec<Instruction>,
    scratch_capacity: Option<usize>,
    scratch_elements: usize,
    scratch_handles: usize,
    peak_scratch_elements: usize,
    peak_scratch_handles: usize,
    instructions: BTreeMap<&'static str, usize>,
    syncs: usize,
}

impl SimState {
    fn slot(&self, op: &'static str, id: MatrixId) -> Result<&Slot> {
        match self.slots.get(&id) {
            Some(slot) if !slot.released => Ok(slot),
            _ => Err(Error::UseAfterRelease { op, id }),
        }
    }

    fn written(&self, op: &'static str, id: MatrixId) -> Result<(Tier, Shape)> {
        let slot = self.slot(op, id)?;
        slot.layout.ok_or_else(|| Error::EmptyMatrix {
            op,
            label: slot.label.clone(),
        })
    }

    /// Shape of `id`, which must be resident in `tier`.
    fn resident(&self, op: &'static str, id: MatrixId, tier: Tier) -> Result<Shape> {
        let (actual, shape) = self.written(op, id)?;
        if actual != tier {
            return Err(Error::TierViolation {
                op,
                label: self.slots[&id].label.clone(),
                expected: tier,
                actual,
            });
        }
        Ok(shape)
    }

    fn ensure_unwritten(&self, op: &'static str, id: MatrixId) -> Result<()> {
        let slot = self.slot(op, id)?;
        if slot.layout.is_some() {
            return Err(Error::InvalidArgument {
                arg: "out",
                reason: format!("{op}: output '{}' already holds data", slot.label),
            });
        }
        Ok(())
    }

    fn reserve_scratch(&mut self, elements: usize) -> Result<()> {
        if let Some(capacity) = self.scratch_capacity {
            if self.scratch_elements + elements > capacity {
                return Err(Error::CapacityExceeded {
                    requested: elements,
                    in_use: self.scratch_elements,
                    capacity,
                });
            }
        }
        self.scratch_elements += elements;
        self.scratch_handles += 1;
        self.peak_scratch_elements = self.peak_scratch_elements.max(self.scratch_elements);
        self.peak_scratch_handles = self.peak_scratch_handles.max(self.scratch_handles);
        Ok(())
    }

    fn return_scratch(&mut self, elements: usize) {
        self.scratch_elements -= elements;
        self.scratch_handles -= 1;
    }

    /// Record the layout of `id` after an instruction writes it.
    fn place(&mut self, id: MatrixId, tier: Tier, shape: Shape) -> Result<()> {
        if tier == Tier::Scratch {
            self.reserve_scratch(shape.0 * shape.1)?;
        }
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.layout = Some((tier, shape));
        }
        Ok(())
    }

    fn issue(&mut self, instruction: Instruction) {
        *self.instructions.entry(instruction.kind()).or_insert(0) += 1;
        self.queue.push(instruction);
    }

    fn tensor(&self, id: MatrixId) -> Result<Tensor<CpuRuntime>> {
        let slot = self
            .slots
            .get(&id)
            .ok_or(Error::UseAfterRelease { op: "execute", id })?;
        slot.data.clone().ok_or_else(|| Error::EmptyMatrix {
            op: "execute",
            label: slot.label.clone(),
        })
    }

    fn store(&mut self, id: MatrixId, tensor: Tensor<CpuRuntime>) {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.data = Some(tensor);
        }
    }

    fn execute(&mut self, instruction: Instruction) -> Result<()> {
        match instruction {
            Instruction::Copy { src, dst } => {
                let t = self.tensor(src)?;
                self.store(dst, t);
            }
            Instruction::MoveToScratch { .. } | Instruction::MoveToBulk { .. } => {}
            Instruction::Transpose { id } => {
                let t = self.tensor(id)?.transpose(-2, -1)?.contiguous();
                self.store(id, t);
            }
            Instruction::Concat { a, b, out, axis } => {
                let (ta, tb) = (self.tensor(a)?, self.tensor(b)?);
                let t = self.client.cat(&[&ta, &tb], axis as isize)?;
                self.store(out, t);
            }
            Instruction::MatMul { a, b, out } => {
                let (ta, tb) = (self.tensor(a)?, self.tensor(b)?);
                let t = self.client.matmul(&ta, &tb)?;
                self.store(out, t);
            }
            Instruction::Exp { a, out } => {
                let t = self.client.exp(&self.tensor(a)?)?;
                self.store(out, t);
            }
            Instruction::RowSum { a, out } => {
                let t = self.client.sum(&self.tensor(a)?, &[1], true)?;
                self.store(out, t);
            }
            Instruction::RowMax { a, out } => {
                let t = self.client.max(&self.tensor(a)?, &[1], true)?;
                self.store(out, t);
            }
            Instruction::BroadcastDiv { a, b, out } => {
                let (ta, tb) = (self.tensor(a)?, self.tensor(b)?);
                let t = self.client.div(&ta, &tb)?;
                self.store(out, t);
            }
            Instruction::BroadcastSub { a, b, out } => {
                let (ta, tb) = (self.tensor(a)?, self.tensor(b)?);
                let t = self.client.sub(&ta, &tb)?;
                self.store(out, t);
            }
            Instruction::GetRow { src, row, out } => {
                let t = self.tensor(src)?.narrow(0, row, 1)?.contiguous();
                self.store(out, t);
            }
            Instruction::Release { id } => {
                self.slots.remove(&id);
            }
        }
        Ok(())
    }
}

/// Two-tier memory simulator over an allocator `A`.
pub struct TierSimulator<A: MatrixAllocator = PoolAllocator> {
    allocator: A,
    state: Mutex<SimState>,
}

impl TierSimulator<PoolAllocator> {
    /// Simulator with a fresh [`PoolAllocator`].
    pub fn with_config(config: &SimulatorConfig) -> Self {
        Self::new(PoolAllocator::new(), config)
    }
}

impl<A: MatrixAllocator> TierSimulator<A> {
    pub fn new(allocator: A, config: &SimulatorConfig) -> Self {
        let device = CpuDevice::new();
        let client = CpuClient::new(device.clone());
        Self {
            allocator,
            state: Mutex::new(SimState {
                client,
                device,
                slots: HashMap::new(),
                queue: Vec::new(),
                scratch_capacity: config.scratch_capacity,
                scratch_elements: 0,
                scratch_handles: 0,
                peak_scratch_elements: 0,
                peak_scratch_handles: 0,
                instructions: BTreeMap::new(),
                syncs: 0,
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, SimState>> {
        self.state.lock().map_err(|e| Error::InvalidArgument {
            arg: "simulator",
            reason: format!("simulator mutex poisoned: {e}"),
        })
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Allocate an empty, labeled matrix.
    pub fn allocate(&self, label: &str) -> Result<MatrixId> {
        let mut state = self.lock()?;
        let id = self.allocator.allocate(label)?;
        state.slots.insert(
            id,
            Slot {
                label: label.to_string(),
                layout: None,
                released: false,
                data: None,
            },
        );
        Ok(id)
    }

    /// Allocate an empty matrix owned by a scope guard.
    pub fn scoped(&self, label: &str) -> Result<Scoped<'_, A>> {
        let id = self.allocate(label)?;
        Ok(Scoped::new(self, id))
    }

    /// Release a handle. Storage is reclaimed at the next synchronization,
    /// after every queued instruction that reads it has run.
    pub fn release(&self, id: MatrixId) -> Result<()> {
        let mut state = self.lock()?;
        self.allocator.free(id)?;
        let layout = match state.slots.get_mut(&id) {
            Some(slot) => {
                slot.released = true;
                slot.layout
            }
            None => return Err(Error::UseAfterRelease { op: "release", id }),
        };
        if let Some((Tier::Scratch, (rows, cols))) = layout {
            state.return_scratch(rows * cols);
        }
        state.issue(Instruction::Release { id });
        Ok(())
    }

    /// Upload host data into a new bulk-tier matrix. Takes effect immediately.
    pub fn upload(&self, label: &str, data: &[f32], rows: usize, cols: usize) -> Result<MatrixId> {
        if data.len() != rows * cols {
            return Err(Error::InvalidArgument {
                arg: "data",
                reason: format!("expected {} elements for {rows}x{cols}, got {}", rows * cols, data.len()),
            });
        }
        let id = self.allocate(label)?;
        let mut state = self.lock()?;
        let tensor = Tensor::<CpuRuntime>::from_slice(data, &[rows, cols], &state.device);
        if let Some(slot) = state.slots.get_mut(&id) {
            slot.layout = Some((Tier::Bulk, (rows, cols)));
            slot.data = Some(tensor);
        }
        Ok(id)
    }

    /// Read a matrix back to the host. Requires an empty instruction queue.
    pub fn read(&self, id: MatrixId) -> Result<Vec<f32>> {
        let state = self.lock()?;
        if !state.queue.is_empty() {
            return Err(Error::PendingWork {
                op: "read",
                pending: state.queue.len(),
            });
        }
        state.written("read", id)?;
        Ok(state.tensor(id)?.to_vec::<f32>())
    }

    pub fn shape(&self, id: MatrixId) -> Result<(usize, usize)> {
        Ok(self.lock()?.written("shape", id)?.1)
    }

    pub fn tier(&self, id: MatrixId) -> Result<Tier> {
        Ok(self.lock()?.written("tier", id)?.0)
    }

    pub fn label(&self, id: MatrixId) -> Option<String> {
        self.allocator.label(id)
    }

    pub fn pending(&self) -> usize {
        self.lock().map(|s| s.queue.len()).unwrap_or(0)
    }

    /// Execute every queued instruction in issue order.
    pub fn synchronize(&self, verbose: bool) -> Result<()> {
        let mut state = self.lock()?;
        let queue = std::mem::take(&mut state.queue);
        for instruction in queue {
            if verbose {
                tracing::trace!(%instruction, "execute");
            }
            state.execute(instruction)?;
        }
        state.syncs += 1;
        if verbose {
            tracing::debug!(
                scratch_elements = state.scratch_elements,
                scratch_handles = state.scratch_handles,
                live = self.allocator.live_count(),
                "synchronized"
            );
        }
        Ok(())
    }

    pub fn stats(&self) -> SimStats {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        SimStats {
            instructions: state.instructions.clone(),
            syncs: state.syncs,
            scratch_elements: state.scratch_elements,
            scratch_handles: state.scratch_handles,
            peak_scratch_elements: state.peak_scratch_elements,
            peak_scratch_handles: state.peak_scratch_handles,
            allocator: self.allocator.stats(),
        }
    }

    /// Fail with [`Error::ResourceLeak`] if any handle other than `allowed`
    /// is still live.
    pub fn audit(&self, allowed: &[MatrixId]) -> Result<()> {
        let labels: Vec<String> = self
            .allocator
            .live_handles()
            .into_iter()
            .filter(|(id, _)| !allowed.contains(id))
            .map(|(_, label)| label)
            .collect();
        if labels.is_empty() {
            return Ok(());
        }
        Err(Error::ResourceLeak {
            count: labels.len(),
            labels,
        })
    }

    // =========================================================================
    // Tier movement
    // =========================================================================

    pub fn copy(&self, src: MatrixId, dst: MatrixId, tier: Tier) -> Result<()> {
        let mut state = self.lock()?;
        let shape = state.resident("copy", src, tier)?;
        state.ensure_unwritten("copy", dst)?;
        state.place(dst, tier, shape)?;
        state.issue(Instruction::Copy { src, dst });
        Ok(())
    }

    pub fn move_to_scratch(&self, id: MatrixId) -> Result<()> {
        let mut state = self.lock()?;
        let shape = state.resident("move_to_scratch", id, Tier::Bulk)?;
        state.reserve_scratch(shape.0 * shape.1)?;
        if let Some(slot) = state.slots.get_mut(&id) {
            slot.layout = Some((Tier::Scratch, shape));
        }
        state.issue(Instruction::MoveToScratch { id });
        Ok(())
    }

    pub fn move_to_bulk(&self, id: MatrixId) -> Result<()> {
        let mut state = self.lock()?;
        let shape = state.resident("move_to_bulk", id, Tier::Scratch)?;
        state.return_scratch(shape.0 * shape.1);
        if let Some(slot) = state.slots.get_mut(&id) {
            slot.layout = Some((Tier::Bulk, shape));
        }
        state.issue(Instruction::MoveToBulk { id });
        Ok(())
    }

    // =========================================================================
    // Primitives
    // =========================================================================

    /// Transpose `id` in place.
    pub fn transpose(&self, id: MatrixId, tier: Tier) -> Result<()> {
        let mut state = self.lock()?;
        let (rows, cols) = state.resident("transpose", id, tier)?;
        if let Some(slot) = state.slots.get_mut(&id) {
            slot.layout = Some((tier, (cols, rows)));
        }
        state.issue(Instruction::Transpose { id });
        Ok(())
    }

    /// Concatenate `a` and `b` along `axis` (0 = rows, 1 = columns) into `out`.
    pub fn concat(&self, a: MatrixId, b: MatrixId, out: MatrixId, axis: usize, tier: Tier) -> Result<()> {
        let mut state = self.lock()?;
        let sa = state.resident("concat", a, tier)?;
        let sb = state.resident("concat", b, tier)?;
        let shape = match axis {
            0 if sa.1 == sb.1 => (sa.0 + sb.0, sa.1),
            1 if sa.0 == sb.0 => (sa.0, sa.1 + sb.1),
            0 | 1 => {
                return Err(Error::ShapeMismatch {
                    op: "concat",
                    lhs: sa,
                    rhs: sb,
                })
            }
            _ => {
                return Err(Error::InvalidArgument {
                    arg: "axis",
                    reason: format!("expected 0 or 1, got {axis}"),
                })
            }
        };
        state.ensure_unwritten("concat", out)?;
        state.place(out, tier, shape)?;
        state.issue(Instruction::Concat { a, b, out, axis });
        Ok(())
    }

    pub fn matmul(&self, a: MatrixId, b: MatrixId, out: MatrixId) -> Result<()> {
        let mut state = self.lock()?;
        let sa = state.resident("matmul", a, Tier::Scratch)?;
        let sb = state.resident("matmul", b, Tier::Scratch)?;
        if sa.1 != sb.0 {
            return Err(Error::ShapeMismatch {
                op: "matmul",
                lhs: sa,
                rhs: sb,
            });
        }
        state.ensure_unwritten("matmul", out)?;
        state.place(out, Tier::Scratch, (sa.0, sb.1))?;
        state.issue(Instruction::MatMul { a, b, out });
        Ok(())
    }

    /// Elementwise exponential.
    pub fn exp(&self, a: MatrixId, out: MatrixId) -> Result<()> {
        let mut state = self.lock()?;
        let shape = state.resident("exp", a, Tier::Scratch)?;
        state.ensure_unwritten("exp", out)?;
        state.place(out, Tier::Scratch, shape)?;
        state.issue(Instruction::Exp { a, out });
        Ok(())
    }

    /// Per-row sum, producing a (rows, 1) column.
    pub fn row_sum(&self, a: MatrixId, out: MatrixId) -> Result<()> {
        self.row_reduce("row_sum", a, out, |a, out| Instruction::RowSum { a, out })
    }

    /// Per-row maximum, producing a (rows, 1) column.
    pub fn row_max(&self, a: MatrixId, out: MatrixId) -> Result<()> {
        self.row_reduce("row_max", a, out, |a, out| Instruction::RowMax { a, out })
    }

    fn row_reduce(
        &self,
        op: &'static str,
        a: MatrixId,
        out: MatrixId,
        instruction: fn(MatrixId, MatrixId) -> Instruction,
    ) -> Result<()> {
        let mut state = self.lock()?;
        let (rows, _) = state.resident(op, a, Tier::Scratch)?;
        state.ensure_unwritten(op, out)?;
        state.place(out, Tier::Scratch, (rows, 1))?;
        state.issue(instruction(a, out));
        Ok(())
    }

    /// Divide every row of `a` by the matching entry of the column `b`.
    pub fn broadcast_div(&self, a: MatrixId, b: MatrixId, out: MatrixId) -> Result<()> {
        self.broadcast("broadcast_div", a, b, out, |a, b, out| Instruction::BroadcastDiv { a, b, out })
    }

    /// Subtract the matching entry of the column `b` from every row of `a`.
    pub fn broadcast_sub(&self, a: MatrixId, b: MatrixId, out: MatrixId) -> Result<()> {
        self.broadcast("broadcast_sub", a, b, out, |a, b, out| Instruction::BroadcastSub { a, b, out })
    }

    fn broadcast(
        &self,
        op: &'static str,
        a: MatrixId,
        b: MatrixId,
        out: MatrixId,
        instruction: fn(MatrixId, MatrixId, MatrixId) -> Instruction,
    ) -> Result<()> {
        let mut state = self.lock()?;
        let sa = state.resident(op, a, Tier::Scratch)?;
        let sb = state.resident(op, b, Tier::Scratch)?;
        if sb != (sa.0, 1) {
            return Err(Error::ShapeMismatch { op, lhs: sa, rhs: sb });
        }
        state.ensure_unwritten(op, out)?;
        state.place(out, Tier::Scratch, sa)?;
        state.issue(instruction(a, b, out));
        Ok(())
    }

    /// Extract row `row` of `src` as a (1, cols) matrix.
    pub fn get_row(&self, src: MatrixId, row: usize, out: MatrixId, tier: Tier) -> Result<()> {
        let mut state = self.lock()?;
        let (rows, cols) = state.resident("get_row", src, tier)?;
        if row >= rows {
            return Err(Error::InvalidArgument {
                arg: "row",
                reason: format!("row {row} out of range for {rows} rows"),
            });
        }
        state.ensure_unwritten("get_row", out)?;
        state.place(out, tier, (1, cols))?;
        state.issue(Instruction::GetRow { src, row, out });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sim() -> TierSimulator {
        TierSimulator::with_config(&SimulatorConfig::default())
    }

    #[test]
    fn test_upload_and_read() {
        let sim = sim();
        let id = sim.upload("m", &[1.0, 2.0, 3.0, 4.0], 2, 2).unwrap();
        assert_eq!(sim.shape(id).unwrap(), (2, 2));
        assert_eq!(sim.tier(id).unwrap(), Tier::Bulk);
        assert_eq!(sim.read(id).unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_matmul_requires_scratch() {
        let sim = sim();
        let a = sim.upload("a", &[1.0, 2.0], 1, 2).unwrap();
        let b = sim.upload("b", &[1.0, 1.0], 2, 1).unwrap();
        let out = sim.allocate("out").unwrap();
        match sim.matmul(a, b, out) {
            Err(Error::TierViolation { expected, actual, .. }) => {
                assert_eq!(expected, Tier::Scratch);
                assert_eq!(actual, Tier::Bulk);
            }
            other => panic!("expected TierViolation, got {other:?}"),
        }
    }

    #[test]
    fn test_deferred_execution() {
        let sim = sim();
        let a = sim.upload("a", &[1.0, 2.0], 1, 2).unwrap();
        let b = sim.upload("b", &[3.0, 4.0], 2, 1).unwrap();
        sim.move_to_scratch(a).unwrap();
        sim.move_to_scratch(b).unwrap();
        let out = sim.allocate("out").unwrap();
        sim.matmul(a, b, out).unwrap();

        // Shape is known at issue time, data only after synchronize.
        assert_eq!(sim.shape(out).unwrap(), (1, 1));
        assert!(matches!(sim.read(out), Err(Error::PendingWork { .. })));

        sim.synchronize(false).unwrap();
        assert_eq!(sim.read(out).unwrap(), vec![11.0]);
    }

    #[test]
    fn test_matmul_shape_mismatch() {
        let sim = sim();
        let a = sim.upload("a", &[1.0, 2.0], 1, 2).unwrap();
        let b = sim.upload("b", &[1.0, 2.0], 1, 2).unwrap();
        sim.move_to_scratch(a).unwrap();
        sim.move_to_scratch(b).unwrap();
        let out = sim.allocate("out").unwrap();
        assert!(matches!(sim.matmul(a, b, out), Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn test_use_after_release() {
        let sim = sim();
        let a = sim.upload("a", &[1.0], 1, 1).unwrap();
        sim.release(a).unwrap();
        assert!(matches!(sim.move_to_scratch(a), Err(Error::UseAfterRelease { .. })));
        assert!(matches!(sim.release(a), Err(Error::DoubleRelease { .. })));
        sim.synchronize(false).unwrap();
        assert!(matches!(sim.read(a), Err(Error::UseAfterRelease { .. })));
    }

    #[test]
    fn test_release_after_read_in_queue() {
        // A released operand must still be readable by instructions queued
        // before the release.
        let sim = sim();
        let a = sim.upload("a", &[5.0, 7.0], 1, 2).unwrap();
        let b = sim.allocate("b").unwrap();
        sim.copy(a, b, Tier::Bulk).unwrap();
        sim.release(a).unwrap();
        sim.synchronize(false).unwrap();
        assert_eq!(sim.read(b).unwrap(), vec![5.0, 7.0]);
    }

    #[test]
    fn test_scratch_capacity() {
        let sim = TierSimulator::with_config(&SimulatorConfig {
            scratch_capacity: Some(4),
        });
        let a = sim.upload("a", &[1.0; 4], 2, 2).unwrap();
        let b = sim.upload("b", &[1.0; 2], 1, 2).unwrap();
        sim.move_to_scratch(a).unwrap();
        assert!(matches!(
            sim.move_to_scratch(b),
            Err(Error::CapacityExceeded { requested: 2, in_use: 4, capacity: 4 })
        ));

        sim.release(a).unwrap();
        sim.move_to_scratch(b).unwrap();
        let stats = sim.stats();
        assert_eq!(stats.scratch_elements, 2);
        assert_eq!(stats.peak_scratch_elements, 4);
    }

    #[test]
    fn test_concat_and_transpose() {
        let sim = sim();
        let a = sim.upload("a", &[1.0, 2.0], 1, 2).unwrap();
        let b = sim.upload("b", &[3.0, 4.0], 1, 2).unwrap();
        let out = sim.allocate("out").unwrap();
        sim.concat(a, b, out, 0, Tier::Bulk).unwrap();
        sim.transpose(out, Tier::Bulk).unwrap();
        assert_eq!(sim.shape(out).unwrap(), (2, 2));
        sim.synchronize(false).unwrap();
        assert_eq!(sim.read(out).unwrap(), vec![1.0, 3.0, 2.0, 4.0]);

        let bad = sim.upload("bad", &[1.0; 3], 1, 3).unwrap();
        let out2 = sim.allocate("out2").unwrap();
        assert!(matches!(
            sim.concat(a, bad, out2, 0, Tier::Bulk),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_row_primitives() {
        let sim = sim();
        let a = sim.upload("a", &[1.0, 3.0, 2.0, 6.0], 2, 2).unwrap();
        sim.move_to_scratch(a).unwrap();

        let sum = sim.allocate("sum").unwrap();
        sim.row_sum(a, sum).unwrap();
        let max = sim.allocate("max").unwrap();
        sim.row_max(a, max).unwrap();
        let div = sim.allocate("div").unwrap();
        sim.broadcast_div(a, sum, div).unwrap();
        let sub = sim.allocate("sub").unwrap();
        sim.broadcast_sub(a, max, sub).unwrap();
        let row = sim.allocate("row").unwrap();
        sim.get_row(a, 1, row, Tier::Scratch).unwrap();
        sim.synchronize(true).unwrap();

        assert_eq!(sim.read(sum).unwrap(), vec![4.0, 8.0]);
        assert_eq!(sim.read(max).unwrap(), vec![3.0, 6.0]);
        assert_eq!(sim.read(div).unwrap(), vec![0.25, 0.75, 0.25, 0.75]);
        assert_eq!(sim.read(sub).unwrap(), vec![-2.0, 0.0, -4.0, 0.0]);
        assert_eq!(sim.read(row).unwrap(), vec![2.0, 6.0]);
    }

    #[test]
    fn test_output_written_once() {
        let sim = sim();
        let a = sim.upload("a", &[1.0], 1, 1).unwrap();
        let out = sim.allocate("out").unwrap();
        sim.copy(a, out, Tier::Bulk).unwrap();
        assert!(matches!(
            sim.copy(a, out, Tier::Bulk),
            Err(Error::InvalidArgument { arg: "out", .. })
        ));
    }

    #[test]
    fn test_unwritten_operand() {
        let sim = sim();
        let empty = sim.allocate("never_written").unwrap();
        let out = sim.allocate("out").unwrap();
        match sim.copy(empty, out, Tier::Bulk) {
            Err(Error::EmptyMatrix { op, label }) => {
                assert_eq!(op, "copy");
                assert_eq!(label, "never_written");
            }
            other => panic!("expected EmptyMatrix, got {other:?}"),
        }
    }

    #[test]
    fn test_audit_reports_leaks() {
        let sim = sim();
        let keep = sim.upload("input", &[1.0], 1, 1).unwrap();
        let _leak = sim.allocate("forgotten").unwrap();
        match sim.audit(&[keep]) {
            Err(Error::ResourceLeak { count, labels }) => {
                assert_eq!(count, 1);
                assert_eq!(labels, vec!["forgotten".to_string()]);
            }
            other => panic!("expected ResourceLeak, got {other:?}"),
        }
    }

    #[test]
    fn test_scoped_releases_on_drop() {
        let sim = sim();
        {
            let _guard = sim.scoped("temp").unwrap();
            assert_eq!(sim.allocator().live_count(), 1);
        }
        assert_eq!(sim.allocator().live_count(), 0);

        let guard = sim.scoped("handed_off").unwrap();
        let id = guard.into_id();
        assert!(sim.allocator().is_live(id));
        sim.release(id).unwrap();
    }
}
