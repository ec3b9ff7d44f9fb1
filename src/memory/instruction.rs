//! Deferred device instructions.

use std::fmt;

use super::handle::MatrixId;

/// Instruction queued by the simulator and executed at `synchronize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Copy { src: MatrixId, dst: MatrixId },
    MoveToScratch { id: MatrixId },
    MoveToBulk { id: MatrixId },
    Transpose { id: MatrixId },
    Concat { a: MatrixId, b: MatrixId, out: MatrixId, axis: usize },
    MatMul { a: MatrixId, b: MatrixId, out: MatrixId },
    Exp { a: MatrixId, out: MatrixId },
    RowSum { a: MatrixId, out: MatrixId },
    RowMax { a: MatrixId, out: MatrixId },
    BroadcastDiv { a: MatrixId, b: MatrixId, out: MatrixId },
    BroadcastSub { a: MatrixId, b: MatrixId, out: MatrixId },
    GetRow { src: MatrixId, row: usize, out: MatrixId },
    Release { id: MatrixId },
}

impl Instruction {
    /// Short name used for instruction counters.
    pub fn kind(&self) -> &'static str {
        match self {
            Instruction::Copy { .. } => "copy",
            Instruction::MoveToScratch { .. } => "move_to_scratch",
            Instruction::MoveToBulk { .. } => "move_to_bulk",
            Instruction::Transpose { .. } => "transpose",
            Instruction::Concat { .. } => "concat",
            Instruction::MatMul { .. } => "matmul",
            Instruction::Exp { .. } => "exp",
            Instruction::RowSum { .. } => "row_sum",
            Instruction::RowMax { .. } => "row_max",
            Instruction::BroadcastDiv { .. } => "broadcast_div",
            Instruction::BroadcastSub { .. } => "broadcast_sub",
            Instruction::GetRow { .. } => "get_row",
            Instruction::Release { .. } => "release",
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Instruction::Copy { src, dst } => write!(f, "copy {src} -> {dst}"),
            Instruction::MoveToScratch { id } => write!(f, "move {id} -> scratch"),
            Instruction::MoveToBulk { id } => write!(f, "move {id} -> bulk"),
            Instruction::Transpose { id } => write!(f, "transpose {id}"),
            Instruction::Concat { a, b, out, axis } => {
                write!(f, "concat[{axis}] {a}, {b} -> {out}")
            }
            Instruction::MatMul { a, b, out } => write!(f, "matmul {a}, {b} -> {out}"),
            Instruction::Exp { a, out } => write!(f, "exp {a} -> {out}"),
            Instruction::RowSum { a, out } => write!(f, "row_sum {a} -> {out}"),
            Instruction::RowMax { a, out } => write!(f, "row_max {a} -> {out}"),
            Instruction::BroadcastDiv { a, b, out } => write!(f, "div {a}, {b} -> {out}"),
            Instruction::BroadcastSub { a, b, out } => write!(f, "sub {a}, {b} -> {out}"),
            Instruction::GetRow { src, row, out } => write!(f, "get_row {src}[{row}] -> {out}"),
            Instruction::Release { id } => write!(f, "release {id}"),
        }
    }
}
