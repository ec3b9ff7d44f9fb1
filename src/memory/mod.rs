pub mod allocator;
pub mod handle;
pub mod instruction;
pub mod simulator;

pub use allocator::{AllocatorStats, MatrixAllocator, PoolAllocator};
pub use handle::{MatrixId, Scoped, Tier};
pub use instruction::Instruction;
pub use simulator::{SimStats, TierSimulator};
