//! SSA-based register allocator for a GPU shader compiler's low-level IR.
//!
//! The crate owns no IR of its own: a host implements [`ssa::SsaValue`],
//! [`ir::Instruction`], [`ir::Block`] and [`ir::Program`] over its own
//! types, and [`context::allocate`] walks the supplied program in
//! dominator-tree pre-order, returning either a fully-assigned
//! [`context::AllocResult`] or a [`error::RegAllocError`].
//!
//! Three register files (full, half, shared) each hold an interval tree of
//! live ranges keyed by physical register; placing a destination walks a
//! fixed policy (merge-set preference, whole-merge-set gap, source reuse,
//! round-robin, eviction, compression) before giving up.

pub mod bitset;
pub mod block;
pub mod compress;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod file;
pub mod interval;
pub mod ir;
pub mod pcopy;
pub mod placement;
pub mod ssa;
pub mod validate;

pub use context::{allocate, AllocResult, Context, CopyEntry, InsertedPCopy, PCopyPosition, PhysAssignment};
pub use error::RegAllocError;
pub use file::FileSizes;
pub use ir::{Block, BlockId, Instruction, InstKind, Program};
pub use ssa::{Flags, MergeSetRef, Name, SsaValue};
