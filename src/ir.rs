//! The small abstract interface the host IR implements. Spec §1 names
//! dominance/liveness analysis, merge-set computation, parallel-copy
//! synthesis and IR container types as external collaborators "consumed
//! via a small abstract interface" - these traits are that interface.
//!
//! Grounded on `regalloc::interface::Function` as implemented by
//! `jlight-vm/src/bytecode/framework.rs` in the teacher repo.

use rustc_hash::FxHashSet;

use crate::ssa::{Name, SsaValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

/// Which of the seven dispatch paths in spec §4.6 an instruction takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstKind {
  Normal,
  /// Extract a sub-range out of a vector value.
  Split,
  /// Build a vector value out of several sources.
  Collect,
  /// A parallel-copy meta-instruction synthesized for phi lowering.
  ParallelCopy,
  /// Sources carry fixed (precolored) physreg numbers.
  Chmask,
  /// Block-entry input, possibly precolored.
  Input,
  /// Block-entry phi.
  Phi,
}

pub trait Instruction {
  type Value: SsaValue;

  fn kind(&self) -> InstKind;
  fn sources(&self) -> &[Self::Value];
  fn destinations(&self) -> &[Self::Value];

  /// For `Chmask`/precolored `Input`: source/destination paired with the
  /// fixed physreg it must land in.
  fn precolored(&self) -> &[(Self::Value, u16)] {
    &[]
  }

  /// True for arithmetic/special-function instructions, enabling the
  /// source-reuse placement rule (spec §4.3.3).
  fn is_alu_or_sfu(&self) -> bool {
    false
  }
}

pub trait Block {
  fn id(&self) -> BlockId;
  fn dom_children(&self) -> &[BlockId];
  fn preds(&self) -> &[BlockId];
}

/// The program the allocator walks. `definitions`/`live_in`/`live_out`
/// mirror spec §6's external liveness result exactly; dominance is exposed
/// through `Block::dom_children`.
pub trait Program {
  type Value: SsaValue;
  type Inst: Instruction<Value = Self::Value>;
  type Block: Block;

  fn blocks(&self) -> &[Self::Block];
  fn block(&self, id: BlockId) -> &Self::Block;
  fn instructions(&self, block: BlockId) -> &[Self::Inst];
  fn live_in(&self, block: BlockId) -> &FxHashSet<Name>;
  fn live_out(&self, block: BlockId) -> &FxHashSet<Name>;
  fn definition(&self, name: Name) -> Self::Value;
  fn merged_regs(&self) -> bool;

  fn entry_block(&self) -> BlockId {
    self.blocks()[0].id()
  }
}
