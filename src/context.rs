//! `Context` (spec §3, §9): the single mutable state threaded through
//! allocation, and `allocate()`, the dominator-tree pre-order walk that
//! drives the whole crate (spec §2).

use rustc_hash::FxHashMap;

use crate::block::{finish_inputs, handle_live_in, handle_live_out, insert_live_in_moves, BlockState};
use crate::dispatch::{dispatch, LiveIntervals};
use crate::error::{internal_error, RegAllocError};
use crate::file::{FileSizes, Files};
use crate::interval::IntervalArena;
use crate::ir::{Block, BlockId, Program};
use crate::pcopy::{PCopyEntry, PCopyStage};
use crate::placement::get_reg;
use crate::ssa::{MergeSetId, Name, SsaValue};

/// How a destination's final register is reported to the caller (spec §6
/// "Output"): a plain number, or an array base/offset pair for
/// `ARRAY`-flagged values (spec SUPPLEMENT "Array-register output").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhysAssignment {
  Num(u16),
  Array { base: u16, offset: u16 },
}

/// Where a synthesized parallel copy belongs relative to the instruction
/// stream (spec §4.5, §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PCopyPosition {
  BeforeInst(usize),
  BlockEnd,
}

#[derive(Debug, Clone, Copy)]
pub struct CopyEntry {
  pub value: Name,
  pub from_physreg: u16,
  pub to_physreg: u16,
}

#[derive(Debug, Clone)]
pub struct InsertedPCopy {
  pub block: BlockId,
  pub position: PCopyPosition,
  pub copies: Vec<CopyEntry>,
}

/// The full result of a successful `allocate()` call (spec §6 "Output").
/// The crate reports assignments and required copy insertions rather than
/// mutating a caller-owned instruction stream directly, since IR container
/// types are an explicit external collaborator (spec §1 "Non-goals").
#[derive(Default)]
pub struct AllocResult {
  pub assignments: FxHashMap<Name, PhysAssignment>,
  pub inserted_pcopies: Vec<InsertedPCopy>,
}

/// The allocator's full mutable state (spec §3 "Context").
pub struct Context<V> {
  pub files: Files,
  pub arena: IntervalArena<V>,
  pub live: LiveIntervals,
  pub stage: PCopyStage,
  pub merge_set_preferred: FxHashMap<MergeSetId, u16>,
  pub blocks: FxHashMap<BlockId, BlockState>,
  /// Loop headers waiting on a not-yet-visited predecessor (spec §4.7
  /// "Loop live-in"): keyed by that predecessor's `BlockId`, so that once
  /// the predecessor itself finishes, its live-out renames get reconciled
  /// against every header it owes a back-edge to.
  pub pending_back_edges: FxHashMap<BlockId, Vec<BlockId>>,
}

impl<V: SsaValue> Context<V> {
  pub fn new(sizes: FileSizes, merged_regs: bool) -> Self {
    Context {
      files: Files::new(sizes, merged_regs),
      arena: IntervalArena::new(),
      live: FxHashMap::default(),
      stage: PCopyStage::default(),
      merge_set_preferred: FxHashMap::default(),
      blocks: FxHashMap::default(),
      pending_back_edges: FxHashMap::default(),
    }
  }

  fn to_copy_entries(&self, entries: Vec<PCopyEntry>) -> Vec<CopyEntry> {
    entries
      .into_iter()
      .map(|e| CopyEntry {
        value: e.value,
        from_physreg: e.src_physreg,
        to_physreg: self.arena.physreg_range(*self.live.get(&e.value).unwrap()).0,
      })
      .collect()
  }

  fn record_assignment(&self, result: &mut AllocResult, value: V) {
    let id = *self.live.get(&value.name()).unwrap();
    let (start, _) = self.arena.physreg_range(id);
    let assignment = if value.flags().contains(crate::ssa::Flags::ARRAY) {
      let ms = value.merge_set();
      PhysAssignment::Array { base: ms.map_or(start, |m| start - m.offset), offset: ms.map_or(0, |m| m.offset) }
    } else {
      PhysAssignment::Num(start)
    };
    result.assignments.insert(value.name(), assignment);
  }
}

/// Walk `program` in dominator-tree pre-order, placing every destination
/// and reconciling live ranges across control-flow edges (spec §2).
pub fn allocate<P: Program>(program: &P, sizes: FileSizes) -> Result<AllocResult, RegAllocError> {
  check_pressure(program, &sizes)?;

  let mut ctx: Context<P::Value> = Context::new(sizes, program.merged_regs());
  let mut result = AllocResult::default();
  walk_block(program, &mut ctx, &mut result, program.entry_block())?;
  Ok(result)
}

/// A value larger than its own file can never fit, compression or not
/// (spec §7.1 "Pressure exceeded at entry" - the one failure the caller is
/// meant to recover from, as opposed to the internal-contradiction panics
/// everything past this point raises). Caught up front rather than as a
/// panic deep inside `compress_regs_left`.
fn check_pressure<P: Program>(program: &P, sizes: &FileSizes) -> Result<(), RegAllocError> {
  let limit = |flags: crate::ssa::Flags| -> (crate::file::FileKind, u16) {
    if flags.contains(crate::ssa::Flags::SHARED) {
      (crate::file::FileKind::Shared, sizes.shared)
    } else if flags.contains(crate::ssa::Flags::HALF) {
      (crate::file::FileKind::Half, sizes.half)
    } else {
      (crate::file::FileKind::Full, sizes.full)
    }
  };
  let mut check = |v: &P::Value| -> Result<(), RegAllocError> {
    let (file, available) = limit(v.flags());
    if v.size() > available {
      return Err(RegAllocError::PressureExceeded { file, needed: v.size(), available });
    }
    Ok(())
  };
  for block in program.blocks() {
    for name in program.live_in(block.id()) {
      check(&program.definition(*name))?;
    }
    for inst in program.instructions(block.id()) {
      for dest in inst.destinations() {
        check(dest)?;
      }
    }
  }
  Ok(())
}

/// Merge `moves` into `pred`'s existing trailing parallel copy, or
/// synthesize a fresh `BlockEnd` one if `pred` doesn't have one yet (spec
/// §4.7 "insert_live_in_moves").
fn push_reconciling_moves(result: &mut AllocResult, pred: BlockId, moves: &[crate::block::ReconcileMove]) {
  if moves.is_empty() {
    return;
  }
  log::trace!("walk_block: {} reconciling move(s) owed by block {:?}", moves.len(), pred);
  let existing = result
    .inserted_pcopies
    .iter_mut()
    .find(|p| p.block == pred && p.position == PCopyPosition::BlockEnd);
  match existing {
    Some(p) => insert_live_in_moves(&mut p.copies, moves),
    None => result.inserted_pcopies.push(InsertedPCopy {
      block: pred,
      position: PCopyPosition::BlockEnd,
      copies: moves
        .iter()
        .map(|m| CopyEntry { value: m.value, from_physreg: m.from_physreg, to_physreg: m.to_physreg })
        .collect(),
    }),
  }
}

fn walk_block<P: Program>(
  program: &P, ctx: &mut Context<P::Value>, result: &mut AllocResult, block_id: BlockId,
) -> Result<(), RegAllocError> {
  let block = program.block(block_id);
  let live_in = program.live_in(block_id).clone();

  // A predecessor the dominator-tree walk hasn't reached yet is a back
  // edge (spec §4.7 "Loop live-in"): it can only be reconciled once that
  // predecessor itself has been placed, so record this block as a header
  // it owes a reconciling copy to, and pick it back up in `walk_block` for
  // that predecessor once it finishes below.
  for pred in block.preds() {
    if !ctx.blocks.contains_key(pred) {
      ctx.pending_back_edges.entry(*pred).or_default().push(block_id);
    }
  }

  let mut state = BlockState::default();
  let stage = &mut ctx.stage;
  let merge_set_preferred = &mut ctx.merge_set_preferred;
  handle_live_in(
    &mut ctx.files,
    &mut ctx.arena,
    &mut ctx.live,
    &mut state,
    &live_in,
    |name| program.definition(name),
    |files, arena, live, value| {
      let physreg = get_reg(files.select(value.flags()), arena, stage, merge_set_preferred, value, &[]);
      let id = arena.alloc(value);
      files.select(value.flags()).add(arena, id, physreg);
      live.insert(value.name(), id);
      physreg
    },
  );
  finish_inputs(&mut ctx.files, &mut ctx.arena);

  if !ctx.stage.is_empty() {
    let copies = ctx.to_copy_entries(ctx.stage.drain());
    result.inserted_pcopies.push(InsertedPCopy { block: block_id, position: PCopyPosition::BeforeInst(0), copies });
  }

  for (i, inst) in program.instructions(block_id).iter().enumerate() {
    let out = dispatch(&mut ctx.files, &mut ctx.arena, &mut ctx.stage, &mut ctx.live, &mut ctx.merge_set_preferred, inst);
    for dest in inst.destinations() {
      // Phi/ParallelCopy destinations are placed by the block-entry
      // live-in pass, not by `dispatch`, so they're already recorded; a
      // non-precolored `Input` destination isn't placed at all until that
      // same pass runs for the *next* block that needs it live-in.
      if ctx.live.contains_key(&dest.name()) {
        ctx.record_assignment(result, *dest);
      }
    }
    if !out.copies.is_empty() {
      result.inserted_pcopies.push(InsertedPCopy {
        block: block_id,
        position: PCopyPosition::BeforeInst(i),
        copies: ctx.to_copy_entries(out.copies),
      });
    }
  }

  // `state.renames` so far only holds this block's *live-in* values, as
  // recorded by `handle_live_in` at entry. A value defined fresh in this
  // block's own body and carried live-out needs an entry too, and a
  // live-in value that got moved by eviction/compression mid-block needs
  // its entry refreshed - both reconciliation loops below key off of
  // each value's real physreg at the point control leaves this block, not
  // where it happened to land on the way in.
  for &name in program.live_out(block_id) {
    if let Some(&id) = ctx.live.get(&name) {
      state.renames.insert(name, ctx.arena.physreg_range(id).0);
    }
  }

  for pred in block.preds() {
    if let Some(pred_state) = ctx.blocks.get(pred) {
      let pred_live_out = program.live_out(*pred);
      // `state.entry_regs`, not `state.renames`: a predecessor must land
      // every live-out value where *this* block expected it on entry, not
      // wherever this block's own body later left it (those can differ -
      // see the comment above `state.renames`'s update just above).
      let moves = handle_live_out(pred_live_out, &pred_state.renames, &state.entry_regs);
      push_reconciling_moves(result, *pred, &moves);
    }
  }

  // This block may itself be the tail of a loop back edge: resolve every
  // header waiting on it (recorded above, when that header was walked
  // before this block had a `BlockState` of its own) against the renames
  // it just settled on, per spec §4.7 "Loop live-in".
  if let Some(headers) = ctx.pending_back_edges.remove(&block_id) {
    let tail_live_out = program.live_out(block_id);
    for header in headers {
      let header_entry_regs = &ctx
        .blocks
        .get(&header)
        .unwrap_or_else(|| internal_error!("walk_block: loop header {:?} not visited before its own back edge", header))
        .entry_regs;
      let moves = handle_live_out(tail_live_out, &state.renames, header_entry_regs);
      push_reconciling_moves(result, block_id, &moves);
    }
  }

  ctx.blocks.insert(block_id, state);

  let dom_children: Vec<BlockId> = block.dom_children().to_vec();
  for child in dom_children {
    walk_block(program, ctx, result, child)?;
  }
  Ok(())
}
