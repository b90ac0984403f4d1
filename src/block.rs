//! Inter-block glue (spec §4.7): reconciling a value's physreg across a
//! control-flow edge. A value can be assigned different physregs in
//! different predecessors (each block is allocated independently in
//! dominator-tree order); `handle_live_in` makes every live-in value agree
//! on one physreg in the successor, inserting reconciling moves into the
//! predecessor's trailing parallel copy wherever one already exists.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::dispatch::{thaw_inputs, LiveIntervals};
use crate::error::internal_error;
use crate::file::Files;
use crate::interval::IntervalArena;
use crate::ir::BlockId;
use crate::ssa::{Name, SsaValue};

/// Per-block bookkeeping the dominator-tree walk threads through (spec §3
/// "BlockState").
#[derive(Default)]
pub struct BlockState {
  /// Seeded at entry by `handle_live_in`, then refreshed by `walk_block`
  /// once the body has run so it reflects each live-through value's actual
  /// physreg as control leaves this block - eviction/compression can move a
  /// live-in value mid-block, and a value defined fresh in the body and
  /// carried live-out never had an entry at all otherwise. Read as the
  /// *predecessor* side of a reconciliation (forward edge or loop back
  /// edge): "where did this value really end up."
  pub renames: FxHashMap<Name, u16>,
  /// The physreg each live-in value was placed at upon entry to this block,
  /// fixed for the block's whole lifetime. Read as the *successor* side of
  /// a reconciliation: "where does this block expect the value to already
  /// be." Also what a loop header exposes to its own back-edge predecessor,
  /// which is visited later (spec §4.7 "entry_regs").
  pub entry_regs: FxHashMap<Name, u16>,
  pub visited: bool,
}

/// A reconciling move a predecessor must perform so its successor's
/// `renames` agree with what the successor expects (spec §4.7).
#[derive(Debug, Clone, Copy)]
pub struct ReconcileMove {
  pub value: Name,
  pub from_physreg: u16,
  pub to_physreg: u16,
}

/// Place every value live-in to `block_id` (spec §4.7 step "live-in
/// installation"). For a value already resident from a dominator-tree
/// ancestor, reuse its existing physreg outright (no motion needed at a
/// straight-line fallthrough); for anything else, fall through to the
/// ordinary placement policy via `place_live_in`, which the caller
/// supplies per the usual `get_reg` contract so this module stays
/// unaware of destination-allocation policy.
pub fn handle_live_in<V: SsaValue>(
  files: &mut Files, arena: &mut IntervalArena<V>, live: &mut LiveIntervals, state: &mut BlockState,
  live_in_names: &FxHashSet<Name>, definition_of: impl Fn(Name) -> V,
  mut place: impl FnMut(&mut Files, &mut IntervalArena<V>, &mut LiveIntervals, V) -> u16,
) {
  for &name in live_in_names {
    let physreg = if let Some(&id) = live.get(&name) {
      arena.physreg_range(id).0
    } else {
      let value = definition_of(name);
      place(files, arena, live, value)
    };
    state.renames.insert(name, physreg);
    state.entry_regs.insert(name, physreg);
  }
  state.visited = true;
}

/// Lift the `frozen` bit set on precolored inputs once this block's entire
/// input/phi placement pass has run (spec §4.6 "Input").
pub fn finish_inputs<V: SsaValue>(files: &mut Files, arena: &mut IntervalArena<V>) {
  thaw_inputs(&mut files.full, arena);
  thaw_inputs(&mut files.half, arena);
  thaw_inputs(&mut files.shared, arena);
}

/// Compute the reconciling moves a predecessor must make so every value
/// live-out of it agrees with the successor's `renames` (spec §4.7
/// "handle_live_out"). Returns one `ReconcileMove` per value whose
/// predecessor-side and successor-side physregs differ; the caller merges
/// these into the predecessor's trailing parallel copy (or synthesizes one
/// if the predecessor doesn't already end in one).
pub fn handle_live_out(
  pred_live_out: &FxHashSet<Name>, pred_renames: &FxHashMap<Name, u16>, succ_renames: &FxHashMap<Name, u16>,
) -> Vec<ReconcileMove> {
  let mut moves = Vec::new();
  for &name in pred_live_out {
    let from = *pred_renames
      .get(&name)
      .unwrap_or_else(|| internal_error!("handle_live_out: {} is live-out but has no predecessor rename", name));
    if let Some(&to) = succ_renames.get(&name) {
      if from != to {
        moves.push(ReconcileMove { value: name, from_physreg: from, to_physreg: to });
      }
    }
  }
  moves
}

/// Merge `moves` into a predecessor's existing trailing parallel copy
/// (spec §4.7 "insert_live_in_moves"), rather than always synthesizing a
/// brand new one. A value already present in `existing` (because some
/// other successor's reconciliation already placed it there) is left
/// alone - swap semantics are a property of how `existing`'s legs execute
/// relative to each other, which this function does not reorder, only
/// extend.
pub fn insert_live_in_moves(existing: &mut Vec<crate::context::CopyEntry>, moves: &[ReconcileMove]) {
  for mv in moves {
    if existing.iter().any(|e| e.value == mv.value) {
      continue;
    }
    existing.push(crate::context::CopyEntry { value: mv.value, from_physreg: mv.from_physreg, to_physreg: mv.to_physreg });
  }
}

/// Target block ids not yet visited by the dominator-tree walk when a
/// predecessor's `handle_live_out` runs (loop back-edges, spec §4.7): the
/// predecessor records its intended live-out renames in its own
/// `BlockState`, and the *successor*, once eventually visited, reconciles
/// against whatever the back-edge predecessor already committed to rather
/// than the other way around.
pub fn successor_already_visited(successors_visited: &FxHashMap<BlockId, bool>, succ: BlockId) -> bool {
  successors_visited.get(&succ).copied().unwrap_or(false)
}
