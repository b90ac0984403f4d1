//! Instruction dispatch (spec §4.6): the seven ways an instruction can ask
//! the allocator for registers. `dispatch` matches on `InstKind` and hands
//! off to one of the per-kind routines below, all of which share the same
//! shape: read/kill sources, place destinations, stage parallel copies.

use rustc_hash::FxHashMap;

use crate::error::internal_error;
use crate::file::Files;
use crate::interval::{IntervalArena, IntervalId};
use crate::ir::{Instruction, InstKind};
use crate::pcopy::{ra_move_interval, PCopyEntry, PCopyStage};
use crate::placement::{get_reg, try_evict_regs};
use crate::ssa::{Flags, MergeSetId, Name, SsaValue};

/// Maps every currently-live SSA name to the arena node that currently
/// represents it - the destination of a split/collect is its own distinct
/// name, nested as a child of the interval it was carved out of or built
/// into, so this map always has exactly one entry per live name regardless
/// of nesting depth.
pub type LiveIntervals = FxHashMap<Name, IntervalId>;

/// What dispatching one instruction produced: each source's resolved
/// physreg (for the caller to patch into the instruction's encoding) and
/// any parallel-copy legs the placement policy staged while making room.
#[derive(Default)]
pub struct DispatchOutput {
  pub source_regs: Vec<(Name, u16)>,
  pub copies: Vec<PCopyEntry>,
}

fn is_first_kill(flags: Flags) -> bool {
  flags.contains(Flags::FIRST_KILL) || flags.contains(Flags::KILL)
}

/// Record every source's current physreg, iterating in reverse program
/// order, then remove the leaf (no parent, no children) first-kill ones.
/// Reverse order is load-bearing (spec §9): removing a source can reparent
/// its siblings, which would corrupt an earlier-computed physreg for a
/// source read afterwards in forward order.
fn read_and_kill_sources<V: SsaValue>(
  files: &mut Files, arena: &mut IntervalArena<V>, live: &mut LiveIntervals, sources: &[V],
) -> Vec<(Name, u16)> {
  let mut out = Vec::with_capacity(sources.len());
  for src in sources.iter().rev() {
    let id = *live
      .get(&src.name())
      .unwrap_or_else(|| internal_error!("dispatch: source {:?} has no live interval", src));
    let (start, _) = arena.physreg_range(id);
    out.push((src.name(), start));

    if is_first_kill(src.flags()) && arena.node(id).parent.is_none() && arena.node(id).children.is_empty() {
      let file = files.select(src.flags());
      file.delete(arena, id);
      arena.remove_all(id);
      live.remove(&src.name());
    }
  }
  out.reverse();
  out
}

fn insert_destination<V: SsaValue>(
  files: &mut Files, arena: &mut IntervalArena<V>, live: &mut LiveIntervals, dest: V, physreg: u16,
) -> IntervalId {
  let id = arena.alloc(dest);
  files.select(dest.flags()).add(arena, id, physreg);
  live.insert(dest.name(), id);
  id
}

pub fn dispatch<I: Instruction>(
  files: &mut Files, arena: &mut IntervalArena<I::Value>, stage: &mut PCopyStage, live: &mut LiveIntervals,
  merge_set_preferred: &mut FxHashMap<MergeSetId, u16>, inst: &I,
) -> DispatchOutput {
  match inst.kind() {
    InstKind::Normal => dispatch_normal(files, arena, stage, live, merge_set_preferred, inst),
    InstKind::Split => dispatch_split(files, arena, stage, live, merge_set_preferred, inst),
    InstKind::Collect => dispatch_collect(files, arena, stage, live, merge_set_preferred, inst),
    InstKind::ParallelCopy | InstKind::Phi => dispatch_parallel_copy(files, arena, live, inst),
    InstKind::Chmask => dispatch_chmask(files, arena, stage, live, inst),
    InstKind::Input => dispatch_input(files, arena, live, inst),
  }
}

fn dispatch_normal<I: Instruction>(
  files: &mut Files, arena: &mut IntervalArena<I::Value>, stage: &mut PCopyStage, live: &mut LiveIntervals,
  merge_set_preferred: &mut FxHashMap<MergeSetId, u16>, inst: &I,
) -> DispatchOutput {
  // Sources that might be reused in place for an ALU/SFU destination must
  // stay resident (not yet deleted) while `get_reg` looks at them, so the
  // placement pass runs before the kill/read pass below.
  let candidate_sources: Vec<IntervalId> = if inst.is_alu_or_sfu() {
    inst.sources().iter().filter_map(|s| live.get(&s.name()).copied()).collect()
  } else {
    Vec::new()
  };

  for dest in inst.destinations() {
    let physreg = get_reg(files.select(dest.flags()), arena, stage, merge_set_preferred, *dest, &candidate_sources);
    insert_destination(files, arena, live, *dest, physreg);
  }

  let source_regs = read_and_kill_sources(files, arena, live, inst.sources());
  DispatchOutput { source_regs, copies: stage.drain() }
}

/// `reg = split vector[offset..offset+size]` (spec §4.6 "Split"). Fast
/// path: the destination shares a merge set with one of the sources, so it
/// is simply a narrower view onto storage the source already occupies -
/// nest it as a child interval instead of allocating fresh space. Falls
/// back to the normal destination-placement path otherwise.
fn dispatch_split<I: Instruction>(
  files: &mut Files, arena: &mut IntervalArena<I::Value>, stage: &mut PCopyStage, live: &mut LiveIntervals,
  merge_set_preferred: &mut FxHashMap<MergeSetId, u16>, inst: &I,
) -> DispatchOutput {
  for dest in inst.destinations() {
    let same_set_source = dest.merge_set().and_then(|dms| {
      inst
        .sources()
        .iter()
        .find(|s| s.merge_set().map_or(false, |sms| sms.id == dms.id))
    });

    match same_set_source {
      Some(src) => {
        let parent = *live
          .get(&src.name())
          .unwrap_or_else(|| internal_error!("dispatch_split: source {:?} has no live interval", src));
        let id = arena.alloc(*dest);
        arena.insert(parent, id);
        live.insert(dest.name(), id);
      }
      None => {
        let physreg = get_reg(files.select(dest.flags()), arena, stage, merge_set_preferred, *dest, &[]);
        insert_destination(files, arena, live, *dest, physreg);
      }
    }
  }

  let source_regs = read_and_kill_sources(files, arena, live, inst.sources());
  DispatchOutput { source_regs, copies: stage.drain() }
}

/// `vector = collect sources...` (spec §4.6 "Collect"). Fast path: the
/// vector's merge set already has a chosen base large enough to hold this
/// destination and every source already sits at its offset within that
/// base - nothing moves, the destination is simply installed as the
/// top-level interval that subsumes its (now-children) sources. Slow path:
/// mark the merge set's own sources killed so their slots are eligible
/// gaps, place the destination, then emit moves for any source that isn't
/// already sitting where the placement landed it.
fn dispatch_collect<I: Instruction>(
  files: &mut Files, arena: &mut IntervalArena<I::Value>, stage: &mut PCopyStage, live: &mut LiveIntervals,
  merge_set_preferred: &mut FxHashMap<MergeSetId, u16>, inst: &I,
) -> DispatchOutput {
  for dest in inst.destinations() {
    let ms = match dest.merge_set() {
      Some(ms) => ms,
      None => internal_error!("dispatch_collect: destination {:?} has no merge set", dest),
    };
    let file = files.select(dest.flags());

    let fast_path_base = merge_set_preferred.get(&ms.id).copied().filter(|&base| {
      inst.sources().iter().all(|s| {
        s.merge_set().map_or(false, |sms| sms.id == ms.id) && {
          let id = live.get(&s.name()).copied();
          id.map_or(false, |id| {
            let (s_start, _) = arena.physreg_range(id);
            s_start == base + s.merge_set().unwrap().offset
          })
        }
      })
    });

    if let Some(base) = fast_path_base {
      let physreg = base + ms.offset;
      // Every source slice is already exactly where it needs to be:
      // detach each as a standalone top-level slot, then re-home them as
      // children of the newly inserted destination.
      let source_ids: Vec<IntervalId> =
        inst.sources().iter().map(|s| *live.get(&s.name()).unwrap()).collect();
      for &id in &source_ids {
        file.delete(arena, id);
      }
      let dest_id = arena.alloc(*dest);
      file.add(arena, dest_id, physreg);
      for &id in &source_ids {
        arena.node_mut(id).phys = None;
        arena.insert(dest_id, id);
      }
      live.insert(dest.name(), dest_id);
      continue;
    }

    // Slow path: temporarily kill every source in this merge set so their
    // space counts as free for the destination's own placement search,
    // then restore the ones that were never actually first-killed by this
    // instruction once we know where they need to end up.
    let mut temp_killed = Vec::new();
    for s in inst.sources() {
      if let Some(&id) = live.get(&s.name()) {
        if !is_first_kill(s.flags()) {
          file.mark_killed(arena, id);
          temp_killed.push(id);
        }
      }
    }

    let physreg = get_reg(file, arena, stage, merge_set_preferred, *dest, &[]);

    for &id in &temp_killed {
      let phys = arena.node(id).phys.unwrap();
      let mut restored = phys;
      restored.is_killed = false;
      arena.node_mut(id).phys = Some(restored);
      file.available.clear_range(restored.physreg_start, restored.size());
    }

    // Move every source that didn't land where the destination expects it.
    let mut running_offset = 0u16;
    for s in inst.sources() {
      let id = *live.get(&s.name()).unwrap();
      let (cur_start, _) = arena.physreg_range(id);
      let offset = s.merge_set().map_or(running_offset, |sms| sms.offset);
      let want = physreg + offset;
      if cur_start != want {
        ra_move_interval(stage, file, arena, id, want);
      }
      running_offset += s.size();
    }

    let source_ids: Vec<IntervalId> = inst.sources().iter().map(|s| *live.get(&s.name()).unwrap()).collect();
    for &id in &source_ids {
      file.delete(arena, id);
    }
    let dest_id = arena.alloc(*dest);
    file.add(arena, dest_id, physreg);
    for &id in &source_ids {
      arena.node_mut(id).phys = None;
      arena.insert(dest_id, id);
    }
    live.insert(dest.name(), dest_id);
  }

  let source_regs = read_and_kill_sources(files, arena, live, inst.sources());
  DispatchOutput { source_regs, copies: stage.drain() }
}

/// Phi and parallel-copy meta-instructions only read source placement -
/// they never allocate, since the destination was already placed by
/// `block::handle_live_in`/`insert_live_in_moves` (spec §4.6, §4.7).
fn dispatch_parallel_copy<I: Instruction>(
  files: &mut Files, arena: &mut IntervalArena<I::Value>, live: &mut LiveIntervals, inst: &I,
) -> DispatchOutput {
  let _ = files;
  let mut source_regs = Vec::with_capacity(inst.sources().len());
  for src in inst.sources() {
    let id = *live
      .get(&src.name())
      .unwrap_or_else(|| internal_error!("dispatch_parallel_copy: source {:?} has no live interval", src));
    source_regs.push((src.name(), arena.physreg_range(id).0));
  }
  DispatchOutput { source_regs, copies: Vec::new() }
}

/// Sources carry a fixed physreg (spec §4.6 "Chmask"): non-speculatively
/// evict whatever's in the way, install each source at its precolored
/// slot, then release the first-kill ones exactly as `Normal` does.
/// `is_killed` is never set here - Chmask sources are precolored inputs to
/// a mask write, not values whose storage becomes reusable mid-instruction.
fn dispatch_chmask<I: Instruction>(
  files: &mut Files, arena: &mut IntervalArena<I::Value>, stage: &mut PCopyStage, live: &mut LiveIntervals,
  inst: &I,
) -> DispatchOutput {
  for (value, physreg) in inst.precolored() {
    let file = files.select(value.flags());
    if !file.get_reg_specified(*physreg, value.size(), value.alignment(), false) {
      if try_evict_regs(file, arena, stage, *physreg, value.size(), false, false).is_none() {
        internal_error!("dispatch_chmask: could not clear precolored physreg {} for {:?}", physreg, value);
      }
    }
  }

  let source_regs = read_and_kill_sources(files, arena, live, inst.sources());
  DispatchOutput { source_regs, copies: stage.drain() }
}

/// Block-entry input, possibly precolored (spec §4.6 "Input"). Precolored
/// inputs are installed first and frozen so the ordinary block-body
/// placement pass can never evict them into each other; the freeze is
/// lifted once every input for the block has been placed (see
/// `block::handle_live_in`, which calls `thaw_inputs` after this returns).
fn dispatch_input<I: Instruction>(
  files: &mut Files, arena: &mut IntervalArena<I::Value>, live: &mut LiveIntervals, inst: &I,
) -> DispatchOutput {
  for (value, physreg) in inst.precolored() {
    let file = files.select(value.flags());
    if !file.get_reg_specified(*physreg, value.size(), value.alignment(), false) {
      internal_error!(
        "dispatch_input: precolored physreg {} for {:?} is not free at block entry",
        physreg, value
      );
    }
    let id = arena.alloc(*value);
    file.add(arena, id, *physreg);
    let mut phys = arena.node(id).phys.unwrap();
    phys.frozen = true;
    arena.node_mut(id).phys = Some(phys);
    live.insert(value.name(), id);
  }

  // Non-precolored inputs are placed by the block-entry reconciliation
  // pass (`block::handle_live_in`), not here.
  DispatchOutput::default()
}

/// Clear the `frozen` bit set by `dispatch_input` on every top-level
/// interval in `file`, once the block's input placement pass is done.
pub fn thaw_inputs(file: &mut crate::file::File, arena: &mut IntervalArena<impl SsaValue>) {
  let ids: Vec<IntervalId> = file.top_level.values().copied().collect();
  for id in ids {
    if let Some(mut phys) = arena.node(id).phys {
      phys.frozen = false;
      arena.node_mut(id).phys = Some(phys);
    }
  }
}
