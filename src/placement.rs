//! The placement policy (spec §4.3): `get_reg` chooses a physreg for a
//! destination, falling through merge-set preference, whole-merge-set
//! gap, source reuse, round-robin, eviction, and finally compression.

use rustc_hash::FxHashMap;

use crate::bitset::round_up;
use crate::compress::compress_regs_left;
use crate::error::internal_error;
use crate::file::File;
use crate::interval::{IntervalArena, IntervalId};
use crate::pcopy::{ra_move_interval, PCopyStage};
use crate::ssa::{MergeSetId, SsaValue};

/// Choose a physreg for `dest` in `file`. `candidate_sources` lists the
/// top-level intervals of this instruction's ALU/SFU sources already
/// resident in `file` (empty for non-ALU/SFU instructions), enabling the
/// source-reuse rule (spec §4.3.3).
pub fn get_reg<V: SsaValue>(
  file: &mut File, arena: &mut IntervalArena<V>, stage: &mut PCopyStage,
  merge_set_preferred: &mut FxHashMap<MergeSetId, u16>, dest: V, candidate_sources: &[IntervalId],
) -> u16 {
  let size = dest.size();
  let align = dest.alignment();

  // 1. Merge-set preference. An externally precolored `preferred_reg`
  // (spec §3, §8) takes priority over a base this same run already chose
  // for the set in step 2 below; either way, a hit here is cached into
  // `merge_set_preferred` so later members of the set agree on it too.
  if let Some(ms) = dest.merge_set() {
    let preferred = ms.preferred_reg.or_else(|| merge_set_preferred.get(&ms.id).copied());
    if let Some(preferred) = preferred {
      let physreg = preferred + ms.offset;
      if physreg % align.max(1) == 0 && file.get_reg_specified(physreg, size, align, false) {
        merge_set_preferred.entry(ms.id).or_insert(preferred);
        log::trace!("get_reg: merge-set {} preference hit at physreg {}", ms.id, physreg);
        return physreg;
      }
    }
  }

  // 2. Whole-merge-set gap: only when `dest` is a strict sub-range of a
  // merge set that has not yet chosen a preferred reg.
  if let Some(ms) = dest.merge_set() {
    if !merge_set_preferred.contains_key(&ms.id) && ms.size > size {
      if let Some(base) = file.find_best_gap(ms.size, ms.alignment, false) {
        merge_set_preferred.insert(ms.id, base);
        return base + ms.offset;
      }
    }
  }

  // 3. Source reuse (ALU/SFU only - caller passes an empty slice
  // otherwise).
  for &src in candidate_sources {
    let (s, e) = arena.physreg_range(src);
    let src_size = e - s;
    if src_size >= size && s % align.max(1) == 0 && file.get_reg_specified(s, size, align, false) {
      return s;
    }
  }

  // 4. Plain round-robin.
  if let Some(physreg) = file.find_best_gap(size, align, false) {
    return physreg;
  }

  // 5. Evict.
  if let Some(physreg) = try_evict_best(file, arena, stage, size, align) {
    return physreg;
  }

  // 6. Compress (last resort).
  compress_regs_left(file, arena, stage, size, align)
}

/// Walk every interval overlapping `[physreg, physreg+size)`. Killed
/// intervals may be ignored when `!is_source`. Frozen intervals abort.
/// For each conflict, search a local copy of `available_to_evict` (with
/// the destination's own range masked out) for a same-size, same-align
/// gap; record the move and reserve the gap. Returns the half-units
/// moved on success. Never mutates `file`/the pending-copy list when
/// `speculative` (spec §4.3 "Speculation contract").
pub fn try_evict_regs<V: SsaValue>(
  file: &mut File, arena: &mut IntervalArena<V>, stage: &mut PCopyStage, physreg: u16, size: u16,
  is_source: bool, speculative: bool,
) -> Option<u16> {
  let conflicts = file.overlapping_precise(arena, physreg, size);

  let mut local_avail = file.available_to_evict.clone();
  local_avail.clear_range(physreg, size);

  struct PlannedMove {
    id: IntervalId,
    new_start: u16,
  }
  let mut moves = Vec::new();
  let mut total_moved = 0u16;

  for cid in conflicts {
    let phys = arena
      .node(cid)
      .phys
      .unwrap_or_else(|| internal_error!("try_evict_regs: overlapping interval has no PhysInterval"));
    if phys.is_killed && !is_source {
      continue;
    }
    if phys.frozen {
      return None;
    }
    let csize = phys.size();
    let calign = if arena.is_half(cid) { 1 } else { 2 };
    match local_avail.first_run_from(0, csize, calign, file.scan_limit(calign)) {
      None => return None,
      Some(new_start) => {
        local_avail.clear_range(new_start, csize);
        total_moved += csize;
        moves.push(PlannedMove { id: cid, new_start });
      }
    }
  }

  if !speculative {
    for mv in &moves {
      ra_move_interval(stage, file, arena, mv.id, mv.new_start);
    }
  }
  Some(total_moved)
}

fn try_evict_best<V: SsaValue>(
  file: &mut File, arena: &mut IntervalArena<V>, stage: &mut PCopyStage, size: u16, align: u16,
) -> Option<u16> {
  let align = align.max(1);
  let limit = file.scan_limit(align);
  let mut best: Option<(u16, u16)> = None;
  let mut physreg = round_up(0, align);
  while physreg + size <= limit {
    if let Some(moved) = try_evict_regs(file, arena, stage, physreg, size, false, true) {
      if best.map_or(true, |(_, best_moved)| moved < best_moved) {
        best = Some((physreg, moved));
      }
    }
    physreg += align;
  }

  let (physreg, moved) = best?;
  match try_evict_regs(file, arena, stage, physreg, size, false, false) {
    Some(_) => {
      log::debug!("get_reg: evicting {} half-units to place a size-{} destination at physreg {}", moved, size, physreg);
      Some(physreg)
    }
    None => internal_error!(
      "try_evict_regs: speculative eviction succeeded at physreg {} but the non-speculative commit failed",
      physreg
    ),
  }
}
