//! Compression (spec §4.4): the allocator's last resort. Re-packs
//! top-level intervals so that half-values sit in the low half of the
//! file and a contiguous gap opens up for the destination.
//!
//! Interpretation note (see DESIGN.md "Open Questions" for the full
//! writeup): the popped ("below the cut") intervals are repacked
//! contiguously starting at physreg 0; the kept ("above the cut")
//! intervals are left untouched at their existing, unchanged physregs.
//! The cut is chosen as high as possible (fewest intervals moved) subject
//! to `sum(sizes below cut) + requested size <= cut`.

use crate::error::internal_error;
use crate::file::File;
use crate::interval::{IntervalArena, IntervalId};
use crate::pcopy::{ra_pop_interval, ra_push_interval, PCopyStage};
use crate::ssa::SsaValue;

pub fn compress_regs_left<V: SsaValue>(
  file: &mut File, arena: &mut IntervalArena<V>, stage: &mut PCopyStage, size: u16, align: u16,
) -> u16 {
  log::debug!("compress_regs_left: last resort, opening a size-{} gap (align {})", size, align);
  let mut tops: Vec<IntervalId> = file.top_level.values().copied().collect();
  tops.sort_by_key(|&id| arena.physreg_range(id).0);

  let sizes: Vec<u16> = tops.iter().map(|&id| {
    let (s, e) = arena.physreg_range(id);
    e - s
  }).collect();

  // Find the highest valid cut: scan candidate cuts (each interval's own
  // start) from highest to lowest, stopping at the first that leaves
  // room once everything strictly below it is compacted.
  let mut cut = file.size;
  let mut move_count = tops.len();
  for i in (0..tops.len()).rev() {
    let candidate = arena.physreg_range(tops[i]).0;
    let below_sum: u16 = sizes[..i].iter().sum();
    if below_sum + size <= candidate {
      cut = candidate;
      move_count = i;
      break;
    }
    if i == 0 {
      // Moving everything (cut = 0) is the only remaining option.
      cut = 0;
      move_count = 0;
    }
  }
  let _ = cut; // only bounded the search; repacking itself starts at 0.
  let to_move = &tops[..move_count];

  // Bucket by the sort rule: half before full; within half, live-through
  // before killed; within full, killed before live-through.
  let mut half_live = Vec::new();
  let mut half_killed = Vec::new();
  let mut full_killed = Vec::new();
  let mut full_live = Vec::new();
  for &id in to_move {
    let killed = arena.node(id).phys.unwrap().is_killed;
    if arena.is_half(id) {
      if killed { half_killed.push(id) } else { half_live.push(id) }
    } else {
      if killed { full_killed.push(id) } else { full_live.push(id) }
    }
  }

  let bucket_size = |ids: &[IntervalId]| -> u16 {
    ids.iter().map(|&id| { let (s, e) = arena.physreg_range(id); e - s }).sum()
  };
  let hl_size = bucket_size(&half_live);
  let hk_size = bucket_size(&half_killed);
  let fk_size = bucket_size(&full_killed);
  let fl_size = bucket_size(&full_live);

  let dest_pos: u16;
  let half_killed_pos: u16;
  let full_region_start: u16;

  if align <= 1 {
    // Destination is a half-value: slots in right after the live-through
    // halves, ahead of the killed halves it may overlap/displace.
    dest_pos = hl_size;
    half_killed_pos = dest_pos + size;
    full_region_start = crate::bitset::round_up(half_killed_pos + hk_size, 2);
  } else {
    // Destination is a full-value: goes at the start of the full region,
    // ahead of the existing full intervals. The half region is unaffected
    // by it, so the killed halves simply follow the live ones.
    half_killed_pos = hl_size;
    let halves_end = hl_size + hk_size;
    dest_pos = crate::bitset::round_up(halves_end, 2);
    full_region_start = dest_pos + size;
  }

  if full_region_start + fk_size + fl_size > file.size {
    internal_error!(
      "compress_regs_left: no room for a size-{} destination even after compaction - pressure estimate was wrong",
      size
    );
  }
  if let Some(bound) = file.half_bound {
    let half_region_end = if align <= 1 { half_killed_pos + hk_size } else { hl_size + hk_size };
    if half_region_end > bound {
      internal_error!(
        "compress_regs_left: repacked half region extends to {} past the half-file bound {}",
        half_region_end, bound
      );
    }
  }

  // Pop everything that's moving up front, before pushing any of it back,
  // so overlapping ranges during the shuffle never collide.
  for &id in to_move {
    ra_pop_interval(stage, file, arena, id);
  }

  let mut pos = 0u16;
  for &id in &half_live {
    let sz = {
      let (s, e) = arena.physreg_range(id);
      let _ = s;
      e - s
    };
    ra_push_interval(file, arena, id, pos);
    pos += sz;
  }
  debug_assert_eq!(pos, hl_size);

  pos = half_killed_pos;
  for &id in &half_killed {
    let sz = {
      let (s, e) = arena.physreg_range(id);
      e - s
    };
    ra_push_interval(file, arena, id, pos);
    pos += sz;
  }

  pos = full_region_start;
  for &id in &full_killed {
    let sz = {
      let (s, e) = arena.physreg_range(id);
      e - s
    };
    ra_push_interval(file, arena, id, pos);
    pos += sz;
  }
  for &id in &full_live {
    let sz = {
      let (s, e) = arena.physreg_range(id);
      e - s
    };
    ra_push_interval(file, arena, id, pos);
    pos += sz;
  }

  log::debug!("compress_regs_left: repacked {} intervals, gap opened at physreg {}", to_move.len(), dest_pos);
  dest_pos
}
