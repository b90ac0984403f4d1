//! `File`: a register file of fixed size, the physreg-ordered tree of
//! top-level intervals it holds, and the two bitsets that track
//! occupancy (spec §3, §4.2).

use std::collections::BTreeMap;

use crate::bitset::{round_up, FixedBitSet};
use crate::error::internal_error;
use crate::interval::{IntervalArena, IntervalId, PhysInterval};
use crate::ssa::{Flags, SsaValue};

/// A practical ceiling on a single file's half-unit width (spec §6
/// "Constants"). Not enforced as a hard limit by `File` itself - callers
/// that hand `FileSizes` larger than this get a file that still works, it
/// just exceeds what any target this allocator ships for actually needs.
pub const MAX_FILE_SIZE: u16 = 1024;

/// The three file sizes a caller configures `allocate()` with (spec §6
/// "Constants": `FULL_SIZE`/`HALF_SIZE`/`SHARED_SIZE`), generalized from
/// compile-time constants to a plain struct so a caller can target
/// different hardware without a rebuild.
#[derive(Debug, Clone, Copy)]
pub struct FileSizes {
  pub full: u16,
  pub half: u16,
  pub shared: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
  Full,
  Half,
  Shared,
}

pub struct File {
  pub kind: FileKind,
  pub size: u16,
  /// Clear at half-unit `i` iff some non-killed top-level interval covers
  /// it (spec §3 File invariant).
  pub available: FixedBitSet,
  /// Clear at half-unit `i` iff *any* top-level interval (killed or not)
  /// covers it.
  pub available_to_evict: FixedBitSet,
  /// Top-level intervals, keyed by `physreg_start` (spec §3 "physreg
  /// tree"). A `BTreeMap` gives the O(log n) ordered lookup/insert spec
  /// §5 requires, grounded on the `BTreeMap`-based interval table in
  /// `splax-s-splax_os/runtime/wave/src/jit/regalloc.rs`.
  pub top_level: BTreeMap<u16, IntervalId>,
  /// Rotating cursor for the round-robin allocator (spec §4.2).
  pub start: u16,
  /// Set only when this `File` is the shared backing store for a merged
  /// half/full register file (spec §3 "Half-file rule", `merged_regs`):
  /// half-flagged requests are confined to `[0, half_bound)`, full-flagged
  /// ones may use the whole file. `None` in the ordinary separate-files
  /// mode, where a `File` only ever serves one `FileKind`.
  pub half_bound: Option<u16>,
}

impl File {
  pub fn new(kind: FileKind, size: u16) -> Self {
    File {
      kind,
      size,
      available: FixedBitSet::new_all_set(size),
      available_to_evict: FixedBitSet::new_all_set(size),
      top_level: BTreeMap::new(),
      start: 0,
      half_bound: None,
    }
  }

  /// The half-unit bound half-flagged (`align <= 1`) requests are confined
  /// to in this file; the whole file for a full-flagged request, or when
  /// this file isn't a merged half/full backing store.
  pub(crate) fn scan_limit(&self, align: u16) -> u16 {
    if align <= 1 {
      self.half_bound.unwrap_or(self.size)
    } else {
      self.size
    }
  }

  /// Precise overlap query, using the arena to get each candidate's real
  /// `[physreg_start, physreg_end)`.
  pub fn overlapping_precise<V: SsaValue>(
    &self, arena: &IntervalArena<V>, start: u16, len: u16,
  ) -> Vec<IntervalId> {
    let end = start + len;
    self
      .top_level
      .values()
      .copied()
      .filter(|&id| {
        let (s, e) = arena.physreg_range(id);
        s < end && start < e
      })
      .collect()
  }

  /// Install `id` as a top-level interval at `physreg_start` (spec §4.2
  /// "On add a file clears available and available_to_evict").
  pub fn add<V: SsaValue>(&mut self, arena: &mut IntervalArena<V>, id: IntervalId, physreg_start: u16) {
    let size = arena.value(id).size();
    let physreg_end = physreg_start + size;
    arena.node_mut(id).phys = Some(PhysInterval {
      physreg_start,
      physreg_end,
      is_killed: false,
      frozen: false,
    });
    self.available.clear_range(physreg_start, size);
    self.available_to_evict.clear_range(physreg_start, size);
    self.top_level.insert(physreg_start, id);
  }

  /// Remove `id` from the top level (spec §4.2 "on delete sets both").
  /// Leaves `arena.node(id).phys` in place (still readable by the caller,
  /// e.g. `ra_pop_interval`) - callers that truly end the interval's
  /// lifetime clear it themselves.
  pub fn delete<V: SsaValue>(&mut self, arena: &IntervalArena<V>, id: IntervalId) {
    let phys = arena
      .node(id)
      .phys
      .unwrap_or_else(|| internal_error!("File::delete: interval has no PhysInterval"));
    self.available.set_range(phys.physreg_start, phys.size());
    self.available_to_evict.set_range(phys.physreg_start, phys.size());
    self.top_level.remove(&phys.physreg_start);
  }

  /// Mark `id` killed: its space is free for *new destinations* but not
  /// for relocating other sources during eviction (spec §4.2).
  pub fn mark_killed<V: SsaValue>(&mut self, arena: &mut IntervalArena<V>, id: IntervalId) {
    let phys = arena
      .node_mut(id)
      .phys
      .as_mut()
      .unwrap_or_else(|| internal_error!("mark_killed: interval has no PhysInterval"));
    phys.is_killed = true;
    let (start, size) = (phys.physreg_start, phys.size());
    self.available.set_range(start, size);
  }

  fn bits_for(&self, is_source: bool) -> &FixedBitSet {
    if is_source { &self.available_to_evict } else { &self.available }
  }

  /// Round-robin scan for a `size`-run of free half-units, `align`-stepped,
  /// starting at the rotating cursor and wrapping once (spec §4.2).
  /// Advances `self.start` past the chosen run on success. Never mutates
  /// `self.start` when called speculatively by the caller simply by virtue
  /// of not being called at all in that path (see `try_evict_regs`).
  pub fn find_best_gap(&mut self, size: u16, align: u16, is_source: bool) -> Option<u16> {
    let limit = self.scan_limit(align);
    if size == 0 || size > limit {
      return None;
    }
    let modulus = limit - size + align;
    let search_start = round_up(self.start, align) % modulus.max(1);

    let bits = self.bits_for(is_source).clone();
    if let Some(pos) = bits.first_run_from(search_start, size, align.max(1), limit) {
      self.start = pos + size;
      return Some(pos);
    }
    // Wrap once: scan from the beginning up to search_start.
    let mut pos = 0u16;
    while pos + size <= search_start {
      if bits.is_range_set(pos, size) {
        self.start = pos + size;
        return Some(pos);
      }
      pos += align.max(1);
    }
    None
  }

  /// All half-units in `[physreg, physreg+size)` must be available under
  /// the appropriate bitset (spec §4.2), and a half-flagged (`align <= 1`)
  /// request must additionally stay under this file's half-bound, if any.
  pub fn get_reg_specified(&self, physreg: u16, size: u16, align: u16, is_source: bool) -> bool {
    if physreg + size > self.scan_limit(align) {
      return false;
    }
    self.bits_for(is_source).is_range_set(physreg, size)
  }
}

/// The allocator's three register files (spec §2, §3): `full`, `half` and
/// `shared`. Which one a value lives in follows its flags alone, except in
/// `merged_regs` mode (spec §6 `Program::merged_regs`), where half and full
/// values share one physical backing file (spec §3 "Half-file rule"): a
/// half-flagged value is confined to `[0, sizes.half)` of `full`, a
/// full-flagged one may use the whole thing, and `half` itself sits unused.
pub struct Files {
  pub full: File,
  pub half: File,
  pub shared: File,
  pub merged_regs: bool,
}

impl Files {
  pub fn new(sizes: FileSizes, merged_regs: bool) -> Self {
    let mut full = File::new(FileKind::Full, sizes.full);
    if merged_regs {
      full.half_bound = Some(sizes.half.min(sizes.full));
    }
    Files {
      full,
      half: File::new(FileKind::Half, sizes.half),
      shared: File::new(FileKind::Shared, sizes.shared),
      merged_regs,
    }
  }

  pub fn select(&mut self, flags: Flags) -> &mut File {
    if flags.contains(Flags::SHARED) {
      &mut self.shared
    } else if flags.contains(Flags::HALF) {
      if self.merged_regs {
        return &mut self.full;
      }
      &mut self.half
    } else {
      &mut self.full
    }
  }

  pub fn select_ref(&self, flags: Flags) -> &File {
    if flags.contains(Flags::SHARED) {
      &self.shared
    } else if flags.contains(Flags::HALF) {
      if self.merged_regs {
        &self.full
      } else {
        &self.half
      }
    } else {
      &self.full
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ssa::{Flags, MergeSetRef};

  #[derive(Debug, Clone, Copy, PartialEq, Eq)]
  struct V {
    name: u32,
    size: u16,
    start: u32,
    end: u32,
  }
  impl SsaValue for V {
    fn name(&self) -> u32 {
      self.name
    }
    fn flags(&self) -> Flags {
      Flags::empty()
    }
    fn size(&self) -> u16 {
      self.size
    }
    fn alignment(&self) -> u16 {
      2
    }
    fn interval_start(&self) -> u32 {
      self.start
    }
    fn interval_end(&self) -> u32 {
      self.end
    }
    fn merge_set(&self) -> Option<MergeSetRef> {
      None
    }
  }

  #[test]
  fn round_robin_fairness_two_calls_are_ascending_and_disjoint() {
    let mut arena = IntervalArena::<V>::new();
    let mut file = File::new(FileKind::Full, 256);

    let first = file.find_best_gap(2, 2, false).unwrap();
    let id1 = arena.alloc(V { name: 0, size: 2, start: 0, end: 1 });
    file.add(&mut arena, id1, first);

    let second = file.find_best_gap(2, 2, false).unwrap();
    assert!(second > first);
    assert!(second >= first + 2);
  }

  #[test]
  fn add_then_delete_restores_availability() {
    let mut arena = IntervalArena::<V>::new();
    let mut file = File::new(FileKind::Full, 16);
    let id = arena.alloc(V { name: 0, size: 4, start: 0, end: 1 });
    file.add(&mut arena, id, 4);
    assert!(!file.get_reg_specified(4, 4, 2, false));
    file.delete(&arena, id);
    assert!(file.get_reg_specified(4, 4, 2, false));
  }
}
