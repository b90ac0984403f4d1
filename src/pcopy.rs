//! Parallel-copy staging (spec §4.5): `ra_pop_interval`/`ra_push_interval`/
//! `ra_move_interval` move a top-level interval's physical slot without
//! disturbing its containment subtree (children ride along for free,
//! since their physreg is always derived relative to the parent).

use crate::error::internal_error;
use crate::file::File;
use crate::interval::IntervalArena;
use crate::interval::IntervalId;
use crate::ssa::{Name, SsaValue};

/// One pending parallel-copy leg: move `interval` from `src_physreg` to
/// wherever it currently sits in its file.
#[derive(Debug, Clone, Copy)]
pub struct PCopyEntry {
  pub interval: IntervalId,
  pub value: Name,
  pub src_physreg: u16,
}

/// The context's staging area for parallel-copy entries (spec §4.5).
#[derive(Default)]
pub struct PCopyStage {
  pending: Vec<PCopyEntry>,
}

impl PCopyStage {
  pub fn is_empty(&self) -> bool {
    self.pending.is_empty()
  }

  pub fn drain(&mut self) -> Vec<PCopyEntry> {
    std::mem::take(&mut self.pending)
  }

  fn contains(&self, id: IntervalId) -> bool {
    self.pending.iter().any(|e| e.interval == id)
  }
}

/// Record `(interval, src=physreg_start)` (deduped by interval) and detach
/// the interval from its file.
pub fn ra_pop_interval<V: SsaValue>(
  stage: &mut PCopyStage, file: &mut File, arena: &mut IntervalArena<V>, id: IntervalId,
) {
  if !stage.contains(id) {
    let phys = arena
      .node(id)
      .phys
      .unwrap_or_else(|| internal_error!("ra_pop_interval: interval has no PhysInterval"));
    stage.pending.push(PCopyEntry { interval: id, value: arena.value(id).name(), src_physreg: phys.physreg_start });
  }
  file.delete(arena, id);
}

/// Re-attach `id` at `new_physreg`, without changing the staged `src`.
pub fn ra_push_interval<V: SsaValue>(
  file: &mut File, arena: &mut IntervalArena<V>, id: IntervalId, new_physreg: u16,
) {
  file.add(arena, id, new_physreg);
}

/// Pop then push: move a top-level interval to a new physreg.
pub fn ra_move_interval<V: SsaValue>(
  stage: &mut PCopyStage, file: &mut File, arena: &mut IntervalArena<V>, id: IntervalId, new_physreg: u16,
) {
  ra_pop_interval(stage, file, arena, id);
  ra_push_interval(file, arena, id, new_physreg);
}
