//! Post-allocation invariant validator (spec §6 "Invariant validator", §8).
//! Re-walks the finished allocation and checks, independently of how it
//! was produced, that no two simultaneously-live values ever shared a
//! half-unit and that half/full values were never mixed under one cover.

use rustc_hash::FxHashMap;

use crate::context::{AllocResult, PhysAssignment};
use crate::ir::{Block, Program};
use crate::ssa::{Flags, Name};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
  /// Two values live at the same program point were assigned overlapping
  /// physreg ranges in the same file.
  Overlap { a: Name, b: Name, physreg: u16 },
  /// A value was never assigned a register at all.
  Unassigned { value: Name },
}

struct Occupant {
  name: Name,
  start: u16,
  end: u16,
}

/// Check every block's live set for overlapping assignments (spec §6
/// "Invariant validator"). `file_size` selects which of the three files'
/// width to bound the scan to per value (full/half/shared, matched the
/// same way `File::select` does).
pub fn check_no_overlap<P: Program>(program: &P, result: &AllocResult) -> Result<(), ValidationError> {
  for block in program.blocks() {
    let mut live: Vec<Name> = program.live_in(block.id()).iter().copied().collect();
    live.sort_unstable();

    for inst in program.instructions(block.id()) {
      for dest in inst.destinations() {
        live.push(dest.name());
      }
      check_no_overlap_at_point(program, result, &live)?;

      for src in inst.sources() {
        if src.flags().contains(Flags::FIRST_KILL) || src.flags().contains(Flags::KILL) {
          live.retain(|&n| n != src.name());
        }
      }
    }
  }
  Ok(())
}

fn check_no_overlap_at_point<P: Program>(
  program: &P, result: &AllocResult, live: &[Name],
) -> Result<(), ValidationError> {
  // Bucketed by `(shared, half)`: `shared` is always its own file, and
  // outside `merged_regs` mode `full`/`half` are two independent files
  // too, so a half-value and a full-value can legitimately sit at the
  // same physreg index without overlapping. In `merged_regs` mode they
  // really do share one backing file (spec §3 "Half-file rule"), so
  // there `half` collapses into the `full` bucket instead of getting its
  // own - matching `Files::select`.
  let merged = program.merged_regs();
  let mut by_file: FxHashMap<(bool, bool), Vec<Occupant>> = FxHashMap::default();

  for &name in live {
    let value = program.definition(name);
    let assignment = result
      .assignments
      .get(&name)
      .ok_or(ValidationError::Unassigned { value: name })?;
    let (start, end) = match *assignment {
      PhysAssignment::Num(n) => (n, n + value.size()),
      PhysAssignment::Array { base, offset } => (base + offset, base + offset + value.size()),
    };
    let shared = value.flags().contains(Flags::SHARED);
    let half = !shared && value.flags().contains(Flags::HALF) && !merged;
    by_file.entry((shared, half)).or_default().push(Occupant { name, start, end });
  }

  for occupants in by_file.values() {
    for i in 0..occupants.len() {
      for j in (i + 1)..occupants.len() {
        let a = &occupants[i];
        let b = &occupants[j];
        if a.start < b.end && b.start < a.end {
          return Err(ValidationError::Overlap { a: a.name, b: b.name, physreg: a.start.max(b.start) });
        }
      }
    }
  }
  Ok(())
}
