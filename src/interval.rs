//! The interval tree (spec §3, §4.1): nested `RegInterval`s that track the
//! split/collect containment hierarchy, plus `PhysInterval`, the record
//! the allocator attaches to every top-level interval.
//!
//! Ownership is arena-based (a `Vec<RegIntervalNode<V>>` addressed by the
//! `IntervalId` newtype index), mirroring the teacher's `TypedIxVec<TyIx,
//! Ty>` pattern in `regalloc.rs/lib/src/data_structures.rs` - this avoids
//! the `Rc`/`RefCell` cycle that a naive parent/children encoding would
//! need (spec §9 "Cyclic ownership").

use std::collections::BTreeMap;

use crate::error::internal_error;
use crate::ssa::{Flags, SsaValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IntervalId(u32);

/// The allocator's own record, attached only to top-level intervals
/// (spec §3 "PhysInterval").
#[derive(Debug, Clone, Copy)]
pub struct PhysInterval {
  pub physreg_start: u16,
  pub physreg_end: u16,
  pub is_killed: bool,
  pub frozen: bool,
}

impl PhysInterval {
  pub fn size(&self) -> u16 {
    self.physreg_end - self.physreg_start
  }
}

pub struct RegIntervalNode<V> {
  pub value: V,
  pub parent: Option<IntervalId>,
  /// Children, ordered by the value's `interval_start` (spec §4.1).
  pub children: BTreeMap<u32, IntervalId>,
  pub inserted: bool,
  /// `Some` exactly when this node is top-level (spec invariant 4).
  pub phys: Option<PhysInterval>,
}

pub struct IntervalArena<V> {
  nodes: Vec<RegIntervalNode<V>>,
}

impl<V: SsaValue> IntervalArena<V> {
  pub fn new() -> Self {
    IntervalArena { nodes: Vec::new() }
  }

  pub fn alloc(&mut self, value: V) -> IntervalId {
    let id = IntervalId(self.nodes.len() as u32);
    self.nodes.push(RegIntervalNode {
      value,
      parent: None,
      children: BTreeMap::new(),
      inserted: false,
      phys: None,
    });
    id
  }

  pub fn node(&self, id: IntervalId) -> &RegIntervalNode<V> {
    &self.nodes[id.0 as usize]
  }

  pub fn node_mut(&mut self, id: IntervalId) -> &mut RegIntervalNode<V> {
    &mut self.nodes[id.0 as usize]
  }

  pub fn value(&self, id: IntervalId) -> V {
    self.node(id).value
  }

  pub fn start(&self, id: IntervalId) -> u32 {
    self.node(id).value.interval_start()
  }

  pub fn end(&self, id: IntervalId) -> u32 {
    self.node(id).value.interval_end()
  }

  pub fn is_half(&self, id: IntervalId) -> bool {
    self.node(id).value.flags().contains(Flags::HALF)
  }

  pub fn is_top_level(&self, id: IntervalId) -> bool {
    self.node(id).parent.is_none()
  }

  /// The physreg range a (possibly nested) interval occupies, derived per
  /// spec invariant 4: `parent.physreg_start + (child.interval_start -
  /// parent.interval_start)`.
  pub fn physreg_range(&self, id: IntervalId) -> (u16, u16) {
    match self.node(id).parent {
      None => {
        let phys = self.node(id).phys.unwrap_or_else(|| {
          internal_error!("physreg_range: top-level interval has no PhysInterval")
        });
        (phys.physreg_start, phys.physreg_end)
      }
      Some(parent) => {
        let (parent_start, _) = self.physreg_range(parent);
        let delta = (self.start(id) - self.start(parent)) as u16;
        let size = self.value(id).size();
        (parent_start + delta, parent_start + delta + size)
      }
    }
  }

  fn contains_range(outer_s: u32, outer_e: u32, inner_s: u32, inner_e: u32) -> bool {
    outer_s <= inner_s && inner_e <= outer_e && (outer_s, outer_e) != (inner_s, inner_e)
  }

  fn overlaps_range(a_s: u32, a_e: u32, b_s: u32, b_e: u32) -> bool {
    a_s < b_e && b_s < a_e
  }

  fn assert_half_matches(&self, a: IntervalId, b: IntervalId) {
    if self.is_half(a) != self.is_half(b) {
      internal_error!(
        "interval insert: HALF-flag mismatch between {:?} and {:?}",
        self.value(a),
        self.value(b)
      );
    }
  }

  /// Insert `new` into the containment tree rooted at `root` (spec §4.1).
  /// `root` is the top-level interval whose children subtree `new` is
  /// being placed into; `root` itself is never replaced by this call.
  pub fn insert(&mut self, root: IntervalId, new: IntervalId) {
    let new_s = self.start(new);
    let new_e = self.end(new);

    let existing = self
      .node(root)
      .children
      .range(..)
      .map(|(_, &cid)| cid)
      .find(|&cid| Self::overlaps_range(self.start(cid), self.end(cid), new_s, new_e));

    match existing {
      None => self.attach_child(root, new),
      Some(existing_id) => {
        self.assert_half_matches(existing_id, new);
        let es = self.start(existing_id);
        let ee = self.end(existing_id);
        if Self::contains_range(es, ee, new_s, new_e) {
          // existing_id strictly contains new: recurse into its children.
          self.insert(existing_id, new);
        } else if Self::contains_range(new_s, new_e, es, ee) {
          // new strictly contains existing_id (and possibly siblings):
          // reparent every overlapping child of root under new.
          let overlapping: Vec<IntervalId> = self
            .node(root)
            .children
            .range(..)
            .map(|(_, &cid)| cid)
            .filter(|&cid| Self::overlaps_range(self.start(cid), self.end(cid), new_s, new_e))
            .collect();
          for cid in overlapping {
            self.assert_half_matches(cid, new);
            self.node_mut(root).children.remove(&self.start(cid));
            self.attach_child(new, cid);
          }
          self.attach_child(root, new);
        } else {
          internal_error!(
            "interval insert: partial overlap between {:?} and {:?} - caller bug",
            self.value(existing_id),
            self.value(new)
          );
        }
      }
    }
  }

  fn attach_child(&mut self, parent: IntervalId, child: IntervalId) {
    self.node_mut(child).parent = Some(parent);
    self.node_mut(child).inserted = true;
    let start = self.start(child);
    self.node_mut(parent).children.insert(start, child);
  }

  /// Detach `id`; each child is lifted one level (spec §4.1 "Remove").
  /// For a top-level `id` this requires the caller to have already fired
  /// the file's `delete` callback (see `File::delete`) - the lifted
  /// children become new top-level intervals and must be `readd`-ed by
  /// the caller with a freshly computed `PhysInterval`.
  pub fn remove(&mut self, id: IntervalId) -> Vec<IntervalId> {
    let parent = self.node(id).parent;
    let children: Vec<IntervalId> = self.node(id).children.values().copied().collect();

    if let Some(p) = parent {
      let start = self.start(id);
      self.node_mut(p).children.remove(&start);
    }
    self.node_mut(id).parent = None;
    self.node_mut(id).inserted = false;
    self.node_mut(id).children.clear();

    let mut promoted = Vec::new();
    for c in children {
      match parent {
        Some(p) => self.attach_child(p, c),
        None => {
          // Lifted to top-level. physreg is recomputed by the caller
          // (it needs File access) before firing `readd`.
          self.node_mut(c).parent = None;
          self.node_mut(c).inserted = true;
          promoted.push(c);
        }
      }
    }
    promoted
  }

  /// Detach `id` and every descendant in one shot (spec §4.1
  /// "RemoveAll"), firing a single eviction instead of per-child lifts.
  /// `id` must be top-level.
  pub fn remove_all(&mut self, id: IntervalId) {
    if !self.is_top_level(id) {
      internal_error!("remove_all called on a non-top-level interval");
    }
    let mut stack = vec![id];
    while let Some(cur) = stack.pop() {
      self.node_mut(cur).inserted = false;
      let kids: Vec<IntervalId> = self.node(cur).children.values().copied().collect();
      self.node_mut(cur).children.clear();
      for k in kids {
        self.node_mut(k).parent = None;
        stack.push(k);
      }
    }
    self.node_mut(id).phys = None;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ssa::MergeSetRef;

  #[derive(Debug, Clone, Copy, PartialEq, Eq)]
  struct V {
    name: u32,
    flags: Flags,
    size: u16,
    start: u32,
    end: u32,
  }
  impl SsaValue for V {
    fn name(&self) -> u32 {
      self.name
    }
    fn flags(&self) -> Flags {
      self.flags
    }
    fn size(&self) -> u16 {
      self.size
    }
    fn alignment(&self) -> u16 {
      if self.flags.contains(Flags::HALF) { 1 } else { 2 }
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

  fn full(name: u32, size: u16, start: u32, end: u32) -> V {
    V { name, flags: Flags::empty(), size, start, end }
  }

  #[test]
  fn insert_splits_reparent_under_new_vector() {
    let mut arena = IntervalArena::new();
    let root_val = full(0, 4, 0, 40);
    let root = arena.alloc(root_val);
    arena.node_mut(root).phys = Some(PhysInterval {
      physreg_start: 8,
      physreg_end: 12,
      is_killed: false,
      frozen: false,
    });

    let child_a = arena.alloc(full(1, 1, 0, 10));
    arena.insert(root, child_a);
    let child_b = arena.alloc(full(2, 1, 10, 20));
    arena.insert(root, child_b);

    assert_eq!(arena.node(child_a).parent, Some(root));
    assert_eq!(arena.node(child_b).parent, Some(root));
    assert_eq!(arena.physreg_range(child_a), (8, 9));
    assert_eq!(arena.physreg_range(child_b), (9, 10));
  }

  #[test]
  fn remove_lifts_children_one_level() {
    let mut arena = IntervalArena::new();
    let root = arena.alloc(full(0, 4, 0, 40));
    arena.node_mut(root).phys = Some(PhysInterval {
      physreg_start: 0,
      physreg_end: 4,
      is_killed: false,
      frozen: false,
    });
    let mid = arena.alloc(full(1, 2, 0, 20));
    arena.insert(root, mid);
    let leaf = arena.alloc(full(2, 1, 0, 10));
    arena.insert(root, leaf);

    assert_eq!(arena.node(leaf).parent, Some(mid));
    let promoted = arena.remove(mid);
    assert!(promoted.is_empty());
    assert_eq!(arena.node(leaf).parent, Some(root));
  }
}
