//! The refcounted heap arena and the hybrid garbage collector.
//!
//! Every heap value carries a reference count; assignment sites deref the
//! old value and incref the new one, and a count hitting zero tears the
//! value down recursively. Containers whose signature admits cycles are
//! *tagged* at allocation and also tracked by a mark/sweep pass: when the
//! live tagged count crosses the configured threshold, the VM hands the
//! collector its roots, reachable values are stamped with the current pass
//! number, and any tagged value left with a stale pass is destroyed.
//!
//! Cycle teardown runs in two phases so it terminates: every dying value is
//! first stamped with a sentinel pass, then children are released with the
//! refcount path (skipping co-dying members), then the shells are freed.
//!
//! Slots are recycled through a free list, keeping memory flat for loops
//! that allocate and release values repeatedly.

use std::cell::Cell;

use crate::value::{HeapData, Value};

/// Pass number stamped on values mid-teardown so recursive release skips
/// other members of the same dying cycle.
const PASS_SENTINEL: i32 = -1;

/// Index into the heap arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapId(u32);

impl HeapId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug)]
struct HeapValue {
    /// Interior mutability lets read paths bump the count without a mutable
    /// heap borrow. One interpreter state is single-threaded by contract.
    refcount: Cell<u32>,
    data: Option<HeapData>,
    /// In the GC entry set: the value's type admits reference cycles.
    tagged: bool,
    /// Pass number of the last collection that reached this value.
    last_pass: Cell<i32>,
}

/// Snapshot of heap counters, exposed for embedders and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcStats {
    pub live_objects: usize,
    pub tagged_objects: usize,
    pub pass: i32,
    pub threshold: u32,
}

#[derive(Debug)]
pub(crate) struct Heap {
    entries: Vec<Option<HeapValue>>,
    /// Freed slot ids available for reuse. Populated by destruction,
    /// consumed by `allocate`.
    free_list: Vec<HeapId>,
    /// Live tagged (cycle-capable) objects.
    tagged_count: u32,
    /// Monotonic collection pass number.
    pass: i32,
    threshold: u32,
    multiplier: u32,
    /// Nonzero while a foreign call is on the stack; values the host has
    /// pushed but not yet rooted must not be collected mid-call.
    suspend_depth: u32,
}

impl Heap {
    pub fn new(gc_start: u32, gc_multiplier: u32) -> Self {
        Self {
            entries: Vec::new(),
            free_list: Vec::new(),
            tagged_count: 0,
            pass: 0,
            threshold: gc_start.max(1),
            multiplier: gc_multiplier.max(2),
            suspend_depth: 0,
        }
    }

    /// Places a value in the arena with a refcount of one. `tagged` comes
    /// from the signature's may-circle flag intersected with the data
    /// shape; tagged values join the GC entry set from creation.
    pub fn allocate(&mut self, data: HeapData, tagged: bool) -> HeapId {
        let tagged = tagged && data.can_cycle();
        if tagged {
            self.tagged_count += 1;
        }
        let entry = HeapValue {
            refcount: Cell::new(1),
            data: Some(data),
            tagged,
            last_pass: Cell::new(self.pass),
        };
        if let Some(id) = self.free_list.pop() {
            self.entries[id.index()] = Some(entry);
            id
        } else {
            let id = HeapId(u32::try_from(self.entries.len()).expect("heap arena exceeds u32"));
            self.entries.push(Some(entry));
            id
        }
    }

    /// # Panics
    /// Panics if the slot is missing or already freed.
    pub fn inc_ref(&self, id: HeapId) {
        let entry = self
            .entries
            .get(id.index())
            .and_then(Option::as_ref)
            .expect("Heap::inc_ref: object already freed");
        entry.refcount.set(entry.refcount.get() + 1);
    }

    /// Drops a reference, destroying the value (and recursively releasing
    /// its children) when the count reaches zero.
    pub fn dec_ref(&mut self, id: HeapId) {
        let entry = self
            .entries
            .get(id.index())
            .and_then(Option::as_ref)
            .expect("Heap::dec_ref: object already freed");
        let count = entry.refcount.get();
        if count > 1 {
            entry.refcount.set(count - 1);
            return;
        }
        self.destroy(id);
    }

    /// Tears a value down: releases children through the refcount path
    /// (skipping members of a dying cycle), runs a foreign destructor if
    /// one was supplied, and recycles the slot.
    fn destroy(&mut self, id: HeapId) {
        let entry = self.entries[id.index()]
            .take()
            .expect("Heap::destroy: object already freed");
        if entry.tagged {
            self.tagged_count -= 1;
        }

        if let Some(data) = entry.data {
            let mut child_ids = Vec::new();
            data.child_ids(&mut child_ids);
            if let HeapData::Foreign(foreign) = data {
                if let Some(destroy) = foreign.destroy {
                    destroy(foreign.data);
                }
            }
            for child in child_ids {
                if let Some(child_entry) = self.entries.get(child.index()).and_then(Option::as_ref)
                {
                    if child_entry.last_pass.get() != PASS_SENTINEL {
                        self.dec_ref(child);
                    }
                }
            }
        }

        self.free_list.push(id);
    }

    /// # Panics
    /// Panics if the slot is missing or already freed.
    #[must_use]
    pub fn get(&self, id: HeapId) -> &HeapData {
        self.entries
            .get(id.index())
            .and_then(Option::as_ref)
            .and_then(|e| e.data.as_ref())
            .expect("Heap::get: object already freed")
    }

    pub fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        self.entries
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .and_then(|e| e.data.as_mut())
            .expect("Heap::get_mut: object already freed")
    }

    pub fn refcount(&self, id: HeapId) -> u32 {
        self.entries
            .get(id.index())
            .and_then(Option::as_ref)
            .map_or(0, |e| e.refcount.get())
    }

    pub fn is_live(&self, id: HeapId) -> bool {
        self.entries.get(id.index()).is_some_and(Option::is_some)
    }

    /// Whether a collection is due. Never while a foreign call has the
    /// collector suspended.
    pub fn needs_gc(&self) -> bool {
        self.suspend_depth == 0 && self.tagged_count >= self.threshold
    }

    pub fn suspend_gc(&mut self) {
        self.suspend_depth += 1;
    }

    pub fn resume_gc(&mut self) {
        self.suspend_depth = self
            .suspend_depth
            .checked_sub(1)
            .expect("Heap::resume_gc: not suspended");
    }

    /// Runs one mark/sweep pass over the tagged set.
    ///
    /// `roots` must cover every live register of every frame, every global,
    /// and every value the embedding API holds outside the register file.
    pub fn collect<'a>(&mut self, roots: impl Iterator<Item = &'a Value>) {
        self.pass += 1;
        let pass = self.pass;

        // Mark phase: stamp everything reachable with the new pass number.
        let mut work_list: Vec<HeapId> = roots
            .filter_map(|v| match v {
                Value::Ref(id) => Some(*id),
                _ => None,
            })
            .collect();

        while let Some(id) = work_list.pop() {
            let Some(entry) = self.entries.get(id.index()).and_then(Option::as_ref) else {
                continue;
            };
            if entry.last_pass.get() == pass {
                continue;
            }
            entry.last_pass.set(pass);
            if let Some(data) = entry.data.as_ref() {
                data.child_ids(&mut work_list);
            }
        }

        // Sweep phase: every tagged value with a stale pass is garbage.
        // Stamp the sentinel on all of them first so cycle members skip
        // each other during teardown, then destroy.
        let mut dead = Vec::new();
        for (index, slot) in self.entries.iter().enumerate() {
            if let Some(entry) = slot {
                if entry.tagged && entry.last_pass.get() != pass {
                    entry.last_pass.set(PASS_SENTINEL);
                    dead.push(HeapId(index as u32));
                }
            }
        }
        for id in dead {
            self.destroy(id);
        }

        self.threshold = self
            .threshold
            .saturating_mul(self.multiplier)
            .min(1 << 30);
    }

    pub fn stats(&self) -> GcStats {
        GcStats {
            live_objects: self.entries.iter().filter(|e| e.is_some()).count(),
            tagged_objects: self.tagged_count as usize,
            pass: self.pass,
            threshold: self.threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        sig::SigId,
        value::{AnyBox, List},
    };

    fn dummy_sig() -> SigId {
        // SigId is opaque; build one through a pool.
        let mut pool = crate::sig::SigPool::new();
        pool.intern(crate::sig::Sig {
            class: crate::symtab::ClassId(0),
            subsigs: smallvec::SmallVec::new(),
            flags: 0,
            template_pos: 0,
        })
    }

    #[test]
    fn refcount_zero_frees_and_recycles_slot() {
        let mut heap = Heap::new(100, 2);
        let id = heap.allocate(HeapData::Str("abc".into()), false);
        assert_eq!(heap.refcount(id), 1);
        heap.inc_ref(id);
        heap.dec_ref(id);
        assert!(heap.is_live(id));
        heap.dec_ref(id);
        assert!(!heap.is_live(id));

        let id2 = heap.allocate(HeapData::Str("def".into()), false);
        assert_eq!(id, id2, "freed slot should be reused");
    }

    #[test]
    fn container_teardown_releases_children() {
        let mut heap = Heap::new(100, 2);
        let sig = dummy_sig();
        let child = heap.allocate(HeapData::Str("inner".into()), false);
        heap.inc_ref(child);
        let list = heap.allocate(
            HeapData::List(List {
                elem_sig: sig,
                values: vec![Value::Ref(child)],
            }),
            false,
        );
        // One count from us, one from the list.
        assert_eq!(heap.refcount(child), 2);
        heap.dec_ref(list);
        assert_eq!(heap.refcount(child), 1);
        heap.dec_ref(child);
        assert!(!heap.is_live(child));
    }

    #[test]
    fn collect_reclaims_a_cycle() {
        let mut heap = Heap::new(1, 2);
        let sig = dummy_sig();

        // list <-> any cycle: list holds the Any, the Any holds the list.
        let list = heap.allocate(
            HeapData::List(List {
                elem_sig: sig,
                values: Vec::new(),
            }),
            true,
        );
        let any = heap.allocate(
            HeapData::Any(AnyBox {
                sig,
                value: Value::Ref(list),
            }),
            true,
        );
        heap.inc_ref(list); // the Any's reference
        match heap.get_mut(list) {
            HeapData::List(l) => l.values.push(Value::Ref(any)),
            _ => unreachable!(),
        }
        heap.inc_ref(any); // the list's reference

        let before = heap.stats();
        assert_eq!(before.tagged_objects, 2);

        // Drop the external references; the cycle keeps both alive.
        heap.dec_ref(list);
        heap.dec_ref(any);
        assert!(heap.is_live(list));
        assert!(heap.is_live(any));

        // No roots: the pass must reclaim both members exactly once.
        heap.collect(std::iter::empty());
        assert!(!heap.is_live(list));
        assert!(!heap.is_live(any));
        assert_eq!(heap.stats().tagged_objects, 0);
    }

    #[test]
    fn collect_spares_rooted_values() {
        let mut heap = Heap::new(1, 2);
        let sig = dummy_sig();
        let list = heap.allocate(
            HeapData::List(List {
                elem_sig: sig,
                values: Vec::new(),
            }),
            true,
        );
        let root = Value::Ref(list);
        heap.collect(std::iter::once(&root));
        assert!(heap.is_live(list));
        assert_eq!(heap.stats().tagged_objects, 1);
    }

    #[test]
    fn threshold_grows_by_multiplier() {
        let mut heap = Heap::new(4, 3);
        assert_eq!(heap.stats().threshold, 4);
        heap.collect(std::iter::empty());
        assert_eq!(heap.stats().threshold, 12);
    }
}
