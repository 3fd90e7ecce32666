//! Mark-and-sweep cycle collector
//!
//! Reference counting cannot free cycles. This pass does:
//! 1. Clear marks and count, for every composite cell, how many references
//!    it receives from other composite cells
//! 2. Mark from the roots: global roots, running or resumed threads, cells
//!    in the refzero queue, and every cell whose count exceeds its internal
//!    references (someone outside the heap graph holds it)
//! 3. Mark from unreachable cells that have a finalizer, keeping them and
//!    everything they reach alive for one more pass
//! 4. Sweep: release the outgoing references of all garbage while it is
//!    still present, then free it
//! 5. Run the pending finalizers, requeue any cell left at zero, and reset
//!    the trigger counter
//!
//! The string table is weak and never marked. Strings and buffers are
//! leaves and are freed by reference counting as the sweep releases them.

use super::allocator::{CellRef, ListKind};
use super::cell::{CellBody, HeaderFlags};
use super::heap::{Heap, HeapFlags};
use crate::vm::ThreadState;
use bitflags::bitflags;
use tracing::{debug, warn};

bitflags! {
    /// Mark-and-sweep options
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct SweepFlags: u8 {
        /// Forced by allocation pressure; also compacts caches and stacks
        const EMERGENCY = 1 << 0;
        /// Treat finalizable garbage as plain garbage
        const SKIP_FINALIZERS = 1 << 1;
    }
}

/// Statistics from a collection pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Composite cells before collection
    pub objects_before: usize,
    /// Composite cells after collection
    pub objects_after: usize,
    /// Bytes freed
    pub bytes_freed: usize,
    /// Finalizers run by this pass
    pub finalized: usize,
    /// Cells left at zero and handed to the refzero queue
    pub requeued: usize,
    pub emergency: bool,
}

impl Heap {
    /// Run a voluntary mark-and-sweep pass
    pub fn collect(&mut self) -> bool {
        self.run_mark_and_sweep(SweepFlags::empty())
    }

    /// Run a full pass. Returns `false` when a pass is already running.
    pub fn run_mark_and_sweep(&mut self, flags: SweepFlags) -> bool {
        if self.flags.contains(HeapFlags::SWEEP_RUNNING) {
            return false;
        }
        self.flags.insert(HeapFlags::SWEEP_RUNNING);

        let objects_before = self.composite_count();
        let bytes_before = self.alloc.used_bytes();

        let roots = self.prepare_marks();
        self.mark_from(roots);

        // Rescued earlier and reachable again: eligible for finalization
        let allocated: Vec<u32> = self.alloc.iter_list(ListKind::Allocated).collect();
        for &idx in &allocated {
            if let Some(cell) = self.alloc.cell_at_mut(idx) {
                if cell.header.has(HeaderFlags::REACHABLE) {
                    cell.header.flags.remove(HeaderFlags::FINALIZED);
                }
            }
        }

        let finalizable = if flags.contains(SweepFlags::SKIP_FINALIZERS) {
            Vec::new()
        } else {
            self.mark_finalizable(&allocated)
        };

        let garbage: Vec<u32> = allocated
            .iter()
            .copied()
            .filter(|&idx| {
                self.alloc
                    .cell_at(idx)
                    .is_some_and(|c| !c.header.has(HeaderFlags::REACHABLE))
            })
            .collect();
        let freed = self.sweep(&garbage);

        if flags.contains(SweepFlags::EMERGENCY) {
            self.compact_for_emergency();
        }

        let finalized = self.run_pending_finalizers(&finalizable);
        if finalized > 0 {
            self.settle_finalized(&finalizable);
        }

        self.flags.remove(HeapFlags::SWEEP_RUNNING);

        let requeued = self.requeue_zero_refcounts();
        self.trigger_counter = self.config.next_trigger(self.composite_count());
        self.counters.gc_passes += 1;

        self.last_gc = GcStats {
            objects_before,
            objects_after: self.composite_count(),
            bytes_freed: bytes_before.saturating_sub(self.alloc.used_bytes()),
            finalized,
            requeued,
            emergency: flags.contains(SweepFlags::EMERGENCY),
        };
        debug!(
            freed,
            finalized,
            requeued,
            emergency = self.last_gc.emergency,
            "mark-and-sweep finished"
        );

        if requeued > 0 {
            self.drain_refzero();
        }
        true
    }

    fn composite_count(&self) -> usize {
        self.alloc.list_len(ListKind::Allocated) + self.alloc.list_len(ListKind::RefZero)
    }

    /// Clear mark bits and collect the root set
    fn prepare_marks(&mut self) -> Vec<CellRef> {
        let mut internal = vec![0u32; self.alloc.slot_count()];
        for (_, cell) in self.alloc.iter_cells_mut() {
            cell.header
                .flags
                .remove(HeaderFlags::REACHABLE | HeaderFlags::FINALIZABLE);
        }
        for (_, cell) in self.alloc.iter_cells() {
            if cell.tag().is_composite() {
                cell.body
                    .for_each_ref(&mut |child| internal[child.index() as usize] += 1);
            }
        }

        let mut roots = Vec::new();
        for (idx, cell) in self.alloc.iter_cells() {
            if !cell.tag().is_composite() {
                continue;
            }
            let held_outside = cell.header.refcount() > internal[idx as usize];
            let active = matches!(
                &cell.body,
                CellBody::Thread(t) if matches!(t.state, ThreadState::Running | ThreadState::Resumed)
            );
            let queued = self.alloc.list_of(idx) == ListKind::RefZero;
            if held_outside || active || queued {
                roots.push(self.alloc.handle_at(idx));
            }
        }
        roots.extend(self.root_values().filter_map(|v| v.as_cell()));
        roots.extend(self.curr_thread);
        roots
    }

    /// Mark everything reachable from `work` with an explicit work list
    fn mark_from(&mut self, mut work: Vec<CellRef>) -> usize {
        let mut marked = 0;
        while let Some(r) = work.pop() {
            let Some(cell) = self.alloc.get_mut(r) else {
                continue;
            };
            if !cell.tag().is_composite() || cell.header.has(HeaderFlags::REACHABLE) {
                continue;
            }
            cell.header.flags.insert(HeaderFlags::REACHABLE);
            marked += 1;
            cell.body.for_each_traced_ref(&mut |child| work.push(child));
        }
        marked
    }

    /// Flag unreachable cells with a pending finalizer and keep them, and
    /// what they reach, alive until the finalizer has run.
    fn mark_finalizable(&mut self, allocated: &[u32]) -> Vec<u32> {
        let mut finalizable = Vec::new();
        for &idx in allocated {
            let Some(cell) = self.alloc.cell_at(idx) else {
                continue;
            };
            if cell.header.has(HeaderFlags::REACHABLE) || cell.header.has(HeaderFlags::FINALIZED)
            {
                continue;
            }
            if self.has_finalizer(self.alloc.handle_at(idx)) {
                finalizable.push(idx);
            }
        }

        let mut work = Vec::with_capacity(finalizable.len());
        for &idx in &finalizable {
            if let Some(cell) = self.alloc.cell_at_mut(idx) {
                cell.header.flags.insert(HeaderFlags::FINALIZABLE);
            }
            work.push(self.alloc.handle_at(idx));
        }
        self.mark_from(work);
        finalizable
    }

    /// Release the outgoing references of every garbage cell, then free
    /// them. Garbage cells reaching zero here stay put until phase two.
    fn sweep(&mut self, garbage: &[u32]) -> usize {
        let mut children = Vec::new();
        for &idx in garbage {
            if let Some(cell) = self.alloc.cell_at(idx) {
                cell.body.for_each_ref(&mut |child| children.push(child));
            }
            for child in children.drain(..) {
                self.decref_cell(child);
            }
        }

        let mut freed = 0;
        for &idx in garbage {
            let r = self.alloc.handle_at(idx);
            debug_assert_eq!(self.refcount(r), Some(0), "swept cell still referenced");
            self.alloc.unlink(idx);
            if self.alloc.free_index(idx).is_some() {
                if self.curr_thread == Some(r) {
                    self.curr_thread = None;
                }
                freed += 1;
            }
        }
        freed
    }

    fn compact_for_emergency(&mut self) {
        self.counters.emergency_passes += 1;
        self.str_cache.flush();
        for (_, cell) in self.alloc.iter_cells_mut() {
            if let CellBody::Thread(t) = &mut cell.body {
                t.shrink();
            }
        }
        warn!(
            used = self.alloc.used_bytes(),
            "emergency collection compacted caches and stacks"
        );
    }

    fn run_pending_finalizers(&mut self, finalizable: &[u32]) -> usize {
        let mut finalized = 0;
        for &idx in finalizable {
            if self.alloc.cell_at(idx).is_none() {
                continue;
            }
            let r = self.alloc.handle_at(idx);
            let Some(fin) = self.resolve_finalizer(r) else {
                continue;
            };
            if let Some(cell) = self.alloc.cell_at_mut(idx) {
                cell.header.flags.insert(HeaderFlags::FINALIZED);
                cell.header.acquire();
            }
            self.run_finalizer(r, fin);
            if let Some(cell) = self.alloc.cell_at_mut(idx) {
                // A zero here is picked up by the requeue step
                let _ = cell.header.release();
            }
            finalized += 1;
        }
        finalized
    }

    /// Re-mark after finalizers ran. A finalized cell reachable from the
    /// roots again was rescued and may be finalized on its next death; one
    /// kept alive only by its own garbage keeps `FINALIZED`.
    fn settle_finalized(&mut self, finalizable: &[u32]) {
        let roots = self.prepare_marks();
        self.mark_from(roots);
        for &idx in finalizable {
            let Some(cell) = self.alloc.cell_at_mut(idx) else {
                continue;
            };
            if cell.header.has(HeaderFlags::FINALIZED) && cell.header.has(HeaderFlags::REACHABLE)
            {
                cell.header.flags.remove(HeaderFlags::FINALIZED);
                self.counters.rescues += 1;
                debug!(r = ?self.alloc.handle_at(idx), "finalizer rescued cell during sweep");
            }
        }
    }

    /// Move allocated cells whose count dropped to zero during the pass to
    /// the refzero queue.
    fn requeue_zero_refcounts(&mut self) -> usize {
        let zero: Vec<u32> = self
            .alloc
            .iter_list(ListKind::Allocated)
            .filter(|&idx| {
                self.alloc
                    .cell_at(idx)
                    .is_some_and(|c| c.header.refcount() == 0)
            })
            .collect();
        for &idx in &zero {
            self.alloc.unlink(idx);
            self.alloc.link_tail(ListKind::RefZero, idx);
        }
        zero.len()
    }
}

#[cfg(test)]
mod tests {
    use crate::config::HeapConfig;
    use crate::gc::{Heap, SweepFlags};
    use crate::value::Value;

    fn heap() -> Heap {
        Heap::new(HeapConfig::default().without_voluntary_gc())
    }

    #[test]
    fn test_collect_cycle() {
        let mut heap = heap();
        let key = heap.intern("peer").unwrap();
        let a = heap.alloc_object(None).unwrap();
        let b = heap.alloc_object(None).unwrap();
        heap.put_prop(a, key, Value::cell(b)).unwrap();
        heap.put_prop(b, key, Value::cell(a)).unwrap();

        heap.decref_cell(a);
        heap.decref_cell(b);
        assert!(heap.is_live(a));
        assert!(heap.is_live(b));

        assert!(heap.collect());
        assert!(!heap.is_live(a));
        assert!(!heap.is_live(b));
        assert_eq!(heap.refcount(key), Some(1));
        assert_eq!(heap.last_gc().objects_before, 2);
        assert_eq!(heap.last_gc().objects_after, 0);
    }

    #[test]
    fn test_held_cells_survive() {
        let mut heap = heap();
        let key = heap.intern("child").unwrap();
        let parent = heap.alloc_object(None).unwrap();
        let child = heap.alloc_object(None).unwrap();
        heap.put_prop(parent, key, Value::cell(child)).unwrap();
        heap.decref_cell(child);

        heap.collect();
        assert!(heap.is_live(parent));
        assert!(heap.is_live(child));
        assert_eq!(heap.refcount(child), Some(1));
    }

    #[test]
    fn test_cycle_reachable_from_root_survives() {
        let mut heap = heap();
        let key = heap.intern("peer").unwrap();
        let a = heap.alloc_object(None).unwrap();
        let b = heap.alloc_object(None).unwrap();
        heap.put_prop(a, key, Value::cell(b)).unwrap();
        heap.put_prop(b, key, Value::cell(a)).unwrap();
        let root = heap.add_root(Value::cell(a)).unwrap();
        heap.decref_cell(a);
        heap.decref_cell(b);

        heap.collect();
        assert!(heap.is_live(a));
        assert!(heap.is_live(b));

        heap.remove_root(root);
        heap.collect();
        assert!(!heap.is_live(a));
        assert!(!heap.is_live(b));
    }

    #[test]
    fn test_cycle_leaves_freed() {
        let mut heap = heap();
        let key = heap.intern("peer").unwrap();
        let data = heap.intern("data").unwrap();
        let a = heap.alloc_object(None).unwrap();
        let b = heap.alloc_object(None).unwrap();
        let s = heap.intern("payload").unwrap();
        let buf = heap.alloc_buffer(16, false).unwrap();
        heap.put_prop(a, key, Value::cell(b)).unwrap();
        heap.put_prop(b, key, Value::cell(a)).unwrap();
        heap.put_prop(a, data, Value::cell(s)).unwrap();
        heap.put_prop(b, data, Value::cell(buf)).unwrap();
        for r in [a, b, s, buf] {
            heap.decref_cell(r);
        }

        heap.collect();
        assert!(!heap.is_live(s));
        assert!(!heap.is_live(buf));
        assert_eq!(heap.stats().live_strings, 2);
    }

    #[test]
    fn test_reentrant_pass_refused() {
        let mut heap = heap();
        heap.flags.insert(crate::gc::HeapFlags::SWEEP_RUNNING);
        assert!(!heap.run_mark_and_sweep(SweepFlags::empty()));
        heap.flags.remove(crate::gc::HeapFlags::SWEEP_RUNNING);
        assert!(heap.run_mark_and_sweep(SweepFlags::empty()));
    }

    #[test]
    fn test_emergency_flushes_cache() {
        let mut heap = heap();
        let s = heap.intern("ünïcödé").unwrap();
        heap.char_offset(s, 3).unwrap();
        assert!(!heap.str_cache.is_empty());

        heap.run_mark_and_sweep(SweepFlags::EMERGENCY);
        assert!(heap.str_cache.is_empty());
        assert!(heap.last_gc().emergency);
        assert_eq!(heap.stats().emergency_passes, 1);
    }

    #[test]
    fn test_trigger_reset() {
        let mut heap = Heap::new(HeapConfig::default().with_trigger(5, 2, 10));
        let _keep = heap.alloc_object(None).unwrap();
        heap.collect();
        assert_eq!(heap.stats().trigger_counter, 12);
    }
}
