//! Reference counting and the refzero queue
//!
//! Leaves (strings, buffers) are freed as soon as their count reaches zero.
//! Composite cells are never freed inside their own zero transition: they
//! move to the tail of the refzero queue and the drain loop frees them,
//! releasing their outgoing references, which may queue further cells.
//!
//! The drain processes the queue head to tail with an explicit loop, so
//! freeing a graph of any depth uses constant native stack.

use super::allocator::{CellRef, ListKind};
use super::cell::{CellBody, HeaderFlags};
use super::collector::SweepFlags;
use super::heap::{Heap, HeapFlags};
use crate::value::Value;
use tracing::{debug, error, trace};

impl Heap {
    /// Take a reference. No-op on immediates.
    #[inline]
    pub fn incref(&mut self, value: Value) {
        if let Some(r) = value.as_cell() {
            self.incref_cell(r);
        }
    }

    pub fn incref_cell(&mut self, r: CellRef) {
        match self.alloc.get_mut(r) {
            Some(cell) => cell.header.acquire(),
            None => {
                debug_assert!(false, "incref of stale handle {:?}", r);
                error!(?r, "incref of stale handle");
            }
        }
    }

    /// Drop a reference. No-op on immediates.
    #[inline]
    pub fn decref(&mut self, value: Value) {
        if let Some(r) = value.as_cell() {
            self.decref_cell(r);
        }
    }

    /// Drop a reference, dispatching the zero handler on the last one
    pub fn decref_cell(&mut self, r: CellRef) {
        let Some(cell) = self.alloc.get_mut(r) else {
            debug_assert!(false, "decref of stale handle {:?}", r);
            error!(?r, "decref of stale handle");
            return;
        };
        if cell.header.release() {
            self.refzero(r);
        }
    }

    /// [`decref_cell`](Self::decref_cell) tolerating an absent reference
    #[inline]
    pub fn decref_or_absent(&mut self, r: Option<CellRef>) {
        if let Some(r) = r {
            self.decref_cell(r);
        }
    }

    /// Zero-handler dispatch
    fn refzero(&mut self, r: CellRef) {
        let idx = r.index();
        let Some(cell) = self.alloc.cell_at(idx) else {
            return;
        };
        match &cell.body {
            CellBody::String(s) => {
                let hash = s.hash();
                self.str_cache.remove_from_cache(r);
                self.strings.remove_by_identity(r, hash);
                self.alloc.free_index(idx);
                self.counters.strings_freed += 1;
                trace!(?r, "freed string");
            }
            CellBody::Buffer(_) => {
                self.alloc.free_index(idx);
                self.counters.buffers_freed += 1;
                trace!(?r, "freed buffer");
            }
            CellBody::Object(_) | CellBody::Thread(_) => {
                if self.flags.contains(HeapFlags::SWEEP_RUNNING) {
                    // The sweep frees or requeues it
                    trace!(?r, "zero refcount during sweep");
                    return;
                }
                if self.alloc.list_of(idx) == ListKind::RefZero {
                    return;
                }
                self.alloc.unlink(idx);
                self.alloc.link_tail(ListKind::RefZero, idx);
                trace!(?r, "queued for refzero");
                self.drain_refzero();
            }
        }
    }

    /// Process the refzero queue until it is empty.
    ///
    /// Returns immediately when a drain is already active further up the
    /// stack; that drain picks up the new tail entries. A voluntary pass
    /// started here runs with the drain flag still set, so whatever it
    /// requeues is drained by this loop rather than a nested one.
    pub(crate) fn drain_refzero(&mut self) {
        if self.flags.contains(HeapFlags::DRAIN_RUNNING) {
            return;
        }
        self.flags.insert(HeapFlags::DRAIN_RUNNING);

        loop {
            let freed = self.drain_queue();
            if freed == 0 || !self.config.voluntary_gc || self.is_sweep_running() {
                break;
            }
            self.trigger_counter -= freed as i64;
            if cfg!(feature = "debug-gc") {
                self.trigger_counter = 0;
            }
            if self.trigger_counter > 0 {
                break;
            }
            debug!("trigger counter exhausted, running voluntary collection");
            self.run_mark_and_sweep(SweepFlags::empty());
            if self.alloc.head(ListKind::RefZero).is_none() {
                break;
            }
        }

        self.flags.remove(HeapFlags::DRAIN_RUNNING);
    }

    /// One pass over the queue. Returns the number of cells freed.
    fn drain_queue(&mut self) -> usize {
        let mut freed: usize = 0;
        let mut rescued: usize = 0;
        while let Some(idx) = self.alloc.head(ListKind::RefZero) {
            let r = self.alloc.handle_at(idx);

            let finalized = self
                .alloc
                .cell_at(idx)
                .is_some_and(|c| c.header.has(HeaderFlags::FINALIZED));
            let mut keep = false;
            if !finalized {
                if let Some(fin) = self.resolve_finalizer(r) {
                    if let Some(cell) = self.alloc.cell_at_mut(idx) {
                        cell.header.flags.insert(HeaderFlags::FINALIZED);
                        cell.header.acquire();
                    }
                    self.run_finalizer(r, fin);
                    keep = match self.alloc.cell_at_mut(idx) {
                        Some(cell) => !cell.header.release(),
                        None => false,
                    };
                }
            }

            debug_assert_eq!(self.alloc.head(ListKind::RefZero), Some(idx));
            self.alloc.unlink(idx);

            if keep {
                if let Some(cell) = self.alloc.cell_at_mut(idx) {
                    cell.header.flags.remove(HeaderFlags::FINALIZED);
                }
                self.alloc.link_head(ListKind::Allocated, idx);
                self.counters.rescues += 1;
                rescued += 1;
                debug!(?r, "finalizer rescued cell");
                continue;
            }

            self.free_composite(idx);
            freed += 1;
        }

        if freed > 0 || rescued > 0 {
            debug!(freed, rescued, "refzero drain finished");
        }
        freed
    }

    /// Free an unlinked composite cell and release everything it owned.
    ///
    /// The outgoing releases may queue more cells; the caller's drain loop
    /// processes them.
    pub(crate) fn free_composite(&mut self, idx: u32) {
        let r = self.alloc.handle_at(idx);
        let Some(cell) = self.alloc.free_index(idx) else {
            return;
        };
        if self.curr_thread == Some(r) {
            self.curr_thread = None;
        }
        self.counters.refzero_frees += 1;
        trace!(?r, tag = ?cell.tag(), "freed composite");
        cell.body.for_each_ref(&mut |child| self.decref_cell(child));
    }
}

#[cfg(test)]
mod tests {
    use crate::config::HeapConfig;
    use crate::gc::Heap;
    use crate::value::Value;

    fn heap() -> Heap {
        Heap::new(HeapConfig::default().without_voluntary_gc())
    }

    #[test]
    fn test_incref_decref_immediates() {
        let mut heap = heap();
        heap.incref(Value::int(1));
        heap.decref(Value::null());
        heap.decref_or_absent(None);
        assert_eq!(heap.stats().refzero_frees, 0);
    }

    #[test]
    fn test_leaf_freed_immediately() {
        let mut heap = heap();
        let b = heap.alloc_buffer(8, true).unwrap();
        heap.incref_cell(b);
        heap.decref_cell(b);
        assert!(heap.is_live(b));

        heap.decref_cell(b);
        assert!(!heap.is_live(b));
        assert_eq!(heap.stats().buffers_freed, 1);
        assert_eq!(heap.stats().used_bytes, 0);
    }

    #[test]
    fn test_cascade_through_queue() {
        let mut heap = heap();
        let key = heap.intern("next").unwrap();
        let a = heap.alloc_object(None).unwrap();
        let b = heap.alloc_object(None).unwrap();
        let s = heap.intern("leaf").unwrap();

        heap.put_prop(a, key, Value::cell(b)).unwrap();
        heap.put_prop(b, key, Value::cell(s)).unwrap();
        heap.decref_cell(b);
        heap.decref_cell(s);

        heap.decref_cell(a);
        assert!(!heap.is_live(a));
        assert!(!heap.is_live(b));
        assert!(!heap.is_live(s));
        assert_eq!(heap.refzero_len(), 0);
        assert!(!heap.is_drain_running());
        assert_eq!(heap.stats().refzero_frees, 2);
        // The key survives: we still hold it
        assert_eq!(heap.refcount(key), Some(1));
    }

    #[test]
    fn test_prototype_released() {
        let mut heap = heap();
        let proto = heap.alloc_object(None).unwrap();
        let obj = heap.alloc_object(Some(proto)).unwrap();
        heap.decref_cell(proto);
        assert!(heap.is_live(proto));

        heap.decref_cell(obj);
        assert!(!heap.is_live(proto));
    }

    #[test]
    #[cfg(not(feature = "debug-gc"))]
    fn test_voluntary_trigger() {
        let mut heap = Heap::new(HeapConfig::default().with_trigger(3, 0, 100));
        for _ in 0..3 {
            let o = heap.alloc_object(None).unwrap();
            heap.decref_cell(o);
        }
        let stats = heap.stats();
        assert_eq!(stats.gc_passes, 1);
        assert_eq!(stats.trigger_counter, 100);
    }
}
