//! The heap context
//!
//! One [`Heap`] bundles all collector state: the cell allocator with its
//! two intrusive lists, the string table and lookaside cache, the native
//! function registry, global roots, the drain/sweep guard flags and the
//! mark-and-sweep trigger counter. Nothing is process-global, so any number
//! of independent heaps can coexist.

use super::allocator::{Allocator, CellRef, ListKind};
use super::cell::{Cell, CellBody, CellTag};
use super::collector::{GcStats, SweepFlags};
use crate::config::HeapConfig;
use crate::error::{HeapError, HeapResult};
use crate::runtime::{StringCache, StringTable};
use crate::value::{NativeFunctionId, Value};
use bitflags::bitflags;
use std::rc::Rc;

bitflags! {
    /// Re-entrancy guards
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct HeapFlags: u8 {
        /// A refzero drain loop is active
        const DRAIN_RUNNING = 1 << 0;
        /// A mark-and-sweep pass is active
        const SWEEP_RUNNING = 1 << 1;
    }
}

/// A native function.
///
/// Arguments are borrowed; a native that keeps one must store it through a
/// heap operation, which takes its own reference.
pub type NativeFn = Rc<dyn Fn(&mut Heap, &[Value]) -> HeapResult<Value>>;

/// Index of a global root slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootId(u32);

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Counters {
    pub refzero_frees: u64,
    pub strings_freed: u64,
    pub buffers_freed: u64,
    pub rescues: u64,
    pub finalizer_runs: u64,
    pub finalizer_errors: u64,
    pub gc_passes: u64,
    pub emergency_passes: u64,
}

/// Snapshot of heap usage
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub live_strings: usize,
    pub live_objects: usize,
    pub live_buffers: usize,
    pub live_threads: usize,
    pub interned_strings: usize,
    pub used_bytes: usize,
    pub max_bytes: usize,
    /// Composite cells freed by the refzero drain
    pub refzero_frees: u64,
    pub strings_freed: u64,
    pub buffers_freed: u64,
    pub rescues: u64,
    pub finalizer_runs: u64,
    pub finalizer_errors: u64,
    pub gc_passes: u64,
    pub emergency_passes: u64,
    pub trigger_counter: i64,
}

/// A garbage-collected heap
pub struct Heap {
    pub(crate) alloc: Allocator,
    pub(crate) strings: StringTable,
    pub(crate) str_cache: StringCache,
    natives: Vec<NativeFn>,
    roots: Vec<Option<Value>>,
    roots_free: Vec<u32>,
    pub(crate) flags: HeapFlags,
    pub(crate) trigger_counter: i64,
    pub(crate) config: HeapConfig,
    pub(crate) counters: Counters,
    /// Non-owning; cleared when the thread is freed
    pub(crate) curr_thread: Option<CellRef>,
    /// Interned finalizer property key; the heap holds one count on it
    pub(crate) finalizer_key: Option<CellRef>,
    pub(crate) last_gc: GcStats,
}

impl Heap {
    /// Create an empty heap
    pub fn new(config: HeapConfig) -> Self {
        Heap {
            alloc: Allocator::new(config.max_bytes),
            strings: StringTable::new(),
            str_cache: StringCache::new(config.string_cache_size),
            natives: Vec::new(),
            roots: Vec::new(),
            roots_free: Vec::new(),
            flags: HeapFlags::empty(),
            trigger_counter: config.trigger_initial,
            config,
            counters: Counters::default(),
            curr_thread: None,
            finalizer_key: None,
            last_gc: GcStats::default(),
        }
    }

    #[inline]
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Allocate a cell with refcount 1, owned by the caller.
    ///
    /// When the byte limit is reached an emergency mark-and-sweep runs and
    /// the allocation is retried once.
    pub(crate) fn alloc_cell(&mut self, body: CellBody) -> HeapResult<CellRef> {
        let cell = match self.alloc.try_alloc(Cell::new(body)) {
            Ok(r) => return Ok(r),
            Err(cell) => cell,
        };
        tracing::warn!(
            used = self.alloc.used_bytes(),
            max = self.alloc.max_bytes(),
            "allocation limit reached, running emergency collection"
        );
        self.run_mark_and_sweep(SweepFlags::EMERGENCY);
        self.alloc.try_alloc(cell).map_err(|_| HeapError::OutOfMemory)
    }

    /// Check whether a handle still refers to a live cell
    #[inline]
    pub fn is_live(&self, r: CellRef) -> bool {
        self.alloc.resolve(r).is_some()
    }

    #[inline]
    pub fn tag(&self, r: CellRef) -> Option<CellTag> {
        self.alloc.get(r).map(Cell::tag)
    }

    /// Current count of a live cell
    #[inline]
    pub fn refcount(&self, r: CellRef) -> Option<u32> {
        self.alloc.get(r).map(|c| c.header.refcount())
    }

    #[inline]
    pub fn is_drain_running(&self) -> bool {
        self.flags.contains(HeapFlags::DRAIN_RUNNING)
    }

    #[inline]
    pub fn is_sweep_running(&self) -> bool {
        self.flags.contains(HeapFlags::SWEEP_RUNNING)
    }

    /// Number of composite cells waiting in the refzero queue
    #[inline]
    pub fn refzero_len(&self) -> usize {
        self.alloc.list_len(ListKind::RefZero)
    }

    /// Statistics of the most recent mark-and-sweep pass
    #[inline]
    pub fn last_gc(&self) -> &GcStats {
        &self.last_gc
    }

    pub fn stats(&self) -> HeapStats {
        let counts = self.alloc.count_by_tag();
        let c = &self.counters;
        HeapStats {
            live_strings: counts[CellTag::String as usize],
            live_objects: counts[CellTag::Object as usize],
            live_buffers: counts[CellTag::Buffer as usize],
            live_threads: counts[CellTag::Thread as usize],
            interned_strings: self.strings.count(),
            used_bytes: self.alloc.used_bytes(),
            max_bytes: self.alloc.max_bytes(),
            refzero_frees: c.refzero_frees,
            strings_freed: c.strings_freed,
            buffers_freed: c.buffers_freed,
            rescues: c.rescues,
            finalizer_runs: c.finalizer_runs,
            finalizer_errors: c.finalizer_errors,
            gc_passes: c.gc_passes,
            emergency_passes: c.emergency_passes,
            trigger_counter: self.trigger_counter,
        }
    }

    /// Register a native function
    pub fn register_native<F>(&mut self, f: F) -> NativeFunctionId
    where
        F: Fn(&mut Heap, &[Value]) -> HeapResult<Value> + 'static,
    {
        self.natives.push(Rc::new(f));
        NativeFunctionId((self.natives.len() - 1) as u32)
    }

    pub(crate) fn native_fn(&self, id: NativeFunctionId) -> Option<NativeFn> {
        self.natives.get(id.index() as usize).cloned()
    }

    /// Register a global root. The slot takes a reference.
    pub fn add_root(&mut self, value: Value) -> HeapResult<RootId> {
        self.check_value(value)?;
        self.incref(value);
        let id = match self.roots_free.pop() {
            Some(idx) => {
                self.roots[idx as usize] = Some(value);
                idx
            }
            None => {
                self.roots.push(Some(value));
                (self.roots.len() - 1) as u32
            }
        };
        Ok(RootId(id))
    }

    pub fn get_root(&self, id: RootId) -> Option<Value> {
        self.roots.get(id.0 as usize).copied().flatten()
    }

    /// Overwrite a root slot
    pub fn set_root(&mut self, id: RootId, value: Value) -> HeapResult<()> {
        self.check_value(value)?;
        let slot = self
            .roots
            .get_mut(id.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(HeapError::InvalidHandle)?;
        let old = std::mem::replace(slot, value);
        self.incref(value);
        self.decref(old);
        Ok(())
    }

    /// Remove a root, releasing its reference
    pub fn remove_root(&mut self, id: RootId) -> Option<Value> {
        let old = self.roots.get_mut(id.0 as usize)?.take()?;
        self.roots_free.push(id.0);
        self.decref(old);
        Some(old)
    }

    pub(crate) fn root_values(&self) -> impl Iterator<Item = Value> + '_ {
        self.roots.iter().flatten().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_heap() {
        let heap = Heap::new(HeapConfig::default());
        let stats = heap.stats();
        assert_eq!(stats.used_bytes, 0);
        assert_eq!(stats.live_objects, 0);
        assert_eq!(stats.trigger_counter, HeapConfig::default().trigger_initial);
        assert!(!heap.is_drain_running());
        assert!(!heap.is_sweep_running());
    }

    #[test]
    fn test_roots_hold_references() {
        let mut heap = Heap::new(HeapConfig::default());
        let obj = heap.alloc_object(None).unwrap();

        let id = heap.add_root(Value::cell(obj)).unwrap();
        assert_eq!(heap.refcount(obj), Some(2));
        assert_eq!(heap.get_root(id), Some(Value::cell(obj)));

        heap.decref(Value::cell(obj));
        assert!(heap.is_live(obj));

        heap.set_root(id, Value::int(3)).unwrap();
        assert!(!heap.is_live(obj));
        assert_eq!(heap.remove_root(id), Some(Value::int(3)));
        assert_eq!(heap.remove_root(id), None);
    }

    #[test]
    fn test_root_slot_reuse() {
        let mut heap = Heap::new(HeapConfig::default());
        let a = heap.add_root(Value::int(1)).unwrap();
        heap.remove_root(a);
        let b = heap.add_root(Value::int(2)).unwrap();
        assert_eq!(a, b);
        assert!(heap.set_root(RootId(99), Value::null()).is_err());
    }

    #[test]
    fn test_register_native() {
        let mut heap = Heap::new(HeapConfig::default());
        let id = heap.register_native(|_, args| Ok(Value::int(args.len() as i32)));
        let f = heap.native_fn(id).unwrap();
        assert_eq!(f(&mut heap, &[Value::null()]).unwrap(), Value::int(1));
        assert!(heap.native_fn(NativeFunctionId(7)).is_none());
    }

    #[test]
    fn test_out_of_memory() {
        let mut heap = Heap::new(HeapConfig::default().with_max_bytes(256));
        assert_eq!(heap.alloc_buffer(4096, false), Err(HeapError::OutOfMemory));
        assert_eq!(heap.stats().emergency_passes, 1);
    }
}
