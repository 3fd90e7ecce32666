//! Embedding context
//!
//! The Context is the main entry point for embedders. It owns a [`Heap`],
//! a main thread registered as a global root and started `Running`, and
//! the initial builtins shared by every thread allocated from it.

use crate::config::HeapConfig;
use crate::error::HeapResult;
use crate::gc::{CellRef, GcStats, Heap, HeapStats, RootId, SweepFlags};
use crate::value::Value;
use crate::vm::BuiltinId;

/// A heap with a running main thread
pub struct Context {
    heap: Heap,
    main: CellRef,
    main_root: RootId,
}

impl Context {
    /// Create a context with a fresh heap.
    ///
    /// The builtins table receives a `Global` object, an `ObjectPrototype`
    /// and a `ThreadPrototype`, both prototypes inheriting from the former.
    pub fn new(config: HeapConfig) -> HeapResult<Self> {
        let mut heap = Heap::new(config);

        let object_proto = heap.alloc_object(None)?;
        let global = heap.alloc_object(Some(object_proto))?;
        let thread_proto = heap.alloc_object(Some(object_proto))?;

        let main = heap.alloc_thread(None)?;
        heap.set_builtin(main, BuiltinId::ObjectPrototype, Some(object_proto))?;
        heap.set_builtin(main, BuiltinId::Global, Some(global))?;
        heap.set_builtin(main, BuiltinId::ThreadPrototype, Some(thread_proto))?;
        heap.set_prototype(main, Some(thread_proto))?;

        // The builtins table and the root now own everything
        for r in [object_proto, global, thread_proto] {
            heap.decref_cell(r);
        }
        let main_root = heap.add_root(Value::cell(main))?;
        heap.decref_cell(main);

        heap.start_thread(main)?;
        tracing::debug!(?main, "context created");

        Ok(Context {
            heap,
            main,
            main_root,
        })
    }

    #[inline]
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    #[inline]
    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// The main thread
    #[inline]
    pub fn main_thread(&self) -> CellRef {
        self.main
    }

    /// Root slot holding the main thread
    #[inline]
    pub fn main_root(&self) -> RootId {
        self.main_root
    }

    /// A builtin of the main thread
    pub fn builtin(&self, id: BuiltinId) -> Option<CellRef> {
        self.heap.builtin(self.main, id).ok().flatten()
    }

    /// The global object
    pub fn global(&self) -> Option<CellRef> {
        self.builtin(BuiltinId::Global)
    }

    /// Allocate a coroutine sharing the main thread's builtins
    pub fn new_thread(&mut self) -> HeapResult<CellRef> {
        self.heap.alloc_thread(Some(self.main))
    }

    /// Allocate a plain object inheriting from `ObjectPrototype`
    pub fn new_object(&mut self) -> HeapResult<CellRef> {
        let proto = self.builtin(BuiltinId::ObjectPrototype);
        self.heap.alloc_object(proto)
    }

    /// Run a full mark-and-sweep pass
    pub fn gc(&mut self) -> bool {
        self.heap.run_mark_and_sweep(SweepFlags::empty())
    }

    pub fn last_gc(&self) -> &GcStats {
        self.heap.last_gc()
    }

    pub fn stats(&self) -> HeapStats {
        self.heap.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::ThreadState;

    #[test]
    fn test_context_creation() {
        let ctx = Context::new(HeapConfig::default()).unwrap();
        let heap = ctx.heap();

        assert_eq!(heap.current_thread(), Some(ctx.main_thread()));
        assert_eq!(
            heap.thread_state(ctx.main_thread()).unwrap(),
            ThreadState::Running
        );
        assert!(ctx.global().is_some());
        assert_eq!(heap.refcount(ctx.main_thread()), Some(1));

        let stats = ctx.stats();
        assert_eq!(stats.live_threads, 1);
        assert_eq!(stats.live_objects, 3);
    }

    #[test]
    fn test_builtins_survive_gc() {
        let mut ctx = Context::new(HeapConfig::default()).unwrap();
        assert!(ctx.gc());
        assert_eq!(ctx.stats().live_objects, 3);
        assert!(ctx.heap().is_live(ctx.main_thread()));
    }

    #[test]
    fn test_new_thread_inherits() {
        let mut ctx = Context::new(HeapConfig::default()).unwrap();
        let co = ctx.new_thread().unwrap();
        let heap = ctx.heap();
        assert_eq!(
            heap.builtin(co, BuiltinId::Global).unwrap(),
            ctx.global()
        );
        assert_eq!(
            heap.object(co).unwrap().proto,
            ctx.builtin(BuiltinId::ThreadPrototype)
        );
        assert_eq!(heap.thread_state(co).unwrap(), ThreadState::Inactive);
    }

    #[test]
    fn test_new_object_prototype() {
        let mut ctx = Context::new(HeapConfig::default()).unwrap();
        let obj = ctx.new_object().unwrap();
        assert_eq!(
            ctx.heap().object(obj).unwrap().proto,
            ctx.builtin(BuiltinId::ObjectPrototype)
        );
    }
}
