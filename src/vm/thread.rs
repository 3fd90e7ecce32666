//! Thread (coroutine) cells
//!
//! A thread owns a value stack, a call stack of activations, a catch stack
//! and a builtins table. Exactly one thread per heap is `Running` at a time.
//!
//! State transitions:
//! ```text
//! Inactive --start/resume--> Running --resume other--> Resumed
//!                            Running <--yield/return-- Resumed
//!                            Running --yield--> Yielded --resume--> Running
//!                            Running --terminate--> Terminated
//! ```

use crate::config::HeapConfig;
use crate::error::{HeapError, HeapResult};
use crate::gc::{CellBody, CellRef, CellTag, Heap};
use crate::runtime::{ClassId, ObjectCell};
use crate::value::Value;
use crate::vm::activation::{ActivationFlags, ActivationRecord, CatchRecord};
use crate::vm::stack::ValueStack;

/// Thread execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Inactive,
    Running,
    /// Resumed another thread and waits for it to yield or return
    Resumed,
    Yielded,
    Terminated,
}

/// Slots of the builtins table
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinId {
    Global = 0,
    ObjectPrototype = 1,
    FunctionPrototype = 2,
    ArrayPrototype = 3,
    ThreadPrototype = 4,
}

pub const NUM_BUILTINS: usize = 5;

/// A thread cell body
pub struct ThreadCell {
    pub object: ObjectCell,
    pub state: ThreadState,
    pub valstack: ValueStack,
    pub callstack: Vec<ActivationRecord>,
    pub callstack_max: usize,
    /// Number of activations carrying `PREVENT_YIELD`
    pub callstack_preventcount: usize,
    pub catchstack: Vec<CatchRecord>,
    pub catchstack_max: usize,
    pub builtins: [Option<CellRef>; NUM_BUILTINS],
    /// Thread that resumed this one; holds a count
    pub resumer: Option<CellRef>,
}

impl ThreadCell {
    pub fn new(
        config: &HeapConfig,
        proto: Option<CellRef>,
        builtins: [Option<CellRef>; NUM_BUILTINS],
    ) -> Self {
        ThreadCell {
            object: ObjectCell::with_class(ClassId::Thread, proto),
            state: ThreadState::Inactive,
            valstack: ValueStack::new(config.valstack_max),
            callstack: Vec::new(),
            callstack_max: config.callstack_max,
            callstack_preventcount: 0,
            catchstack: Vec::new(),
            catchstack_max: config.catchstack_max,
            builtins,
            resumer: None,
        }
    }

    /// Visit every reference the thread owns: its object part, occupied
    /// value stack slots, activation references, builtins and resumer.
    pub fn for_each_ref(&self, f: &mut impl FnMut(CellRef)) {
        self.object.for_each_ref(f);
        for v in self.valstack.iter() {
            if let Some(r) = v.as_cell() {
                f(r);
            }
        }
        for act in &self.callstack {
            act.for_each_ref(f);
        }
        for r in self.builtins.iter().flatten() {
            f(*r);
        }
        if let Some(r) = self.resumer {
            f(r);
        }
    }

    /// Owned references plus catch variable names
    pub fn for_each_traced_ref(&self, f: &mut impl FnMut(CellRef)) {
        self.for_each_ref(f);
        for r in self.catchstack.iter().filter_map(|c| c.varname) {
            f(r);
        }
    }

    /// Release spare stack capacity
    pub fn shrink(&mut self) {
        self.valstack.shrink_to_fit();
        self.callstack.shrink_to_fit();
        self.catchstack.shrink_to_fit();
    }
}

impl Heap {
    fn thread(&self, r: CellRef) -> HeapResult<&ThreadCell> {
        let cell = self.alloc.get(r).ok_or(HeapError::InvalidHandle)?;
        match &cell.body {
            CellBody::Thread(t) => Ok(t),
            other => Err(HeapError::WrongCellKind {
                expected: CellTag::Thread,
                found: other.tag(),
            }),
        }
    }

    fn thread_mut(&mut self, r: CellRef) -> HeapResult<&mut ThreadCell> {
        let cell = self.alloc.get_mut(r).ok_or(HeapError::InvalidHandle)?;
        match &mut cell.body {
            CellBody::Thread(t) => Ok(t),
            other => Err(HeapError::WrongCellKind {
                expected: CellTag::Thread,
                found: other.tag(),
            }),
        }
    }

    /// Allocate an inactive thread, optionally sharing another thread's
    /// builtins. The new thread's prototype is the `ThreadPrototype` builtin.
    pub fn alloc_thread(&mut self, copy_builtins_from: Option<CellRef>) -> HeapResult<CellRef> {
        let builtins = match copy_builtins_from {
            Some(src) => self.thread(src)?.builtins,
            None => [None; NUM_BUILTINS],
        };
        let proto = builtins[BuiltinId::ThreadPrototype as usize];
        let cell = ThreadCell::new(&self.config, proto, builtins);

        let mut refs = Vec::new();
        cell.for_each_ref(&mut |r| refs.push(r));
        let r = self.alloc_cell(CellBody::Thread(Box::new(cell)))?;
        for child in refs {
            self.incref_cell(child);
        }
        Ok(r)
    }

    pub fn thread_state(&self, thr: CellRef) -> HeapResult<ThreadState> {
        Ok(self.thread(thr)?.state)
    }

    /// The thread currently `Running`, if any
    #[inline]
    pub fn current_thread(&self) -> Option<CellRef> {
        self.curr_thread
    }

    pub fn stack_len(&self, thr: CellRef) -> HeapResult<usize> {
        Ok(self.thread(thr)?.valstack.len())
    }

    pub fn callstack_len(&self, thr: CellRef) -> HeapResult<usize> {
        Ok(self.thread(thr)?.callstack.len())
    }

    pub fn catchstack_len(&self, thr: CellRef) -> HeapResult<usize> {
        Ok(self.thread(thr)?.catchstack.len())
    }

    /// Push a value; the stack slot takes a reference
    pub fn push(&mut self, thr: CellRef, value: Value) -> HeapResult<()> {
        self.check_value(value)?;
        self.thread_mut(thr)?.valstack.push(value)?;
        self.incref(value);
        Ok(())
    }

    /// Pop and release the top value
    pub fn pop(&mut self, thr: CellRef) -> HeapResult<()> {
        let value = self
            .thread_mut(thr)?
            .valstack
            .pop()
            .ok_or(HeapError::StackUnderflow)?;
        self.decref(value);
        Ok(())
    }

    /// Pop and release `n` values
    pub fn pop_n(&mut self, thr: CellRef, n: usize) -> HeapResult<()> {
        let stack = &mut self.thread_mut(thr)?.valstack;
        if stack.len() - stack.bottom() < n {
            return Err(HeapError::StackUnderflow);
        }
        let new_len = stack.len() - n;
        let removed = stack.truncate(new_len);
        for value in removed {
            self.decref(value);
        }
        Ok(())
    }

    /// Borrowed top value
    pub fn peek(&self, thr: CellRef) -> HeapResult<Value> {
        self.thread(thr)?
            .valstack
            .peek()
            .ok_or(HeapError::StackUnderflow)
    }

    /// Borrowed value at absolute index `idx`
    pub fn stack_get(&self, thr: CellRef, idx: usize) -> HeapResult<Value> {
        self.thread(thr)?
            .valstack
            .get(idx)
            .ok_or(HeapError::TypeError("stack index out of range"))
    }

    /// Overwrite a stack slot
    pub fn replace(&mut self, thr: CellRef, idx: usize, value: Value) -> HeapResult<()> {
        self.check_value(value)?;
        let old = self
            .thread_mut(thr)?
            .valstack
            .replace(idx, value)
            .ok_or(HeapError::TypeError("stack index out of range"))?;
        self.incref(value);
        self.decref(old);
        Ok(())
    }

    pub fn builtin(&self, thr: CellRef, id: BuiltinId) -> HeapResult<Option<CellRef>> {
        Ok(self.thread(thr)?.builtins[id as usize])
    }

    pub fn set_builtin(
        &mut self,
        thr: CellRef,
        id: BuiltinId,
        value: Option<CellRef>,
    ) -> HeapResult<()> {
        if let Some(v) = value {
            self.object(v)?;
        }
        let old = std::mem::replace(&mut self.thread_mut(thr)?.builtins[id as usize], value);
        if let Some(v) = value {
            self.incref_cell(v);
        }
        self.decref_or_absent(old);
        Ok(())
    }

    /// Push an activation; the record takes a reference to each cell it
    /// names.
    pub fn push_activation(&mut self, thr: CellRef, act: ActivationRecord) -> HeapResult<()> {
        let func = self.object(act.func)?;
        if !func.class.is_callable() {
            return Err(HeapError::NotCallable);
        }
        for r in [act.var_env, act.lex_env, act.prev_caller].into_iter().flatten() {
            self.object(r)?;
        }

        let t = self.thread_mut(thr)?;
        if t.callstack.len() >= t.callstack_max {
            return Err(HeapError::StackLimit("call stack"));
        }
        t.callstack.push(act);
        if act.flags.contains(ActivationFlags::PREVENT_YIELD) {
            t.callstack_preventcount += 1;
        }
        act.for_each_ref(&mut |r| self.incref_cell(r));
        Ok(())
    }

    pub fn pop_activation(&mut self, thr: CellRef) -> HeapResult<()> {
        let len = self.thread(thr)?.callstack.len();
        if len == 0 {
            return Err(HeapError::StackUnderflow);
        }
        self.unwind_callstack(thr, len - 1)
    }

    /// Pop activations down to `new_len`, dropping their catchers and
    /// releasing their references.
    pub fn unwind_callstack(&mut self, thr: CellRef, new_len: usize) -> HeapResult<()> {
        loop {
            // Re-borrow each round: releases can run finalizers
            let t = self.thread_mut(thr)?;
            if t.callstack.len() <= new_len {
                return Ok(());
            }
            let Some(act) = t.callstack.pop() else {
                return Ok(());
            };
            if act.flags.contains(ActivationFlags::PREVENT_YIELD) {
                t.callstack_preventcount = t.callstack_preventcount.saturating_sub(1);
            }
            let depth = t.callstack.len();
            let keep = t
                .catchstack
                .iter()
                .position(|c| c.callstack_index >= depth)
                .unwrap_or(t.catchstack.len());
            t.catchstack.truncate(keep);
            act.for_each_ref(&mut |r| self.decref_cell(r));
        }
    }

    /// Push a catcher for an activation already on the call stack
    pub fn push_catcher(&mut self, thr: CellRef, rec: CatchRecord) -> HeapResult<()> {
        if let Some(name) = rec.varname {
            self.expect_tag(name, CellTag::String)?;
        }
        let t = self.thread_mut(thr)?;
        if rec.callstack_index >= t.callstack.len() {
            return Err(HeapError::TypeError("catcher without activation"));
        }
        if t.catchstack.len() >= t.catchstack_max {
            return Err(HeapError::StackLimit("catch stack"));
        }
        t.catchstack.push(rec);
        Ok(())
    }

    /// Drop catchers above `new_len`. Catchers own nothing.
    pub fn unwind_catchstack(&mut self, thr: CellRef, new_len: usize) -> HeapResult<()> {
        self.thread_mut(thr)?.catchstack.truncate(new_len);
        Ok(())
    }

    fn expect_state(&self, thr: CellRef, expected: ThreadState) -> HeapResult<()> {
        let found = self.thread(thr)?.state;
        if found == expected {
            Ok(())
        } else {
            Err(HeapError::InvalidThreadState { expected, found })
        }
    }

    fn running_thread(&self) -> HeapResult<CellRef> {
        let curr = self
            .curr_thread
            .ok_or(HeapError::TypeError("no running thread"))?;
        self.expect_state(curr, ThreadState::Running)?;
        Ok(curr)
    }

    /// Start an inactive thread when no other thread is running
    pub fn start_thread(&mut self, thr: CellRef) -> HeapResult<()> {
        self.expect_state(thr, ThreadState::Inactive)?;
        if let Some(curr) = self.curr_thread {
            if self.thread_state(curr)? == ThreadState::Running {
                return Err(HeapError::TypeError("another thread is running"));
            }
        }
        self.thread_mut(thr)?.state = ThreadState::Running;
        self.curr_thread = Some(thr);
        tracing::trace!(?thr, "thread started");
        Ok(())
    }

    /// Resume an inactive or yielded thread from the running one
    pub fn resume_thread(&mut self, target: CellRef) -> HeapResult<()> {
        let curr = self.running_thread()?;
        if curr == target {
            return Err(HeapError::TypeError("thread cannot resume itself"));
        }
        let found = self.thread(target)?.state;
        if !matches!(found, ThreadState::Inactive | ThreadState::Yielded) {
            return Err(HeapError::InvalidThreadState {
                expected: ThreadState::Yielded,
                found,
            });
        }

        self.thread_mut(curr)?.state = ThreadState::Resumed;
        let t = self.thread_mut(target)?;
        t.state = ThreadState::Running;
        let old = t.resumer.replace(curr);
        self.incref_cell(curr);
        self.decref_or_absent(old);
        self.curr_thread = Some(target);
        tracing::trace!(from = ?curr, to = ?target, "thread resumed");
        Ok(())
    }

    /// Suspend the running thread and hand control back to its resumer
    pub fn yield_thread(&mut self) -> HeapResult<()> {
        let curr = self.running_thread()?;
        let t = self.thread(curr)?;
        if t.callstack_preventcount > 0 {
            return Err(HeapError::YieldPrevented);
        }
        let resumer = t
            .resumer
            .ok_or(HeapError::TypeError("thread has no resumer"))?;
        self.expect_state(resumer, ThreadState::Resumed)?;

        let t = self.thread_mut(curr)?;
        t.state = ThreadState::Yielded;
        t.resumer = None;
        self.thread_mut(resumer)?.state = ThreadState::Running;
        self.curr_thread = Some(resumer);
        tracing::trace!(from = ?curr, to = ?resumer, "thread yielded");
        self.decref_cell(resumer);
        Ok(())
    }

    /// Terminate the running thread: unwind all three stacks, release the
    /// resumer and hand control back to it.
    pub fn terminate_thread(&mut self, thr: CellRef) -> HeapResult<()> {
        self.expect_state(thr, ThreadState::Running)?;

        self.unwind_catchstack(thr, 0)?;
        self.unwind_callstack(thr, 0)?;
        let t = self.thread_mut(thr)?;
        t.valstack.set_bottom(0);
        let removed = t.valstack.truncate(0);
        for value in removed {
            self.decref(value);
        }

        let t = self.thread_mut(thr)?;
        t.state = ThreadState::Terminated;
        let resumer = t.resumer.take();
        match resumer {
            Some(res) => {
                if let Ok(rt) = self.thread_mut(res) {
                    rt.state = ThreadState::Running;
                }
                self.curr_thread = Some(res);
            }
            None => {
                if self.curr_thread == Some(thr) {
                    self.curr_thread = None;
                }
            }
        }
        tracing::trace!(?thr, "thread terminated");
        self.decref_or_absent(resumer);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::activation::CatchType;

    fn heap() -> Heap {
        Heap::new(HeapConfig::default().without_voluntary_gc())
    }

    fn function(heap: &mut Heap) -> CellRef {
        heap.alloc_compiled_function(None, vec![], vec![], &[]).unwrap()
    }

    #[test]
    fn test_push_pop_counts() {
        let mut heap = heap();
        let thr = heap.alloc_thread(None).unwrap();
        let obj = heap.alloc_object(None).unwrap();

        heap.push(thr, Value::cell(obj)).unwrap();
        heap.push(thr, Value::int(1)).unwrap();
        assert_eq!(heap.refcount(obj), Some(2));

        heap.pop_n(thr, 2).unwrap();
        assert_eq!(heap.refcount(obj), Some(1));
        assert_eq!(heap.pop(thr), Err(HeapError::StackUnderflow));
    }

    #[test]
    fn test_replace() {
        let mut heap = heap();
        let thr = heap.alloc_thread(None).unwrap();
        let a = heap.alloc_object(None).unwrap();
        let b = heap.alloc_object(None).unwrap();

        heap.push(thr, Value::cell(a)).unwrap();
        heap.replace(thr, 0, Value::cell(b)).unwrap();
        assert_eq!(heap.refcount(a), Some(1));
        assert_eq!(heap.refcount(b), Some(2));
        assert_eq!(heap.stack_get(thr, 0).unwrap(), Value::cell(b));
        assert!(heap.replace(thr, 5, Value::null()).is_err());
    }

    #[test]
    fn test_valstack_limit() {
        let mut heap = Heap::new(HeapConfig::default().with_stack_limits(2, 2, 2));
        let thr = heap.alloc_thread(None).unwrap();

        heap.push(thr, Value::int(1)).unwrap();
        heap.push(thr, Value::int(2)).unwrap();
        assert_eq!(
            heap.push(thr, Value::int(3)),
            Err(HeapError::StackLimit("value stack"))
        );
    }

    #[test]
    fn test_activation_refs() {
        let mut heap = heap();
        let thr = heap.alloc_thread(None).unwrap();
        let f = function(&mut heap);
        let env = heap.alloc_environment(None).unwrap();

        heap.push_activation(thr, ActivationRecord::new(f).with_envs(Some(env), Some(env)))
            .unwrap();
        assert_eq!(heap.refcount(f), Some(2));
        assert_eq!(heap.refcount(env), Some(3));

        heap.pop_activation(thr).unwrap();
        assert_eq!(heap.refcount(f), Some(1));
        assert_eq!(heap.refcount(env), Some(1));
        assert_eq!(heap.pop_activation(thr), Err(HeapError::StackUnderflow));
    }

    #[test]
    fn test_activation_requires_callable() {
        let mut heap = heap();
        let thr = heap.alloc_thread(None).unwrap();
        let obj = heap.alloc_object(None).unwrap();
        assert_eq!(
            heap.push_activation(thr, ActivationRecord::new(obj)),
            Err(HeapError::NotCallable)
        );
    }

    #[test]
    fn test_unwind_drops_catchers() {
        let mut heap = heap();
        let thr = heap.alloc_thread(None).unwrap();
        let f = function(&mut heap);
        let name = heap.intern("e").unwrap();

        heap.push_activation(thr, ActivationRecord::new(f)).unwrap();
        heap.push_activation(thr, ActivationRecord::new(f)).unwrap();
        heap.push_catcher(thr, CatchRecord::new(CatchType::Tcf, 0, 0, 0))
            .unwrap();
        heap.push_catcher(
            thr,
            CatchRecord::new(CatchType::Tcf, 1, 0, 0).with_varname(name),
        )
        .unwrap();
        // Catch names hold no count
        assert_eq!(heap.refcount(name), Some(1));

        heap.pop_activation(thr).unwrap();
        assert_eq!(heap.catchstack_len(thr).unwrap(), 1);
        assert!(
            heap.push_catcher(thr, CatchRecord::new(CatchType::Label, 3, 0, 0))
                .is_err()
        );

        heap.unwind_catchstack(thr, 0).unwrap();
        assert_eq!(heap.catchstack_len(thr).unwrap(), 0);
    }

    #[test]
    fn test_builtins_copied() {
        let mut heap = heap();
        let main = heap.alloc_thread(None).unwrap();
        let global = heap.alloc_object(None).unwrap();
        let tproto = heap.alloc_object(None).unwrap();
        heap.set_builtin(main, BuiltinId::Global, Some(global)).unwrap();
        heap.set_builtin(main, BuiltinId::ThreadPrototype, Some(tproto))
            .unwrap();

        let co = heap.alloc_thread(Some(main)).unwrap();
        assert_eq!(heap.builtin(co, BuiltinId::Global).unwrap(), Some(global));
        assert_eq!(heap.object(co).unwrap().proto, Some(tproto));
        assert_eq!(heap.refcount(global), Some(3));
        // Two builtin slots plus the prototype link
        assert_eq!(heap.refcount(tproto), Some(4));
    }

    #[test]
    fn test_resume_yield() {
        let mut heap = heap();
        let main = heap.alloc_thread(None).unwrap();
        let co = heap.alloc_thread(None).unwrap();

        heap.start_thread(main).unwrap();
        assert_eq!(heap.current_thread(), Some(main));
        heap.resume_thread(co).unwrap();
        assert_eq!(heap.thread_state(main).unwrap(), ThreadState::Resumed);
        assert_eq!(heap.thread_state(co).unwrap(), ThreadState::Running);
        assert_eq!(heap.refcount(main), Some(2));

        heap.yield_thread().unwrap();
        assert_eq!(heap.thread_state(co).unwrap(), ThreadState::Yielded);
        assert_eq!(heap.current_thread(), Some(main));
        assert_eq!(heap.refcount(main), Some(1));

        heap.resume_thread(co).unwrap();
        heap.terminate_thread(co).unwrap();
        assert_eq!(heap.thread_state(co).unwrap(), ThreadState::Terminated);
        assert_eq!(heap.thread_state(main).unwrap(), ThreadState::Running);
        assert_eq!(heap.refcount(main), Some(1));
        assert!(heap.resume_thread(co).is_err());
    }

    #[test]
    fn test_yield_prevented() {
        let mut heap = heap();
        let main = heap.alloc_thread(None).unwrap();
        let co = heap.alloc_thread(None).unwrap();
        let f = function(&mut heap);

        heap.start_thread(main).unwrap();
        heap.resume_thread(co).unwrap();
        heap.push_activation(
            co,
            ActivationRecord::new(f).with_flags(ActivationFlags::PREVENT_YIELD),
        )
        .unwrap();
        assert_eq!(heap.yield_thread(), Err(HeapError::YieldPrevented));

        heap.pop_activation(co).unwrap();
        heap.yield_thread().unwrap();
    }

    #[test]
    fn test_start_requires_inactive() {
        let mut heap = heap();
        let a = heap.alloc_thread(None).unwrap();
        let b = heap.alloc_thread(None).unwrap();

        heap.start_thread(a).unwrap();
        assert!(heap.start_thread(a).is_err());
        assert!(heap.start_thread(b).is_err());
    }

    #[test]
    fn test_terminate_unwinds_stacks() {
        let mut heap = heap();
        let thr = heap.alloc_thread(None).unwrap();
        let f = function(&mut heap);
        let v = heap.alloc_object(None).unwrap();

        heap.start_thread(thr).unwrap();
        heap.push(thr, Value::cell(v)).unwrap();
        heap.push_activation(thr, ActivationRecord::new(f)).unwrap();
        heap.terminate_thread(thr).unwrap();

        assert_eq!(heap.refcount(v), Some(1));
        assert_eq!(heap.refcount(f), Some(1));
        assert_eq!(heap.stack_len(thr).unwrap(), 0);
        assert_eq!(heap.current_thread(), None);
    }
}
