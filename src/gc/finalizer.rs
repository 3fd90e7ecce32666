//! Finalizer capability
//!
//! A finalizer is a native function stored under an internal property key.
//! It is found by ordinary property lookup, so objects inherit the
//! finalizer of their prototype chain.
//!
//! Finalizers run with the dying cell as their only argument. They may
//! allocate, free, store the cell somewhere reachable (rescuing it) or fail;
//! errors and panics are logged and discarded and never reach the caller.

use super::allocator::CellRef;
use super::heap::Heap;
use crate::error::{HeapError, HeapResult};
use crate::runtime::PropertyValue;
use crate::value::Value;
use std::panic::{AssertUnwindSafe, catch_unwind};
use tracing::debug;

/// Internal property key of finalizers
pub const FINALIZER_KEY: &str = "\u{ff}Finalizer";

/// A resolved finalizer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Finalizable {
    /// Object along the prototype chain that holds the finalizer
    pub holder: CellRef,
    pub finalizer: Value,
}

impl Heap {
    fn finalizer_key(&mut self) -> HeapResult<CellRef> {
        match self.finalizer_key {
            Some(key) => Ok(key),
            None => {
                let key = self.intern_static(FINALIZER_KEY)?;
                self.finalizer_key = Some(key);
                Ok(key)
            }
        }
    }

    /// Install (or with `undefined`, clear) the finalizer of an object
    pub fn set_finalizer(&mut self, obj: CellRef, finalizer: Value) -> HeapResult<()> {
        if !finalizer.is_undefined() && !self.is_callable(finalizer) {
            return Err(HeapError::NotCallable);
        }
        let key = self.finalizer_key()?;
        self.put_prop(obj, key, finalizer)
    }

    /// Look up the finalizer of a cell along its prototype chain
    pub fn resolve_finalizer(&self, cell: CellRef) -> Option<Finalizable> {
        let key = self.finalizer_key?;
        match self.find_in_chain(cell, key) {
            Ok(Some((holder, PropertyValue::Data(finalizer)))) if !finalizer.is_undefined() => {
                Some(Finalizable { holder, finalizer })
            }
            Ok(_) => None,
            Err(err) => {
                debug!(?cell, %err, "finalizer lookup failed");
                None
            }
        }
    }

    #[inline]
    pub fn has_finalizer(&self, cell: CellRef) -> bool {
        self.resolve_finalizer(cell).is_some()
    }

    fn is_callable(&self, v: Value) -> bool {
        match v {
            Value::NativeFunc(id) => self.native_fn(id).is_some(),
            Value::Ref(r) => self.object(r).is_ok_and(|o| o.native().is_some()),
            _ => false,
        }
    }

    /// Run a finalizer for `cell`. Never fails.
    pub(crate) fn run_finalizer(&mut self, cell: CellRef, fin: Finalizable) {
        self.counters.finalizer_runs += 1;

        let native = match fin.finalizer {
            Value::NativeFunc(id) => Some(id),
            Value::Ref(r) => self.object(r).ok().and_then(|o| o.native()),
            _ => None,
        }
        .and_then(|id| self.native_fn(id));

        let outcome = match native {
            Some(f) => {
                let args = [Value::cell(cell)];
                match catch_unwind(AssertUnwindSafe(|| f(self, &args))) {
                    Ok(Ok(_)) => Ok(()),
                    Ok(Err(err)) => Err(err),
                    Err(_) => Err(HeapError::Finalizer("finalizer panicked".into())),
                }
            }
            None => Err(HeapError::NotCallable),
        };

        if let Err(err) = outcome {
            self.counters.finalizer_errors += 1;
            debug!(?cell, %err, "finalizer error discarded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapConfig;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn heap() -> Heap {
        Heap::new(HeapConfig::default().without_voluntary_gc())
    }

    #[test]
    fn test_inherited_finalizer() {
        let mut heap = heap();
        let id = heap.register_native(|_, _| Ok(Value::undefined()));
        let proto = heap.alloc_object(None).unwrap();
        let obj = heap.alloc_object(Some(proto)).unwrap();

        assert!(!heap.has_finalizer(obj));
        heap.set_finalizer(proto, Value::native(id)).unwrap();
        assert!(heap.has_finalizer(obj));
        assert_eq!(heap.resolve_finalizer(obj).unwrap().holder, proto);

        heap.set_finalizer(proto, Value::undefined()).unwrap();
        assert!(!heap.has_finalizer(obj));
    }

    #[test]
    fn test_set_finalizer_requires_callable() {
        let mut heap = heap();
        let obj = heap.alloc_object(None).unwrap();
        assert_eq!(
            heap.set_finalizer(obj, Value::int(3)),
            Err(HeapError::NotCallable)
        );
        let plain = heap.alloc_object(None).unwrap();
        assert_eq!(
            heap.set_finalizer(obj, Value::cell(plain)),
            Err(HeapError::NotCallable)
        );
    }

    #[test]
    fn test_native_function_object_as_finalizer() {
        let mut heap = heap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = seen.clone();
        let id = heap.register_native(move |_, args| {
            log.borrow_mut().push(args[0]);
            Ok(Value::undefined())
        });
        let func = heap.alloc_native_function(id, None).unwrap();
        let obj = heap.alloc_object(None).unwrap();
        heap.set_finalizer(obj, Value::cell(func)).unwrap();

        heap.decref_cell(obj);
        assert_eq!(*seen.borrow(), vec![Value::cell(obj)]);
        assert!(!heap.is_live(obj));
        assert_eq!(heap.stats().finalizer_runs, 1);
    }

    #[test]
    fn test_finalizer_error_discarded() {
        let mut heap = heap();
        let id = heap.register_native(|_, _| Err(HeapError::Finalizer("boom".into())));
        let obj = heap.alloc_object(None).unwrap();
        heap.set_finalizer(obj, Value::native(id)).unwrap();

        heap.decref_cell(obj);
        assert!(!heap.is_live(obj));
        assert_eq!(heap.stats().finalizer_errors, 1);
        assert!(!heap.is_drain_running());
    }

    #[test]
    fn test_finalizer_panic_discarded() {
        let mut heap = heap();
        let id = heap.register_native(|_, _| panic!("finalizer panic"));
        let obj = heap.alloc_object(None).unwrap();
        heap.set_finalizer(obj, Value::native(id)).unwrap();

        heap.decref_cell(obj);
        assert!(!heap.is_live(obj));
        assert_eq!(heap.stats().finalizer_errors, 1);
    }
}
