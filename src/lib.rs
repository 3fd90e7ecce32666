//! refzero - heap and hybrid collector for an embedded dynamic-language
//! runtime
//!
//! Heap cells (strings, objects, buffers, threads) are reference counted.
//! Acyclic garbage is reclaimed eagerly through a FIFO refzero queue that
//! frees arbitrarily deep graphs without recursion; cycles fall to a
//! mark-and-sweep pass. User finalizers may run arbitrary code from either
//! path, including rescuing the dying cell.
//!
//! # Example
//! ```
//! use refzero::{Context, HeapConfig, Value};
//!
//! let mut ctx = Context::new(HeapConfig::default()).unwrap();
//! let heap = ctx.heap_mut();
//!
//! let key = heap.intern("next").unwrap();
//! let a = heap.alloc_object(None).unwrap();
//! let b = heap.alloc_object(None).unwrap();
//! heap.put_prop(a, key, Value::cell(b)).unwrap();
//! heap.decref(Value::cell(b));
//!
//! // Dropping the last reference to `a` frees `b` too
//! heap.decref(Value::cell(a));
//! assert!(!heap.is_live(b));
//! ```

// Core modules
pub mod config;
pub mod context;
pub mod error;
pub mod value;

// Collector
pub mod gc;

// Execution contexts
pub mod vm;

// Cell kinds
pub mod runtime;

// Re-export main types
pub use config::HeapConfig;
pub use context::Context;
pub use error::{HeapError, HeapResult};
pub use gc::{CellRef, Heap, SweepFlags};
pub use value::{NativeFunctionId, Value};
