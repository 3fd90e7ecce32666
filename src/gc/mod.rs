//! Memory reclamation
//!
//! A hybrid collector:
//! - Deferred reference counting frees acyclic garbage as soon as its last
//!   reference goes away, through a FIFO refzero queue drained by a
//!   non-recursive loop
//! - A fallback mark-and-sweep pass reclaims cycles, triggered by a counter
//!   of refzero frees or by allocation pressure
//!
//! Finalizers may run arbitrary native code from either path. Two guard
//! flags on the [`Heap`] keep drains and sweeps from nesting.

mod allocator;
mod cell;
mod collector;
mod finalizer;
mod heap;
mod refcount;

pub use allocator::{CellRef, ListKind};
pub use cell::{Cell, CellBody, CellHeader, CellTag, HeaderFlags};
pub use collector::{GcStats, SweepFlags};
pub use finalizer::{FINALIZER_KEY, Finalizable};
pub use heap::{Heap, HeapFlags, HeapStats, NativeFn, RootId};
