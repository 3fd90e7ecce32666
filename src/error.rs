//! Heap error type
//!
//! Only fallible heap operations (allocation, handle resolution, property and
//! stack manipulation, thread transitions) report errors. Reference count
//! maintenance never does.

use crate::gc::CellTag;
use crate::vm::ThreadState;

/// Errors produced by heap operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HeapError {
    /// The allocator limit was reached, even after an emergency collection.
    #[error("out of memory")]
    OutOfMemory,

    /// A cell handle was used after the cell was freed.
    #[error("invalid handle")]
    InvalidHandle,

    /// A handle referred to a cell of an unexpected kind.
    #[error("expected {expected:?} cell, found {found:?}")]
    WrongCellKind { expected: CellTag, found: CellTag },

    /// The operation does not apply to this value.
    #[error("type error: {0}")]
    TypeError(&'static str),

    /// Attempted to call a value that has no native entry point.
    #[error("value is not callable")]
    NotCallable,

    /// A prototype chain traversal exceeded [`MAX_PROTOTYPE_CHAIN`](crate::runtime::MAX_PROTOTYPE_CHAIN).
    #[error("prototype chain too deep")]
    PrototypeChainTooDeep,

    /// A per-thread stack reached its configured maximum.
    #[error("{0} limit reached")]
    StackLimit(&'static str),

    /// Popped from an empty stack.
    #[error("stack underflow")]
    StackUnderflow,

    /// A thread transition was requested from the wrong state.
    #[error("invalid thread state: expected {expected:?}, found {found:?}")]
    InvalidThreadState {
        expected: ThreadState,
        found: ThreadState,
    },

    /// A yield was attempted while an activation prevents it.
    #[error("yield prevented by an active native call")]
    YieldPrevented,

    /// Raised by a finalizer. Never escapes the collector.
    #[error("finalizer failed: {0}")]
    Finalizer(String),
}

/// Result alias used throughout the crate.
pub type HeapResult<T> = Result<T, HeapError>;
