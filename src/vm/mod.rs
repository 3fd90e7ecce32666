//! Execution contexts
//!
//! Per-thread root storage: the value stack, call stack (activations),
//! catch stack and builtins table, plus the coroutine state machine.

pub mod activation;
pub mod stack;
pub mod thread;

pub use activation::{ActivationFlags, ActivationRecord, CatchFlags, CatchRecord, CatchType};
pub use stack::ValueStack;
pub use thread::{BuiltinId, NUM_BUILTINS, ThreadCell, ThreadState};
