//! Runtime cell kinds
//!
//! This module contains the heap-resident value kinds:
//! - Objects, arrays, functions and environments (`ObjectCell`)
//! - Property storage (`PropertyTable`)
//! - Interned strings and the lookaside cache
//! - Byte buffers

pub mod buffer;
pub mod object;
pub mod property;
pub mod string;

pub use buffer::BufferCell;
pub use object::{ClassId, CompiledFunction, MAX_PROTOTYPE_CHAIN, ObjectCell, ObjectPayload};
pub use property::{PropertyTable, PropertyValue, SetOutcome};
pub use string::{StringCache, StringCell, StringTable};
