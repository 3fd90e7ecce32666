//! Runtime value representation
//!
//! A `Value` is either an immediate or an owning reference to a heap cell.
//!
//! # Value kinds
//! - Undefined, Null, Bool, Number: plain immediates
//! - NativeFunc: a native function pointer (index into the heap's registry),
//!   also an immediate
//! - Ref: a reference to a String, Object, Buffer or Thread cell
//!
//! Storing a `Ref` anywhere stable (stack slot, property slot, root) holds
//! exactly one reference count on the cell; overwriting or removing it
//! releases exactly one.

use crate::gc::CellRef;
use std::fmt;

/// Index of a native function in the heap's registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct NativeFunctionId(pub(crate) u32);

impl NativeFunctionId {
    /// Registry index
    #[inline]
    pub fn index(self) -> u32 {
        self.0
    }
}

/// Tagged runtime value
#[derive(Clone, Copy, PartialEq)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    NativeFunc(NativeFunctionId),
    Ref(CellRef),
}

impl Value {
    /// Create an undefined value
    #[inline]
    pub const fn undefined() -> Self {
        Value::Undefined
    }

    /// Create a null value
    #[inline]
    pub const fn null() -> Self {
        Value::Null
    }

    /// Create a boolean value
    #[inline]
    pub const fn bool(b: bool) -> Self {
        Value::Bool(b)
    }

    /// Create a number value
    #[inline]
    pub const fn number(n: f64) -> Self {
        Value::Number(n)
    }

    /// Create a number value from an integer
    #[inline]
    pub const fn int(n: i32) -> Self {
        Value::Number(n as f64)
    }

    /// Create a native function immediate
    #[inline]
    pub const fn native(id: NativeFunctionId) -> Self {
        Value::NativeFunc(id)
    }

    /// Create a reference to a heap cell
    #[inline]
    pub const fn cell(r: CellRef) -> Self {
        Value::Ref(r)
    }

    #[inline]
    pub fn is_undefined(self) -> bool {
        matches!(self, Value::Undefined)
    }

    #[inline]
    pub fn is_null(self) -> bool {
        matches!(self, Value::Null)
    }

    /// Check if this value refers to a heap cell
    #[inline]
    pub fn is_heap_allocated(self) -> bool {
        matches!(self, Value::Ref(_))
    }

    /// Get the referenced cell, if any
    #[inline]
    pub fn as_cell(self) -> Option<CellRef> {
        match self {
            Value::Ref(r) => Some(r),
            _ => None,
        }
    }

    #[inline]
    pub fn to_bool(self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(b),
            _ => None,
        }
    }

    #[inline]
    pub fn to_f64(self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(n),
            _ => None,
        }
    }

    /// Get the value as an integer, if it is an integral number
    pub fn to_i32(self) -> Option<i32> {
        match self {
            Value::Number(n) if n.fract() == 0.0 && n >= i32::MIN as f64 && n <= i32::MAX as f64 => {
                Some(n as i32)
            }
            _ => None,
        }
    }

    #[inline]
    pub fn as_native(self) -> Option<NativeFunctionId> {
        match self {
            Value::NativeFunc(id) => Some(id),
            _ => None,
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::undefined()
    }
}

impl From<CellRef> for Value {
    fn from(r: CellRef) -> Self {
        Value::Ref(r)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "Undefined"),
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "Bool({})", b),
            Value::Number(n) => write!(f, "Number({})", n),
            Value::NativeFunc(id) => write!(f, "NativeFunc({})", id.0),
            Value::Ref(r) => write!(f, "Ref({:?})", r),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::NativeFunc(id) => write!(f, "[native function {}]", id.0),
            Value::Ref(r) => write!(f, "[cell {}:{}]", r.index(), r.generation()),
        }
    }
}
