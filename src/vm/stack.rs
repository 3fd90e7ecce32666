//! Value stack of a thread
//!
//! Plain storage only. The heap's thread operations pair every stored
//! reference with a count; this type never touches refcounts.

use crate::error::{HeapError, HeapResult};
use crate::value::Value;

/// Bounded value stack
pub struct ValueStack {
    values: Vec<Value>,
    /// Bottom of the current activation's frame
    bottom: usize,
    max: usize,
}

impl ValueStack {
    /// Create an empty stack holding at most `max` values
    pub fn new(max: usize) -> Self {
        ValueStack {
            values: Vec::new(),
            bottom: 0,
            max,
        }
    }

    /// Push a value onto the stack
    #[inline]
    pub fn push(&mut self, value: Value) -> HeapResult<()> {
        if self.values.len() >= self.max {
            return Err(HeapError::StackLimit("value stack"));
        }
        self.values.push(value);
        Ok(())
    }

    /// Pop a value from the stack
    #[inline]
    pub fn pop(&mut self) -> Option<Value> {
        if self.values.len() <= self.bottom {
            return None;
        }
        self.values.pop()
    }

    /// Peek at the top value without removing it
    #[inline]
    pub fn peek(&self) -> Option<Value> {
        self.values.last().copied()
    }

    /// Peek at a value at offset from top (0 = top)
    #[inline]
    pub fn peek_at(&self, offset: usize) -> Option<Value> {
        let len = self.values.len();
        if offset < len {
            Some(self.values[len - 1 - offset])
        } else {
            None
        }
    }

    #[inline]
    pub fn get(&self, idx: usize) -> Option<Value> {
        self.values.get(idx).copied()
    }

    /// Overwrite slot `idx`, handing back the previous value
    pub fn replace(&mut self, idx: usize, value: Value) -> Option<Value> {
        self.values
            .get_mut(idx)
            .map(|slot| std::mem::replace(slot, value))
    }

    /// Get the current stack depth
    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[inline]
    pub fn max(&self) -> usize {
        self.max
    }

    #[inline]
    pub fn bottom(&self) -> usize {
        self.bottom
    }

    /// Set the frame bottom; values below it cannot be popped
    pub fn set_bottom(&mut self, bottom: usize) {
        self.bottom = bottom.min(self.values.len());
    }

    /// Cut the stack down to `len`, handing back the removed values top
    /// first.
    pub fn truncate(&mut self, len: usize) -> Vec<Value> {
        if len >= self.values.len() {
            return Vec::new();
        }
        let mut removed = self.values.split_off(len);
        removed.reverse();
        self.bottom = self.bottom.min(len);
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.values.iter()
    }

    pub fn shrink_to_fit(&mut self) {
        self.values.shrink_to_fit();
    }
}
