//! Byte buffers
//!
//! Fixed buffers keep their bytes inline with the cell; dynamic buffers own
//! a separate resizable allocation. Both are leaves.

use crate::error::{HeapError, HeapResult};
use crate::gc::{CellBody, CellRef, CellTag, Heap};

/// A buffer cell body
pub enum BufferCell {
    Fixed(Box<[u8]>),
    Dynamic(Vec<u8>),
}

impl BufferCell {
    /// Zero-filled fixed buffer
    pub fn fixed(len: usize) -> Self {
        BufferCell::Fixed(vec![0; len].into_boxed_slice())
    }

    /// Zero-filled dynamic buffer
    pub fn dynamic(len: usize) -> Self {
        BufferCell::Dynamic(vec![0; len])
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn is_dynamic(&self) -> bool {
        matches!(self, BufferCell::Dynamic(_))
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        match self {
            BufferCell::Fixed(b) => b,
            BufferCell::Dynamic(v) => v,
        }
    }

    #[inline]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        match self {
            BufferCell::Fixed(b) => b,
            BufferCell::Dynamic(v) => v,
        }
    }
}

impl Heap {
    /// Allocate a zero-filled buffer, returning an owned reference
    pub fn alloc_buffer(&mut self, len: usize, dynamic: bool) -> HeapResult<CellRef> {
        let body = if dynamic {
            BufferCell::dynamic(len)
        } else {
            BufferCell::fixed(len)
        };
        self.alloc_cell(CellBody::Buffer(body))
    }

    /// Allocate a fixed buffer holding a copy of `data`
    pub fn alloc_buffer_from(&mut self, data: &[u8]) -> HeapResult<CellRef> {
        self.alloc_cell(CellBody::Buffer(BufferCell::Fixed(data.into())))
    }

    fn buffer_cell_mut(&mut self, r: CellRef) -> HeapResult<&mut BufferCell> {
        let cell = self.alloc.get_mut(r).ok_or(HeapError::InvalidHandle)?;
        match &mut cell.body {
            CellBody::Buffer(b) => Ok(b),
            other => Err(HeapError::WrongCellKind {
                expected: CellTag::Buffer,
                found: other.tag(),
            }),
        }
    }

    pub fn buffer_bytes(&self, r: CellRef) -> HeapResult<&[u8]> {
        let cell = self.alloc.get(r).ok_or(HeapError::InvalidHandle)?;
        match &cell.body {
            CellBody::Buffer(b) => Ok(b.bytes()),
            other => Err(HeapError::WrongCellKind {
                expected: CellTag::Buffer,
                found: other.tag(),
            }),
        }
    }

    pub fn buffer_bytes_mut(&mut self, r: CellRef) -> HeapResult<&mut [u8]> {
        Ok(self.buffer_cell_mut(r)?.bytes_mut())
    }

    /// Resize a dynamic buffer. New bytes are zero.
    pub fn buffer_resize(&mut self, r: CellRef, new_len: usize) -> HeapResult<()> {
        let buf = self.buffer_cell_mut(r)?;
        if !buf.is_dynamic() {
            return Err(HeapError::TypeError("buffer is not dynamic"));
        }
        let old_len = buf.len();
        let new_bytes = std::mem::size_of::<crate::gc::Cell>() + new_len;
        if !self.alloc.reaccount(r.index(), new_bytes) {
            // Grow after freeing what we can, once
            self.run_mark_and_sweep(crate::gc::SweepFlags::EMERGENCY);
            // The pass may have freed the buffer along with its last owner
            let idx = self.alloc.resolve(r).ok_or(HeapError::InvalidHandle)?;
            if !self.alloc.reaccount(idx, new_bytes) {
                return Err(HeapError::OutOfMemory);
            }
        }
        if let BufferCell::Dynamic(v) = self.buffer_cell_mut(r)? {
            v.resize(new_len, 0);
            if new_len < old_len {
                v.shrink_to_fit();
            }
        }
        Ok(())
    }
}
