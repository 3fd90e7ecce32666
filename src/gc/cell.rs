//! Heap cell model
//!
//! Every collectible value lives in a [`Cell`]: a small header (type tag,
//! reference count, collector flags) followed by a kind-specific body.
//!
//! ```text
//! +-----------------------+
//! | refcount | flags      |  CellHeader
//! +-----------------------+
//! | String | Object |     |  CellBody
//! | Buffer | Thread       |
//! +-----------------------+
//! ```
//!
//! Strings and buffers are leaves. Objects and threads are composite: they
//! own outgoing references, which [`CellBody::for_each_ref`] enumerates for
//! both the refzero cascade and the mark phase.

use super::CellRef;
use crate::runtime::{BufferCell, ObjectCell, StringCell};
use crate::vm::ThreadCell;
use bitflags::bitflags;

/// Cell type tags
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CellTag {
    String = 0,
    Object = 1,
    Buffer = 2,
    Thread = 3,
}

impl CellTag {
    pub const COUNT: usize = 4;

    /// Composite cells own references and live on the heap lists.
    #[inline]
    pub const fn is_composite(self) -> bool {
        matches!(self, CellTag::Object | CellTag::Thread)
    }
}

bitflags! {
    /// Collector bits stored in every cell header.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct HeaderFlags: u8 {
        /// Marked during the current mark-and-sweep pass
        const REACHABLE = 1 << 0;
        /// Unreachable, its finalizer runs at the end of the current pass
        const FINALIZABLE = 1 << 1;
        /// Finalizer already ran; cleared again when the cell is rescued
        const FINALIZED = 1 << 2;
    }
}

/// Reference count and collector flags.
///
/// The count is only changed through [`acquire`](Self::acquire) and
/// [`release`](Self::release).
#[derive(Debug, Clone, Copy)]
pub struct CellHeader {
    refcount: u32,
    pub flags: HeaderFlags,
}

impl CellHeader {
    /// Header of a freshly allocated cell (one reference, held by the creator)
    #[inline]
    pub const fn new() -> Self {
        CellHeader {
            refcount: 1,
            flags: HeaderFlags::empty(),
        }
    }

    #[inline]
    pub const fn refcount(&self) -> u32 {
        self.refcount
    }

    /// Take one more reference.
    #[inline]
    pub fn acquire(&mut self) {
        self.refcount += 1;
    }

    /// Drop one reference. Returns `true` when this was the last one.
    ///
    /// Underflow is a heap corruption: it asserts in debug builds and leaves
    /// the count at zero otherwise.
    #[inline]
    #[must_use]
    pub fn release(&mut self) -> bool {
        debug_assert!(self.refcount > 0, "refcount underflow");
        match self.refcount.checked_sub(1) {
            Some(n) => {
                self.refcount = n;
                n == 0
            }
            None => {
                tracing::error!("refcount underflow");
                false
            }
        }
    }

    #[inline]
    pub fn has(&self, flag: HeaderFlags) -> bool {
        self.flags.contains(flag)
    }
}

impl Default for CellHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Kind-specific cell payload
pub enum CellBody {
    String(StringCell),
    Object(ObjectCell),
    Buffer(BufferCell),
    Thread(Box<ThreadCell>),
}

impl CellBody {
    #[inline]
    pub fn tag(&self) -> CellTag {
        match self {
            CellBody::String(_) => CellTag::String,
            CellBody::Object(_) => CellTag::Object,
            CellBody::Buffer(_) => CellTag::Buffer,
            CellBody::Thread(_) => CellTag::Thread,
        }
    }

    /// Object part of an object or thread cell
    #[inline]
    pub fn as_object(&self) -> Option<&ObjectCell> {
        match self {
            CellBody::Object(obj) => Some(obj),
            CellBody::Thread(thr) => Some(&thr.object),
            _ => None,
        }
    }

    #[inline]
    pub fn as_object_mut(&mut self) -> Option<&mut ObjectCell> {
        match self {
            CellBody::Object(obj) => Some(obj),
            CellBody::Thread(thr) => Some(&mut thr.object),
            _ => None,
        }
    }

    /// Approximate size accounted to the allocator
    pub fn size_bytes(&self) -> usize {
        let base = std::mem::size_of::<Cell>();
        match self {
            CellBody::String(s) => base + s.as_str().len(),
            CellBody::Buffer(b) => base + b.len(),
            CellBody::Object(obj) => base + obj.payload_bytes(),
            CellBody::Thread(thr) => {
                base + std::mem::size_of::<ThreadCell>() + thr.object.payload_bytes()
            }
        }
    }

    /// Visit every reference this cell owns (one count each).
    pub fn for_each_ref(&self, f: &mut impl FnMut(CellRef)) {
        match self {
            CellBody::String(_) | CellBody::Buffer(_) => {}
            CellBody::Object(obj) => obj.for_each_ref(f),
            CellBody::Thread(thr) => thr.for_each_ref(f),
        }
    }

    /// Visit every reference the mark phase follows. This is the owned set
    /// plus borrowed scope-bound references such as catch variable names.
    pub fn for_each_traced_ref(&self, f: &mut impl FnMut(CellRef)) {
        match self {
            CellBody::Thread(thr) => thr.for_each_traced_ref(f),
            _ => self.for_each_ref(f),
        }
    }
}

/// A heap cell: header plus body
pub struct Cell {
    pub header: CellHeader,
    pub body: CellBody,
}

impl Cell {
    #[inline]
    pub fn new(body: CellBody) -> Self {
        Cell {
            header: CellHeader::new(),
            body,
        }
    }

    #[inline]
    pub fn tag(&self) -> CellTag {
        self.body.tag()
    }
}
