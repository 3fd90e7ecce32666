//! Slot arena for heap cells
//!
//! Memory layout:
//! ```text
//! slots:     [ Slot 0 | Slot 1 | Slot 2 | ... ]
//!              generation, links, bytes, Option<Cell>
//!
//! allocated: head <-> ... <-> tail     (live objects and threads)
//! refzero:   head  -> ... ->  tail     (FIFO, tail insert, head process)
//! ```
//!
//! Cells are addressed by [`CellRef`] (slot index + generation). Composite
//! cells are threaded through the intrusive `prev`/`next` links of their
//! slot, so moving a cell between lists never allocates.

use super::cell::{Cell, CellTag};
use std::fmt;

/// A stable handle to a heap cell.
///
/// The generation is bumped every time the slot is freed, so a handle that
/// outlived its cell never aliases a newer cell in the same slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellRef {
    index: u32,
    generation: u32,
}

impl CellRef {
    #[inline]
    pub(crate) const fn from_parts(index: u32, generation: u32) -> Self {
        CellRef { index, generation }
    }

    /// The slot index within the heap
    #[inline]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// The slot generation when this handle was created
    #[inline]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CellRef")
            .field("index", &self.index)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Which heap list a slot is threaded on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListKind {
    #[default]
    None,
    Allocated,
    RefZero,
}

#[derive(Debug, Clone, Copy, Default)]
struct Links {
    prev: Option<u32>,
    next: Option<u32>,
    list: ListKind,
}

struct Slot {
    generation: u32,
    links: Links,
    bytes: usize,
    cell: Option<Cell>,
}

#[derive(Debug, Clone, Copy, Default)]
struct CellList {
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
}

/// The cell allocator
///
/// Hands out slots, accounts their approximate size against a byte limit,
/// and maintains the two intrusive heap lists.
pub struct Allocator {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
    used_bytes: usize,
    max_bytes: usize,
    allocated: CellList,
    refzero: CellList,
}

impl Allocator {
    /// Create an allocator with the given byte limit
    pub fn new(max_bytes: usize) -> Self {
        Allocator {
            slots: Vec::new(),
            free_list: Vec::new(),
            used_bytes: 0,
            max_bytes,
            allocated: CellList::default(),
            refzero: CellList::default(),
        }
    }

    /// Get the number of accounted bytes in use
    #[inline]
    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    #[inline]
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Number of occupied slots
    #[inline]
    pub fn live_count(&self) -> usize {
        self.slots.len() - self.free_list.len()
    }

    /// Number of slots ever created
    #[inline]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Allocate a slot for `cell`.
    ///
    /// On failure the cell is handed back so the caller can retry after a
    /// collection. Composite cells are linked at the head of the allocated
    /// list.
    pub fn try_alloc(&mut self, cell: Cell) -> Result<CellRef, Cell> {
        let bytes = cell.body.size_bytes();
        if self.used_bytes.saturating_add(bytes) > self.max_bytes {
            return Err(cell);
        }

        let composite = cell.tag().is_composite();
        let idx = match self.free_list.pop() {
            Some(idx) => idx,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    links: Links::default(),
                    bytes: 0,
                    cell: None,
                });
                (self.slots.len() - 1) as u32
            }
        };

        let slot = &mut self.slots[idx as usize];
        debug_assert!(slot.cell.is_none());
        debug_assert_eq!(slot.links.list, ListKind::None);
        slot.cell = Some(cell);
        slot.bytes = bytes;
        self.used_bytes += bytes;

        let r = CellRef::from_parts(idx, slot.generation);
        if composite {
            self.link_head(ListKind::Allocated, idx);
        }
        Ok(r)
    }

    /// Release a slot and hand back its cell.
    ///
    /// The slot must already be unlinked from any heap list.
    pub fn free_index(&mut self, idx: u32) -> Option<Cell> {
        let slot = self.slots.get_mut(idx as usize)?;
        debug_assert_eq!(slot.links.list, ListKind::None, "freeing a linked slot");
        let cell = slot.cell.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.used_bytes = self.used_bytes.saturating_sub(slot.bytes);
        slot.bytes = 0;
        self.free_list.push(idx);
        Some(cell)
    }

    /// Adjust the accounted size of a live slot (dynamic buffer resize).
    pub fn reaccount(&mut self, idx: u32, bytes: usize) -> bool {
        let Some(slot) = self.slots.get_mut(idx as usize) else {
            return false;
        };
        if slot.cell.is_none() {
            return false;
        }
        let new_used = self.used_bytes - slot.bytes + bytes;
        if bytes > slot.bytes && new_used > self.max_bytes {
            return false;
        }
        self.used_bytes = new_used;
        slot.bytes = bytes;
        true
    }

    /// Resolve a handle to its slot index if the cell is still alive
    #[inline]
    pub fn resolve(&self, r: CellRef) -> Option<u32> {
        let slot = self.slots.get(r.index as usize)?;
        (slot.generation == r.generation && slot.cell.is_some()).then_some(r.index)
    }

    #[inline]
    pub fn get(&self, r: CellRef) -> Option<&Cell> {
        let slot = self.slots.get(r.index as usize)?;
        if slot.generation != r.generation {
            return None;
        }
        slot.cell.as_ref()
    }

    #[inline]
    pub fn get_mut(&mut self, r: CellRef) -> Option<&mut Cell> {
        let slot = self.slots.get_mut(r.index as usize)?;
        if slot.generation != r.generation {
            return None;
        }
        slot.cell.as_mut()
    }

    #[inline]
    pub fn cell_at(&self, idx: u32) -> Option<&Cell> {
        self.slots.get(idx as usize)?.cell.as_ref()
    }

    #[inline]
    pub fn cell_at_mut(&mut self, idx: u32) -> Option<&mut Cell> {
        self.slots.get_mut(idx as usize)?.cell.as_mut()
    }

    /// Current handle for an occupied slot
    #[inline]
    pub fn handle_at(&self, idx: u32) -> CellRef {
        CellRef::from_parts(idx, self.slots[idx as usize].generation)
    }

    /// Which list the slot is on
    #[inline]
    pub fn list_of(&self, idx: u32) -> ListKind {
        self.slots
            .get(idx as usize)
            .map_or(ListKind::None, |slot| slot.links.list)
    }

    fn list_mut(&mut self, kind: ListKind) -> &mut CellList {
        match kind {
            ListKind::Allocated => &mut self.allocated,
            ListKind::RefZero => &mut self.refzero,
            ListKind::None => unreachable!("ListKind::None has no list head"),
        }
    }

    fn list(&self, kind: ListKind) -> CellList {
        match kind {
            ListKind::Allocated => self.allocated,
            ListKind::RefZero => self.refzero,
            ListKind::None => CellList::default(),
        }
    }

    /// Insert at the head of a list
    pub fn link_head(&mut self, kind: ListKind, idx: u32) {
        debug_assert_eq!(self.slots[idx as usize].links.list, ListKind::None);
        let old_head = self.list(kind).head;
        self.slots[idx as usize].links = Links {
            prev: None,
            next: old_head,
            list: kind,
        };
        match old_head {
            Some(h) => self.slots[h as usize].links.prev = Some(idx),
            None => self.list_mut(kind).tail = Some(idx),
        }
        let list = self.list_mut(kind);
        list.head = Some(idx);
        list.len += 1;
    }

    /// Insert at the tail of a list. The head is never disturbed.
    pub fn link_tail(&mut self, kind: ListKind, idx: u32) {
        debug_assert_eq!(self.slots[idx as usize].links.list, ListKind::None);
        let old_tail = self.list(kind).tail;
        self.slots[idx as usize].links = Links {
            prev: old_tail,
            next: None,
            list: kind,
        };
        match old_tail {
            Some(t) => {
                debug_assert!(self.slots[t as usize].links.next.is_none());
                self.slots[t as usize].links.next = Some(idx);
            }
            None => self.list_mut(kind).head = Some(idx),
        }
        let list = self.list_mut(kind);
        list.tail = Some(idx);
        list.len += 1;
    }

    /// Remove a slot from whichever list it is on
    pub fn unlink(&mut self, idx: u32) {
        let links = self.slots[idx as usize].links;
        if links.list == ListKind::None {
            return;
        }
        match links.prev {
            Some(p) => self.slots[p as usize].links.next = links.next,
            None => self.list_mut(links.list).head = links.next,
        }
        match links.next {
            Some(n) => self.slots[n as usize].links.prev = links.prev,
            None => self.list_mut(links.list).tail = links.prev,
        }
        let list = self.list_mut(links.list);
        list.len -= 1;
        self.slots[idx as usize].links = Links::default();
    }

    /// First entry of a list
    #[inline]
    pub fn head(&self, kind: ListKind) -> Option<u32> {
        self.list(kind).head
    }

    #[inline]
    pub fn list_len(&self, kind: ListKind) -> usize {
        self.list(kind).len
    }

    /// Iterate over the slot indices of a list, head to tail
    pub fn iter_list(&self, kind: ListKind) -> ListIter<'_> {
        ListIter {
            alloc: self,
            next: self.list(kind).head,
        }
    }

    /// Iterate over all occupied slots
    pub fn iter_cells(&self) -> impl Iterator<Item = (u32, &Cell)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.cell.as_ref().map(|cell| (idx as u32, cell)))
    }

    /// Iterate mutably over all occupied slots
    pub fn iter_cells_mut(&mut self) -> impl Iterator<Item = (u32, &mut Cell)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(idx, slot)| slot.cell.as_mut().map(|cell| (idx as u32, cell)))
    }

    /// Count live cells of each tag
    pub fn count_by_tag(&self) -> [usize; CellTag::COUNT] {
        let mut counts = [0; CellTag::COUNT];
        for (_, cell) in self.iter_cells() {
            counts[cell.tag() as usize] += 1;
        }
        counts
    }
}

/// Iterator over a heap list
pub struct ListIter<'a> {
    alloc: &'a Allocator,
    next: Option<u32>,
}

impl Iterator for ListIter<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        let idx = self.next?;
        self.next = self.alloc.slots[idx as usize].links.next;
        Some(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::cell::CellBody;
    use crate::runtime::{BufferCell, ObjectCell};

    fn object() -> Cell {
        Cell::new(CellBody::Object(ObjectCell::new(None)))
    }

    fn buffer(len: usize) -> Cell {
        Cell::new(CellBody::Buffer(BufferCell::fixed(len)))
    }

    #[test]
    fn test_allocator_creation() {
        let alloc = Allocator::new(1024);
        assert_eq!(alloc.used_bytes(), 0);
        assert_eq!(alloc.live_count(), 0);
        assert_eq!(alloc.max_bytes(), 1024);
    }

    #[test]
    fn test_alloc() {
        let mut alloc = Allocator::new(1 << 20);

        let r = alloc.try_alloc(object()).ok().unwrap();
        assert!(alloc.used_bytes() > 0);
        assert_eq!(alloc.get(r).unwrap().tag(), CellTag::Object);
        assert_eq!(alloc.list_of(r.index()), ListKind::Allocated);
        assert_eq!(alloc.list_len(ListKind::Allocated), 1);
    }

    #[test]
    fn test_leaf_cells_are_not_listed() {
        let mut alloc = Allocator::new(1 << 20);

        let r = alloc.try_alloc(buffer(16)).ok().unwrap();
        assert_eq!(alloc.list_of(r.index()), ListKind::None);
        assert_eq!(alloc.list_len(ListKind::Allocated), 0);
    }

    #[test]
    fn test_out_of_memory() {
        let mut alloc = Allocator::new(64);
        assert!(alloc.try_alloc(buffer(1024)).is_err());
        assert_eq!(alloc.used_bytes(), 0);
    }

    #[test]
    fn test_free_bumps_generation() {
        let mut alloc = Allocator::new(1 << 20);

        let r = alloc.try_alloc(buffer(8)).ok().unwrap();
        assert!(alloc.free_index(r.index()).is_some());
        assert!(alloc.get(r).is_none());
        assert_eq!(alloc.used_bytes(), 0);

        // Slot is reused with a new generation
        let r2 = alloc.try_alloc(buffer(8)).ok().unwrap();
        assert_eq!(r2.index(), r.index());
        assert_ne!(r2.generation(), r.generation());
        assert!(alloc.resolve(r).is_none());
        assert!(alloc.resolve(r2).is_some());
    }

    #[test]
    fn test_refzero_fifo() {
        let mut alloc = Allocator::new(1 << 20);

        let a = alloc.try_alloc(object()).ok().unwrap().index();
        let b = alloc.try_alloc(object()).ok().unwrap().index();
        let c = alloc.try_alloc(object()).ok().unwrap().index();

        for idx in [a, b, c] {
            alloc.unlink(idx);
            alloc.link_tail(ListKind::RefZero, idx);
        }

        assert_eq!(alloc.list_len(ListKind::Allocated), 0);
        let order: Vec<_> = alloc.iter_list(ListKind::RefZero).collect();
        assert_eq!(order, vec![a, b, c]);
        assert_eq!(alloc.head(ListKind::RefZero), Some(a));
    }

    #[test]
    fn test_unlink_middle() {
        let mut alloc = Allocator::new(1 << 20);

        let a = alloc.try_alloc(object()).ok().unwrap().index();
        let b = alloc.try_alloc(object()).ok().unwrap().index();
        let c = alloc.try_alloc(object()).ok().unwrap().index();

        alloc.unlink(b);
        let order: Vec<_> = alloc.iter_list(ListKind::Allocated).collect();
        assert_eq!(order, vec![c, a]);
        assert_eq!(alloc.list_of(b), ListKind::None);

        alloc.unlink(a);
        alloc.unlink(c);
        assert_eq!(alloc.head(ListKind::Allocated), None);
        assert_eq!(alloc.list_len(ListKind::Allocated), 0);
    }

    #[test]
    fn test_reaccount() {
        let mut alloc = Allocator::new(4096);

        let r = alloc.try_alloc(buffer(0)).ok().unwrap();
        let before = alloc.used_bytes();
        assert!(alloc.reaccount(r.index(), before + 100));
        assert_eq!(alloc.used_bytes(), before + 100);

        // Growing past the limit is refused
        assert!(!alloc.reaccount(r.index(), 1 << 20));
        assert_eq!(alloc.used_bytes(), before + 100);
    }

    #[test]
    fn test_count_by_tag() {
        let mut alloc = Allocator::new(1 << 20);

        alloc.try_alloc(object()).ok().unwrap();
        alloc.try_alloc(object()).ok().unwrap();
        alloc.try_alloc(buffer(4)).ok().unwrap();

        let counts = alloc.count_by_tag();
        assert_eq!(counts[CellTag::Object as usize], 2);
        assert_eq!(counts[CellTag::Buffer as usize], 1);
        assert_eq!(counts[CellTag::String as usize], 0);
    }
}
