//! Immutable string cells, interning and the lookaside cache
//!
//! Strings are stored as UTF-8. Every string cell is interned: the
//! [`StringTable`] maps content to the one live cell holding it. The table
//! and the [`StringCache`] are weak; neither holds a reference count, and a
//! string's zero transition scrubs it from both before the cell is freed.

use crate::error::{HeapError, HeapResult};
use crate::gc::{CellBody, CellRef, CellTag, Heap};

enum StringData {
    Owned(Box<str>),
    /// Backed by static storage; freeing the cell releases only the header
    External(&'static str),
}

/// A string cell body
pub struct StringCell {
    hash: u32,
    char_len: u32,
    data: StringData,
}

impl StringCell {
    pub fn owned(s: &str, hash: u32) -> Self {
        StringCell {
            hash,
            char_len: s.chars().count() as u32,
            data: StringData::Owned(s.into()),
        }
    }

    pub fn external(s: &'static str, hash: u32) -> Self {
        StringCell {
            hash,
            char_len: s.chars().count() as u32,
            data: StringData::External(s),
        }
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        match &self.data {
            StringData::Owned(s) => s,
            StringData::External(s) => s,
        }
    }

    #[inline]
    pub fn hash(&self) -> u32 {
        self.hash
    }

    /// Length in characters
    #[inline]
    pub fn char_len(&self) -> usize {
        self.char_len as usize
    }

    /// Check if string is ASCII-only (byte and char offsets coincide)
    #[inline]
    pub fn is_ascii(&self) -> bool {
        self.char_len as usize == self.as_str().len()
    }

    #[inline]
    pub fn is_external(&self) -> bool {
        matches!(self.data, StringData::External(_))
    }
}

/// String interning table
///
/// Buckets hold `(hash, cell)` pairs. Content comparison needs the heap, so
/// lookups take an equality callback.
pub struct StringTable {
    buckets: Vec<Vec<(u32, CellRef)>>,
    hash_mask: u32,
    count: usize,
}

impl StringTable {
    /// Initial bucket count (power of 2)
    const INITIAL_SIZE: usize = 256;

    pub fn new() -> Self {
        StringTable {
            buckets: vec![Vec::new(); Self::INITIAL_SIZE],
            hash_mask: (Self::INITIAL_SIZE - 1) as u32,
            count: 0,
        }
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Hash a string for table lookup
    #[inline]
    pub fn hash_string(s: &str) -> u32 {
        let mut h: u32 = 0;
        for b in s.bytes() {
            h = h.wrapping_mul(31).wrapping_add(b as u32);
        }
        h
    }

    /// Find an interned cell with this hash for which `eq` holds
    pub fn lookup(&self, hash: u32, mut eq: impl FnMut(CellRef) -> bool) -> Option<CellRef> {
        self.buckets[(hash & self.hash_mask) as usize]
            .iter()
            .find(|&&(h, r)| h == hash && eq(r))
            .map(|&(_, r)| r)
    }

    pub fn insert(&mut self, hash: u32, r: CellRef) {
        if self.count + 1 > self.buckets.len() * 2 {
            self.resize();
        }
        self.buckets[(hash & self.hash_mask) as usize].push((hash, r));
        self.count += 1;
    }

    /// Remove a cell by handle identity. Returns whether it was present.
    pub fn remove_by_identity(&mut self, r: CellRef, hash: u32) -> bool {
        let bucket = &mut self.buckets[(hash & self.hash_mask) as usize];
        match bucket.iter().position(|&(_, e)| e == r) {
            Some(pos) => {
                bucket.swap_remove(pos);
                self.count -= 1;
                true
            }
            None => false,
        }
    }

    fn resize(&mut self) {
        let new_size = self.buckets.len() * 2;
        let mut buckets = vec![Vec::new(); new_size];
        let mask = (new_size - 1) as u32;
        for (hash, r) in self.buckets.drain(..).flatten() {
            buckets[(hash & mask) as usize].push((hash, r));
        }
        self.buckets = buckets;
        self.hash_mask = mask;
    }
}

impl Default for StringTable {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CacheEntry {
    string: CellRef,
    char_idx: usize,
    byte_idx: usize,
}

/// Lookaside cache of character-to-byte offsets
///
/// Keeps the most recently used positions at the front. Entries are weak:
/// [`remove_from_cache`](Self::remove_from_cache) must run before a string
/// cell is freed so a reused slot is never matched.
pub struct StringCache {
    entries: Vec<CacheEntry>,
    capacity: usize,
}

impl StringCache {
    pub fn new(capacity: usize) -> Self {
        StringCache {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cached position nearest to `char_idx` for this string
    fn nearest(&self, string: CellRef, char_idx: usize) -> Option<(usize, usize)> {
        self.entries
            .iter()
            .filter(|e| e.string == string)
            .min_by_key(|e| e.char_idx.abs_diff(char_idx))
            .map(|e| (e.char_idx, e.byte_idx))
    }

    /// Record a position, replacing the string's nearest entry or evicting
    /// the least recently used one.
    fn record(&mut self, string: CellRef, char_idx: usize, byte_idx: usize) {
        if self.capacity == 0 {
            return;
        }
        let entry = CacheEntry {
            string,
            char_idx,
            byte_idx,
        };
        let reuse = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.string == string)
            .min_by_key(|(_, e)| e.char_idx.abs_diff(char_idx))
            .map(|(i, _)| i);
        match reuse {
            Some(pos) => {
                self.entries.remove(pos);
            }
            None if self.entries.len() == self.capacity => {
                self.entries.pop();
            }
            None => {}
        }
        self.entries.insert(0, entry);
    }

    /// Drop every entry pointing at `string`
    pub fn remove_from_cache(&mut self, string: CellRef) {
        self.entries.retain(|e| e.string != string);
    }

    pub fn flush(&mut self) {
        self.entries.clear();
    }

    pub fn contains(&self, string: CellRef) -> bool {
        self.entries.iter().any(|e| e.string == string)
    }
}

/// Byte offset of character `target`, scanning from a known position
fn scan_to_char(s: &str, from_char: usize, from_byte: usize, target: usize) -> usize {
    if target >= from_char {
        let rest = &s[from_byte..];
        from_byte
            + rest
                .char_indices()
                .nth(target - from_char)
                .map_or(rest.len(), |(b, _)| b)
    } else {
        s[..from_byte]
            .char_indices()
            .rev()
            .nth(from_char - target - 1)
            .map_or(0, |(b, _)| b)
    }
}

impl Heap {
    /// Intern a string, returning an owned reference.
    ///
    /// Interning content that is already live returns the existing cell with
    /// its count incremented.
    pub fn intern(&mut self, s: &str) -> HeapResult<CellRef> {
        self.intern_with(s, |s, hash| StringCell::owned(s, hash))
    }

    /// Intern a string backed by static storage
    pub fn intern_static(&mut self, s: &'static str) -> HeapResult<CellRef> {
        self.intern_with(s, |_, hash| StringCell::external(s, hash))
    }

    fn intern_with(
        &mut self,
        s: &str,
        make: impl FnOnce(&str, u32) -> StringCell,
    ) -> HeapResult<CellRef> {
        let hash = StringTable::hash_string(s);
        if let Some(existing) = self.lookup_string(s, hash) {
            self.incref_cell(existing);
            return Ok(existing);
        }

        let r = self.alloc_cell(CellBody::String(make(s, hash)))?;

        // A finalizer run by an emergency pass may have interned it meanwhile
        if let Some(existing) = self.lookup_string(s, hash) {
            self.incref_cell(existing);
            self.decref_cell(r);
            return Ok(existing);
        }

        self.strings.insert(hash, r);
        tracing::trace!(?r, len = s.len(), "interned string");
        Ok(r)
    }

    fn lookup_string(&self, s: &str, hash: u32) -> Option<CellRef> {
        let alloc = &self.alloc;
        self.strings.lookup(hash, |r| {
            matches!(alloc.get(r), Some(cell) if matches!(&cell.body, CellBody::String(sc) if sc.as_str() == s))
        })
    }

    /// Borrow the content of a string cell
    pub fn string_str(&self, r: CellRef) -> HeapResult<&str> {
        Ok(self.string_cell(r)?.as_str())
    }

    pub(crate) fn string_cell(&self, r: CellRef) -> HeapResult<&StringCell> {
        let cell = self.alloc.get(r).ok_or(HeapError::InvalidHandle)?;
        match &cell.body {
            CellBody::String(s) => Ok(s),
            other => Err(HeapError::WrongCellKind {
                expected: CellTag::String,
                found: other.tag(),
            }),
        }
    }

    /// Convert a character index into a byte offset, using the lookaside
    /// cache. `char_idx == char_len` yields the byte length.
    pub fn char_offset(&mut self, r: CellRef, char_idx: usize) -> HeapResult<usize> {
        let cell = self.alloc.get(r).ok_or(HeapError::InvalidHandle)?;
        let s = match &cell.body {
            CellBody::String(s) => s,
            other => {
                return Err(HeapError::WrongCellKind {
                    expected: CellTag::String,
                    found: other.tag(),
                });
            }
        };
        if char_idx > s.char_len() {
            return Err(HeapError::TypeError("character index out of range"));
        }
        if s.is_ascii() {
            return Ok(char_idx);
        }

        let text = s.as_str();
        let (from_char, from_byte) = match self.str_cache.nearest(r, char_idx) {
            // Scanning from either end of the string may be closer
            Some((c, b)) if c.abs_diff(char_idx) <= char_idx.min(s.char_len() - char_idx) => (c, b),
            _ if char_idx * 2 > s.char_len() => (s.char_len(), text.len()),
            _ => (0, 0),
        };
        let byte_idx = scan_to_char(text, from_char, from_byte, char_idx);
        self.str_cache.record(r, char_idx, byte_idx);
        Ok(byte_idx)
    }
}
