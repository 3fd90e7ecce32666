//! Property table
//!
//! Objects store their named properties in a hash-chained table keyed by
//! interned string cells. Because keys are interned, key equality is handle
//! identity.
//!
//! Every occupied slot owns one reference to its key and one to each cell
//! its value refers to. The table itself never touches reference counts:
//! callers receive the displaced slot contents and release them.

use crate::gc::CellRef;
use crate::value::Value;

/// Contents of a property slot
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PropertyValue {
    Data(Value),
    Accessor { getter: Value, setter: Value },
}

impl PropertyValue {
    /// Visit the cells this slot owns
    pub fn for_each_ref(&self, f: &mut impl FnMut(CellRef)) {
        match *self {
            PropertyValue::Data(v) => {
                if let Some(r) = v.as_cell() {
                    f(r);
                }
            }
            PropertyValue::Accessor { getter, setter } => {
                for v in [getter, setter] {
                    if let Some(r) = v.as_cell() {
                        f(r);
                    }
                }
            }
        }
    }

    /// The data value, or `None` for accessors
    #[inline]
    pub fn data(&self) -> Option<Value> {
        match *self {
            PropertyValue::Data(v) => Some(v),
            PropertyValue::Accessor { .. } => None,
        }
    }
}

/// A property slot. `key == None` marks a deleted slot on the free chain.
#[derive(Debug, Clone, Copy)]
pub struct Property {
    pub key: Option<CellRef>,
    pub value: PropertyValue,
    hash_next: u32,
}

/// Result of [`PropertyTable::set`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SetOutcome {
    /// A new slot was created; the table now owns the key
    Inserted,
    /// An existing slot was overwritten; the old contents are handed back
    Replaced(PropertyValue),
}

/// Hash-chained property storage
///
/// Layout:
/// - hash_table[hash_mask + 1]: 1-based indices into `properties` (0 = end)
/// - properties[]: slots, deleted ones threaded on `first_free`
#[derive(Debug)]
pub struct PropertyTable {
    prop_count: u32,
    hash_mask: u32,
    properties: Vec<Property>,
    hash_table: Vec<u32>,
    first_free: u32,
}

impl PropertyTable {
    const MIN_HASH_SIZE: usize = 4;

    const MAX_LOAD_FACTOR: f64 = 0.75;

    pub fn new() -> Self {
        PropertyTable {
            prop_count: 0,
            hash_mask: (Self::MIN_HASH_SIZE - 1) as u32,
            properties: Vec::new(),
            hash_table: vec![0; Self::MIN_HASH_SIZE],
            first_free: 0,
        }
    }

    /// Number of live properties
    #[inline]
    pub fn len(&self) -> usize {
        self.prop_count as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.prop_count == 0
    }

    /// Bytes of slot storage, for allocator accounting
    pub fn storage_bytes(&self) -> usize {
        self.properties.capacity() * std::mem::size_of::<Property>()
            + self.hash_table.capacity() * std::mem::size_of::<u32>()
    }

    #[inline]
    fn hash_key(key: CellRef) -> u32 {
        let mut h = key.index() ^ key.generation().rotate_left(16);
        h ^= h >> 16;
        h = h.wrapping_mul(0x85ebca6b);
        h ^= h >> 13;
        h = h.wrapping_mul(0xc2b2ae35);
        h ^= h >> 16;
        h
    }

    fn find(&self, key: CellRef) -> Option<usize> {
        if self.prop_count == 0 {
            return None;
        }

        let hash = Self::hash_key(key);
        let mut idx = self.hash_table[(hash & self.hash_mask) as usize];
        while idx != 0 {
            let prop_idx = (idx - 1) as usize;
            let prop = &self.properties[prop_idx];
            if prop.key == Some(key) {
                return Some(prop_idx);
            }
            idx = prop.hash_next;
        }
        None
    }

    pub fn get(&self, key: CellRef) -> Option<&PropertyValue> {
        self.find(key).map(|idx| &self.properties[idx].value)
    }

    #[inline]
    pub fn has(&self, key: CellRef) -> bool {
        self.find(key).is_some()
    }

    /// Insert or overwrite a property
    pub fn set(&mut self, key: CellRef, value: PropertyValue) -> SetOutcome {
        if let Some(idx) = self.find(key) {
            let old = std::mem::replace(&mut self.properties[idx].value, value);
            return SetOutcome::Replaced(old);
        }

        let load = (self.prop_count + 1) as f64 / (self.hash_mask + 1) as f64;
        if load > Self::MAX_LOAD_FACTOR {
            self.resize();
        }

        let bucket = (Self::hash_key(key) & self.hash_mask) as usize;
        let prop = Property {
            key: Some(key),
            value,
            hash_next: self.hash_table[bucket],
        };

        // Reuse a deleted slot or append
        let prop_idx = if self.first_free != 0 {
            let idx = (self.first_free - 1) as usize;
            self.first_free = self.properties[idx].hash_next;
            self.properties[idx] = prop;
            idx
        } else {
            self.properties.push(prop);
            self.properties.len() - 1
        };

        self.hash_table[bucket] = (prop_idx + 1) as u32;
        self.prop_count += 1;
        SetOutcome::Inserted
    }

    /// Remove a property, handing back its key and value
    pub fn delete(&mut self, key: CellRef) -> Option<(CellRef, PropertyValue)> {
        if self.prop_count == 0 {
            return None;
        }

        let bucket = (Self::hash_key(key) & self.hash_mask) as usize;
        let mut prev_idx: Option<usize> = None;
        let mut idx = self.hash_table[bucket];

        while idx != 0 {
            let prop_idx = (idx - 1) as usize;
            let prop = self.properties[prop_idx];

            if prop.key == Some(key) {
                match prev_idx {
                    Some(prev) => self.properties[prev].hash_next = prop.hash_next,
                    None => self.hash_table[bucket] = prop.hash_next,
                }

                let slot = &mut self.properties[prop_idx];
                slot.key = None;
                slot.value = PropertyValue::Data(Value::undefined());
                slot.hash_next = self.first_free;
                self.first_free = (prop_idx + 1) as u32;

                self.prop_count -= 1;
                return Some((key, prop.value));
            }

            prev_idx = Some(prop_idx);
            idx = prop.hash_next;
        }
        None
    }

    fn resize(&mut self) {
        let new_size = ((self.hash_mask + 1) * 2) as usize;
        self.hash_mask = (new_size - 1) as u32;
        self.hash_table = vec![0; new_size];

        for i in 0..self.properties.len() {
            let Some(key) = self.properties[i].key else {
                continue;
            };
            let bucket = (Self::hash_key(key) & self.hash_mask) as usize;
            self.properties[i].hash_next = self.hash_table[bucket];
            self.hash_table[bucket] = (i + 1) as u32;
        }
    }

    /// Iterate over live properties
    pub fn iter(&self) -> impl Iterator<Item = (CellRef, &PropertyValue)> {
        self.properties
            .iter()
            .filter_map(|p| p.key.map(|k| (k, &p.value)))
    }

    /// Visit every key and value reference held by the table
    pub fn for_each_ref(&self, f: &mut impl FnMut(CellRef)) {
        for (key, value) in self.iter() {
            f(key);
            value.for_each_ref(f);
        }
    }

    /// Empty the table, handing back everything it owned
    pub fn drain(&mut self) -> Vec<(CellRef, PropertyValue)> {
        let out = self.iter().map(|(k, v)| (k, *v)).collect();
        *self = PropertyTable::new();
        out
    }
}

impl Default for PropertyTable {
    fn default() -> Self {
        Self::new()
    }
}
