//! Object cells
//!
//! An [`ObjectCell`] is the composite part shared by plain objects, arrays,
//! functions and threads. Its owned references are, in enumeration order:
//! property keys and values (both halves of accessor pairs), the array part,
//! the prototype link, and for compiled functions the constant pool, the
//! nested function table and the bytecode blob.

use crate::error::{HeapError, HeapResult};
use crate::gc::{CellBody, CellRef, CellTag, Heap};
use crate::runtime::property::{PropertyTable, PropertyValue, SetOutcome};
use crate::value::{NativeFunctionId, Value};

/// Upper bound on prototype chain walks
pub const MAX_PROTOTYPE_CHAIN: usize = 10_000;

/// Object class IDs
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassId {
    /// Plain object
    Object = 0,
    /// Array (uses the array part)
    Array = 1,
    /// Compiled function template or closure
    Function = 2,
    /// Object wrapping a registered native function
    NativeFunction = 3,
    /// Variable or lexical environment record
    Environment = 4,
    /// Object part of a thread cell
    Thread = 5,
}

impl ClassId {
    #[inline]
    pub fn is_callable(self) -> bool {
        matches!(self, ClassId::Function | ClassId::NativeFunction)
    }
}

/// Compiled function payload
#[derive(Debug, Default)]
pub struct CompiledFunction {
    /// Constant pool
    pub constants: Vec<Value>,
    /// Nested function templates
    pub functions: Vec<CellRef>,
    /// Bytecode blob (a buffer cell)
    pub data: Option<CellRef>,
}

#[derive(Debug, Default)]
pub enum ObjectPayload {
    #[default]
    None,
    Compiled(CompiledFunction),
    Native(NativeFunctionId),
}

/// The object part of a composite cell
#[derive(Debug)]
pub struct ObjectCell {
    pub class: ClassId,
    pub proto: Option<CellRef>,
    pub props: PropertyTable,
    pub array: Vec<Value>,
    pub payload: ObjectPayload,
}

impl ObjectCell {
    /// Create a plain object
    pub fn new(proto: Option<CellRef>) -> Self {
        Self::with_class(ClassId::Object, proto)
    }

    pub fn with_class(class: ClassId, proto: Option<CellRef>) -> Self {
        ObjectCell {
            class,
            proto,
            props: PropertyTable::new(),
            array: Vec::new(),
            payload: ObjectPayload::None,
        }
    }

    /// Approximate out-of-line storage, for allocator accounting
    pub fn payload_bytes(&self) -> usize {
        let value = std::mem::size_of::<Value>();
        let mut bytes = self.props.storage_bytes() + self.array.capacity() * value;
        if let ObjectPayload::Compiled(func) = &self.payload {
            bytes += func.constants.len() * value
                + func.functions.len() * std::mem::size_of::<CellRef>();
        }
        bytes
    }

    /// Visit every reference this object owns
    pub fn for_each_ref(&self, f: &mut impl FnMut(CellRef)) {
        self.props.for_each_ref(f);
        for v in &self.array {
            if let Some(r) = v.as_cell() {
                f(r);
            }
        }
        if let Some(p) = self.proto {
            f(p);
        }
        if let ObjectPayload::Compiled(func) = &self.payload {
            for v in &func.constants {
                if let Some(r) = v.as_cell() {
                    f(r);
                }
            }
            for &r in &func.functions {
                f(r);
            }
            if let Some(d) = func.data {
                f(d);
            }
        }
    }

    /// Native entry point, if this object wraps one
    #[inline]
    pub fn native(&self) -> Option<NativeFunctionId> {
        match self.payload {
            ObjectPayload::Native(id) => Some(id),
            _ => None,
        }
    }
}

impl Heap {
    /// Borrow the object part of an object or thread cell
    pub fn object(&self, r: CellRef) -> HeapResult<&ObjectCell> {
        let cell = self.alloc.get(r).ok_or(HeapError::InvalidHandle)?;
        cell.body.as_object().ok_or(HeapError::WrongCellKind {
            expected: CellTag::Object,
            found: cell.tag(),
        })
    }

    pub(crate) fn object_mut(&mut self, r: CellRef) -> HeapResult<&mut ObjectCell> {
        let cell = self.alloc.get_mut(r).ok_or(HeapError::InvalidHandle)?;
        let found = cell.tag();
        cell.body.as_object_mut().ok_or(HeapError::WrongCellKind {
            expected: CellTag::Object,
            found,
        })
    }

    pub(crate) fn expect_tag(&self, r: CellRef, expected: CellTag) -> HeapResult<()> {
        let found = self.tag(r).ok_or(HeapError::InvalidHandle)?;
        if found == expected {
            Ok(())
        } else {
            Err(HeapError::WrongCellKind { expected, found })
        }
    }

    pub(crate) fn check_value(&self, v: Value) -> HeapResult<()> {
        match v.as_cell() {
            Some(r) if !self.is_live(r) => Err(HeapError::InvalidHandle),
            _ => Ok(()),
        }
    }

    fn check_proto(&self, proto: Option<CellRef>) -> HeapResult<()> {
        match proto {
            Some(p) => self.object(p).map(|_| ()),
            None => Ok(()),
        }
    }

    /// Allocate a plain object, returning an owned reference
    pub fn alloc_object(&mut self, proto: Option<CellRef>) -> HeapResult<CellRef> {
        self.alloc_object_with(ObjectCell::new(proto))
    }

    /// Allocate an empty array
    pub fn alloc_array(&mut self, proto: Option<CellRef>) -> HeapResult<CellRef> {
        self.alloc_object_with(ObjectCell::with_class(ClassId::Array, proto))
    }

    /// Allocate an environment record
    pub fn alloc_environment(&mut self, parent: Option<CellRef>) -> HeapResult<CellRef> {
        self.alloc_object_with(ObjectCell::with_class(ClassId::Environment, parent))
    }

    /// Allocate a compiled function. The constant pool and nested templates
    /// are borrowed from the caller; the bytecode is copied into a buffer the
    /// function owns.
    pub fn alloc_compiled_function(
        &mut self,
        proto: Option<CellRef>,
        constants: Vec<Value>,
        functions: Vec<CellRef>,
        bytecode: &[u8],
    ) -> HeapResult<CellRef> {
        for &v in &constants {
            self.check_value(v)?;
        }
        for &f in &functions {
            self.object(f)?;
        }

        let data = self.alloc_buffer_from(bytecode)?;
        let mut obj = ObjectCell::with_class(ClassId::Function, proto);
        obj.payload = ObjectPayload::Compiled(CompiledFunction {
            constants,
            functions,
            data: Some(data),
        });
        let result = self.alloc_object_with(obj);
        // The function took its own reference to the blob
        self.decref_cell(data);
        result
    }

    /// Allocate an object wrapping a registered native function
    pub fn alloc_native_function(
        &mut self,
        id: NativeFunctionId,
        proto: Option<CellRef>,
    ) -> HeapResult<CellRef> {
        if self.native_fn(id).is_none() {
            return Err(HeapError::NotCallable);
        }
        let mut obj = ObjectCell::with_class(ClassId::NativeFunction, proto);
        obj.payload = ObjectPayload::Native(id);
        self.alloc_object_with(obj)
    }

    fn alloc_object_with(&mut self, obj: ObjectCell) -> HeapResult<CellRef> {
        self.check_proto(obj.proto)?;
        let mut refs = Vec::new();
        obj.for_each_ref(&mut |r| refs.push(r));

        let r = self.alloc_cell(CellBody::Object(obj))?;
        for child in refs {
            self.incref_cell(child);
        }
        Ok(r)
    }

    /// Store a data property
    pub fn put_prop(&mut self, obj: CellRef, key: CellRef, value: Value) -> HeapResult<()> {
        self.put_slot(obj, key, PropertyValue::Data(value))
    }

    /// Store an accessor property
    pub fn put_accessor(
        &mut self,
        obj: CellRef,
        key: CellRef,
        getter: Value,
        setter: Value,
    ) -> HeapResult<()> {
        self.put_slot(obj, key, PropertyValue::Accessor { getter, setter })
    }

    fn put_slot(&mut self, obj: CellRef, key: CellRef, slot: PropertyValue) -> HeapResult<()> {
        self.expect_tag(key, CellTag::String)?;
        let mut live = Ok(());
        slot.for_each_ref(&mut |r| {
            if !self.is_live(r) {
                live = Err(HeapError::InvalidHandle);
            }
        });
        live?;

        let outcome = self.object_mut(obj)?.props.set(key, slot);
        slot.for_each_ref(&mut |r| self.incref_cell(r));
        match outcome {
            SetOutcome::Inserted => self.incref_cell(key),
            SetOutcome::Replaced(old) => self.release_slot(old),
        }
        Ok(())
    }

    pub(crate) fn release_slot(&mut self, slot: PropertyValue) {
        slot.for_each_ref(&mut |r| self.decref_cell(r));
    }

    /// Walk the prototype chain for `key`, returning the holder and slot
    pub(crate) fn find_in_chain(
        &self,
        obj: CellRef,
        key: CellRef,
    ) -> HeapResult<Option<(CellRef, PropertyValue)>> {
        let mut cur = obj;
        for _ in 0..MAX_PROTOTYPE_CHAIN {
            let o = self.object(cur)?;
            if let Some(slot) = o.props.get(key) {
                return Ok(Some((cur, *slot)));
            }
            match o.proto {
                Some(p) => cur = p,
                None => return Ok(None),
            }
        }
        Err(HeapError::PrototypeChainTooDeep)
    }

    /// Look up a property through the prototype chain
    pub fn get_prop(&self, obj: CellRef, key: CellRef) -> HeapResult<Option<PropertyValue>> {
        Ok(self.find_in_chain(obj, key)?.map(|(_, slot)| slot))
    }

    /// Data value of a property, `undefined` when absent or an accessor.
    /// The result is borrowed; incref it before storing it elsewhere.
    pub fn get_value(&self, obj: CellRef, key: CellRef) -> HeapResult<Value> {
        Ok(self
            .get_prop(obj, key)?
            .and_then(|slot| slot.data())
            .unwrap_or_default())
    }

    pub fn has_prop(&self, obj: CellRef, key: CellRef) -> HeapResult<bool> {
        Ok(self.find_in_chain(obj, key)?.is_some())
    }

    /// Delete an own property. Returns whether it existed.
    pub fn delete_prop(&mut self, obj: CellRef, key: CellRef) -> HeapResult<bool> {
        match self.object_mut(obj)?.props.delete(key) {
            Some((k, slot)) => {
                self.release_slot(slot);
                self.decref_cell(k);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Replace the prototype link. Cycles are refused.
    pub fn set_prototype(&mut self, obj: CellRef, proto: Option<CellRef>) -> HeapResult<()> {
        self.object(obj)?;
        self.check_proto(proto)?;

        let mut cur = proto;
        let mut depth = 0;
        while let Some(p) = cur {
            if p == obj {
                return Err(HeapError::TypeError("prototype cycle"));
            }
            depth += 1;
            if depth > MAX_PROTOTYPE_CHAIN {
                return Err(HeapError::PrototypeChainTooDeep);
            }
            cur = self.object(p)?.proto;
        }

        if let Some(p) = proto {
            self.incref_cell(p);
        }
        let old = std::mem::replace(&mut self.object_mut(obj)?.proto, proto);
        self.decref_or_absent(old);
        Ok(())
    }

    fn array_mut(&mut self, arr: CellRef) -> HeapResult<&mut Vec<Value>> {
        let o = self.object_mut(arr)?;
        if o.class != ClassId::Array {
            return Err(HeapError::TypeError("not an array"));
        }
        Ok(&mut o.array)
    }

    /// Append to an array, returning the new length
    pub fn array_push(&mut self, arr: CellRef, value: Value) -> HeapResult<usize> {
        self.check_value(value)?;
        let array = self.array_mut(arr)?;
        array.push(value);
        let len = array.len();
        self.incref(value);
        Ok(len)
    }

    /// Store at `idx`, padding with `undefined`
    pub fn array_set(&mut self, arr: CellRef, idx: usize, value: Value) -> HeapResult<()> {
        self.check_value(value)?;
        let array = self.array_mut(arr)?;
        if idx >= array.len() {
            array.resize(idx + 1, Value::undefined());
        }
        let old = std::mem::replace(&mut array[idx], value);
        self.incref(value);
        self.decref(old);
        Ok(())
    }

    /// Borrowed array element, `undefined` past the end
    pub fn array_get(&self, arr: CellRef, idx: usize) -> HeapResult<Value> {
        Ok(self.object(arr)?.array.get(idx).copied().unwrap_or_default())
    }

    pub fn array_len(&self, arr: CellRef) -> HeapResult<usize> {
        Ok(self.object(arr)?.array.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapConfig;

    fn heap() -> Heap {
        Heap::new(HeapConfig::default().without_voluntary_gc())
    }

    #[test]
    fn test_put_get_prop() {
        let mut heap = heap();
        let obj = heap.alloc_object(None).unwrap();
        let key = heap.intern("x").unwrap();

        heap.put_prop(obj, key, Value::int(1)).unwrap();
        assert_eq!(heap.get_value(obj, key).unwrap(), Value::int(1));
        // The property owns the key
        assert_eq!(heap.refcount(key), Some(2));

        heap.put_prop(obj, key, Value::int(2)).unwrap();
        assert_eq!(heap.get_value(obj, key).unwrap(), Value::int(2));
        assert_eq!(heap.refcount(key), Some(2));
    }

    #[test]
    fn test_overwrite_releases_old_value() {
        let mut heap = heap();
        let obj = heap.alloc_object(None).unwrap();
        let child = heap.alloc_object(None).unwrap();
        let key = heap.intern("child").unwrap();

        heap.put_prop(obj, key, Value::cell(child)).unwrap();
        assert_eq!(heap.refcount(child), Some(2));
        heap.decref(Value::cell(child));

        heap.put_prop(obj, key, Value::null()).unwrap();
        assert!(!heap.is_live(child));
    }

    #[test]
    fn test_prototype_lookup() {
        let mut heap = heap();
        let proto = heap.alloc_object(None).unwrap();
        let obj = heap.alloc_object(Some(proto)).unwrap();
        let key = heap.intern("inherited").unwrap();

        heap.put_prop(proto, key, Value::bool(true)).unwrap();
        assert!(heap.has_prop(obj, key).unwrap());
        assert_eq!(heap.get_value(obj, key).unwrap(), Value::bool(true));
        assert_eq!(heap.refcount(proto), Some(2));

        // Deleting on the child does not touch the prototype
        assert!(!heap.delete_prop(obj, key).unwrap());
        assert!(heap.delete_prop(proto, key).unwrap());
        assert!(!heap.has_prop(obj, key).unwrap());
    }

    #[test]
    fn test_delete_releases_key_and_value() {
        let mut heap = heap();
        let obj = heap.alloc_object(None).unwrap();
        let key = heap.intern("k").unwrap();
        let val = heap.intern("v").unwrap();

        heap.put_prop(obj, key, Value::cell(val)).unwrap();
        heap.decref(Value::cell(val));
        assert!(heap.delete_prop(obj, key).unwrap());
        assert!(!heap.is_live(val));
        assert_eq!(heap.refcount(key), Some(1));
    }

    #[test]
    fn test_accessor_refs() {
        let mut heap = heap();
        let obj = heap.alloc_object(None).unwrap();
        let getter = heap.alloc_object(None).unwrap();
        let setter = heap.alloc_object(None).unwrap();
        let key = heap.intern("acc").unwrap();

        heap.put_accessor(obj, key, Value::cell(getter), Value::cell(setter))
            .unwrap();
        assert_eq!(heap.refcount(getter), Some(2));
        assert_eq!(heap.refcount(setter), Some(2));
        assert_eq!(heap.get_value(obj, key).unwrap(), Value::undefined());

        heap.decref(Value::cell(obj));
        assert_eq!(heap.refcount(getter), Some(1));
        assert_eq!(heap.refcount(setter), Some(1));
    }

    #[test]
    fn test_set_prototype_refuses_cycle() {
        let mut heap = heap();
        let a = heap.alloc_object(None).unwrap();
        let b = heap.alloc_object(Some(a)).unwrap();

        assert_eq!(
            heap.set_prototype(a, Some(b)),
            Err(HeapError::TypeError("prototype cycle"))
        );

        let c = heap.alloc_object(None).unwrap();
        heap.set_prototype(b, Some(c)).unwrap();
        assert_eq!(heap.refcount(a), Some(1));
        assert_eq!(heap.refcount(c), Some(2));
    }

    #[test]
    fn test_array_ops() {
        let mut heap = heap();
        let arr = heap.alloc_array(None).unwrap();
        let item = heap.alloc_object(None).unwrap();

        assert_eq!(heap.array_push(arr, Value::int(1)).unwrap(), 1);
        heap.array_set(arr, 3, Value::cell(item)).unwrap();
        assert_eq!(heap.array_len(arr).unwrap(), 4);
        assert_eq!(heap.array_get(arr, 2).unwrap(), Value::undefined());
        assert_eq!(heap.refcount(item), Some(2));

        heap.array_set(arr, 3, Value::null()).unwrap();
        assert_eq!(heap.refcount(item), Some(1));

        let plain = heap.alloc_object(None).unwrap();
        assert!(heap.array_push(plain, Value::int(0)).is_err());
    }

    #[test]
    fn test_compiled_function_owns_parts() {
        let mut heap = heap();
        let konst = heap.intern("const").unwrap();
        let inner = heap.alloc_compiled_function(None, vec![], vec![], &[1, 2]).unwrap();

        let f = heap
            .alloc_compiled_function(None, vec![Value::cell(konst)], vec![inner], &[0x10, 0x20])
            .unwrap();
        assert_eq!(heap.refcount(konst), Some(2));
        assert_eq!(heap.refcount(inner), Some(2));

        let data = match &heap.object(f).unwrap().payload {
            ObjectPayload::Compiled(func) => func.data.unwrap(),
            _ => panic!("expected compiled payload"),
        };
        assert_eq!(heap.refcount(data), Some(1));
        assert_eq!(heap.buffer_bytes(data).unwrap(), &[0x10, 0x20]);

        heap.decref(Value::cell(f));
        assert!(!heap.is_live(data));
        assert_eq!(heap.refcount(konst), Some(1));
        assert_eq!(heap.refcount(inner), Some(1));
    }

    #[test]
    fn test_key_must_be_string() {
        let mut heap = heap();
        let obj = heap.alloc_object(None).unwrap();
        let not_key = heap.alloc_object(None).unwrap();
        assert!(matches!(
            heap.put_prop(obj, not_key, Value::int(1)),
            Err(HeapError::WrongCellKind { .. })
        ));
    }
}
