//! Type descriptors.
//!
//! A type records the instance layout (slot count and bytes size, either
//! fixed or extendable, plus the cached total size when both are fixed), an
//! ordered field-name map, a method table and a static table.  Types are
//! themselves objects of the root `Type` type and are always allocated in
//! old space (they are long-lived and their addresses must stay 4-aligned so
//! the two GC-state bits of meta word 0 can be recovered).

use crate::util::constants::BYTES_IN_WORD;

use super::value::{ObjRef, Value};
use super::{map_obj, ObjectMeta, OBJECT_HEAD_SIZE};

/// Raw encoding of "extendable" in the stored size words.
const EXTENDABLE_RAW: usize = usize::MAX;

/// Fixed-or-extendable size descriptor.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SizeSpec {
    /// The region has this many slots / bytes in every instance.
    Fixed(usize),
    /// The region size is stored per instance (slot 0 / leading bytes word).
    Extendable,
}

impl SizeSpec {
    pub fn from_raw(raw: usize) -> SizeSpec {
        if raw == EXTENDABLE_RAW {
            SizeSpec::Extendable
        } else {
            SizeSpec::Fixed(raw)
        }
    }

    pub fn to_raw(self) -> usize {
        match self {
            SizeSpec::Fixed(n) => {
                debug_assert_ne!(n, EXTENDABLE_RAW);
                n
            }
            SizeSpec::Extendable => EXTENDABLE_RAW,
        }
    }

    pub fn is_extendable(self) -> bool {
        matches!(self, SizeSpec::Extendable)
    }
}

/// Number of slots in a `Type` object.
pub const TYPE_SLOT_COUNT: usize = 4;
/// Bytes region size of a `Type` object.
pub const TYPE_BYTES_SIZE: usize = 3 * BYTES_IN_WORD;
/// Total size of a `Type` object.
pub const TYPE_OBJ_SIZE: usize =
    OBJECT_HEAD_SIZE + TYPE_SLOT_COUNT * BYTES_IN_WORD + TYPE_BYTES_SIZE;

/// The `Type` object overlay.
#[repr(C)]
pub struct TypeObj {
    _meta: ObjectMeta,
    // --- SLOTS ---
    name: Value,    // Symbol, or small-int 0
    fields: Value,  // Map { Symbol -> slot index (small int) }, or small-int 0
    methods: Value, // Map { Symbol -> callable }, or small-int 0
    statics: Value, // Map { Symbol -> value }, or small-int 0
    // --- BYTES ---
    slots_num: usize, // EXTENDABLE_RAW => extendable
    bytes_len: usize, // EXTENDABLE_RAW => extendable
    obj_size: usize,  // 0 => a region is extendable; compute per object
}

const_assert_eq!(std::mem::size_of::<TypeObj>(), TYPE_OBJ_SIZE);

impl TypeObj {
    /// View an object as a type descriptor.
    ///
    /// # Safety
    /// `r` must reference a `Type` object.
    pub unsafe fn deref(r: ObjRef) -> &'static mut TypeObj {
        r.deref()
    }

    /// Fill in the layout words.  Called right after allocation.
    pub fn init_layout(&mut self, slots: SizeSpec, bytes: SizeSpec) {
        if let SizeSpec::Fixed(n) = bytes {
            debug_assert_eq!(n % BYTES_IN_WORD, 0, "bytes region must be word-rounded");
        }
        self.name = Value::SMALLINT_ZERO;
        self.fields = Value::SMALLINT_ZERO;
        self.methods = Value::SMALLINT_ZERO;
        self.statics = Value::SMALLINT_ZERO;
        self.slots_num = slots.to_raw();
        self.bytes_len = bytes.to_raw();
        self.obj_size = match (slots, bytes) {
            (SizeSpec::Fixed(s), SizeSpec::Fixed(b)) => {
                OBJECT_HEAD_SIZE + s * BYTES_IN_WORD + b
            }
            _ => 0,
        };
    }

    pub fn slots_spec(&self) -> SizeSpec {
        SizeSpec::from_raw(self.slots_num)
    }

    pub fn bytes_spec(&self) -> SizeSpec {
        SizeSpec::from_raw(self.bytes_len)
    }

    /// Cached total object size; 0 when a region is extendable.
    pub fn cached_obj_size(&self) -> usize {
        self.obj_size
    }

    pub fn name(&self) -> Value {
        self.name
    }

    pub fn set_name(&mut self, self_ref: ObjRef, name: Value) {
        self.name = name;
        crate::mem::objmem::write_barrier(self_ref, name);
    }

    pub fn fields_map(&self) -> Value {
        self.fields
    }

    pub fn methods_map(&self) -> Value {
        self.methods
    }

    pub fn statics_map(&self) -> Value {
        self.statics
    }

    pub fn set_fields_map(&mut self, self_ref: ObjRef, map: Value) {
        self.fields = map;
        crate::mem::objmem::write_barrier(self_ref, map);
    }

    pub fn set_methods_map(&mut self, self_ref: ObjRef, map: Value) {
        self.methods = map;
        crate::mem::objmem::write_barrier(self_ref, map);
    }

    pub fn set_statics_map(&mut self, self_ref: ObjRef, map: Value) {
        self.statics = map;
        crate::mem::objmem::write_barrier(self_ref, map);
    }

    /// Look up a method by interned symbol.  Allocation-free.
    pub fn get_method(&self, name_sym: Value) -> Option<Value> {
        if self.methods.is_smallint() {
            return None;
        }
        map_obj::sym_get(self.methods.as_obj(), name_sym)
    }

    /// Look up a static member by interned symbol.  Allocation-free.
    pub fn get_static(&self, name_sym: Value) -> Option<Value> {
        if self.statics.is_smallint() {
            return None;
        }
        map_obj::sym_get(self.statics.as_obj(), name_sym)
    }

    /// Find the slot index of a named field.  Allocation-free.
    pub fn find_field(&self, name_sym: Value) -> Option<usize> {
        if self.fields.is_smallint() {
            return None;
        }
        let idx = map_obj::sym_get(self.fields.as_obj(), name_sym)?;
        debug_assert!(idx.is_smallint());
        Some(idx.as_smallint() as usize)
    }
}
