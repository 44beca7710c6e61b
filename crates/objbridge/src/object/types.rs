//! Builtin Type Descriptors and Singletons
//!
//! Native type objects for the builtin kinds, plus the none/true/false
//! singleton instances. They behave like the static type objects of a C
//! runtime: they live outside the bridge allocator for the whole lifetime of
//! the bridge and start with an immortal refcount.

use super::header::{
    Destructor, NativeIntObject, NativeObjectHeader, NativeTypeObject, NativeVarObjectHeader,
    NativeFloatObject, NativeListObject, NativeStringObject, OBJECT_SIZE,
};
use crate::runtime::dealloc;
use std::ffi::CString;
use std::mem::size_of;
use std::ptr;

/// Refcount of objects that are never deallocated
///
/// Large enough that balanced incref/decref traffic from native code never
/// brings it down to 1.
pub const IMMORTAL_REFCOUNT: isize = 1 << 30;

/// Builtin native types known to every bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinType {
    Object,
    Type,
    None,
    Bool,
    Int,
    Float,
    Str,
    Tuple,
    List,
    Dict,
}

impl BuiltinType {
    pub const ALL: [BuiltinType; 10] = [
        BuiltinType::Object,
        BuiltinType::Type,
        BuiltinType::None,
        BuiltinType::Bool,
        BuiltinType::Int,
        BuiltinType::Float,
        BuiltinType::Str,
        BuiltinType::Tuple,
        BuiltinType::List,
        BuiltinType::Dict,
    ];

    /// Value of `tp_name`
    pub fn name(self) -> &'static str {
        match self {
            BuiltinType::Object => "object",
            BuiltinType::Type => "type",
            BuiltinType::None => "NoneType",
            BuiltinType::Bool => "bool",
            BuiltinType::Int => "int",
            BuiltinType::Float => "float",
            BuiltinType::Str => "str",
            BuiltinType::Tuple => "tuple",
            BuiltinType::List => "list",
            BuiltinType::Dict => "dict",
        }
    }

    fn basicsize(self) -> usize {
        match self {
            BuiltinType::Type => size_of::<NativeTypeObject>(),
            BuiltinType::Bool | BuiltinType::Int => size_of::<NativeIntObject>(),
            BuiltinType::Float => size_of::<NativeFloatObject>(),
            BuiltinType::Str => size_of::<NativeStringObject>(),
            BuiltinType::Tuple => size_of::<NativeVarObjectHeader>(),
            BuiltinType::List => size_of::<NativeListObject>(),
            BuiltinType::Object | BuiltinType::None | BuiltinType::Dict => OBJECT_SIZE,
        }
    }

    fn itemsize(self) -> usize {
        match self {
            BuiltinType::Str => 1,
            BuiltinType::Tuple => size_of::<usize>(),
            _ => 0,
        }
    }

    fn dealloc(self) -> Destructor {
        match self {
            BuiltinType::Tuple => dealloc::tuple_dealloc,
            BuiltinType::List => dealloc::list_dealloc,
            BuiltinType::Type | BuiltinType::None | BuiltinType::Bool => dealloc::immortal_dealloc,
            BuiltinType::Object
            | BuiltinType::Int
            | BuiltinType::Float
            | BuiltinType::Str
            | BuiltinType::Dict => dealloc::object_dealloc,
        }
    }
}

struct TypeSlot {
    object: Box<NativeTypeObject>,
    // Backing storage of `object.tp_name`
    _name: CString,
}

/// Owned table of builtin type objects
pub struct BuiltinTypes {
    slots: Vec<TypeSlot>,
}

// SAFETY: the raw pointers inside the boxed type objects point into this
// table (or are null) and are only read or written with the bridge lock held.
unsafe impl Send for BuiltinTypes {}

impl BuiltinTypes {
    pub fn new() -> Self {
        let mut slots: Vec<TypeSlot> = BuiltinType::ALL
            .iter()
            .map(|&ty| {
                let name = CString::new(ty.name()).unwrap_or_default();
                let object = Box::new(NativeTypeObject {
                    ob_base: NativeVarObjectHeader {
                        ob_base: NativeObjectHeader {
                            ob_refcnt: IMMORTAL_REFCOUNT,
                            ob_type: ptr::null_mut(),
                        },
                        ob_size: 0,
                    },
                    tp_name: name.as_ptr(),
                    tp_basicsize: ty.basicsize() as isize,
                    tp_itemsize: ty.itemsize() as isize,
                    tp_dealloc: Some(ty.dealloc()),
                });
                TypeSlot {
                    object,
                    _name: name,
                }
            })
            .collect();

        // Every builtin type is an instance of `type`, `type` included
        let meta = &mut *slots[BuiltinType::Type as usize].object as *mut NativeTypeObject;
        for slot in &mut slots {
            slot.object.ob_base.ob_base.ob_type = meta;
        }

        Self { slots }
    }

    /// Native address of a builtin type object
    pub fn address(&self, ty: BuiltinType) -> usize {
        &*self.slots[ty as usize].object as *const NativeTypeObject as usize
    }

    /// Builtin type living at `type_address`, if any
    pub fn lookup(&self, type_address: usize) -> Option<BuiltinType> {
        BuiltinType::ALL
            .iter()
            .copied()
            .find(|&ty| self.address(ty) == type_address)
    }

    pub fn iter(&self) -> impl Iterator<Item = (BuiltinType, usize)> + '_ {
        BuiltinType::ALL.iter().map(move |&ty| (ty, self.address(ty)))
    }
}

impl Default for BuiltinTypes {
    fn default() -> Self {
        Self::new()
    }
}

/// Native instances of the none, true and false singletons
pub struct Singletons {
    none: Box<NativeObjectHeader>,
    true_: Box<NativeIntObject>,
    false_: Box<NativeIntObject>,
}

// SAFETY: as for `BuiltinTypes`.
unsafe impl Send for Singletons {}

impl Singletons {
    pub fn new(types: &BuiltinTypes) -> Self {
        let header = |ty: BuiltinType| NativeObjectHeader {
            ob_refcnt: IMMORTAL_REFCOUNT,
            ob_type: types.address(ty) as *mut NativeTypeObject,
        };

        Self {
            none: Box::new(header(BuiltinType::None)),
            true_: Box::new(NativeIntObject {
                ob_base: header(BuiltinType::Bool),
                ob_ival: 1,
            }),
            false_: Box::new(NativeIntObject {
                ob_base: header(BuiltinType::Bool),
                ob_ival: 0,
            }),
        }
    }

    pub fn none(&self) -> usize {
        &*self.none as *const NativeObjectHeader as usize
    }

    pub fn bool(&self, value: bool) -> usize {
        let object = if value { &self.true_ } else { &self.false_ };
        &**object as *const NativeIntObject as usize
    }
}
