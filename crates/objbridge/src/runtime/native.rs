//! Native-side constructors
//!
//! Native code builds strings, tuples and lists directly in bridge memory
//! and fills them in before any managed code looks at them. Each one is
//! mapped to a deferred marker; `retrieve` builds the managed object from the
//! native fields the first time it is asked for.
//!
//! The set-item functions steal the caller's reference to the item.

use super::state::BridgeState;
use super::Bridge;
use crate::error::{BridgeError, Result};
use crate::logging::BridgeEvent;
use crate::object::{header, BuiltinType, DeferredMarker, Object, Value};

impl BridgeState {
    fn map_deferred(&mut self, address: usize, marker: DeferredMarker, bytes: usize) -> Result<()> {
        if let Err(err) = self.map.associate(address, Object::deferred_marker(marker)) {
            let _ = self.free_block(address);
            return Err(err);
        }
        self.logger.log(BridgeEvent::Stored {
            address,
            kind: marker.name(),
            bytes,
        });
        Ok(())
    }

    pub(crate) fn new_string(&mut self, len: usize) -> Result<usize> {
        let (address, size) = self.alloc_string(len)?;
        self.map_deferred(address, DeferredMarker::String, size)?;
        Ok(address)
    }

    fn expect_type(&self, address: usize, ty: BuiltinType, operation: &str) -> Result<()> {
        if self.has_type(address, ty) {
            Ok(())
        } else {
            Err(BridgeError::ArgumentKind(format!(
                "{}: object at {:#x} is not a {}",
                operation,
                address,
                ty.name()
            )))
        }
    }

    fn check_index(address: usize, index: usize, operation: &str) -> Result<()> {
        // SAFETY: callers have checked the type of `address`.
        let len = unsafe { header::read_var_size(address) }.max(0) as usize;
        if index < len {
            Ok(())
        } else {
            Err(BridgeError::ArgumentKind(format!(
                "{}: index {} out of range for object at {:#x} of size {}",
                operation, index, address, len
            )))
        }
    }

    /// Put `item` into a tuple slot, returning the previous occupant
    fn swap_tuple_item(&mut self, tuple: usize, index: usize, item: usize) -> Result<usize> {
        self.require_mapped(tuple, "TupleSetItem")?;
        self.expect_type(tuple, BuiltinType::Tuple, "TupleSetItem")?;
        if !self.map.entry(tuple).is_some_and(|entry| entry.is_deferred()) {
            return Err(BridgeError::ArgumentKind(format!(
                "TupleSetItem: tuple at {:#x} is already in use",
                tuple
            )));
        }
        Self::check_index(tuple, index, "TupleSetItem")?;

        // SAFETY: in-range slot of a live tuple.
        unsafe {
            let slot = header::tuple_items(tuple).add(index);
            Ok(std::mem::replace(&mut *slot, item))
        }
    }

    /// Put `item` into a list slot, returning the previous occupant
    ///
    /// A list that has already been materialized is updated on both sides.
    fn swap_list_item(&mut self, list: usize, index: usize, item: usize) -> Result<usize> {
        self.require_mapped(list, "ListSetItem")?;
        self.expect_type(list, BuiltinType::List, "ListSetItem")?;
        Self::check_index(list, index, "ListSetItem")?;

        let managed = self
            .map
            .get_obj(list)
            .filter(|obj| obj.marker().is_none());
        if let Some(obj) = managed {
            let value = self.retrieve(item)?;
            if let Value::List(slots) = obj.value() {
                if let Some(slot) = slots.write().get_mut(index) {
                    *slot = value;
                }
            }
        }

        // SAFETY: in-range slot of a live list's item array.
        unsafe {
            let slot = header::list_items(list).add(index);
            Ok(std::mem::replace(&mut *slot, item))
        }
    }
}

impl Bridge {
    /// Allocate an instance of any native type, refcount 1, unmapped
    ///
    /// It is mapped through the actualizer registered for its type the first
    /// time it is used.
    pub fn new_object(&self, type_address: usize, size: usize) -> Result<usize> {
        if type_address == 0 {
            return Err(BridgeError::InvalidPointer {
                address: type_address,
            });
        }
        self.enter(|cell| Self::state(cell)?.alloc_typed(type_address, size))
    }

    /// Native string holding a copy of `bytes`
    pub fn new_string(&self, bytes: &[u8]) -> Result<usize> {
        self.enter(|cell| {
            let address = Self::state(cell)?.new_string(bytes.len())?;
            // SAFETY: fresh string of `bytes.len()` bytes.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    bytes.as_ptr(),
                    header::string_data(address),
                    bytes.len(),
                )
            };
            Ok(address)
        })
    }

    /// Native string of `len` zero bytes, to be filled in by native code
    pub fn new_string_uninit(&self, len: usize) -> Result<usize> {
        self.enter(|cell| Self::state(cell)?.new_string(len))
    }

    /// Current native contents of a string
    pub fn string_bytes(&self, address: usize) -> Result<Vec<u8>> {
        self.enter(|cell| {
            let mut state = Self::state(cell)?;
            state.require_mapped(address, "StringBytes")?;
            state.expect_type(address, BuiltinType::Str, "StringBytes")?;
            // SAFETY: mapped string.
            Ok(unsafe { header::read_string(address) })
        })
    }

    /// Length in bytes of a native string
    pub fn string_len(&self, address: usize) -> Result<usize> {
        self.enter(|cell| {
            let mut state = Self::state(cell)?;
            state.require_mapped(address, "StringSize")?;
            state.expect_type(address, BuiltinType::Str, "StringSize")?;
            // SAFETY: mapped string.
            Ok(unsafe { header::read_var_size(address) }.max(0) as usize)
        })
    }

    /// Native tuple with `len` empty slots
    pub fn new_tuple(&self, len: usize) -> Result<usize> {
        self.enter(|cell| {
            let mut state = Self::state(cell)?;
            let (address, size) = state.alloc_tuple(len)?;
            state.map_deferred(address, DeferredMarker::Tuple, size)?;
            Ok(address)
        })
    }

    /// Native list with `len` empty slots
    pub fn new_list(&self, len: usize) -> Result<usize> {
        self.enter(|cell| {
            let mut state = Self::state(cell)?;
            let (address, array) = state.alloc_list(len)?;
            if let Err(err) = state.map_deferred(
                address,
                DeferredMarker::List,
                std::mem::size_of::<header::NativeListObject>(),
            ) {
                if array != 0 {
                    let _ = state.free_buffer(array);
                }
                return Err(err);
            }
            Ok(address)
        })
    }

    /// Set a slot of a tuple that has not been materialized yet
    ///
    /// Takes over the caller's reference to `item` and drops the reference
    /// held by the previous occupant.
    pub fn tuple_set_item(&self, tuple: usize, index: usize, item: usize) -> Result<()> {
        self.enter(|cell| {
            let previous = Self::state(cell)?.swap_tuple_item(tuple, index, item)?;
            if previous != 0 {
                self.decref_locked(cell, previous)?;
            }
            Ok(())
        })
    }

    /// Set a slot of a list
    ///
    /// Takes over the caller's reference to `item` and drops the reference
    /// held by the previous occupant.
    pub fn list_set_item(&self, list: usize, index: usize, item: usize) -> Result<()> {
        self.enter(|cell| {
            let previous = Self::state(cell)?.swap_list_item(list, index, item)?;
            if previous != 0 {
                self.decref_locked(cell, previous)?;
            }
            Ok(())
        })
    }

    /// Shared native string for `bytes`
    ///
    /// Equal contents always give the same address. The intern table keeps
    /// one reference of its own; the caller receives a new one.
    pub fn intern(&self, bytes: &[u8]) -> Result<usize> {
        self.enter(|cell| {
            let mut state = Self::state(cell)?;
            if let Some(&address) = state.interned.get(bytes) {
                state.incref(address)?;
                return Ok(address);
            }
            drop(state);

            let address = self.new_string(bytes)?;
            let mut state = Self::state(cell)?;
            state.interned.insert(bytes.to_vec(), address);
            state.incref(address)?;
            Ok(address)
        })
    }

    pub(crate) fn free_buffer(&self, address: usize) -> Result<()> {
        self.enter(|cell| Self::state(cell)?.free_buffer(address))
    }
}
