//! Reference-Count Engine
//!
//! Per-address state machine:
//!
//! ```text
//!            store / native constructor
//! Unmapped ─────────────────────────────► Mapped(refcount > 0)
//!                                           │  ▲
//!                               incref/decref│  │ (n > 1)
//!                                           ▼  │
//!                                   decref at refcount 1
//!                                           │
//!                                 destructor / default free
//!                                           ▼
//!                                         Freed
//! ```
//!
//! Strength is re-derived from the native header after every transition.

use super::state::BridgeState;
use super::Bridge;
use crate::error::{BridgeError, Result};
use crate::logging::BridgeEvent;
use crate::object::header::{self, Destructor, NativeListObject, NativeObjectHeader};
use crate::object::{BuiltinType, Object, Value};
use std::cell::RefCell;
use std::mem::size_of;

/// What remains to be done after a refcount drop, once the state borrow is
/// released
#[derive(Debug)]
pub(crate) enum Release {
    /// Object still referenced
    Retained,
    /// Run the type's destructor
    Destroy {
        address: usize,
        destructor: Destructor,
    },
    /// Type has no destructor; free the memory directly
    DefaultFree { address: usize, type_address: usize },
}

impl Release {
    /// Destruction step for an address whose last reference is gone
    ///
    /// # Safety
    /// `address` must point to a live native object.
    pub(crate) unsafe fn for_address(address: usize) -> Release {
        let type_address = header::read_type(address);
        match header::read_dealloc(type_address) {
            Some(destructor) => Release::Destroy {
                address,
                destructor,
            },
            None => Release::DefaultFree {
                address,
                type_address,
            },
        }
    }
}

impl BridgeState {
    /// Map `address` or fail with `NotFound` naming `operation`
    pub(crate) fn require_mapped(&mut self, address: usize, operation: &'static str) -> Result<()> {
        match self.attempt_to_map(address) {
            Ok(()) if self.map.has_ptr(address) => Ok(()),
            Ok(()) => Err(BridgeError::NotFound { address, operation }),
            Err(BridgeError::NotInterpretable { .. }) | Err(BridgeError::NotFound { .. }) => {
                log::debug!("{}: {:#x} cannot be mapped", operation, address);
                Err(BridgeError::NotFound { address, operation })
            },
            Err(err) => Err(err),
        }
    }

    pub(crate) fn refcount(&mut self, address: usize) -> Result<isize> {
        self.require_mapped(address, "RefCount")?;
        self.refresh_strength(address);
        // SAFETY: mapped.
        Ok(unsafe { header::read_refcount(address) })
    }

    pub(crate) fn incref(&mut self, address: usize) -> Result<()> {
        self.require_mapped(address, "IncRef")?;
        // SAFETY: mapped.
        unsafe {
            let refcount = header::read_refcount(address);
            header::write_refcount(address, refcount + 1);
        }
        self.refresh_strength(address);
        Ok(())
    }

    /// Drop one reference; the caller performs the returned release
    pub(crate) fn decref_step(&mut self, address: usize) -> Result<Release> {
        self.require_mapped(address, "DecRef")?;

        // SAFETY: mapped.
        let refcount = unsafe { header::read_refcount(address) };
        match refcount {
            n if n <= 0 => Err(BridgeError::BadRefCount {
                address,
                refcount: n,
            }),
            1 => {
                // SAFETY: mapped.
                unsafe {
                    header::write_refcount(address, 0);
                    Ok(Release::for_address(address))
                }
            },
            n => {
                // SAFETY: mapped.
                unsafe { header::write_refcount(address, n - 1) };
                self.refresh_strength(address);
                Ok(Release::Retained)
            },
        }
    }

    /// Close attached resources, unmap, and return the memory
    ///
    /// Memory the allocator does not own is left untouched, entry included.
    pub(crate) fn free(&mut self, address: usize) -> Result<()> {
        if !self.allocator.contains(address) {
            return Err(BridgeError::InvalidPointer { address });
        }
        if let Some(handle) = self.resources.remove(address) {
            if let Err(err) = handle.close() {
                log::warn!("closing resource of {:#x} failed: {}", address, err);
            }
        }
        self.map.release(address);
        self.free_block(address)?;

        self.counters.record_deallocation();
        self.logger.log(BridgeEvent::Deallocated {
            address,
            forced: self.disposing,
        });
        Ok(())
    }

    /// Return a block that never had a map entry (e.g. a list item array)
    pub(crate) fn free_buffer(&mut self, address: usize) -> Result<()> {
        self.free_block(address)
    }

    /// Give `object` a native address holding one new reference
    ///
    /// Items stored on behalf of a container that then fails are dropped
    /// again; their releases are pushed to `undo`.
    pub(crate) fn store(&mut self, object: &Object, undo: &mut Vec<Release>) -> Result<usize> {
        if let Some(marker) = object.marker() {
            return Err(BridgeError::ArgumentKind(format!(
                "cannot store deferred {} marker",
                marker.name()
            )));
        }

        if object.is_none() {
            let address = self.singletons.none();
            self.incref(address)?;
            return Ok(address);
        }

        if let Some(address) = self.map.get_ptr(object) {
            self.incref(address)?;
            return Ok(address);
        }

        let (address, bytes) = match object.value() {
            Value::Str(bytes) => {
                let (address, size) = self.alloc_string(bytes.len())?;
                // SAFETY: freshly allocated string layout of this length.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        bytes.as_ptr(),
                        header::string_data(address),
                        bytes.len(),
                    )
                };
                (address, size)
            },
            Value::Tuple(items) => self.store_tuple(items, undo)?,
            Value::List(items) => {
                let items = items.read().clone();
                self.store_list(object, &items, undo)?
            },
            Value::Int(value) => {
                let size = size_of::<header::NativeIntObject>();
                let address = self.alloc_object(BuiltinType::Int, size)?;
                // SAFETY: freshly allocated int layout.
                unsafe { header::write_int(address, *value) };
                (address, size)
            },
            Value::Float(value) => {
                let size = size_of::<header::NativeFloatObject>();
                let address = self.alloc_object(BuiltinType::Float, size)?;
                // SAFETY: freshly allocated float layout.
                unsafe { header::write_float(address, *value) };
                (address, size)
            },
            Value::Dict(_) => (
                self.alloc_object(BuiltinType::Dict, header::OBJECT_SIZE)?,
                header::OBJECT_SIZE,
            ),
            _ => (
                self.alloc_object(BuiltinType::Object, header::OBJECT_SIZE)?,
                header::OBJECT_SIZE,
            ),
        };

        if !self.map.has_ptr(address) {
            self.map.associate(address, object.clone())?;
        }
        self.counters.record_store();
        self.logger.log(BridgeEvent::Stored {
            address,
            kind: object.kind().name(),
            bytes,
        });
        Ok(address)
    }

    fn store_items(&mut self, items: &[Object], undo: &mut Vec<Release>) -> Result<Vec<usize>> {
        let mut stored = Vec::with_capacity(items.len());
        for item in items {
            match self.store(item, undo) {
                Ok(address) => stored.push(address),
                Err(err) => {
                    self.unwind(&stored, undo);
                    return Err(err);
                },
            }
        }
        Ok(stored)
    }

    fn unwind(&mut self, stored: &[usize], undo: &mut Vec<Release>) {
        for &address in stored {
            match self.decref_step(address) {
                Ok(release) => undo.push(release),
                Err(err) => log::error!("unwinding store of {:#x}: {}", address, err),
            }
        }
    }

    fn store_tuple(&mut self, items: &[Object], undo: &mut Vec<Release>) -> Result<(usize, usize)> {
        let stored = self.store_items(items, undo)?;
        let (address, size) = match self.alloc_tuple(stored.len()) {
            Ok(allocated) => allocated,
            Err(err) => {
                self.unwind(&stored, undo);
                return Err(err);
            },
        };
        // SAFETY: freshly allocated tuple with `stored.len()` slots.
        unsafe {
            let slots = header::tuple_items(address);
            for (i, &item) in stored.iter().enumerate() {
                *slots.add(i) = item;
            }
        }
        Ok((address, size))
    }

    /// Lists are mapped before their items are stored, so a list that
    /// contains itself resolves to its own address.
    fn store_list(
        &mut self,
        object: &Object,
        items: &[Object],
        undo: &mut Vec<Release>,
    ) -> Result<(usize, usize)> {
        let (address, array) = self.alloc_list(items.len())?;
        if let Err(err) = self.map.associate(address, object.clone()) {
            let _ = self.free_buffer(array);
            let _ = self.free_buffer(address);
            return Err(err);
        }

        for (i, item) in items.iter().enumerate() {
            match self.store(item, undo) {
                // SAFETY: the item array holds `items.len()` slots.
                Ok(stored) => unsafe { *(array as *mut usize).add(i) = stored },
                Err(err) => {
                    // The list destructor releases the slots filled so far
                    self.unwind(&[address], undo);
                    return Err(err);
                },
            }
        }
        Ok((
            address,
            size_of::<NativeListObject>() + items.len() * size_of::<usize>(),
        ))
    }

    /// Allocate and initialize a header of builtin type `ty`
    pub(crate) fn alloc_object(&mut self, ty: BuiltinType, size: usize) -> Result<usize> {
        let type_address = self.types.address(ty);
        self.alloc_typed(type_address, size)
    }

    /// Allocate and initialize a header of any type
    pub(crate) fn alloc_typed(&mut self, type_address: usize, size: usize) -> Result<usize> {
        let address = self.alloc_block(size.max(header::OBJECT_SIZE))?;
        // SAFETY: fresh zeroed block of at least a header.
        unsafe { header::init_header(address, type_address) };
        Ok(address)
    }

    pub(crate) fn alloc_var_object(
        &mut self,
        ty: BuiltinType,
        size: usize,
        len: usize,
    ) -> Result<usize> {
        let address = self.alloc_object(ty, size)?;
        // SAFETY: `size` covers a variable-size header.
        unsafe { header::write_var_size(address, len as isize) };
        Ok(address)
    }

    /// Allocate a string of `len` zero bytes plus the terminator
    ///
    /// Returns the address and the block size.
    pub(crate) fn alloc_string(&mut self, len: usize) -> Result<(usize, usize)> {
        let size = checked_size(header::string_size(len), BuiltinType::Str, len)?;
        let address = self.alloc_var_object(BuiltinType::Str, size, len)?;
        // SAFETY: string layout; the hash is computed lazily by native code.
        unsafe { (*(address as *mut header::NativeStringObject)).ob_shash = -1 };
        Ok((address, size))
    }

    /// Allocate a tuple with `len` empty slots
    ///
    /// Returns the address and the block size.
    pub(crate) fn alloc_tuple(&mut self, len: usize) -> Result<(usize, usize)> {
        let size = checked_size(header::tuple_size(len), BuiltinType::Tuple, len)?;
        let address = self.alloc_var_object(BuiltinType::Tuple, size, len)?;
        Ok((address, size))
    }

    /// Allocate a list header and its item array
    pub(crate) fn alloc_list(&mut self, len: usize) -> Result<(usize, usize)> {
        let array_size = checked_size(header::list_array_size(len), BuiltinType::List, len)?;
        let address =
            self.alloc_var_object(BuiltinType::List, size_of::<NativeListObject>(), len)?;
        let array = if len == 0 {
            0
        } else {
            match self.alloc_block(array_size) {
                Ok(array) => array,
                Err(err) => {
                    let _ = self.free_block(address);
                    return Err(err);
                },
            }
        };
        // SAFETY: fresh list layout.
        unsafe { header::write_list_items(address, array, len as isize) };
        Ok((address, array))
    }
}

/// Size of a `len`-item object of type `ty`, or `ArgumentKind` when it
/// does not fit
fn checked_size(size: Option<usize>, ty: BuiltinType, len: usize) -> Result<usize> {
    size.ok_or_else(|| {
        BridgeError::ArgumentKind(format!("{} of length {} is too large", ty.name(), len))
    })
}

impl Bridge {
    /// Perform a release returned by the state, with no state borrow held
    pub(crate) fn run_release(&self, cell: &RefCell<BridgeState>, release: Release) -> Result<()> {
        match release {
            Release::Retained => Ok(()),
            Release::Destroy {
                address,
                destructor,
            } => {
                // SAFETY: the destructor belongs to the type of a live object
                // whose last reference was just dropped.
                unsafe { destructor(address as *mut NativeObjectHeader) };
                Ok(())
            },
            Release::DefaultFree {
                address,
                type_address,
            } => {
                log::warn!(
                    "type at {:#x} has no destructor; freeing {:#x} directly",
                    type_address,
                    address
                );
                self.logger.log(BridgeEvent::DefaultFree {
                    address,
                    type_address,
                });
                Self::state(cell)?.free(address)
            },
        }
    }

    pub(crate) fn decref_locked(&self, cell: &RefCell<BridgeState>, address: usize) -> Result<()> {
        let release = Self::state(cell)?.decref_step(address)?;
        self.run_release(cell, release)
    }

    /// Give `object` a native address with one new reference
    ///
    /// Storing an already mapped object increments its refcount and returns
    /// the existing address. The none object always maps to the none
    /// singleton and booleans to the true/false singletons.
    pub fn store(&self, object: &Object) -> Result<usize> {
        self.enter(|cell| {
            let mut undo = Vec::new();
            let result = Self::state(cell)?.store(object, &mut undo);
            for release in undo {
                if let Err(err) = self.run_release(cell, release) {
                    self.report_failure("Store", &err);
                }
            }
            result
        })
    }

    /// Managed object for `address`
    ///
    /// Deferred native objects are materialized on the first call; later
    /// calls return the identical object.
    pub fn retrieve(&self, address: usize) -> Result<Object> {
        self.enter(|cell| Self::state(cell)?.retrieve(address))
    }

    /// Current native refcount of `address`
    pub fn refcount(&self, address: usize) -> Result<isize> {
        self.enter(|cell| Self::state(cell)?.refcount(address))
    }

    pub fn incref(&self, address: usize) -> Result<()> {
        self.enter(|cell| Self::state(cell)?.incref(address))
    }

    /// Drop one reference, running the type's destructor at the last one
    ///
    /// Types without a destructor are freed directly and a `DefaultFree`
    /// event is logged.
    pub fn decref(&self, address: usize) -> Result<()> {
        self.enter(|cell| self.decref_locked(cell, address))
    }

    /// Release the native memory at `address`
    ///
    /// Closes any attached resource handle and unmaps the address. This is
    /// what destructors call as their last step.
    pub fn free(&self, address: usize) -> Result<()> {
        self.enter(|cell| Self::state(cell)?.free(address))
    }

    /// Associate a host-owned native object with its managed counterpart
    ///
    /// `address` must point to a live native object whose header the host
    /// keeps valid for as long as the entry exists.
    pub fn store_bridge(&self, address: usize, object: &Object) -> Result<()> {
        if address == 0 {
            return Err(BridgeError::InvalidPointer { address });
        }
        self.enter(|cell| {
            let mut state = Self::state(cell)?;
            state.map.bridge_associate(address, object.clone())?;
            state.refresh_strength(address);
            Ok(())
        })
    }

    /// Keep `object` alive regardless of its native refcount
    pub fn strengthen(&self, object: &Object) -> Result<()> {
        self.enter(|cell| {
            if Self::state(cell)?.map.strengthen(object) {
                Ok(())
            } else {
                Err(BridgeError::ArgumentKind(format!(
                    "strengthen: {:?} is not mapped",
                    object
                )))
            }
        })
    }

    /// Let `object` be collected regardless of its native refcount
    pub fn weaken(&self, object: &Object) -> Result<()> {
        self.enter(|cell| {
            if Self::state(cell)?.map.weaken(object) {
                Ok(())
            } else {
                Err(BridgeError::ArgumentKind(format!(
                    "weaken: {:?} is not mapped",
                    object
                )))
            }
        })
    }

    /// Re-derive all host-owned entries and prune collected ones
    ///
    /// Returns the pruned addresses.
    pub fn check_bridge_ptrs(&self) -> Result<Vec<usize>> {
        self.enter(|cell| {
            let mut state = Self::state(cell)?;
            let checked = state.map.bridge_count();
            // SAFETY: bridge entries point to live host-owned objects.
            let pruned = state
                .map
                .check_bridge_ptrs(|address| unsafe { header::read_refcount(address) });
            self.logger.log(BridgeEvent::BridgeSweep {
                checked,
                pruned: pruned.len(),
            });
            Ok(pruned)
        })
    }

    /// Call `f` for every host-owned address
    ///
    /// Works on a snapshot, so `f` may call back into the bridge.
    pub fn map_over_bridge_ptrs(&self, mut f: impl FnMut(&Bridge, usize)) -> Result<()> {
        self.enter(|cell| {
            let addresses = Self::state(cell)?.map.bridge_addresses();
            for address in addresses {
                f(self, address);
            }
            Ok(())
        })
    }
}
