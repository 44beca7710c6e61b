//! Actualization - building managed objects for native memory
//!
//! Two situations need a managed object that does not exist yet:
//!
//! 1. An address the map has never seen. `attempt_to_map` resolves its type
//!    pointer first (recursively), then hands the address to the routine
//!    registered for that type.
//! 2. A deferred entry created by a native constructor. `retrieve` reads the
//!    native fields and swaps the sentinel for the real object, keeping the
//!    address and refcount.

use super::state::BridgeState;
use super::Bridge;
use crate::error::{BridgeError, Result};
use crate::logging::BridgeEvent;
use crate::object::{header, DeferredMarker, Object, ObjectKind, Value};
use std::sync::Arc;

/// Managed object produced by an actualization routine
pub enum Actualized {
    /// The bridge owns the native memory; strength follows the refcount
    Owned(Object),
    /// The host owns the native memory and the managed object
    Hosted(Object),
}

/// Routine turning an unmapped native address of one type into a managed
/// object
///
/// Runs with the bridge lock held and must not call back into the bridge.
pub type Actualizer = Arc<dyn Fn(usize) -> Result<Actualized> + Send + Sync>;

/// Actualizer for instances of `type`
pub(crate) fn actualize_type_object(address: usize) -> Result<Actualized> {
    // SAFETY: only registered for addresses whose type is `type`, which all
    // start with a type object prefix.
    let name = unsafe { header::read_type_name(address) };
    Ok(Actualized::Hosted(Object::type_object(name)))
}

impl BridgeState {
    /// Make sure `address` is mapped
    pub(crate) fn attempt_to_map(&mut self, address: usize) -> Result<()> {
        if self.map.has_ptr(address) {
            return Ok(());
        }
        if address == 0 {
            return Err(BridgeError::NotInterpretable {
                address,
                type_address: None,
            });
        }
        if self.disposing || self.released.contains(&address) {
            // Unmapped memory may already be gone
            return Err(BridgeError::NotFound {
                address,
                operation: "AttemptToMap",
            });
        }

        // SAFETY: addresses handed to the bridge are null, mapped, or live
        // native objects.
        let type_address = unsafe { header::read_type(address) };
        if type_address == 0 {
            return Err(BridgeError::NotInterpretable {
                address,
                type_address: None,
            });
        }
        self.attempt_to_map(type_address)?;

        let actualizer = self.actualizers.get(&type_address).cloned().ok_or(
            BridgeError::NotInterpretable {
                address,
                type_address: Some(type_address),
            },
        )?;

        let kind = match actualizer(address)? {
            Actualized::Owned(object) => {
                let kind = object.kind();
                self.map.associate(address, object)?;
                kind
            },
            Actualized::Hosted(object) => {
                let kind = object.kind();
                if kind == ObjectKind::Type {
                    self.type_objects.push(object.clone());
                }
                self.map.bridge_associate(address, object)?;
                kind
            },
        };
        self.refresh_strength(address);

        self.counters.record_actualization();
        self.logger.log(BridgeEvent::Actualized {
            address,
            marker: kind.name(),
        });
        Ok(())
    }

    /// Managed object for `address`, materializing deferred data once
    pub(crate) fn retrieve(&mut self, address: usize) -> Result<Object> {
        self.attempt_to_map(address)?;

        let entry = self.map.entry(address).ok_or(BridgeError::NotFound {
            address,
            operation: "Retrieve",
        })?;
        let object = entry.object().ok_or(BridgeError::Collected { address })?;

        match object.marker() {
            None => Ok(object),
            Some(DeferredMarker::None) => Ok(Object::none()),
            Some(marker) => self.actualize_deferred(address, marker),
        }
    }

    fn actualize_deferred(&mut self, address: usize, marker: DeferredMarker) -> Result<Object> {
        if !self.actualizing.insert(address) {
            return Err(BridgeError::Internal(format!(
                "{} at {:#x} contains itself",
                marker.name(),
                address
            )));
        }

        let result = match marker {
            DeferredMarker::String => self.actualize_string(address),
            DeferredMarker::Tuple => self.actualize_tuple(address),
            DeferredMarker::List => self.actualize_list(address),
            DeferredMarker::None => Ok(Object::none()),
        };
        self.actualizing.remove(&address);

        if result.is_ok() {
            self.refresh_strength(address);
            self.counters.record_actualization();
            self.logger.log(BridgeEvent::Actualized {
                address,
                marker: marker.name(),
            });
        }
        result
    }

    fn actualize_string(&mut self, address: usize) -> Result<Object> {
        // SAFETY: deferred string entries are created over string layouts.
        let bytes = unsafe { header::read_string(address) };
        let object = Object::string(bytes);
        self.map.replace_deferred(address, object.clone())?;
        Ok(object)
    }

    fn actualize_tuple(&mut self, address: usize) -> Result<Object> {
        // SAFETY: deferred tuple entries are created over tuple layouts with
        // `ob_size` inline slots.
        let addresses = unsafe {
            let len = header::read_var_size(address).max(0) as usize;
            header::read_items(header::tuple_items(address), len)
        };

        let items = addresses
            .into_iter()
            .map(|item| self.retrieve(item))
            .collect::<Result<Vec<_>>>()?;

        let object = Object::tuple(items);
        self.map.replace_deferred(address, object.clone())?;
        Ok(object)
    }

    fn actualize_list(&mut self, address: usize) -> Result<Object> {
        // SAFETY: deferred list entries are created over list layouts.
        let (len, array) = unsafe {
            (
                header::read_var_size(address).max(0) as usize,
                header::list_items(address),
            )
        };
        if len > 0 && array.is_null() {
            return Err(BridgeError::Internal(format!(
                "list at {:#x} has {} items but no item array",
                address, len
            )));
        }
        // SAFETY: the item array holds `ob_size` slots.
        let addresses = unsafe { header::read_items(array, len) };

        // Map the list before its items so that it can contain itself
        let sentinel = self.map.get_obj(address).ok_or(BridgeError::Collected { address })?;
        let object = Object::list(Vec::with_capacity(len));
        self.map.replace_deferred(address, object.clone())?;

        let items = match addresses
            .into_iter()
            .map(|item| self.retrieve(item))
            .collect::<Result<Vec<_>>>()
        {
            Ok(items) => items,
            Err(err) => {
                // Stay deferred so that a later retrieve starts over
                self.map.restore_deferred(address, sentinel)?;
                return Err(err);
            },
        };
        if let Value::List(slots) = object.value() {
            *slots.write() = items;
        }
        Ok(object)
    }
}

impl Bridge {
    /// Register the routine used to map unmapped instances of the type at
    /// `type_address`
    ///
    /// Replaces any routine registered for the same type.
    pub fn register_actualizer<F>(&self, type_address: usize, actualizer: F) -> Result<()>
    where
        F: Fn(usize) -> Result<Actualized> + Send + Sync + 'static,
    {
        self.enter(|cell| {
            Self::state(cell)?
                .actualizers
                .insert(type_address, Arc::new(actualizer));
            Ok(())
        })
    }

    /// Make sure `address` is mapped, actualizing it through its type if
    /// needed
    pub fn attempt_to_map(&self, address: usize) -> Result<()> {
        self.enter(|cell| Self::state(cell)?.attempt_to_map(address))
    }
}
