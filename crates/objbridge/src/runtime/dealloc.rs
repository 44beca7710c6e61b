//! Builtin destructors
//!
//! These sit in the `tp_dealloc` slot of the builtin types and are called
//! with the bridge lock held by the thread that dropped the last reference.
//! They reach the bridge through the current-bridge scope.

use super::Bridge;
use crate::error::Result;
use crate::object::header::{self, NativeObjectHeader};
use crate::object::IMMORTAL_REFCOUNT;

fn in_bridge(operation: &'static str, f: impl FnOnce(&Bridge) -> Result<()>) {
    let handled = Bridge::with_current(|bridge| {
        if let Err(err) = f(bridge) {
            bridge.report_failure(operation, &err);
        }
    });
    if handled.is_none() {
        log::error!("{}: called outside of any bridge", operation);
    }
}

impl Bridge {
    /// Drop the references held by a container's item slots
    ///
    /// During teardown, items that were already destroyed are skipped.
    fn release_items(&self, items: &[usize]) {
        let disposing = self.is_disposing();
        for &item in items {
            if item == 0 || (disposing && !self.has_pointer(item)) {
                continue;
            }
            if let Err(err) = self.decref(item) {
                self.report_failure("DecRef item", &err);
            }
        }
    }
}

/// Destructor of plain objects: free the memory
pub(crate) unsafe extern "C" fn object_dealloc(object: *mut NativeObjectHeader) {
    let address = object as usize;
    in_bridge("object_dealloc", |bridge| bridge.free(address));
}

/// Destructor of tuples: release the items, then free
pub(crate) unsafe extern "C" fn tuple_dealloc(object: *mut NativeObjectHeader) {
    let address = object as usize;
    // SAFETY: called on a live tuple.
    let items = unsafe {
        let len = header::read_var_size(address).max(0) as usize;
        header::read_items(header::tuple_items(address), len)
    };
    in_bridge("tuple_dealloc", |bridge| {
        bridge.release_items(&items);
        bridge.free(address)
    });
}

/// Destructor of lists: release the items and the item array, then free
pub(crate) unsafe extern "C" fn list_dealloc(object: *mut NativeObjectHeader) {
    let address = object as usize;
    // SAFETY: called on a live list whose array holds `ob_size` slots.
    let (array, items) = unsafe {
        let len = header::read_var_size(address).max(0) as usize;
        let array = header::list_items(address);
        let items = if array.is_null() {
            Vec::new()
        } else {
            header::read_items(array, len)
        };
        (array as usize, items)
    };
    in_bridge("list_dealloc", |bridge| {
        bridge.release_items(&items);
        if array != 0 {
            bridge.free_buffer(array)?;
        }
        bridge.free(address)
    });
}

/// Destructor of types and singletons, which are never freed
pub(crate) unsafe extern "C" fn immortal_dealloc(object: *mut NativeObjectHeader) {
    let address = object as usize;
    log::error!("refcount of immortal object {:#x} reached zero", address);
    // SAFETY: types and singletons are owned by the bridge for its lifetime.
    unsafe { header::write_refcount(address, IMMORTAL_REFCOUNT) };
}
