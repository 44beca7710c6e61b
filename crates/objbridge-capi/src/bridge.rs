//! Bridge C API - process-wide bridge behind `extern "C"` functions
//!
//! Failures are logged and reported as `-1` or null. Functions called from
//! inside a destructor use the bridge that invoked it.

use anyhow::Context;
use libc::{c_char, c_int, ssize_t};
use objbridge::object::header::{self, NativeObjectHeader};
use objbridge::{Bridge, BridgeError, Result};
use std::ffi::CStr;
use std::sync::{Arc, OnceLock};

static BRIDGE: OnceLock<Arc<Bridge>> = OnceLock::new();

type ObjectPtr = *mut NativeObjectHeader;

fn create_bridge() -> anyhow::Result<Arc<Bridge>> {
    objbridge::init().context("creating the process-wide object bridge")
}

/// Run `f` against the active bridge, mapping failures to `failed`
fn with_bridge<R>(operation: &'static str, failed: R, f: impl FnOnce(&Bridge) -> Result<R>) -> R {
    let result = if Bridge::in_bridge_call() {
        Bridge::with_current(f)
    } else {
        BRIDGE.get().map(|bridge| f(bridge.as_ref()))
    };
    match result {
        Some(Ok(value)) => value,
        Some(Err(err)) => {
            log::error!("{} failed: {}", operation, err);
            failed
        },
        None => {
            log::error!("{}: object bridge is not initialized", operation);
            failed
        },
    }
}

fn to_len(n: ssize_t, operation: &str) -> Result<usize> {
    usize::try_from(n)
        .map_err(|_| BridgeError::ArgumentKind(format!("{}: negative size {}", operation, n)))
}

fn status(result: Result<()>) -> Result<c_int> {
    result.map(|()| 0)
}

#[no_mangle]
pub extern "C" fn objbridge_init() -> bool {
    if let Some(bridge) = BRIDGE.get() {
        if !bridge.is_alive() {
            log::error!("object bridge was shut down and cannot be restarted");
        }
        return bridge.is_alive();
    }

    match create_bridge() {
        Ok(bridge) => {
            // A concurrent init may have won; its bridge is used instead
            let _ = BRIDGE.set(bridge);
            true
        },
        Err(e) => {
            log::error!("{:#}", e);
            false
        },
    }
}

#[no_mangle]
pub extern "C" fn objbridge_shutdown() {
    if let Some(bridge) = BRIDGE.get() {
        if let Err(e) = bridge.dispose() {
            log::error!("object bridge shutdown failed: {}", e);
        }
    }
}

#[no_mangle]
pub extern "C" fn objbridge_incref(obj: ObjectPtr) {
    with_bridge("IncRef", (), |bridge| bridge.incref(obj as usize));
}

#[no_mangle]
pub extern "C" fn objbridge_decref(obj: ObjectPtr) {
    with_bridge("DecRef", (), |bridge| bridge.decref(obj as usize));
}

#[no_mangle]
pub extern "C" fn objbridge_refcount(obj: ObjectPtr) -> ssize_t {
    with_bridge("RefCount", -1, |bridge| bridge.refcount(obj as usize))
}

/// Release an object's memory; called by destructors as their last step
#[no_mangle]
pub extern "C" fn objbridge_free(obj: ObjectPtr) -> c_int {
    with_bridge("Free", -1, |bridge| status(bridge.free(obj as usize)))
}

#[no_mangle]
pub extern "C" fn objbridge_remember_temp(obj: ObjectPtr) -> c_int {
    with_bridge("RememberTemp", -1, |bridge| status(bridge.remember_temp(obj as usize)))
}

#[no_mangle]
pub extern "C" fn objbridge_free_temps() -> c_int {
    with_bridge("FreeTemps", -1, |bridge| status(bridge.free_temps().map(|_| ())))
}

/// New reference to the none singleton
#[no_mangle]
pub extern "C" fn objbridge_none() -> ObjectPtr {
    with_bridge("None", std::ptr::null_mut(), |bridge| {
        let address = bridge.none_address();
        bridge.incref(address)?;
        Ok(address as ObjectPtr)
    })
}

/// New string copied from `data`, or `len` zero bytes when `data` is null
///
/// # Safety
/// A non-null `data` must point to `len` readable bytes.
#[no_mangle]
pub unsafe extern "C" fn objbridge_string_from_bytes(data: *const c_char, len: ssize_t) -> ObjectPtr {
    with_bridge("StringFromBytes", std::ptr::null_mut(), |bridge| {
        let len = to_len(len, "StringFromBytes")?;
        let address = if data.is_null() {
            bridge.new_string_uninit(len)?
        } else {
            // SAFETY: caller guarantees `len` readable bytes.
            let bytes = unsafe { std::slice::from_raw_parts(data as *const u8, len) };
            bridge.new_string(bytes)?
        };
        Ok(address as ObjectPtr)
    })
}

#[no_mangle]
pub extern "C" fn objbridge_string_size(obj: ObjectPtr) -> ssize_t {
    with_bridge("StringSize", -1, |bridge| {
        Ok(bridge.string_len(obj as usize)? as ssize_t)
    })
}

/// Pointer to a string's inline, NUL-terminated bytes
#[no_mangle]
pub extern "C" fn objbridge_string_data(obj: ObjectPtr) -> *mut c_char {
    with_bridge("StringData", std::ptr::null_mut(), |bridge| {
        bridge.string_len(obj as usize)?;
        // SAFETY: checked to be a live string.
        Ok(unsafe { header::string_data(obj as usize) } as *mut c_char)
    })
}

#[no_mangle]
pub extern "C" fn objbridge_tuple_new(size: ssize_t) -> ObjectPtr {
    with_bridge("TupleNew", std::ptr::null_mut(), |bridge| {
        let address = bridge.new_tuple(to_len(size, "TupleNew")?)?;
        Ok(address as ObjectPtr)
    })
}

/// Set a tuple slot, stealing the reference to `item`
#[no_mangle]
pub extern "C" fn objbridge_tuple_set_item(tuple: ObjectPtr, index: ssize_t, item: ObjectPtr) -> c_int {
    with_bridge("TupleSetItem", -1, |bridge| {
        let index = to_len(index, "TupleSetItem")?;
        status(bridge.tuple_set_item(tuple as usize, index, item as usize))
    })
}

#[no_mangle]
pub extern "C" fn objbridge_list_new(size: ssize_t) -> ObjectPtr {
    with_bridge("ListNew", std::ptr::null_mut(), |bridge| {
        let address = bridge.new_list(to_len(size, "ListNew")?)?;
        Ok(address as ObjectPtr)
    })
}

/// Set a list slot, stealing the reference to `item`
#[no_mangle]
pub extern "C" fn objbridge_list_set_item(list: ObjectPtr, index: ssize_t, item: ObjectPtr) -> c_int {
    with_bridge("ListSetItem", -1, |bridge| {
        let index = to_len(index, "ListSetItem")?;
        status(bridge.list_set_item(list as usize, index, item as usize))
    })
}

/// New reference to the interned string equal to `value`
///
/// # Safety
/// `value` must be null or a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn objbridge_intern(value: *const c_char) -> ObjectPtr {
    if value.is_null() {
        log::error!("Intern: null string");
        return std::ptr::null_mut();
    }
    // SAFETY: caller guarantees a NUL-terminated string.
    let bytes = unsafe { CStr::from_ptr(value) }.to_bytes();
    with_bridge("Intern", std::ptr::null_mut(), |bridge| {
        Ok(bridge.intern(bytes)? as ObjectPtr)
    })
}
