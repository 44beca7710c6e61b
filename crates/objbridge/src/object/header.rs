//! Native Object Layout - the binary contract with extension modules
//!
//! Every bridged address starts with the same two fields. Variable-size
//! objects add an element count, and type descriptors expose the
//! destructor slot at a fixed offset:
//!
//! ```text
//! NativeObjectHeader (16 bytes on 64-bit)
//! ┌─────────────────────────────────────────┐
//! │         ob_refcnt (isize)               │  offset 0
//! ├─────────────────────────────────────────┤
//! │         ob_type (*mut NativeTypeObject) │  offset 8
//! └─────────────────────────────────────────┘
//!
//! NativeTypeObject (prefix)
//! ┌──────────┬─────────┬─────────┬─────────┬──────────────┬─────────────┬────────────┐
//! │ ob_refcnt│ ob_type │ ob_size │ tp_name │ tp_basicsize │ tp_itemsize │ tp_dealloc │
//! └──────────┴─────────┴─────────┴─────────┴──────────────┴─────────────┴────────────┘
//! ```
//!
//! Any offset mismatch with the native side corrupts arbitrary memory, so
//! every struct here is `#[repr(C)]` and the offsets are pinned by tests.
//! The bridge only reads the type object up to `tp_dealloc`; extension
//! type objects may be longer.

use std::ffi::{c_char, c_int, c_long, CStr};
use std::mem::{offset_of, size_of};

/// Destructor slot signature
pub type Destructor = unsafe extern "C" fn(*mut NativeObjectHeader);

/// Fixed header at the start of every bridged native object
#[repr(C)]
pub struct NativeObjectHeader {
    pub ob_refcnt: isize,
    pub ob_type: *mut NativeTypeObject,
}

/// Header of variable-size objects
#[repr(C)]
pub struct NativeVarObjectHeader {
    pub ob_base: NativeObjectHeader,
    pub ob_size: isize,
}

/// Type descriptor prefix
#[repr(C)]
pub struct NativeTypeObject {
    pub ob_base: NativeVarObjectHeader,
    pub tp_name: *const c_char,
    pub tp_basicsize: isize,
    pub tp_itemsize: isize,
    pub tp_dealloc: Option<Destructor>,
}

/// Byte string with inline, NUL-terminated storage
#[repr(C)]
pub struct NativeStringObject {
    pub ob_base: NativeVarObjectHeader,
    pub ob_shash: c_long,
    pub ob_sstate: c_int,
    pub ob_sval: [u8; 1],
}

/// Tuple with inline item pointers
#[repr(C)]
pub struct NativeTupleObject {
    pub ob_base: NativeVarObjectHeader,
    pub ob_item: [*mut NativeObjectHeader; 1],
}

/// List with a separately allocated item array
#[repr(C)]
pub struct NativeListObject {
    pub ob_base: NativeVarObjectHeader,
    pub ob_item: *mut *mut NativeObjectHeader,
    pub allocated: isize,
}

#[repr(C)]
pub struct NativeIntObject {
    pub ob_base: NativeObjectHeader,
    pub ob_ival: c_long,
}

#[repr(C)]
pub struct NativeFloatObject {
    pub ob_base: NativeObjectHeader,
    pub ob_fval: f64,
}

pub const REFCOUNT_OFFSET: usize = offset_of!(NativeObjectHeader, ob_refcnt);
pub const TYPE_OFFSET: usize = offset_of!(NativeObjectHeader, ob_type);
pub const DEALLOC_OFFSET: usize = offset_of!(NativeTypeObject, tp_dealloc);

/// Size of a plain object header
pub const OBJECT_SIZE: usize = size_of::<NativeObjectHeader>();

/// Largest block size whose length still fits `ob_size`
const MAX_OBJECT_SIZE: usize = isize::MAX as usize;

/// Size of a string object holding `len` bytes plus the trailing NUL
///
/// `None` when the size does not fit an object.
pub fn string_size(len: usize) -> Option<usize> {
    offset_of!(NativeStringObject, ob_sval)
        .checked_add(len)?
        .checked_add(1)
        .filter(|&size| size <= MAX_OBJECT_SIZE)
}

/// Size of a tuple object holding `len` items
///
/// `None` when the size does not fit an object.
pub fn tuple_size(len: usize) -> Option<usize> {
    len.max(1)
        .checked_mul(size_of::<usize>())?
        .checked_add(offset_of!(NativeTupleObject, ob_item))
        .filter(|&size| size <= MAX_OBJECT_SIZE)
}

/// Size of the item array of a list holding `len` items
///
/// `None` when the size does not fit an object.
pub fn list_array_size(len: usize) -> Option<usize> {
    len.checked_mul(size_of::<usize>())
        .filter(|&size| size <= MAX_OBJECT_SIZE)
}

/// Get pointer to the header at `address`
///
/// # Safety
/// None by itself; dereferencing requires `address` to be a live object.
#[inline]
pub unsafe fn get_header(address: usize) -> *mut NativeObjectHeader {
    address as *mut NativeObjectHeader
}

/// # Safety
/// `address` must point to a live object header.
#[inline]
pub unsafe fn read_refcount(address: usize) -> isize {
    (*get_header(address)).ob_refcnt
}

/// # Safety
/// `address` must point to a live object header.
#[inline]
pub unsafe fn write_refcount(address: usize, refcount: isize) {
    (*get_header(address)).ob_refcnt = refcount;
}

/// # Safety
/// `address` must point to a live object header.
#[inline]
pub unsafe fn read_type(address: usize) -> usize {
    (*get_header(address)).ob_type as usize
}

/// # Safety
/// `address` must point to a live object header.
#[inline]
pub unsafe fn write_type(address: usize, type_address: usize) {
    (*get_header(address)).ob_type = type_address as *mut NativeTypeObject;
}

/// Initialize a freshly allocated header
///
/// # Safety
/// `address` must point to at least `OBJECT_SIZE` writable bytes.
#[inline]
pub unsafe fn init_header(address: usize, type_address: usize) {
    write_refcount(address, 1);
    write_type(address, type_address);
}

/// # Safety
/// `address` must point to a live variable-size object.
#[inline]
pub unsafe fn read_var_size(address: usize) -> isize {
    (*(address as *mut NativeVarObjectHeader)).ob_size
}

/// # Safety
/// `address` must point to a live variable-size object.
#[inline]
pub unsafe fn write_var_size(address: usize, size: isize) {
    (*(address as *mut NativeVarObjectHeader)).ob_size = size;
}

/// Read the destructor slot of a type
///
/// # Safety
/// `type_address` must be null or point to a live type object prefix.
#[inline]
pub unsafe fn read_dealloc(type_address: usize) -> Option<Destructor> {
    if type_address == 0 {
        return None;
    }
    (*(type_address as *mut NativeTypeObject)).tp_dealloc
}

/// Read `tp_name` of a type, lossily decoded
///
/// # Safety
/// `type_address` must point to a live type object whose `tp_name` is
/// null or a NUL-terminated string.
pub unsafe fn read_type_name(type_address: usize) -> String {
    let name = (*(type_address as *mut NativeTypeObject)).tp_name;
    if name.is_null() {
        return String::from("?");
    }
    CStr::from_ptr(name).to_string_lossy().into_owned()
}

/// Pointer to the inline bytes of a string object
///
/// # Safety
/// `address` must point to a live string object.
#[inline]
pub unsafe fn string_data(address: usize) -> *mut u8 {
    (address + offset_of!(NativeStringObject, ob_sval)) as *mut u8
}

/// Copy the contents of a string object
///
/// # Safety
/// `address` must point to a live string object whose `ob_size` bytes are
/// initialized.
pub unsafe fn read_string(address: usize) -> Vec<u8> {
    let len = read_var_size(address).max(0) as usize;
    std::slice::from_raw_parts(string_data(address), len).to_vec()
}

/// Pointer to the inline item slots of a tuple
///
/// # Safety
/// `address` must point to a live tuple object.
#[inline]
pub unsafe fn tuple_items(address: usize) -> *mut usize {
    (address + offset_of!(NativeTupleObject, ob_item)) as *mut usize
}

/// Pointer to the item array of a list
///
/// # Safety
/// `address` must point to a live list object.
#[inline]
pub unsafe fn list_items(address: usize) -> *mut usize {
    (*(address as *mut NativeListObject)).ob_item as *mut usize
}

/// # Safety
/// `address` must point to a live list object.
#[inline]
pub unsafe fn write_list_items(address: usize, items: usize, allocated: isize) {
    let list = address as *mut NativeListObject;
    (*list).ob_item = items as *mut *mut NativeObjectHeader;
    (*list).allocated = allocated;
}

/// Read `len` item addresses starting at `items`
///
/// # Safety
/// `items` must point to `len` readable slots.
pub unsafe fn read_items(items: *const usize, len: usize) -> Vec<usize> {
    if len == 0 {
        return Vec::new();
    }
    std::slice::from_raw_parts(items, len).to_vec()
}

/// # Safety
/// `address` must point to a live int object.
#[inline]
pub unsafe fn write_int(address: usize, value: i64) {
    (*(address as *mut NativeIntObject)).ob_ival = value as c_long;
}

/// # Safety
/// `address` must point to a live int object.
#[inline]
pub unsafe fn read_int(address: usize) -> i64 {
    (*(address as *mut NativeIntObject)).ob_ival as i64
}

/// # Safety
/// `address` must point to a live float object.
#[inline]
pub unsafe fn write_float(address: usize, value: f64) {
    (*(address as *mut NativeFloatObject)).ob_fval = value;
}

/// # Safety
/// `address` must point to a live float object.
#[inline]
pub unsafe fn read_float(address: usize) -> f64 {
    (*(address as *mut NativeFloatObject)).ob_fval
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_offsets_match_abi() {
        assert_eq!(REFCOUNT_OFFSET, 0);
        assert_eq!(TYPE_OFFSET, size_of::<isize>());
        assert_eq!(OBJECT_SIZE, 2 * size_of::<usize>());
        assert_eq!(
            offset_of!(NativeVarObjectHeader, ob_size),
            2 * size_of::<usize>()
        );
    }

    #[test]
    fn test_type_object_dealloc_slot() {
        // ob_refcnt, ob_type, ob_size, tp_name, tp_basicsize, tp_itemsize
        assert_eq!(DEALLOC_OFFSET, 6 * size_of::<usize>());
    }

    #[test]
    fn test_list_and_tuple_item_offsets() {
        assert_eq!(
            offset_of!(NativeTupleObject, ob_item),
            3 * size_of::<usize>()
        );
        assert_eq!(
            offset_of!(NativeListObject, ob_item),
            3 * size_of::<usize>()
        );
        assert_eq!(tuple_size(0), tuple_size(1));
    }

    #[test]
    fn test_sizes_reject_overflowing_lengths() {
        assert_eq!(string_size(3), Some(offset_of!(NativeStringObject, ob_sval) + 4));
        assert_eq!(string_size(usize::MAX), None);
        assert_eq!(string_size(MAX_OBJECT_SIZE), None);

        assert_eq!(tuple_size(usize::MAX / 8 + 2), None);
        assert_eq!(tuple_size(MAX_OBJECT_SIZE / size_of::<usize>()), None);

        assert_eq!(list_array_size(2), Some(2 * size_of::<usize>()));
        assert_eq!(list_array_size(usize::MAX / 8 + 2), None);
    }

    #[test]
    fn test_header_read_write() {
        let mut block = [0usize; 4];
        let addr = block.as_mut_ptr() as usize;

        unsafe {
            init_header(addr, 0x4000);
            assert_eq!(read_refcount(addr), 1);
            assert_eq!(read_type(addr), 0x4000);

            write_refcount(addr, 7);
            assert_eq!(read_refcount(addr), 7);
        }
    }

    #[test]
    fn test_read_dealloc_null_type() {
        assert!(unsafe { read_dealloc(0) }.is_none());
    }
}
