//! Test Utilities for the objbridge Bug-Finding Test Suite
//!
//! Provides a bridge fixture, native extension types with counting
//! destructors, a recording allocator and strict assertion helpers.
//!
//! ============================================================================
//! CRITICAL: Every refcount and mapping assertion here is EXACT.
//! ============================================================================

#![allow(dead_code)]

use lazy_static::lazy_static;
use objbridge::object::header::{NativeObjectHeader, NativeTypeObject, NativeVarObjectHeader, OBJECT_SIZE};
use objbridge::object::IMMORTAL_REFCOUNT;
use objbridge::{Actualized, Allocator, Bridge, BridgeConfig, BuiltinType, HeapAllocator, Object, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::CString;
use std::sync::Arc;
use std::time::Duration;

/// Maximum time a test waits for the delete dispatcher
pub const DISPATCH_TIMEOUT: Duration = Duration::from_secs(5);

lazy_static! {
    /// type address -> instances whose destructor ran, in order
    static ref DESTROYED: Mutex<HashMap<usize, Vec<usize>>> = Mutex::new(HashMap::new());
}

/// ============================================================================
/// NATIVE EXTENSION TYPES
/// ============================================================================

/// Destructor of fixture types: record the instance, then free it
unsafe extern "C" fn counting_dealloc(object: *mut NativeObjectHeader) {
    let address = object as usize;
    let type_address = (*object).ob_type as usize;
    DESTROYED.lock().entry(type_address).or_default().push(address);

    match Bridge::with_current(|bridge| bridge.free(address)) {
        Some(Ok(())) => {},
        Some(Err(err)) => eprintln!("counting_dealloc: free of {:#x} failed: {}", address, err),
        None => eprintln!("counting_dealloc: {:#x} destroyed outside of a bridge", address),
    }
}

/// Extension type object owned by a test, the way a C extension owns its
/// static type objects
pub struct NativeType {
    object: Box<NativeTypeObject>,
    _name: CString,
}

impl NativeType {
    fn new(bridge: &Bridge, name: &str, with_destructor: bool) -> Self {
        let name = CString::new(name).expect("type name has no NUL");
        let object = Box::new(NativeTypeObject {
            ob_base: NativeVarObjectHeader {
                ob_base: NativeObjectHeader {
                    ob_refcnt: IMMORTAL_REFCOUNT,
                    ob_type: bridge.builtin_type(BuiltinType::Type) as *mut NativeTypeObject,
                },
                ob_size: 0,
            },
            tp_name: name.as_ptr(),
            tp_basicsize: OBJECT_SIZE as isize,
            tp_itemsize: 0,
            tp_dealloc: if with_destructor {
                Some(counting_dealloc)
            } else {
                None
            },
        });
        Self {
            object,
            _name: name,
        }
    }

    pub fn address(&self) -> usize {
        &*self.object as *const NativeTypeObject as usize
    }
}

/// ============================================================================
/// RECORDING ALLOCATOR
/// ============================================================================

/// Allocation history shared between a test and its allocator
#[derive(Default)]
pub struct AllocationLog {
    pub allocs: Vec<usize>,
    pub frees: Vec<usize>,
    pub free_all_calls: usize,
}

/// Heap allocator that records every call
///
/// **Bug this finds:** Double frees, frees of foreign memory, leaked blocks
pub struct RecordingAllocator {
    inner: HeapAllocator,
    log: Arc<Mutex<AllocationLog>>,
}

impl RecordingAllocator {
    pub fn new() -> (Self, Arc<Mutex<AllocationLog>>) {
        let log = Arc::new(Mutex::new(AllocationLog::default()));
        (
            Self {
                inner: HeapAllocator::new(),
                log: log.clone(),
            },
            log,
        )
    }
}

impl Allocator for RecordingAllocator {
    fn alloc(&mut self, size: usize) -> Result<usize> {
        let address = self.inner.alloc(size)?;
        self.log.lock().allocs.push(address);
        Ok(address)
    }

    fn free(&mut self, address: usize) -> Result<()> {
        self.inner.free(address)?;
        self.log.lock().frees.push(address);
        Ok(())
    }

    fn contains(&self, address: usize) -> bool {
        self.inner.contains(address)
    }

    fn free_all(&mut self) -> usize {
        self.log.lock().free_all_calls += 1;
        self.inner.free_all()
    }

    fn allocated_bytes(&self) -> usize {
        self.inner.allocated_bytes()
    }
}

/// ============================================================================
/// BRIDGE FIXTURE
/// ============================================================================

/// Test fixture owning one bridge and the extension types defined on it
///
/// The bridge is disposed before the type objects are dropped, since
/// teardown still reads their headers.
pub struct BridgeFixture {
    pub bridge: Arc<Bridge>,
    types: Vec<NativeType>,
}

impl BridgeFixture {
    /// Bridge without the background dispatcher
    ///
    /// **Bug this finds:** Configuration validation bugs, initialization failures
    pub fn with_defaults() -> Self {
        Self::with_config(BridgeConfig {
            delete_dispatch: false,
            ..Default::default()
        })
    }

    /// Bridge with the background dispatcher running
    pub fn with_dispatcher() -> Self {
        Self::with_config(BridgeConfig {
            delete_dispatch: true,
            delete_dispatch_interval_ms: 1,
            ..Default::default()
        })
    }

    pub fn with_config(config: BridgeConfig) -> Self {
        let bridge =
            Bridge::new(config).expect("bridge initialization should succeed with valid config");
        Self {
            bridge,
            types: Vec::new(),
        }
    }

    /// Bridge over a recording allocator
    pub fn with_recording_allocator() -> (Self, Arc<Mutex<AllocationLog>>) {
        let (allocator, log) = RecordingAllocator::new();
        let bridge = Bridge::with_allocator(
            BridgeConfig {
                delete_dispatch: false,
                ..Default::default()
            },
            Box::new(allocator),
        )
        .expect("bridge initialization should succeed with a recording allocator");
        (
            Self {
                bridge,
                types: Vec::new(),
            },
            log,
        )
    }

    /// Define an extension type with a counting destructor
    ///
    /// Instances are actualized as opaque managed objects carrying their
    /// own address.
    pub fn define_type(&mut self, name: &str) -> usize {
        self.define(name, true)
    }

    /// Define an extension type that leaves `tp_dealloc` empty
    pub fn define_type_without_destructor(&mut self, name: &str) -> usize {
        self.define(name, false)
    }

    fn define(&mut self, name: &str, with_destructor: bool) -> usize {
        let ty = NativeType::new(&self.bridge, name, with_destructor);
        let type_address = ty.address();
        let type_name = name.to_string();
        self.bridge
            .register_actualizer(type_address, move |address| {
                Ok(Actualized::Owned(Object::opaque(type_name.clone(), address)))
            })
            .expect("registering an actualizer should succeed");
        self.types.push(ty);
        type_address
    }

    /// Native instance of `type_address`, refcount 1, not yet mapped
    pub fn new_instance(&self, type_address: usize) -> usize {
        self.bridge
            .new_object(type_address, OBJECT_SIZE)
            .unwrap_or_else(|e| panic!("allocating an instance failed: {:?}", e))
    }

    /// Native instance that is already mapped
    pub fn new_mapped_instance(&self, type_address: usize) -> usize {
        let address = self.new_instance(type_address);
        self.bridge
            .attempt_to_map(address)
            .unwrap_or_else(|e| panic!("mapping {:#x} failed: {:?}", address, e));
        address
    }

    /// Instances of `type_address` whose destructor has run, in order
    pub fn destroyed(&self, type_address: usize) -> Vec<usize> {
        DESTROYED
            .lock()
            .get(&type_address)
            .cloned()
            .unwrap_or_default()
    }
}

impl Drop for BridgeFixture {
    fn drop(&mut self) {
        let _ = self.bridge.dispose();
        let mut destroyed = DESTROYED.lock();
        for ty in &self.types {
            destroyed.remove(&ty.address());
        }
    }
}

/// ============================================================================
/// STRICT ASSERTION HELPERS
/// ============================================================================

/// Assert the exact refcount of a mapped address
///
/// **Tolerance:** ZERO - an off-by-one refcount is a leak or a use-after-free
#[track_caller]
pub fn assert_refcount(bridge: &Bridge, address: usize, expected: isize, context: &str) {
    let actual = bridge
        .refcount(address)
        .unwrap_or_else(|e| panic!("{}: refcount of {:#x} failed: {:?}", context, address, e));
    assert_eq!(
        actual, expected,
        "{}: refcount of {:#x} is {}, expected {}",
        context, address, actual, expected
    );
}

/// Assert that an address has no map entry
#[track_caller]
pub fn assert_unmapped(bridge: &Bridge, address: usize, context: &str) {
    assert!(
        !bridge.has_pointer(address),
        "{}: {:#x} is still mapped after its last reference was dropped",
        context,
        address
    );
}

/// Assert that each address appears exactly once
///
/// **Bug this finds:** Destructors run twice, or not at all
#[track_caller]
pub fn assert_each_once(actual: &[usize], expected: &[usize], context: &str) {
    let mut sorted_actual = actual.to_vec();
    let mut sorted_expected = expected.to_vec();
    sorted_actual.sort_unstable();
    sorted_expected.sort_unstable();
    assert_eq!(
        sorted_actual, sorted_expected,
        "{}: destructor calls {:x?} do not match live objects {:x?}",
        context, actual, expected
    );
}
