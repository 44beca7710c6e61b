//! Object Module - both sides of the bridge
//!
//! - `header`: binary layout of native objects
//! - `value`: managed objects
//! - `types`: builtin native type objects and singletons

pub mod header;
pub mod types;
pub mod value;

pub use header::{Destructor, NativeObjectHeader, NativeTypeObject};
pub use types::{BuiltinType, BuiltinTypes, Singletons, IMMORTAL_REFCOUNT};
pub use value::{DeferredMarker, DictKey, Object, ObjectKind, Value, WeakObject};
