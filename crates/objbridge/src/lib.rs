//! # objbridge - Native Object Bridge and Refcount Engine
//!
//! objbridge lets compiled extension modules written against a fixed C
//! object ABI operate on objects that live in a garbage-collected managed
//! object space. Native code sees manually refcounted structs at stable
//! addresses; managed code sees ordinary shared objects.
//!
//! ## Overview
//!
//! - **Pointer map**: bidirectional native address <-> managed object table,
//!   with each entry holding its object strongly or weakly
//! - **Refcount engine**: store, retrieve, incref, decref and free, driving
//!   native destructors at the last reference
//! - **Actualization**: managed objects are built lazily from native memory
//!   the first time managed code looks at it
//! - **Temps**: bulk release of references owned by one native call
//!
//! ## Quick Start
//!
//! ```rust
//! use objbridge::{BridgeConfig, Object};
//!
//! fn main() -> Result<(), objbridge::BridgeError> {
//!     let bridge = objbridge::init()?;
//!
//!     // Managed -> native
//!     let greeting = Object::from("hello");
//!     let address = bridge.store(&greeting)?;
//!     assert_eq!(bridge.refcount(address)?, 1);
//!
//!     // Native -> managed, materialized on first access
//!     let tuple = bridge.new_tuple(1)?;
//!     bridge.tuple_set_item(tuple, 0, address)?;
//!     let managed = bridge.retrieve(tuple)?;
//!     assert_eq!(managed.items().unwrap()[0], greeting);
//!
//!     // Dropping the tuple drops the reference it stole
//!     bridge.decref(tuple)?;
//!     assert!(!bridge.has_pointer(address));
//!
//!     bridge.dispose()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────┐        ┌──────────────────────────┐
//! │     Extension module     │        │      Managed objects     │
//! │  (refcount, type ptr)    │        │   (Object / WeakObject)  │
//! └────────────┬─────────────┘        └─────────────┬────────────┘
//!              │ incref / decref / new_*            │ store / retrieve
//!              ▼                                    ▼
//! ┌────────────────────────────────────────────────────────────────┐
//! │                        Bridge (global lock)                    │
//! │  ┌────────────┐  ┌──────────────┐  ┌────────────┐  ┌────────┐  │
//! │  │ PointerMap │  │ Actualizers  │  │ Temp set   │  │ Delete │  │
//! │  │ addr <-> obj│ │ type -> fn   │  │            │  │ queue  │  │
//! │  └────────────┘  └──────────────┘  └────────────┘  └────────┘  │
//! │                  ┌──────────────┐                              │
//! │                  │  Allocator   │                              │
//! │                  └──────────────┘                              │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ### Entry strength
//!
//! | Origin | Refcount | Strength |
//! |--------|----------|----------|
//! | store / native constructor | > 0 | Strong |
//! | store / native constructor | 0 | Weak |
//! | host (bridge) | > 1 | Strong |
//! | host (bridge) | <= 1 | Weak |
//! | deferred | any | Strong |
//!
//! `strengthen`/`weaken` pin an entry regardless of its refcount.

pub mod allocator;
pub mod config;
pub mod error;
pub mod logging;
pub mod map;
pub mod object;
pub mod runtime;
pub mod stats;

pub use allocator::{Allocator, HeapAllocator};
pub use config::{BridgeConfig, ConfigError};
pub use error::{BridgeError, Result};
pub use logging::{BridgeEvent, BridgeLogger, LogLevel};
pub use map::{BridgeEntry, EntryOrigin, PointerMap, Strength};
pub use object::{BuiltinType, DeferredMarker, Object, ObjectKind, Value, WeakObject};
pub use runtime::{Actualized, Bridge, ResourceHandle};
pub use stats::BridgeStats;

use std::sync::Arc;

/// objbridge version string from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Create a bridge with configuration read from the environment
///
/// See `BridgeConfig::from_env` for the recognized variables.
pub fn init() -> Result<Arc<Bridge>> {
    Bridge::new(BridgeConfig::from_env())
}

/// Create a bridge with the given configuration
///
/// # Examples
///
/// ```rust
/// use objbridge::BridgeConfig;
///
/// let config = BridgeConfig {
///     max_allocated_bytes: Some(16 * 1024 * 1024),
///     delete_dispatch: false,
///     ..Default::default()
/// };
///
/// let bridge = objbridge::init_with_config(config)?;
/// # Ok::<(), objbridge::BridgeError>(())
/// ```
pub fn init_with_config(config: BridgeConfig) -> Result<Arc<Bridge>> {
    Bridge::new(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_default() {
        let bridge = init_with_config(BridgeConfig::default()).unwrap();
        assert!(bridge.is_alive());
    }

    #[test]
    fn test_version_not_empty() {
        assert!(!VERSION.is_empty());
    }
}
