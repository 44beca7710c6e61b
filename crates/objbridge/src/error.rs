//! Error Module - Bridge Error Types
//!
//! Defines all error types used by the object bridge.
//!
//! # Error Categories
//!
//! ## Mapping Errors
//! - `NotFound` - Address required to be mappable is not
//! - `NotInterpretable` - Type chain of an address cannot be resolved
//! - `AlreadyMapped` - Address already has an association
//! - `Collected` - Weakly held managed object has been reclaimed
//!
//! ## Refcount Errors
//! - `BadRefCount` - Refcount invariant violated
//!
//! ## Argument Errors
//! - `ArgumentKind` - Internal sentinel passed where a managed object is required
//! - `InvalidPointer` - Null or foreign pointer
//!
//! ## Memory and Lifecycle Errors
//! - `OutOfMemory` - Allocator limit reached
//! - `Disposed` - Bridge already torn down
//! - `Configuration` - Invalid configuration
//! - `Internal` - Bridge bug

use crate::config::ConfigError;
use thiserror::Error;

/// Main error type for all bridge operations
///
/// # Examples
///
/// ```rust
/// use objbridge::BridgeError;
///
/// fn report(err: &BridgeError) -> String {
///     match err {
///         BridgeError::BadRefCount { address, refcount } => {
///             format!("corrupt refcount {} at {:#x}", refcount, address)
///         }
///         other => other.to_string(),
///     }
/// }
/// ```
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Address absent from the map where mappability is required
    ///
    /// **When returned:** `incref`, `decref`, `refcount` or `retrieve` on an
    /// address that is neither mapped nor actualizable.
    ///
    /// **Recovery strategy:** None. The caller holds a pointer the bridge
    /// never handed out, or one that was already freed.
    #[error("{operation}: missing key in pointer map: {address:#x}")]
    NotFound {
        address: usize,
        operation: &'static str,
    },

    /// Type chain cannot be resolved
    ///
    /// **When returned:** `attempt_to_map` on a null address, or on an address
    /// whose type has no registered actualization routine.
    ///
    /// **Recovery strategy:** None. Signals a native/managed mismatch.
    #[error("{}", describe_unmappable(.address, .type_address))]
    NotInterpretable {
        address: usize,
        type_address: Option<usize>,
    },

    /// Refcount invariant violated
    ///
    /// **When returned:** `decref` on an address whose refcount is already 0.
    ///
    /// **Recovery strategy:** Cannot recover - prior corruption.
    #[error("trying to decref object at {address:#x} with ref count {refcount}")]
    BadRefCount { address: usize, refcount: isize },

    /// Internal sentinel passed by a client
    ///
    /// **When returned:** `store` given a deferred-marker object.
    #[error("argument kind error: {0}")]
    ArgumentKind(String),

    /// Address already associated
    #[error("address {address:#x} is already mapped")]
    AlreadyMapped { address: usize },

    /// Weak referent reclaimed
    ///
    /// **When returned:** `retrieve` on a weakly held entry whose managed
    /// object has no remaining owners.
    #[error("managed object for {address:#x} has been collected")]
    Collected { address: usize },

    /// Null or foreign pointer
    #[error("invalid pointer address: {address:#x}")]
    InvalidPointer { address: usize },

    /// Allocator limit reached
    #[error("out of memory: requested {requested} bytes, limit {limit} bytes")]
    OutOfMemory { requested: usize, limit: usize },

    /// Operation on a disposed bridge
    #[error("bridge has been disposed")]
    Disposed,

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Internal error - indicates a bug in the bridge
    #[error("internal error: {0}")]
    Internal(String),
}

fn describe_unmappable(address: &usize, type_address: &Option<usize>) -> String {
    match type_address {
        Some(ty) => format!("cannot map object at {:#x} with type at {:#x}", address, ty),
        None => format!("cannot map object at {:#x}", address),
    }
}

impl BridgeError {
    /// Check if this error indicates a consistency bug in either the native
    /// extension or the bridge
    pub fn is_bug(&self) -> bool {
        matches!(
            self,
            BridgeError::BadRefCount { .. }
                | BridgeError::AlreadyMapped { .. }
                | BridgeError::Internal(_)
        )
    }

    /// Address the error refers to, if any
    pub fn address(&self) -> Option<usize> {
        match self {
            BridgeError::NotFound { address, .. }
            | BridgeError::NotInterpretable { address, .. }
            | BridgeError::BadRefCount { address, .. }
            | BridgeError::AlreadyMapped { address }
            | BridgeError::Collected { address }
            | BridgeError::InvalidPointer { address } => Some(*address),
            _ => None,
        }
    }
}

impl From<ConfigError> for BridgeError {
    fn from(err: ConfigError) -> Self {
        BridgeError::Configuration(err.to_string())
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;
