//! objbridge C API
//!
//! Provides the C-compatible entry points extension modules link against:
//! - Bridge initialization and shutdown
//! - Reference counting
//! - Native constructors for strings, tuples and lists

mod bridge;

pub use bridge::*;
