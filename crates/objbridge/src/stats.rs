//! Stats Module - bridge activity counters
//!
//! Counters are bumped from inside the bridge lock but read without it, so
//! they are plain relaxed atomics.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Running counters shared by a bridge and its state
#[derive(Debug, Default)]
pub struct BridgeCounters {
    stores: AtomicU64,
    actualizations: AtomicU64,
    deallocations: AtomicU64,
    forced_destructors: AtomicU64,
}

impl BridgeCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_store(&self) {
        self.stores.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_actualization(&self) {
        self.actualizations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deallocation(&self) {
        self.deallocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forced_destructor(&self) {
        self.forced_destructors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stores(&self) -> u64 {
        self.stores.load(Ordering::Relaxed)
    }

    pub fn actualizations(&self) -> u64 {
        self.actualizations.load(Ordering::Relaxed)
    }

    pub fn deallocations(&self) -> u64 {
        self.deallocations.load(Ordering::Relaxed)
    }

    pub fn forced_destructors(&self) -> u64 {
        self.forced_destructors.load(Ordering::Relaxed)
    }
}

/// Point-in-time snapshot returned by `Bridge::stats`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BridgeStats {
    /// Entries in the pointer map
    pub live_entries: usize,
    /// Host-owned entries
    pub bridge_entries: usize,
    /// Entries still holding a deferred marker
    pub deferred_entries: usize,
    /// Bytes held by the bridge allocator
    pub allocated_bytes: usize,
    /// Addresses waiting in the temp set
    pub pending_temps: usize,
    /// Decrefs queued for the dispatcher
    pub pending_decrefs: usize,
    /// Interned strings
    pub interned_strings: usize,
    /// Objects given a fresh native address by `store`
    pub stores: u64,
    /// Deferred or unmapped addresses materialized
    pub actualizations: u64,
    /// Addresses freed
    pub deallocations: u64,
    /// Destructors run by teardown
    pub forced_destructors: u64,
}

impl BridgeStats {
    /// Render as a JSON object
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let counters = BridgeCounters::new();
        counters.record_store();
        counters.record_store();
        counters.record_deallocation();

        assert_eq!(counters.stores(), 2);
        assert_eq!(counters.deallocations(), 1);
        assert_eq!(counters.actualizations(), 0);
    }

    #[test]
    fn test_stats_json() {
        let stats = BridgeStats {
            live_entries: 3,
            ..Default::default()
        };
        let json: serde_json::Value = serde_json::from_str(&stats.to_json()).unwrap();
        assert_eq!(json["live_entries"], 3);
    }
}
