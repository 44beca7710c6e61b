//! Runtime Module - the object bridge
//!
//! `Bridge` owns the pointer map, the native allocator and everything else
//! that must stay consistent across the native/managed boundary. Every
//! operation runs under one reentrant lock:
//!
//! - `refcount`: store, retrieve, incref, decref, free
//! - `actualize`: mapping unknown addresses and deferred data
//! - `temps`: per-call temporaries and the native call scope
//! - `native`: constructors used by native code
//! - `dispatch`: deferred decrefs
//! - `resources`: OS handles tied to native objects
//! - `dealloc`: destructors of the builtin types
//! - `scope`: current-bridge lookup for destructors
//!
//! # Addresses
//!
//! Every address passed to the bridge must be null, mapped, or the start of
//! a live native object whose type pointer is valid. The bridge reads the
//! native header of unmapped addresses to find their type.

pub mod actualize;
pub(crate) mod dealloc;
pub mod dispatch;
mod native;
mod refcount;
pub mod resources;
mod scope;
pub(crate) mod state;
pub mod temps;

pub use actualize::{Actualized, Actualizer};
pub use dispatch::DeleteDispatcher;
pub use resources::{ResourceHandle, ResourceTable};
pub use temps::TempObjectSet;

use crate::allocator::{Allocator, HeapAllocator};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::logging::{BridgeEvent, BridgeLogger, BridgeLoggerConfig};
use crate::object::BuiltinType;
use crate::stats::{BridgeCounters, BridgeStats};
use parking_lot::ReentrantMutex;
use refcount::Release;
use state::BridgeState;
use std::cell::{RefCell, RefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Object bridge between native refcounted memory and managed objects
///
/// # Examples
///
/// ```rust
/// use objbridge::{Bridge, BridgeConfig, Object};
///
/// let bridge = Bridge::new(BridgeConfig::default()).unwrap();
///
/// let obj = Object::from("spam");
/// let address = bridge.store(&obj).unwrap();
/// assert_eq!(bridge.refcount(address).unwrap(), 1);
/// assert!(bridge.retrieve(address).unwrap().is(&obj));
///
/// bridge.decref(address).unwrap();
/// assert!(!bridge.has_pointer(address));
/// ```
pub struct Bridge {
    /// All mutable state, behind the global lock
    state: ReentrantMutex<RefCell<BridgeState>>,

    config: BridgeConfig,

    logger: Arc<BridgeLogger>,

    counters: Arc<BridgeCounters>,

    /// Cleared by `dispose`
    alive: AtomicBool,

    dispatcher: DeleteDispatcher,
}

impl Bridge {
    /// Create a bridge with the allocator described by `config`
    pub fn new(config: BridgeConfig) -> Result<Arc<Self>> {
        let allocator: Box<dyn Allocator> = match config.max_allocated_bytes {
            Some(limit) => Box::new(HeapAllocator::with_limit(limit)),
            None => Box::new(HeapAllocator::new()),
        };
        Self::with_allocator(config, allocator)
    }

    /// Create a bridge over a caller-supplied allocator
    pub fn with_allocator(config: BridgeConfig, allocator: Box<dyn Allocator>) -> Result<Arc<Self>> {
        config.validate()?;

        let logger = Arc::new(BridgeLogger::new(BridgeLoggerConfig {
            level: config.log_level,
            console: config.verbose,
            json: config.json_log,
            timestamps: true,
        }));
        let counters = Arc::new(BridgeCounters::new());
        let state = BridgeState::new(allocator, logger.clone(), counters.clone())?;

        let bridge = Arc::new(Self {
            state: ReentrantMutex::new(RefCell::new(state)),
            config,
            logger,
            counters,
            alive: AtomicBool::new(true),
            dispatcher: DeleteDispatcher::new(),
        });

        if bridge.config.delete_dispatch {
            let interval = Duration::from_millis(bridge.config.delete_dispatch_interval_ms);
            bridge.dispatcher.start(Arc::downgrade(&bridge), interval)?;
        }

        log::debug!("object bridge created");
        Ok(bridge)
    }

    /// Take the global lock and run `f` with this bridge as current
    pub(crate) fn enter<R>(&self, f: impl FnOnce(&RefCell<BridgeState>) -> Result<R>) -> Result<R> {
        let guard = self.state.lock();
        if !self.is_alive() {
            return Err(BridgeError::Disposed);
        }
        let _scope = scope::enter(self);
        f(&guard)
    }

    /// Mutable access to the state for the duration of one step
    pub(crate) fn state(cell: &RefCell<BridgeState>) -> Result<RefMut<'_, BridgeState>> {
        cell.try_borrow_mut().map_err(|_| {
            BridgeError::Internal("bridge state re-entered during an actualizer".to_string())
        })
    }

    /// Run `f` against the bridge the calling thread is currently inside
    ///
    /// Native destructors use this to reach the bridge that invoked them.
    /// Returns `None` outside of any bridge operation.
    pub fn with_current<R>(f: impl FnOnce(&Bridge) -> R) -> Option<R> {
        scope::with_current(f)
    }

    /// Whether the calling thread is inside a bridge operation
    pub fn in_bridge_call() -> bool {
        scope::depth() > 0
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn logger(&self) -> &BridgeLogger {
        &self.logger
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub(crate) fn is_disposing(&self) -> bool {
        self.enter(|cell| Ok(Self::state(cell)?.disposing))
            .unwrap_or(false)
    }

    /// Whether `address` currently has a map entry
    pub fn has_pointer(&self, address: usize) -> bool {
        let guard = self.state.lock();
        let has = match guard.try_borrow() {
            Ok(state) => state.map.has_ptr(address),
            Err(_) => false,
        };
        has
    }

    /// Native address of a builtin type object
    pub fn builtin_type(&self, ty: BuiltinType) -> usize {
        let guard = self.state.lock();
        let address = match guard.try_borrow() {
            Ok(state) => state.type_address(ty),
            Err(_) => 0,
        };
        address
    }

    /// Native address of the none singleton
    pub fn none_address(&self) -> usize {
        let guard = self.state.lock();
        let address = match guard.try_borrow() {
            Ok(state) => state.singletons.none(),
            Err(_) => 0,
        };
        address
    }

    /// Native address of the true or false singleton
    pub fn bool_address(&self, value: bool) -> usize {
        let guard = self.state.lock();
        let address = match guard.try_borrow() {
            Ok(state) => state.singletons.bool(value),
            Err(_) => 0,
        };
        address
    }

    /// Record a failed operation that has no caller to return to
    pub fn report_failure(&self, operation: &'static str, err: &BridgeError) {
        log::error!("{} failed: {}", operation, err);
        self.logger.log(BridgeEvent::Failure {
            operation,
            message: err.to_string(),
        });
    }

    /// Snapshot of the bridge counters
    pub fn stats(&self) -> BridgeStats {
        let mut stats = BridgeStats {
            pending_decrefs: self.dispatcher.pending(),
            stores: self.counters.stores(),
            actualizations: self.counters.actualizations(),
            deallocations: self.counters.deallocations(),
            forced_destructors: self.counters.forced_destructors(),
            ..Default::default()
        };

        let guard = self.state.lock();
        if let Ok(state) = guard.try_borrow() {
            stats.live_entries = state.map.len();
            stats.bridge_entries = state.map.bridge_count();
            stats.deferred_entries = state.map.deferred_count();
            stats.allocated_bytes = state.allocator.allocated_bytes();
            stats.pending_temps = state.temps.len();
            stats.interned_strings = state.interned.len();
        }
        stats
    }

    /// Tear the bridge down
    ///
    /// Runs the destructor of every object the bridge still owns, stops the
    /// delete dispatcher, releases all native memory, closes all resource
    /// handles and clears the map. Later calls do nothing; every other
    /// operation fails with `Disposed` afterwards.
    pub fn dispose(&self) -> Result<()> {
        if !self.is_alive() {
            return Ok(());
        }
        // Before taking the lock: the dispatcher may be waiting for it
        self.dispatcher.stop();

        let guard = self.state.lock();
        if !self.is_alive() {
            return Ok(());
        }
        let _scope = scope::enter(self);

        Self::state(&guard)?.disposing = true;
        if self.config.check_bridge_ptrs_on_dispose {
            self.check_bridge_ptrs()?;
        }

        let owned: Vec<usize> = {
            let state = Self::state(&guard)?;
            state
                .map
                .owned_addresses()
                .into_iter()
                .filter(|&address| state.allocator.contains(address))
                .collect()
        };

        let mut forced = 0;
        for address in owned {
            let release = {
                let state = Self::state(&guard)?;
                if !state.map.has_ptr(address) {
                    // Destroyed along with a container
                    continue;
                }
                // SAFETY: still mapped, so still allocated.
                unsafe { Release::for_address(address) }
            };
            forced += 1;
            self.counters.record_forced_destructor();
            if let Err(err) = self.run_release(&guard, release) {
                self.report_failure("Dispose", &err);
            }
        }

        let discarded = self.dispatcher.drain();
        if !discarded.is_empty() {
            log::debug!("dropping {} queued decrefs at teardown", discarded.len());
        }

        let mut state = Self::state(&guard)?;
        let released = state.allocator.free_all();
        let closed = state.resources.close_all();
        state.map.clear();
        state.temps.clear();
        state.interned.clear();
        state.released.clear();
        state.type_objects.clear();
        state.disposing = false;
        self.alive.store(false, Ordering::SeqCst);

        log::debug!("closed {} resource handles at teardown", closed);
        self.logger.log(BridgeEvent::Disposed {
            forced_destructors: forced,
            bytes_released: released,
        });
        Ok(())
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        if let Err(err) = self.dispose() {
            log::error!("disposing bridge failed: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Object;

    fn bridge() -> Arc<Bridge> {
        Bridge::new(BridgeConfig {
            delete_dispatch: false,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = Bridge::new(BridgeConfig {
            max_allocated_bytes: Some(0),
            ..Default::default()
        });
        assert!(matches!(result, Err(BridgeError::Configuration(_))));
    }

    #[test]
    fn test_scope_is_popped() {
        let bridge = bridge();
        bridge.store(&Object::int(1)).unwrap();

        assert!(!Bridge::in_bridge_call());
        assert!(Bridge::with_current(|_| ()).is_none());
    }

    #[test]
    fn test_operations_fail_after_dispose() {
        let bridge = bridge();
        let address = bridge.store(&Object::int(1)).unwrap();

        bridge.dispose().unwrap();
        bridge.dispose().unwrap();

        assert!(!bridge.is_alive());
        assert!(!bridge.has_pointer(address));
        assert!(matches!(
            bridge.store(&Object::int(2)),
            Err(BridgeError::Disposed)
        ));
    }

    #[test]
    fn test_stats_snapshot() {
        let bridge = bridge();
        let baseline = bridge.stats();

        bridge.store(&Object::from("abc")).unwrap();
        let stats = bridge.stats();

        assert_eq!(stats.live_entries, baseline.live_entries + 1);
        assert_eq!(stats.stores, 1);
        assert!(stats.allocated_bytes > 0);
    }
}
