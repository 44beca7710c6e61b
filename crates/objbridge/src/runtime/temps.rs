//! Temp objects - references owned by the current native call

use super::Bridge;
use crate::error::{BridgeError, Result};
use crate::logging::BridgeEvent;

/// Ordered set of addresses to release at the end of a native call
#[derive(Debug, Default)]
pub struct TempObjectSet {
    addresses: Vec<usize>,
}

impl TempObjectSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remember(&mut self, address: usize) {
        self.addresses.push(address);
    }

    /// Empty the set, returning its addresses in insertion order
    pub fn take(&mut self) -> Vec<usize> {
        std::mem::take(&mut self.addresses)
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn clear(&mut self) {
        self.addresses.clear();
    }
}

impl Bridge {
    /// Release `address` once at the next `free_temps`
    pub fn remember_temp(&self, address: usize) -> Result<()> {
        self.enter(|cell| {
            Self::state(cell)?.temps.remember(address);
            Ok(())
        })
    }

    /// Decref every remembered address once, in insertion order
    ///
    /// The set is emptied before any decref runs. Every address is attempted
    /// even if an earlier one fails; the first error is returned.
    pub fn free_temps(&self) -> Result<usize> {
        self.enter(|cell| {
            let temps = Self::state(cell)?.temps.take();

            let mut first_error: Option<BridgeError> = None;
            for &address in &temps {
                if let Err(err) = self.decref_locked(cell, address) {
                    log::warn!("freeing temp {:#x}: {}", address, err);
                    first_error.get_or_insert(err);
                }
            }

            if !temps.is_empty() {
                self.logger.log(BridgeEvent::TempsFreed { count: temps.len() });
            }
            match first_error {
                Some(err) => Err(err),
                None => Ok(temps.len()),
            }
        })
    }

    /// Run `f` as one native call
    ///
    /// The bridge lock is held throughout, and temps remembered during the
    /// call are freed afterwards. An error from `f` takes precedence over an
    /// error from freeing temps.
    pub fn call_native<R>(&self, f: impl FnOnce(&Bridge) -> Result<R>) -> Result<R> {
        self.enter(|_| {
            let result = f(self);
            let freed = self.free_temps();
            let value = result?;
            freed?;
            Ok(value)
        })
    }
}
