//! OS resource handles tied to native objects
//!
//! Native file objects carry an OS handle next to their memory. The handle
//! is closed when the object is freed, or at teardown at the latest.

use super::Bridge;
use crate::error::Result;
use rustc_hash::FxHashMap;
use std::io;

/// Handle closed together with the native object that owns it
pub trait ResourceHandle: Send {
    fn close(self: Box<Self>) -> io::Result<()>;
}

impl ResourceHandle for std::fs::File {
    fn close(self: Box<Self>) -> io::Result<()> {
        drop(self);
        Ok(())
    }
}

/// address -> handle
#[derive(Default)]
pub struct ResourceTable {
    handles: FxHashMap<usize, Box<dyn ResourceHandle>>,
}

impl ResourceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `handle` to `address`, returning the handle it replaces
    pub fn attach(
        &mut self,
        address: usize,
        handle: Box<dyn ResourceHandle>,
    ) -> Option<Box<dyn ResourceHandle>> {
        self.handles.insert(address, handle)
    }

    pub fn remove(&mut self, address: usize) -> Option<Box<dyn ResourceHandle>> {
        self.handles.remove(&address)
    }

    pub fn contains(&self, address: usize) -> bool {
        self.handles.contains_key(&address)
    }

    /// Close every handle, returning how many there were
    pub fn close_all(&mut self) -> usize {
        let handles: Vec<_> = self.handles.drain().collect();
        let count = handles.len();
        for (address, handle) in handles {
            if let Err(err) = handle.close() {
                log::warn!("closing resource of {:#x} failed: {}", address, err);
            }
        }
        count
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl Bridge {
    /// Tie an OS handle to the native object at `address`
    ///
    /// A handle already attached to the address is closed first.
    pub fn attach_resource(
        &self,
        address: usize,
        handle: impl ResourceHandle + 'static,
    ) -> Result<()> {
        self.enter(|cell| {
            let mut state = Self::state(cell)?;
            state.require_mapped(address, "AttachResource")?;
            if let Some(previous) = state.resources.attach(address, Box::new(handle)) {
                if let Err(err) = previous.close() {
                    log::warn!("closing replaced resource of {:#x} failed: {}", address, err);
                }
            }
            Ok(())
        })
    }

    /// Whether an OS handle is attached to `address`
    pub fn has_resource(&self, address: usize) -> bool {
        self.enter(|cell| Ok(Self::state(cell)?.resources.contains(address)))
            .unwrap_or(false)
    }
}
