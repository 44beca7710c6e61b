//! Delete Dispatcher - deferred decrefs
//!
//! Some callers must not run destructors inline (e.g. a managed finalizer
//! dropping the last native reference). `decref_later` queues the decref
//! instead; the dispatcher thread performs it under the bridge lock, or the
//! embedder drains the queue with `flush_deferred_decrefs`.

use super::Bridge;
use crate::error::{BridgeError, Result};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

/// Queue of pending decrefs plus the optional thread draining it
pub struct DeleteDispatcher {
    sender: Sender<usize>,
    receiver: Receiver<usize>,

    /// Dispatcher thread handle
    thread_handle: Mutex<Option<JoinHandle<()>>>,

    /// Dispatcher thread id, to avoid joining from inside the thread
    thread_id: Mutex<Option<ThreadId>>,

    /// Running flag
    running: Arc<AtomicBool>,
}

impl DeleteDispatcher {
    pub fn new() -> Self {
        let (sender, receiver) = channel::unbounded();
        Self {
            sender,
            receiver,
            thread_handle: Mutex::new(None),
            thread_id: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start the dispatcher thread
    pub(crate) fn start(&self, bridge: Weak<Bridge>, interval: Duration) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);

        let receiver = self.receiver.clone();
        let running = self.running.clone();

        let handle = thread::Builder::new()
            .name("objbridge-dispatch".to_string())
            .spawn(move || {
                while running.load(Ordering::SeqCst) {
                    match receiver.recv_timeout(interval) {
                        Ok(address) => match bridge.upgrade() {
                            Some(bridge) => bridge.run_deferred_decref(address),
                            None => break,
                        },
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .map_err(|e| BridgeError::Internal(format!("cannot spawn dispatcher: {}", e)))?;

        *self.thread_id.lock() = Some(handle.thread().id());
        *self.thread_handle.lock() = Some(handle);
        Ok(())
    }

    /// Stop the dispatcher thread
    ///
    /// Waits for an in-flight decref to finish unless called from the
    /// dispatcher thread itself.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);

        let handle = self.thread_handle.lock().take();
        let Some(handle) = handle else {
            return;
        };
        if *self.thread_id.lock() == Some(thread::current().id()) {
            return;
        }
        if handle.join().is_err() {
            log::error!("delete dispatcher thread panicked");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn push(&self, address: usize) -> Result<()> {
        self.sender
            .send(address)
            .map_err(|_| BridgeError::Internal("delete queue disconnected".to_string()))
    }

    /// Take every queued address
    pub(crate) fn drain(&self) -> Vec<usize> {
        self.receiver.try_iter().collect()
    }

    pub fn pending(&self) -> usize {
        self.receiver.len()
    }
}

impl Default for DeleteDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Bridge {
    /// Queue a decref to run later, outside the caller's stack
    pub fn decref_later(&self, address: usize) -> Result<()> {
        if !self.is_alive() {
            return Err(BridgeError::Disposed);
        }
        self.dispatcher.push(address)
    }

    /// Run every queued decref on the calling thread
    ///
    /// Returns how many ran; the first error is returned after all of them
    /// have been attempted.
    pub fn flush_deferred_decrefs(&self) -> Result<usize> {
        self.enter(|cell| {
            let addresses = self.dispatcher.drain();
            let mut first_error = None;
            for &address in &addresses {
                if let Err(err) = self.decref_locked(cell, address) {
                    self.report_failure("DecRefLater", &err);
                    first_error.get_or_insert(err);
                }
            }
            match first_error {
                Some(err) => Err(err),
                None => Ok(addresses.len()),
            }
        })
    }

    fn run_deferred_decref(&self, address: usize) {
        match self.decref(address) {
            Ok(()) | Err(BridgeError::Disposed) => {},
            Err(err) => self.report_failure("DecRefLater", &err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_without_thread() {
        let dispatcher = DeleteDispatcher::new();
        dispatcher.push(0x10).unwrap();
        dispatcher.push(0x20).unwrap();

        assert_eq!(dispatcher.pending(), 2);
        assert_eq!(dispatcher.drain(), vec![0x10, 0x20]);
        assert_eq!(dispatcher.pending(), 0);
    }

    #[test]
    fn test_stop_without_start() {
        let dispatcher = DeleteDispatcher::new();
        dispatcher.stop();
        assert!(!dispatcher.is_running());
    }
}
