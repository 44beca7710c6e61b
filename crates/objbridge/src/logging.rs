//! Bridge Logging and Tracing
//!
//! Structured event log for bridge operations, useful for:
//! - Tracking down refcount leaks in native extensions
//! - Debugging actualization failures
//! - Teardown accounting
//!
//! Log Levels:
//! - ERROR: Failed operations
//! - WARN: Default-free fallbacks, pruned bridge entries
//! - INFO: Teardown, bridge sweeps
//! - DEBUG: Deallocations, temp flushes
//! - TRACE: Per-object store and actualization
//!
//! Every recorded event is also forwarded to the `log` facade.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Log level for bridge events
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    fn as_log_level(self) -> log::Level {
        match self {
            LogLevel::Error => log::Level::Error,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Trace => log::Level::Trace,
        }
    }
}

/// Bridge event types
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    /// Managed object stored at a new native address
    Stored {
        address: usize,
        kind: &'static str,
        bytes: usize,
    },

    /// Deferred native object materialized
    Actualized {
        address: usize,
        marker: &'static str,
    },

    /// Address unmapped and its memory released
    Deallocated { address: usize, forced: bool },

    /// Refcount hit zero on a type without a destructor
    DefaultFree { address: usize, type_address: usize },

    /// Temp set flushed
    TempsFreed { count: usize },

    /// Bridge entries re-derived at a sweep
    BridgeSweep { checked: usize, pruned: usize },

    /// Bridge torn down
    Disposed {
        forced_destructors: usize,
        bytes_released: usize,
    },

    /// Operation failed
    Failure {
        operation: &'static str,
        message: String,
    },
}

/// Logger configuration
#[derive(Debug, Clone)]
pub struct BridgeLoggerConfig {
    /// Minimum log level
    pub level: LogLevel,

    /// Enable console output
    pub console: bool,

    /// Enable JSON format
    pub json: bool,

    /// Enable timestamps
    pub timestamps: bool,
}

impl Default for BridgeLoggerConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            console: false,
            json: false,
            timestamps: true,
        }
    }
}

/// Bridge logger - records events for one bridge instance
pub struct BridgeLogger {
    config: BridgeLoggerConfig,
    events: Mutex<Vec<(Instant, BridgeEvent)>>,
    enabled: AtomicBool,
}

impl BridgeLogger {
    /// Create new logger
    pub fn new(config: BridgeLoggerConfig) -> Self {
        Self {
            config,
            events: Mutex::new(Vec::new()),
            enabled: AtomicBool::new(true),
        }
    }

    /// Enable logging
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    /// Disable logging
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    /// Check if logging is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Log a bridge event
    pub fn log(&self, event: BridgeEvent) {
        if !self.is_enabled() {
            return;
        }

        let level = Self::event_level(&event);
        log::log!(level.as_log_level(), "{:?}", event);

        if level > self.config.level {
            return;
        }

        if self.config.console {
            self.output_console(&event);
        }

        self.events.lock().push((Instant::now(), event));
    }

    /// Get log level for event
    fn event_level(event: &BridgeEvent) -> LogLevel {
        match event {
            BridgeEvent::Failure { .. } => LogLevel::Error,
            BridgeEvent::DefaultFree { .. } => LogLevel::Warn,
            BridgeEvent::BridgeSweep { pruned, .. } if *pruned > 0 => LogLevel::Warn,
            BridgeEvent::BridgeSweep { .. } | BridgeEvent::Disposed { .. } => LogLevel::Info,
            BridgeEvent::Deallocated { .. } | BridgeEvent::TempsFreed { .. } => LogLevel::Debug,
            BridgeEvent::Stored { .. } | BridgeEvent::Actualized { .. } => LogLevel::Trace,
        }
    }

    /// Output to console
    fn output_console(&self, event: &BridgeEvent) {
        if self.config.timestamps {
            let now = chrono::Local::now();
            print!("[{}] ", now.format("%Y-%m-%d %H:%M:%S%.3f"));
        }

        if self.config.json {
            if let Ok(json) = serde_json::to_string(event) {
                println!("{}", json);
            }
        } else {
            Self::output_human(event);
        }
    }

    /// Output in human-readable format
    fn output_human(event: &BridgeEvent) {
        match event {
            BridgeEvent::Stored {
                address,
                kind,
                bytes,
            } => {
                println!("[bridge] stored {} at {:#x} ({} bytes)", kind, address, bytes);
            },
            BridgeEvent::Actualized { address, marker } => {
                println!("[bridge] actualized {} at {:#x}", marker, address);
            },
            BridgeEvent::Deallocated { address, forced } => {
                if *forced {
                    println!("[bridge] forced deallocation of {:#x}", address);
                } else {
                    println!("[bridge] deallocated {:#x}", address);
                }
            },
            BridgeEvent::DefaultFree {
                address,
                type_address,
            } => {
                println!(
                    "[bridge] type at {:#x} has no destructor, freeing {:#x} directly",
                    type_address, address
                );
            },
            BridgeEvent::TempsFreed { count } => {
                println!("[bridge] released {} temporaries", count);
            },
            BridgeEvent::BridgeSweep { checked, pruned } => {
                println!(
                    "[bridge] checked {} bridge pointers, pruned {}",
                    checked, pruned
                );
            },
            BridgeEvent::Disposed {
                forced_destructors,
                bytes_released,
            } => {
                println!(
                    "[bridge] disposed ({} forced destructors, {} bytes released)",
                    forced_destructors, bytes_released
                );
            },
            BridgeEvent::Failure { operation, message } => {
                eprintln!("[bridge] {} failed: {}", operation, message);
            },
        }
    }

    /// Get all events
    pub fn get_events(&self) -> Vec<(Instant, BridgeEvent)> {
        self.events.lock().clone()
    }

    /// Events without timestamps, in order
    pub fn events(&self) -> Vec<BridgeEvent> {
        self.events.lock().iter().map(|(_, e)| e.clone()).collect()
    }

    /// Clear all events
    pub fn clear_events(&self) {
        self.events.lock().clear();
    }

    /// Get event count
    pub fn event_count(&self) -> usize {
        self.events.lock().len()
    }
}

impl Default for BridgeLogger {
    fn default() -> Self {
        Self::new(BridgeLoggerConfig::default())
    }
}
