//! Configuration Module - Bridge Tuning Parameters
//!
//! Manages the configuration parameters for a bridge instance.
//! Every parameter has a sensible default; most embedders never touch them.

use crate::logging::LogLevel;

/// Main configuration for the object bridge
///
/// # Examples
///
/// ```rust
/// use objbridge::BridgeConfig;
///
/// // Use default configuration
/// let config = BridgeConfig::default();
///
/// // Bounded allocator with synchronous deferred decrefs
/// let config = BridgeConfig {
///     max_allocated_bytes: Some(64 * 1024 * 1024),
///     delete_dispatch: false,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Upper bound on native bytes held by the bridge allocator
    ///
    /// `None` means unbounded.
    /// Default: None
    pub max_allocated_bytes: Option<usize>,

    /// Run deferred decrefs on a background dispatcher thread
    ///
    /// When false, `decref_later` only queues and the queue is drained by
    /// `flush_deferred_decrefs` or at teardown.
    /// Default: true
    pub delete_dispatch: bool,

    /// Polling interval of the background dispatcher (milliseconds)
    ///
    /// Default: 10ms
    pub delete_dispatch_interval_ms: u64,

    /// Sweep bridge entries before the forced teardown pass
    ///
    /// Default: true
    pub check_bridge_ptrs_on_dispose: bool,

    /// Print bridge events to the console
    ///
    /// Default: false
    pub verbose: bool,

    /// Minimum level recorded by the event logger
    ///
    /// Default: Info
    pub log_level: LogLevel,

    /// Emit console events as JSON lines
    ///
    /// Default: false
    pub json_log: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            max_allocated_bytes: None,
            delete_dispatch: true,
            delete_dispatch_interval_ms: 10,
            check_bridge_ptrs_on_dispose: true,
            verbose: false,
            log_level: LogLevel::Info,
            json_log: false,
        }
    }
}

impl BridgeConfig {
    /// Validate configuration
    ///
    /// # Examples
    ///
    /// ```rust
    /// use objbridge::BridgeConfig;
    ///
    /// let config = BridgeConfig {
    ///     max_allocated_bytes: Some(0), // Invalid!
    ///     ..Default::default()
    /// };
    ///
    /// assert!(config.validate().is_err());
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(limit) = self.max_allocated_bytes {
            if limit == 0 {
                return Err(ConfigError::InvalidAllocationLimit(
                    "max_allocated_bytes must be > 0 when set".to_string(),
                ));
            }
        }

        if self.delete_dispatch && self.delete_dispatch_interval_ms == 0 {
            return Err(ConfigError::InvalidDispatchInterval(
                "delete_dispatch_interval_ms must be > 0 when delete_dispatch is enabled"
                    .to_string(),
            ));
        }

        Ok(())
    }

    /// Build configuration from environment variables
    ///
    /// Overrides defaults with environment variables:
    /// - OBJBRIDGE_MAX_ALLOC
    /// - OBJBRIDGE_DELETE_DISPATCH
    /// - OBJBRIDGE_DISPATCH_INTERVAL_MS
    /// - OBJBRIDGE_VERBOSE
    ///
    /// ```bash
    /// export OBJBRIDGE_MAX_ALLOC=67108864  # 64MB
    /// export OBJBRIDGE_DELETE_DISPATCH=0
    /// export OBJBRIDGE_VERBOSE=1
    /// ```
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("OBJBRIDGE_MAX_ALLOC") {
            if let Ok(size) = val.parse::<usize>() {
                config.max_allocated_bytes = Some(size);
            }
        }

        if let Ok(val) = std::env::var("OBJBRIDGE_DELETE_DISPATCH") {
            config.delete_dispatch = parse_flag(&val);
        }

        if let Ok(val) = std::env::var("OBJBRIDGE_DISPATCH_INTERVAL_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                config.delete_dispatch_interval_ms = ms;
            }
        }

        if let Ok(val) = std::env::var("OBJBRIDGE_VERBOSE") {
            config.verbose = parse_flag(&val);
        }

        config
    }
}

fn parse_flag(val: &str) -> bool {
    val == "1" || val.eq_ignore_ascii_case("true")
}

/// Error types for configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid allocation limit: {0}")]
    InvalidAllocationLimit(String),

    #[error("Invalid dispatch interval: {0}")]
    InvalidDispatchInterval(String),
}
