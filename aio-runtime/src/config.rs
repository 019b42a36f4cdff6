//! Engine Configuration
//!
//! Configuration for the completion engine. Values can be set
//! programmatically through [`AioConfig::builder`] or loaded from
//! environment variables with [`AioConfig::from_env`].
//!
//! # Environment Variables
//!
//! All environment variables use the `AIO_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `AIO_MAX_WORKERS` | Cap on result-handler threads per group | CPU count |
//! | `AIO_INITIAL_WORKERS` | Result-handler threads started per group | 1 |
//! | `AIO_DEQUEUE_TIMEOUT_MS` | Blocking dequeue timeout | 500 |
//! | `AIO_MAX_BATCHED_EVENTS` | Completion records per dequeue call | 16 |
//! | `AIO_LISTENER_THREADS` | Listener executor threads (0 = inline) | 0 |
//! | `AIO_COMPLETION_TIMEOUT_MS` | Default operation timeout (0 = none) | 0 |
//! | `AIO_DISABLE_TIMEOUTS` | Skip all soft-timeout registration | false |
//! | `AIO_TIMER_BATCH_SIZE` | Requests drained per timer cycle | 64 |
//! | `AIO_TIMER_SLEEP_MS` | Timer sleep between idle cycles | 10 |
//! | `AIO_TIMER_QUEUES` | Timer request queues (1 or 2) | 2 |
//! | `AIO_TIMER_CHECK_MS` | Interval between expiry scans | 10 |
//! | `AIO_TIMER_PRUNE_MS` | Interval between slot pruning passes | 1000 |
//! | `AIO_TIMER_PRUNE_THRESHOLD_MS` | Idle age before an empty slot is pruned | 5000 |
//! | `AIO_RECORD_POOL_SIZE` | Completion records kept for reuse | 256 |
//! | `AIO_JIT_BUFFER_SIZE` | Size of each JIT receive buffer | 8192 |
//! | `AIO_JIT_POOL_SIZE` | JIT buffers kept for reuse | 64 |
//! | `AIO_TABLE_INITIAL_CAPACITY` | Initial lookup-table slots | 64 |
//! | `AIO_TABLE_INCREMENT` | Lookup-table growth step | 64 |
//! | `AIO_TABLE_MAX_CAPACITY` | Lookup-table hard limit | 16777216 |
//! | `AIO_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | info |
//!
//! # Example
//!
//! ```rust,ignore
//! use aio_runtime::config::AioConfig;
//!
//! let config = AioConfig::builder()
//!     .max_workers(4)
//!     .disable_timeouts(false)
//!     .build()?;
//! ```

use std::env;
use std::time::Duration;

use thiserror::Error;

/// Log level for engine logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// No logging.
    Off,
    /// Error messages only.
    Error,
    /// Warnings and errors.
    Warn,
    /// Informational messages (default).
    #[default]
    Info,
    /// Debug messages.
    Debug,
    /// Trace-level messages.
    Trace,
}

impl LogLevel {
    /// Parse a log level from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "off" | "none" | "0" => Some(LogLevel::Off),
            "error" | "err" | "1" => Some(LogLevel::Error),
            "warn" | "warning" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    /// Convert to a filter directive.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Result-handler (event processing loop) configuration.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// Upper bound on worker threads per channel group.
    /// Default: number of available CPUs.
    pub max_workers: usize,

    /// Workers started when a group is created.
    /// Default: 1.
    pub initial_workers: usize,

    /// Timeout passed to each blocking dequeue call.
    /// Default: 500ms.
    pub dequeue_timeout: Duration,

    /// Maximum completion records returned by one dequeue call.
    /// Only honoured when the provider is batch-capable.
    /// Default: 16.
    pub max_batched_events: usize,

    /// Threads in the listener executor; 0 runs listeners inline.
    /// Default: 0.
    pub listener_threads: usize,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            max_workers: num_cpus(),
            initial_workers: 1,
            dequeue_timeout: Duration::from_millis(500),
            max_batched_events: 16,
            listener_threads: 0,
        }
    }
}

/// Soft-timeout configuration.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Timeout applied to requests that do not name one.
    /// `Duration::ZERO` means no timeout (default).
    pub completion_timeout: Duration,

    /// Skip soft-timeout registration entirely.
    /// Default: false.
    pub disable_timeouts: bool,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            completion_timeout: Duration::ZERO,
            disable_timeouts: false,
        }
    }
}

/// Timer thread configuration.
#[derive(Debug, Clone)]
pub struct TimerConfig {
    /// Maximum requests drained from a queue per cycle.
    /// Default: 64.
    pub batch_size: usize,

    /// Sleep between cycles when no requests remain.
    /// Default: 10ms.
    pub sleep_interval: Duration,

    /// Number of request queues (1 or 2).
    /// Default: 2.
    pub queue_count: usize,

    /// Interval between scans for expired slots; also the slot resolution.
    /// Default: 10ms.
    pub check_interval: Duration,

    /// Interval between pruning passes.
    /// Default: 1s.
    pub prune_interval: Duration,

    /// Age after which a slot with no active entries is pruned.
    /// Default: 5s.
    pub prune_threshold: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            sleep_interval: Duration::from_millis(10),
            queue_count: 2,
            check_interval: Duration::from_millis(10),
            prune_interval: Duration::from_secs(1),
            prune_threshold: Duration::from_secs(5),
        }
    }
}

/// Pools and lookup-table sizing.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Completion records retained for reuse.
    /// Default: 256.
    pub record_pool_size: usize,

    /// Size in bytes of each JIT receive buffer.
    /// Default: 8KB.
    pub jit_buffer_size: usize,

    /// JIT buffers retained for reuse.
    /// Default: 64.
    pub jit_pool_size: usize,

    /// Initial lookup-table capacity.
    /// Default: 64.
    pub table_initial_capacity: usize,

    /// Slots added each time the lookup table fills.
    /// Default: 64.
    pub table_increment: usize,

    /// Hard limit on lookup-table slots.
    /// Default: 16M.
    pub table_max_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            record_pool_size: 256,
            jit_buffer_size: 8 * 1024,
            jit_pool_size: 64,
            table_initial_capacity: 64,
            table_increment: 64,
            table_max_capacity: 16 * 1024 * 1024,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level.
    /// Default: Info.
    pub level: LogLevel,

    /// Include thread names in log output.
    /// Default: true.
    pub thread_names: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            thread_names: true,
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default)]
pub struct AioConfig {
    /// Result-handler configuration.
    pub handler: HandlerConfig,

    /// Soft-timeout configuration.
    pub timeout: TimeoutConfig,

    /// Timer thread configuration.
    pub timer: TimerConfig,

    /// Pool and table sizing.
    pub pools: PoolConfig,

    /// Logging configuration.
    pub log: LogConfig,
}

impl AioConfig {
    /// Create a new builder for AioConfig.
    pub fn builder() -> AioConfigBuilder {
        AioConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Unset or unparsable variables keep their default values.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(val) = parse_env_usize("AIO_MAX_WORKERS") {
            if val > 0 {
                config.handler.max_workers = val;
            }
        }

        if let Some(val) = parse_env_usize("AIO_INITIAL_WORKERS") {
            if val > 0 {
                config.handler.initial_workers = val;
            }
        }

        if let Some(val) = parse_env_millis("AIO_DEQUEUE_TIMEOUT_MS") {
            if !val.is_zero() {
                config.handler.dequeue_timeout = val;
            }
        }

        if let Some(val) = parse_env_usize("AIO_MAX_BATCHED_EVENTS") {
            if val > 0 {
                config.handler.max_batched_events = val;
            }
        }

        if let Some(val) = parse_env_usize("AIO_LISTENER_THREADS") {
            config.handler.listener_threads = val;
        }

        if let Some(val) = parse_env_millis("AIO_COMPLETION_TIMEOUT_MS") {
            config.timeout.completion_timeout = val;
        }

        if let Some(val) = parse_env_bool("AIO_DISABLE_TIMEOUTS") {
            config.timeout.disable_timeouts = val;
        }

        if let Some(val) = parse_env_usize("AIO_TIMER_BATCH_SIZE") {
            if val > 0 {
                config.timer.batch_size = val;
            }
        }

        if let Some(val) = parse_env_millis("AIO_TIMER_SLEEP_MS") {
            if !val.is_zero() {
                config.timer.sleep_interval = val;
            }
        }

        if let Some(val) = parse_env_usize("AIO_TIMER_QUEUES") {
            if val == 1 || val == 2 {
                config.timer.queue_count = val;
            }
        }

        if let Some(val) = parse_env_millis("AIO_TIMER_CHECK_MS") {
            if !val.is_zero() {
                config.timer.check_interval = val;
            }
        }

        if let Some(val) = parse_env_millis("AIO_TIMER_PRUNE_MS") {
            if !val.is_zero() {
                config.timer.prune_interval = val;
            }
        }

        if let Some(val) = parse_env_millis("AIO_TIMER_PRUNE_THRESHOLD_MS") {
            config.timer.prune_threshold = val;
        }

        if let Some(val) = parse_env_usize("AIO_RECORD_POOL_SIZE") {
            config.pools.record_pool_size = val;
        }

        if let Some(val) = parse_env_usize("AIO_JIT_BUFFER_SIZE") {
            if val > 0 {
                config.pools.jit_buffer_size = val;
            }
        }

        if let Some(val) = parse_env_usize("AIO_JIT_POOL_SIZE") {
            config.pools.jit_pool_size = val;
        }

        if let Some(val) = parse_env_usize("AIO_TABLE_INITIAL_CAPACITY") {
            if val > 0 {
                config.pools.table_initial_capacity = val;
            }
        }

        if let Some(val) = parse_env_usize("AIO_TABLE_INCREMENT") {
            if val > 0 {
                config.pools.table_increment = val;
            }
        }

        if let Some(val) = parse_env_usize("AIO_TABLE_MAX_CAPACITY") {
            if val > 0 {
                config.pools.table_max_capacity = val;
            }
        }

        if let Ok(val) = env::var("AIO_LOG_LEVEL") {
            if let Some(level) = LogLevel::parse(&val) {
                config.log.level = level;
            }
        }

        config
    }

    /// Validate the configuration and return the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.handler.max_workers == 0 {
            return Err(invalid("handler.max_workers", "must be at least 1"));
        }

        if self.handler.initial_workers == 0 || self.handler.initial_workers > self.handler.max_workers {
            return Err(invalid(
                "handler.initial_workers",
                "must be between 1 and handler.max_workers",
            ));
        }

        if self.handler.dequeue_timeout.is_zero() {
            return Err(invalid("handler.dequeue_timeout", "must be non-zero"));
        }

        if self.handler.max_batched_events == 0 {
            return Err(invalid("handler.max_batched_events", "must be at least 1"));
        }

        if self.timer.batch_size == 0 {
            return Err(invalid("timer.batch_size", "must be at least 1"));
        }

        if !(1..=2).contains(&self.timer.queue_count) {
            return Err(invalid("timer.queue_count", "must be 1 or 2"));
        }

        if self.timer.check_interval.is_zero() || self.timer.sleep_interval.is_zero() {
            return Err(invalid("timer.check_interval", "intervals must be non-zero"));
        }

        if self.timer.prune_interval < self.timer.check_interval {
            return Err(invalid(
                "timer.prune_interval",
                "must be at least timer.check_interval",
            ));
        }

        if self.pools.jit_buffer_size == 0 {
            return Err(invalid("pools.jit_buffer_size", "must be non-zero"));
        }

        if self.pools.table_initial_capacity == 0 || self.pools.table_increment == 0 {
            return Err(invalid(
                "pools.table_increment",
                "initial capacity and increment must be non-zero",
            ));
        }

        if self.pools.table_max_capacity < self.pools.table_initial_capacity {
            return Err(invalid(
                "pools.table_max_capacity",
                "must be at least pools.table_initial_capacity",
            ));
        }

        if self.pools.table_max_capacity > crate::record::MAX_CHANNEL_INDEX + 1 {
            return Err(invalid(
                "pools.table_max_capacity",
                "must fit in the call identifier index field",
            ));
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.into(),
        message: message.into(),
    }
}

/// Builder for AioConfig.
#[derive(Debug, Clone, Default)]
pub struct AioConfigBuilder {
    config: AioConfig,
}

impl AioConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker thread cap per group.
    pub fn max_workers(mut self, n: usize) -> Self {
        self.config.handler.max_workers = n;
        self
    }

    /// Set the number of workers started per group.
    pub fn initial_workers(mut self, n: usize) -> Self {
        self.config.handler.initial_workers = n;
        self
    }

    /// Set the blocking dequeue timeout.
    pub fn dequeue_timeout(mut self, timeout: Duration) -> Self {
        self.config.handler.dequeue_timeout = timeout;
        self
    }

    /// Set the batched-event limit.
    pub fn max_batched_events(mut self, n: usize) -> Self {
        self.config.handler.max_batched_events = n;
        self
    }

    /// Set the listener executor thread count.
    pub fn listener_threads(mut self, n: usize) -> Self {
        self.config.handler.listener_threads = n;
        self
    }

    /// Set the default completion timeout.
    pub fn completion_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout.completion_timeout = timeout;
        self
    }

    /// Enable or disable soft timeouts globally.
    pub fn disable_timeouts(mut self, disabled: bool) -> Self {
        self.config.timeout.disable_timeouts = disabled;
        self
    }

    /// Set the timer drain batch size.
    pub fn timer_batch_size(mut self, n: usize) -> Self {
        self.config.timer.batch_size = n;
        self
    }

    /// Set the timer idle sleep interval.
    pub fn timer_sleep_interval(mut self, interval: Duration) -> Self {
        self.config.timer.sleep_interval = interval;
        self
    }

    /// Set the number of timer request queues.
    pub fn timer_queue_count(mut self, n: usize) -> Self {
        self.config.timer.queue_count = n;
        self
    }

    /// Set the timer expiry check interval.
    pub fn timer_check_interval(mut self, interval: Duration) -> Self {
        self.config.timer.check_interval = interval;
        self
    }

    /// Set the timer pruning interval.
    pub fn timer_prune_interval(mut self, interval: Duration) -> Self {
        self.config.timer.prune_interval = interval;
        self
    }

    /// Set the idle age after which empty slots are pruned.
    pub fn timer_prune_threshold(mut self, threshold: Duration) -> Self {
        self.config.timer.prune_threshold = threshold;
        self
    }

    /// Set the completion-record pool size.
    pub fn record_pool_size(mut self, n: usize) -> Self {
        self.config.pools.record_pool_size = n;
        self
    }

    /// Set the JIT buffer size.
    pub fn jit_buffer_size(mut self, size: usize) -> Self {
        self.config.pools.jit_buffer_size = size;
        self
    }

    /// Set the JIT buffer pool size.
    pub fn jit_pool_size(mut self, n: usize) -> Self {
        self.config.pools.jit_pool_size = n;
        self
    }

    /// Set the lookup-table initial capacity and growth increment.
    pub fn table_sizing(mut self, initial: usize, increment: usize) -> Self {
        self.config.pools.table_initial_capacity = initial;
        self.config.pools.table_increment = increment;
        self
    }

    /// Set the lookup-table hard limit.
    pub fn table_max_capacity(mut self, n: usize) -> Self {
        self.config.pools.table_max_capacity = n;
        self
    }

    /// Set the log level.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log.level = level;
        self
    }

    /// Build the configuration, validating it first.
    pub fn build(self) -> Result<AioConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the configuration without validation.
    pub fn build_unchecked(self) -> AioConfig {
        self.config
    }
}

/// Parse an environment variable as usize.
fn parse_env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

/// Parse an environment variable holding milliseconds.
fn parse_env_millis(name: &str) -> Option<Duration> {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
}

/// Parse an environment variable as bool.
fn parse_env_bool(name: &str) -> Option<bool> {
    env::var(name).ok().and_then(|s| match s.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    })
}

/// Get the number of available CPUs.
fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
