//! Logging Setup
//!
//! The engine emits structured events through `tracing`. Embedders that
//! already install a subscriber need nothing from this module; standalone
//! users call [`init_logging`] once at startup.
//!
//! The filter is taken from `AIO_LOG`, then `RUST_LOG`, and falls back to
//! the level in [`LogConfig`].

use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

/// Targets used by the engine's log events.
pub mod targets {
    /// Channel issue / cancel / close paths.
    pub const CHANNEL: &str = "aio::channel";
    /// Result-handler worker threads.
    pub const HANDLER: &str = "aio::handler";
    /// Timer thread.
    pub const TIMER: &str = "aio::timer";
    /// Engine lifecycle.
    pub const ENGINE: &str = "aio::engine";
}

static INSTALLED: OnceLock<bool> = OnceLock::new();

/// Install a global fmt subscriber for engine logging.
///
/// Only the first call attempts the install. Every call returns that
/// attempt's outcome: `true` if the engine's subscriber is the global one,
/// `false` if another subscriber was already installed elsewhere.
pub fn init_logging(config: &LogConfig) -> bool {
    *INSTALLED.get_or_init(|| {
        let filter = build_filter(config);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_thread_names(config.thread_names)
            .try_init()
            .is_ok()
    })
}

fn build_filter(config: &LogConfig) -> EnvFilter {
    EnvFilter::try_from_env("AIO_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()))
}
