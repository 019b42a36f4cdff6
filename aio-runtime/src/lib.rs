//! # AIO Runtime
//!
//! An asynchronous I/O completion engine. It turns a platform's native
//! asynchronous read/write primitives into a uniform future-based API with
//! cancellation and software timeouts:
//!
//! - **Provider**: the injected boundary to the native layer
//!   ([`AioProvider`], with [`LoopbackProvider`] as an in-process stand-in)
//! - **Channels and futures**: one read future and one write future per
//!   channel, reused across operations
//! - **Lookup table**: integer indices packed into call ids resolve a
//!   completion back to its channel
//! - **Completion records**: the fixed-layout exchange structure, pooled
//! - **Result handlers**: worker threads draining each completion port
//! - **Timer**: a bucketed soft-timeout thread racing cancels against
//!   natural completion
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            AioEngine                              │
//! │  ProviderHandle   TimerService   RecordPool   BufferPool (JIT)    │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ChannelGroup (one completion port)                               │
//! │  ┌──────────────┐   ┌───────────────────┐   ┌─────────────────┐   │
//! │  │ LookupTable  │◀──│  result handlers  │──▶│    IoFuture     │   │
//! │  │ (table.rs)   │   │   (handler.rs)    │   │  (future.rs)    │   │
//! │  └──────────────┘   └───────────────────┘   └─────────────────┘   │
//! │         ▲                                           ▲             │
//! │         └──────────── AsyncChannel (channel.rs) ────┘             │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use aio_runtime::{AioConfig, AioEngine, IoBuffer, IoRequest, LoopbackProvider};
//!
//! let engine = AioEngine::new(Arc::new(LoopbackProvider::new()), AioConfig::default())?;
//! let group = engine.create_group()?;
//! let channel = group.open_channel(1)?;
//!
//! channel.write_sync(IoRequest::single(IoBuffer::from_slice(b"hello")))?;
//! let buf = IoBuffer::allocate(16);
//! let read = channel.read(IoRequest::single(buf.clone()))?;
//! assert_eq!(read.wait_for_completion(std::time::Duration::ZERO)?, 5);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod buffer;
pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod future;
pub mod group;
mod handler;
pub mod log;
pub mod loopback;
pub mod panic;
pub mod provider;
pub mod record;
pub mod table;
pub mod timer;

// Re-exports
pub use buffer::{BufferPool, IoBuffer};
pub use channel::{AsyncChannel, IoRequest};
pub use config::{AioConfig, AioConfigBuilder, ConfigError, LogLevel};
pub use engine::AioEngine;
pub use error::{AioError, ErrorKind, Result};
pub use executor::{ListenerExecutor, ThreadPoolExecutor};
pub use future::{FutureKind, IoFuture};
pub use group::{ChannelGroup, GroupStats};
pub use log::init_logging;
pub use loopback::LoopbackProvider;
pub use provider::{AioProvider, Capability, IssueOptions, Issued, PortHandle, ProviderHandle};
pub use record::{CallId, CompletionRecord, FutureSelector, RecordPool, RecordSlot};
pub use table::LookupTable;
pub use timer::{TimerService, TimerStats};

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build an engine from `AIO_*` environment variables, installing the
/// logging subscriber first.
///
/// See [`AioConfig::from_env`] for the supported variables.
pub fn init_from_env(provider: std::sync::Arc<dyn AioProvider>) -> Result<AioEngine> {
    let config = AioConfig::from_env();
    init_logging(&config.log);
    AioEngine::new(provider, config)
}
