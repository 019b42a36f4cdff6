//! Completion Engine
//!
//! [`AioEngine`] is the owner of everything shared between channel groups:
//! the provider handle, the timer thread, the completion-record pool, the
//! JIT buffer pool and the optional listener executor.
//!
//! # Lifecycle
//!
//! `AioEngine::new` validates the configuration, initializes the provider
//! and starts the timer. [`AioEngine::shutdown`] tears everything down in
//! reverse: groups (channels, ports, workers), then the timer, the
//! executor, and finally the provider. Shutdown is idempotent and also runs
//! on drop.
//!
//! # Example
//!
//! ```rust,ignore
//! use aio_runtime::{AioConfig, AioEngine, IoBuffer, IoRequest, LoopbackProvider};
//!
//! let engine = AioEngine::new(Arc::new(LoopbackProvider::new()), AioConfig::from_env())?;
//! let group = engine.create_group()?;
//! let channel = group.open_channel(7)?;
//! let written = channel.write_sync(IoRequest::single(IoBuffer::from_slice(b"ping")))?;
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::{BufferPool, IoBuffer};
use crate::config::AioConfig;
use crate::error::Result;
use crate::executor::{ListenerExecutor, ThreadPoolExecutor};
use crate::future::SoftTimeout;
use crate::group::ChannelGroup;
use crate::log::targets;
use crate::provider::{AioProvider, ProviderHandle};
use crate::record::RecordPool;
use crate::timer::{TimerCallback, TimerService, TimerStats};

/// State shared by every group, channel and future of one engine.
pub(crate) struct EngineContext {
    pub(crate) provider: ProviderHandle,
    pub(crate) config: AioConfig,
    pub(crate) timer: TimerService,
    pub(crate) records: RecordPool,
    pub(crate) jit_pool: BufferPool,
    pub(crate) executor: Option<Arc<dyn ListenerExecutor>>,
    pub(crate) soft_timeout: Arc<dyn TimerCallback>,
    shutdown: AtomicBool,
}

impl EngineContext {
    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

/// Asynchronous I/O completion engine.
pub struct AioEngine {
    ctx: Arc<EngineContext>,
    groups: Mutex<Vec<ChannelGroup>>,
}

impl AioEngine {
    /// Build an engine over `provider`.
    ///
    /// Starts a [`ThreadPoolExecutor`] for listeners when
    /// `handler.listener_threads` is non-zero.
    pub fn new(provider: Arc<dyn AioProvider>, config: AioConfig) -> Result<Self> {
        let executor: Option<Arc<dyn ListenerExecutor>> = match config.handler.listener_threads {
            0 => None,
            n => Some(Arc::new(ThreadPoolExecutor::new(n)?)),
        };
        Self::with_executor(provider, config, executor)
    }

    /// Build an engine with an explicit listener executor.
    pub fn with_executor(
        provider: Arc<dyn AioProvider>,
        config: AioConfig,
        executor: Option<Arc<dyn ListenerExecutor>>,
    ) -> Result<Self> {
        config.validate()?;

        let provider = ProviderHandle::new(provider);
        provider.initialize()?;

        let timer = match TimerService::start(config.timer.clone()) {
            Ok(timer) => timer,
            Err(err) => {
                provider.shutdown();
                return Err(err.into());
            }
        };

        let pools = &config.pools;
        let records = RecordPool::new(pools.record_pool_size);
        let jit_pool = BufferPool::new(pools.jit_pool_size, pools.jit_buffer_size);

        tracing::info!(
            target: targets::ENGINE,
            max_workers = config.handler.max_workers,
            listener_threads = config.handler.listener_threads,
            timeouts = !config.timeout.disable_timeouts,
            "engine started"
        );

        Ok(Self {
            ctx: Arc::new(EngineContext {
                provider,
                timer,
                records,
                jit_pool,
                executor,
                soft_timeout: Arc::new(SoftTimeout),
                shutdown: AtomicBool::new(false),
                config,
            }),
            groups: Mutex::new(Vec::new()),
        })
    }

    /// Open a completion port and start its result handlers.
    pub fn create_group(&self) -> Result<ChannelGroup> {
        if self.is_shut_down() {
            return Err(crate::error::AioError::ClosedResource);
        }
        let group = ChannelGroup::create(self.ctx.clone())?;
        self.groups.lock().push(group.clone());
        Ok(group)
    }

    /// Effective configuration.
    pub fn config(&self) -> &AioConfig {
        &self.ctx.config
    }

    /// The provider handle.
    pub fn provider(&self) -> &ProviderHandle {
        &self.ctx.provider
    }

    /// Timer counters.
    pub fn timer_stats(&self) -> TimerStats {
        self.ctx.timer.stats()
    }

    /// Hand a JIT buffer taken from a future back to the pool.
    pub fn recycle_buffer(&self, buffer: IoBuffer) {
        self.ctx.jit_pool.release(buffer);
    }

    /// Records pooled and allocated so far, as `(available, allocated)`.
    pub fn record_pool_usage(&self) -> (usize, u64) {
        (self.ctx.records.available(), self.ctx.records.allocated())
    }

    /// Whether [`shutdown`](Self::shutdown) has run.
    pub fn is_shut_down(&self) -> bool {
        self.ctx.is_shutting_down()
    }

    /// Stop all groups, the timer, the executor and the provider.
    pub fn shutdown(&self) {
        if self.ctx.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let groups = std::mem::take(&mut *self.groups.lock());
        for group in &groups {
            group.shutdown();
        }
        self.ctx.timer.shutdown();
        if let Some(executor) = &self.ctx.executor {
            executor.shutdown();
        }
        self.ctx.provider.shutdown();
        tracing::info!(target: targets::ENGINE, groups = groups.len(), "engine shut down");
    }
}

impl Drop for AioEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for AioEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AioEngine")
            .field("provider", &self.ctx.provider)
            .field("groups", &self.groups.lock().len())
            .field("timer", &self.ctx.timer)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
