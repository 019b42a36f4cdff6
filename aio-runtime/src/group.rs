//! Channel Groups
//!
//! A [`ChannelGroup`] is one completion port plus everything that serves
//! it: the lookup table of registered channels, the pool of result-handler
//! workers blocked on the port, and the group's counters.
//!
//! Workers start at `initial_workers` and grow on demand up to
//! `max_workers`; they exit only when the group shuts down or the port is
//! found closed.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::channel::AsyncChannel;
use crate::engine::EngineContext;
use crate::error::Result;
use crate::handler;
use crate::log::targets;
use crate::provider::PortHandle;
use crate::table::LookupTable;

static NEXT_GROUP_ID: AtomicUsize = AtomicUsize::new(0);

/// Snapshot of a group's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupStats {
    /// Channels currently registered.
    pub channels: usize,
    /// Result-handler threads alive.
    pub workers_running: usize,
    /// Workers currently blocked in dequeue.
    pub workers_waiting: usize,
    /// Completions handed to a future by the result handler.
    pub dispatched: u64,
    /// Completion records dropped: unknown channel, unknown future, or
    /// undecodable.
    pub dropped: u64,
    /// Operations that completed inline at issue time.
    pub immediate: u64,
    /// Operations ended by a soft timeout.
    pub timeouts: u64,
}

#[derive(Debug, Default)]
pub(crate) struct GroupCounters {
    pub(crate) running: AtomicUsize,
    pub(crate) waiting: AtomicUsize,
    dispatched: AtomicU64,
    dropped: AtomicU64,
    immediate: AtomicU64,
    timeouts: AtomicU64,
}

impl GroupCounters {
    pub(crate) fn record_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_immediate(&self) {
        self.immediate.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }
}

/// Shared state of one group.
pub(crate) struct GroupCore {
    pub(crate) id: usize,
    pub(crate) port: PortHandle,
    pub(crate) ctx: Arc<EngineContext>,
    pub(crate) table: LookupTable<AsyncChannel>,
    pub(crate) stats: GroupCounters,
    workers: Mutex<Vec<JoinHandle<()>>>,
    spawned: AtomicUsize,
    shutdown: AtomicBool,
}

impl GroupCore {
    /// Whether workers should stop.
    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire) || self.ctx.is_shutting_down()
    }

    /// Start one more worker unless the cap is reached.
    pub(crate) fn add_worker(self: &Arc<Self>) -> bool {
        let max = self.ctx.config.handler.max_workers.max(1);
        let claimed = self
            .stats
            .running
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1));
        if claimed.is_err() || self.is_shutting_down() {
            if claimed.is_ok() {
                self.stats.running.fetch_sub(1, Ordering::AcqRel);
            }
            return false;
        }

        let serial = self.spawned.fetch_add(1, Ordering::Relaxed);
        match handler::spawn(self.clone(), serial) {
            Ok(handle) => {
                self.workers.lock().push(handle);
                tracing::debug!(target: targets::HANDLER, group = self.id, worker = serial, "worker started");
                true
            }
            Err(err) => {
                self.stats.running.fetch_sub(1, Ordering::AcqRel);
                tracing::error!(target: targets::HANDLER, group = self.id, error = %err, "failed to start worker");
                false
            }
        }
    }

    pub(crate) fn unregister(&self, index: usize) {
        if let Err(err) = self.table.remove(index) {
            tracing::debug!(target: targets::CHANNEL, group = self.id, index, error = %err, "channel was not registered");
        }
    }

    fn snapshot(&self) -> GroupStats {
        GroupStats {
            channels: self.table.len(),
            workers_running: self.stats.running.load(Ordering::Acquire),
            workers_waiting: self.stats.waiting.load(Ordering::Acquire),
            dispatched: self.stats.dispatched.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            immediate: self.stats.immediate.load(Ordering::Relaxed),
            timeouts: self.stats.timeouts.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        for channel in self.table.snapshot() {
            channel.close();
        }
        self.ctx.provider.provider().close_completion_port(self.port);

        let workers = std::mem::take(&mut *self.workers.lock());
        let current = std::thread::current().id();
        for handle in workers {
            // A listener running on a worker may trigger shutdown.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::error!(target: targets::HANDLER, group = self.id, "worker panicked");
            }
        }
        tracing::debug!(target: targets::ENGINE, group = self.id, "group shut down");
    }
}

/// A completion port and the channels bound to it.
#[derive(Clone)]
pub struct ChannelGroup {
    core: Arc<GroupCore>,
}

impl ChannelGroup {
    pub(crate) fn create(ctx: Arc<EngineContext>) -> Result<Self> {
        let port = ctx.provider.provider().open_completion_port()?;
        let pools = &ctx.config.pools;
        let core = Arc::new(GroupCore {
            id: NEXT_GROUP_ID.fetch_add(1, Ordering::Relaxed),
            port,
            table: LookupTable::new(pools.table_initial_capacity, pools.table_increment, pools.table_max_capacity),
            stats: GroupCounters::default(),
            workers: Mutex::new(Vec::new()),
            spawned: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            ctx,
        });

        let initial = core.ctx.config.handler.initial_workers.max(1);
        for _ in 0..initial {
            if !core.add_worker() {
                break;
            }
        }
        tracing::info!(target: targets::ENGINE, group = core.id, %port, workers = initial, "group created");
        Ok(Self { core })
    }

    pub(crate) fn core(&self) -> &Arc<GroupCore> {
        &self.core
    }

    /// Register `native_handle` and return its channel.
    pub fn open_channel(&self, native_handle: u64) -> Result<Arc<AsyncChannel>> {
        let provider = self.core.ctx.provider.provider();
        provider.associate(native_handle, self.core.port)?;

        let channel = AsyncChannel::new(native_handle, self.core.ctx.clone(), Arc::downgrade(&self.core));
        let index = match self.core.table.add(channel.clone()) {
            Ok(index) => index,
            Err(err) => {
                provider.release_handle(native_handle);
                return Err(err);
            }
        };
        channel.set_index(index);
        tracing::debug!(target: targets::CHANNEL, group = self.core.id, index, handle = native_handle, "channel opened");
        Ok(channel)
    }

    /// The channel registered at `index`.
    pub fn channel(&self, index: usize) -> Option<Arc<AsyncChannel>> {
        self.core.table.lookup(index)
    }

    /// The completion port serving this group.
    pub fn port(&self) -> PortHandle {
        self.core.port
    }

    /// Counter snapshot.
    pub fn stats(&self) -> GroupStats {
        self.core.snapshot()
    }

    /// Close every channel, close the port and join the workers.
    pub fn shutdown(&self) {
        self.core.shutdown();
    }

    /// Whether the group has been shut down.
    pub fn is_shut_down(&self) -> bool {
        self.core.shutdown.load(Ordering::Acquire)
    }
}

impl fmt::Debug for ChannelGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelGroup")
            .field("id", &self.core.id)
            .field("port", &self.core.port)
            .field("stats", &self.stats())
            .finish()
    }
}
