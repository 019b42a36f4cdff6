//! Asynchronous Channels
//!
//! An [`AsyncChannel`] wraps one native handle registered with a
//! [`ChannelGroup`](crate::group::ChannelGroup). It owns exactly one read
//! future and one write future, so at most one read and one write are
//! outstanding at a time.
//!
//! # Issuing
//!
//! `read`/`write` pin the request's buffers, describe their
//! `position..limit` windows in a completion record, and hand the record to
//! the provider. An immediate result completes the future before `read`
//! returns; a pending one is completed later by the result handler or by
//! the soft timeout.
//!
//! Failures during setup (closed channel, no buffers, a buffer already in
//! flight) complete the returned future. The only error `read`/`write`
//! return directly is [`AioError::OperationPending`], because completing a
//! busy future would clobber the operation that owns it.
//!
//! # Example
//!
//! ```rust,ignore
//! let channel = group.open_channel(fd)?;
//! let buf = IoBuffer::allocate(4096);
//! let future = channel.read(IoRequest::single(buf.clone()).timeout(Duration::from_secs(5)))?;
//! future.add_completion_listener(|f| println!("read {:?}", f.result()));
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::buffer::IoBuffer;
use crate::engine::EngineContext;
use crate::error::{AioError, Result};
use crate::future::{FutureKind, IoFuture};
use crate::group::GroupCore;
use crate::log::targets;
use crate::provider::{Capability, IssueOptions, Issued};
use crate::record::{CallId, FutureSelector, FLAG_FORCE_QUEUE};

/// Parameters of one read or write.
#[derive(Debug, Clone, Default)]
pub struct IoRequest {
    buffers: Vec<IoBuffer>,
    position: Option<u64>,
    timeout: Option<Duration>,
    force_queue: bool,
    min_bytes: u64,
    use_jit: bool,
}

impl IoRequest {
    /// Scatter/gather over `buffers`, in order.
    pub fn new(buffers: impl IntoIterator<Item = IoBuffer>) -> Self {
        Self {
            buffers: buffers.into_iter().collect(),
            ..Self::default()
        }
    }

    /// A single-buffer request.
    pub fn single(buffer: IoBuffer) -> Self {
        Self::new([buffer])
    }

    /// Buffers up to, but not including, the first `None`.
    pub fn from_slots(slots: impl IntoIterator<Item = Option<IoBuffer>>) -> Self {
        Self::new(slots.into_iter().map_while(|slot| slot))
    }

    /// File position for positional I/O.
    pub fn at(mut self, position: u64) -> Self {
        self.position = Some(position);
        self
    }

    /// Soft timeout for this operation. Overrides the configured default.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Always complete through the completion port.
    pub fn force_queue(mut self, force: bool) -> Self {
        self.force_queue = force;
        self
    }

    /// Minimum bytes a read must transfer before completing.
    pub fn min_bytes(mut self, bytes: u64) -> Self {
        self.min_bytes = bytes;
        self
    }

    /// Allow delivery into a just-in-time buffer.
    pub fn use_jit(mut self, use_jit: bool) -> Self {
        self.use_jit = use_jit;
        self
    }

    /// The request's buffers.
    pub fn buffers(&self) -> &[IoBuffer] {
        &self.buffers
    }
}

/// Native handle plus its read and write futures.
pub struct AsyncChannel {
    index: AtomicUsize,
    native_handle: u64,
    ctx: Arc<EngineContext>,
    group: Weak<GroupCore>,
    read_future: Arc<IoFuture>,
    write_future: Arc<IoFuture>,
    closed: AtomicBool,
    close_lock: Mutex<()>,
}

impl AsyncChannel {
    pub(crate) fn new(native_handle: u64, ctx: Arc<EngineContext>, group: Weak<GroupCore>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            index: AtomicUsize::new(usize::MAX),
            native_handle,
            ctx,
            group,
            read_future: Arc::new(IoFuture::new(FutureKind::Read, this.clone())),
            write_future: Arc::new(IoFuture::new(FutureKind::Write, this.clone())),
            closed: AtomicBool::new(false),
            close_lock: Mutex::new(()),
        })
    }

    pub(crate) fn set_index(&self, index: usize) {
        self.index.store(index, Ordering::Release);
    }

    pub(crate) fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    /// Lookup-table index.
    pub fn index(&self) -> usize {
        self.index.load(Ordering::Acquire)
    }

    /// Native handle this channel wraps.
    pub fn native_handle(&self) -> u64 {
        self.native_handle
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The read future.
    pub fn read_future(&self) -> &Arc<IoFuture> {
        &self.read_future
    }

    /// The write future.
    pub fn write_future(&self) -> &Arc<IoFuture> {
        &self.write_future
    }

    /// The future a selector resolves to. Sync selectors share the async
    /// futures.
    pub fn future_for(&self, selector: FutureSelector) -> &Arc<IoFuture> {
        if selector.is_read() {
            &self.read_future
        } else {
            &self.write_future
        }
    }

    /// Start a scatter read.
    pub fn read(self: &Arc<Self>, request: IoRequest) -> Result<Arc<IoFuture>> {
        self.issue(FutureSelector::Read, request)
    }

    /// Start a gather write.
    pub fn write(self: &Arc<Self>, request: IoRequest) -> Result<Arc<IoFuture>> {
        self.issue(FutureSelector::Write, request)
    }

    /// Read and block for the result.
    pub fn read_sync(self: &Arc<Self>, request: IoRequest) -> Result<u64> {
        self.issue_sync(FutureSelector::SyncRead, request)
    }

    /// Write and block for the result.
    pub fn write_sync(self: &Arc<Self>, request: IoRequest) -> Result<u64> {
        self.issue_sync(FutureSelector::SyncWrite, request)
    }

    /// Cancel `future`'s operation with a caller-supplied reason.
    ///
    /// Returns `true` if the cancel completed the future. A refused cancel
    /// leaves the operation outstanding; its real completion arrives later.
    pub fn cancel(&self, future: &Arc<IoFuture>, reason: impl Into<String>) -> bool {
        self.cancel_with(future, AioError::cancelled(reason))
    }

    pub(crate) fn cancel_with(&self, future: &Arc<IoFuture>, reason: AioError) -> bool {
        if !self.owns(future) {
            tracing::warn!(target: targets::CHANNEL, index = self.index(), "cancel for foreign future ignored");
            return false;
        }
        if self.is_closed() {
            return future.abandon();
        }
        let Some(call_id) = future.begin_cancel() else {
            return false;
        };

        let timed_out = reason.is_timeout();
        let rc = self.ctx.provider.provider().cancel(self.native_handle, call_id);
        if rc == 0 {
            let cancelled = future.cancel_succeeded(reason);
            if cancelled && timed_out {
                if let Some(group) = self.group.upgrade() {
                    group.stats.record_timeout();
                }
            }
            tracing::debug!(target: targets::CHANNEL, call = %call_id, timed_out, "operation cancelled");
            cancelled
        } else {
            tracing::debug!(target: targets::CHANNEL, call = %call_id, rc, "native cancel refused");
            future.cancel_failed();
            false
        }
    }

    /// Close the channel. Idempotent.
    ///
    /// Outstanding operations complete with [`AioError::ClosedResource`],
    /// the native handle is released, and the table slot is freed.
    pub fn close(&self) {
        let _guard = self.close_lock.lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.ctx.provider.provider().release_handle(self.native_handle);
        self.read_future.abandon();
        self.write_future.abandon();
        self.read_future.release_held();
        self.write_future.release_held();
        if let Some(group) = self.group.upgrade() {
            group.unregister(self.index());
        }
        tracing::debug!(target: targets::CHANNEL, index = self.index(), handle = self.native_handle, "channel closed");
    }

    fn issue_sync(self: &Arc<Self>, selector: FutureSelector, request: IoRequest) -> Result<u64> {
        let timeout = self.effective_timeout(&request);
        let future = self.issue(selector, request)?;
        // The soft timeout completes the future when it is armed.
        let wait = if self.soft_timeouts_enabled() {
            Duration::ZERO
        } else {
            timeout
        };
        future.wait_for_completion(wait)
    }

    fn issue(self: &Arc<Self>, selector: FutureSelector, request: IoRequest) -> Result<Arc<IoFuture>> {
        let future = self.future_for(selector).clone();
        future.begin()?;

        if self.is_closed() {
            future.fail(AioError::ClosedResource);
            return Ok(future);
        }

        let timeout = self.effective_timeout(&request);
        let IoRequest {
            buffers,
            position,
            force_queue,
            min_bytes,
            use_jit,
            ..
        } = request;

        if buffers.iter().all(|b| !b.has_remaining()) {
            let operation = if selector.is_read() { "read" } else { "write" };
            future.fail(AioError::NoBuffersSupplied { operation });
            return Ok(future);
        }

        for (i, buffer) in buffers.iter().enumerate() {
            if let Err(err) = buffer.pin() {
                buffers[..i].iter().for_each(IoBuffer::unpin);
                future.fail(err);
                return Ok(future);
            }
        }

        let call_id = CallId::new(selector, self.index());
        let mut record = self.ctx.records.acquire();
        let prepared = call_id.and_then(|call_id| {
            record
                .prepare(self.native_handle, call_id, position, &buffers)
                .map(|()| call_id)
        });
        let call_id = match prepared {
            Ok(call_id) => call_id,
            Err(err) => {
                buffers.iter().for_each(IoBuffer::unpin);
                self.ctx.records.release(record);
                future.fail(err);
                return Ok(future);
            }
        };
        if force_queue {
            record.set_flags(FLAG_FORCE_QUEUE);
        }
        future.arm(call_id, buffers);

        let options = IssueOptions {
            is_read: selector.is_read(),
            force_queue,
            min_bytes,
            use_jit: use_jit && selector.is_read() && self.ctx.provider.has_capability(Capability::JitBuffers),
        };
        match self.ctx.provider.provider().issue_multi_io(&mut record, options) {
            Ok(Issued::Immediate) => {
                let outcome = record.outcome();
                self.ctx.records.release(record);
                if let Some(group) = self.group.upgrade() {
                    group.stats.record_immediate();
                }
                tracing::trace!(target: targets::CHANNEL, call = %call_id, ok = outcome.is_ok(), "completed inline");
                future.complete_inline(outcome);
            }
            Ok(Issued::Pending) => {
                if let Some(record) = future.attach_record(record) {
                    self.ctx.records.release(record);
                }
                if self.soft_timeouts_enabled() && !timeout.is_zero() {
                    future.schedule_timeout(&self.ctx.timer, self.ctx.soft_timeout.clone(), timeout);
                }
                tracing::trace!(target: targets::CHANNEL, call = %call_id, ?timeout, "pending");
            }
            Err(err) => {
                self.ctx.records.release(record);
                tracing::debug!(target: targets::CHANNEL, call = %call_id, error = %err, "issue failed");
                future.fail(err.into());
            }
        }
        Ok(future)
    }

    fn effective_timeout(&self, request: &IoRequest) -> Duration {
        request.timeout.unwrap_or(self.ctx.config.timeout.completion_timeout)
    }

    fn soft_timeouts_enabled(&self) -> bool {
        !self.ctx.config.timeout.disable_timeouts
    }

    fn owns(&self, future: &Arc<IoFuture>) -> bool {
        Arc::ptr_eq(future, &self.read_future) || Arc::ptr_eq(future, &self.write_future)
    }
}

impl fmt::Debug for AsyncChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncChannel")
            .field("index", &self.index())
            .field("native_handle", &self.native_handle)
            .field("closed", &self.is_closed())
            .field("read", &self.read_future)
            .field("write", &self.write_future)
            .finish()
    }
}
