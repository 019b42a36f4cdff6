//! I/O Futures
//!
//! An [`IoFuture`] is the outcome of one asynchronous operation. Each
//! channel owns exactly two, one for reads and one for writes, and reuses
//! them across operations.
//!
//! # State machine
//!
//! ```text
//!   Idle ──begin──▶ Pending ──complete──▶ Completed
//!    ▲                                       │
//!    └────────────────reset──────────────────┘
//! ```
//!
//! Completion is a latch: once a future is completed it stays completed
//! until the next reset, and only the first completing call wins. Natural
//! completion, cancellation, the soft timeout and a timed-out wait all race
//! through the same lock.
//!
//! # Generations
//!
//! The reuse counter is bumped on every reset, before the completed flag is
//! cleared. Timeout callbacks carry the counter value from when they were
//! armed and do nothing if it no longer matches.
//!
//! # Listeners
//!
//! A listener runs exactly once, outside the future lock, on the engine's
//! listener executor if one is configured and inline otherwise. A panicking
//! listener is contained and logged.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::buffer::{advance_all, IoBuffer};
use crate::channel::AsyncChannel;
use crate::error::{AioError, Result};
use crate::executor::Task;
use crate::log::targets;
use crate::panic::run_isolated;
use crate::record::{CallId, CompletionRecord};
use crate::timer::{TimerCallback, TimerService, TimerWorkItem};

/// Which side of a channel a future serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FutureKind {
    /// The channel's read future.
    Read,
    /// The channel's write future.
    Write,
}

impl FutureKind {
    /// Lowercase name for messages.
    pub fn as_str(self) -> &'static str {
        match self {
            FutureKind::Read => "read",
            FutureKind::Write => "write",
        }
    }
}

impl fmt::Display for FutureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type Listener = Box<dyn FnOnce(&Arc<IoFuture>) + Send + 'static>;

enum Phase {
    Idle,
    Pending,
    Completed(Result<u64>),
}

/// What happens to the in-flight buffers when a future completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Release {
    /// Unpin and advance positions by the transferred byte count.
    Advance,
    /// Unpin without touching positions.
    Unpin,
    /// Keep pinned until the native completion arrives or the channel
    /// closes; the native layer may still own them.
    Hold,
}

/// What became of a completion handed over by the result handler.
#[derive(Debug)]
pub(crate) enum Delivery {
    /// The completion settled the future.
    Completed,
    /// A cancel is in flight; the completion applies only if it fails.
    Parked,
    /// Closed channel or already completed. Returns the unused JIT buffer.
    Refused(Option<IoBuffer>),
}

struct FutureState {
    phase: Phase,
    timed_out: bool,
    cancel_in_progress: bool,
    /// Completion that arrived while a cancel was in flight.
    deferred: Option<(Result<u64>, Option<IoBuffer>)>,
    listener: Option<Listener>,
    timer: Option<Arc<TimerWorkItem>>,
    call_id: Option<CallId>,
    buffers: Vec<IoBuffer>,
    /// Buffers stayed pinned past completion; the native operation is
    /// still outstanding.
    held: bool,
    record: Option<Box<CompletionRecord>>,
    oob: Option<IoBuffer>,
}

struct Finished {
    listener: Option<Listener>,
    record: Option<Box<CompletionRecord>>,
    /// JIT buffer of a parked completion the cancel made obsolete.
    spare: Option<IoBuffer>,
}

/// Outcome of one asynchronous operation.
pub struct IoFuture {
    kind: FutureKind,
    channel: Weak<AsyncChannel>,
    reuse_count: AtomicU64,
    completed: AtomicBool,
    completions: AtomicU64,
    state: Mutex<FutureState>,
    wake: Condvar,
}

impl IoFuture {
    pub(crate) fn new(kind: FutureKind, channel: Weak<AsyncChannel>) -> Self {
        Self {
            kind,
            channel,
            reuse_count: AtomicU64::new(0),
            completed: AtomicBool::new(false),
            completions: AtomicU64::new(0),
            state: Mutex::new(FutureState {
                phase: Phase::Idle,
                timed_out: false,
                cancel_in_progress: false,
                deferred: None,
                listener: None,
                timer: None,
                call_id: None,
                buffers: Vec::new(),
                held: false,
                record: None,
                oob: None,
            }),
            wake: Condvar::new(),
        }
    }

    /// A future not bound to any channel.
    ///
    /// Completion is never suppressed by a closed channel, listeners run
    /// inline, and a soft timeout completes it directly.
    pub fn detached(kind: FutureKind) -> Arc<Self> {
        Arc::new(Self::new(kind, Weak::new()))
    }

    /// Read or write side.
    pub fn kind(&self) -> FutureKind {
        self.kind
    }

    /// Times this future has been reset for a new operation.
    pub fn reuse_count(&self) -> u64 {
        self.reuse_count.load(Ordering::Acquire)
    }

    /// Whether the current operation has completed.
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Whether an operation is outstanding.
    pub fn is_pending(&self) -> bool {
        matches!(self.state.lock().phase, Phase::Pending)
    }

    /// Whether the current operation ended in a soft or wait timeout.
    pub fn is_timed_out(&self) -> bool {
        self.state.lock().timed_out
    }

    /// Total completions over the life of the future.
    pub fn completions(&self) -> u64 {
        self.completions.load(Ordering::Relaxed)
    }

    /// Call identifier of the current operation.
    pub fn call_id(&self) -> Option<CallId> {
        self.state.lock().call_id
    }

    /// Byte count or failure, once completed.
    pub fn result(&self) -> Option<Result<u64>> {
        match &self.state.lock().phase {
            Phase::Completed(outcome) => Some(outcome.clone()),
            _ => None,
        }
    }

    /// Take the out-of-band (JIT) buffer delivered with the completion.
    pub fn take_oob_buffer(&self) -> Option<IoBuffer> {
        self.state.lock().oob.take()
    }

    /// Complete with a byte count or failure.
    ///
    /// Ignored if already completed or if the owning channel is closed.
    /// Returns `true` if this call completed the future.
    ///
    /// If the operation was already handed to the provider, its buffers stay
    /// pinned and untouched until the native completion arrives or the
    /// channel closes. Until then [`reset`](Self::reset) fails.
    pub fn complete(self: &Arc<Self>, outcome: Result<u64>) -> bool {
        if self.channel_closed() {
            return false;
        }
        let mut state = self.state.lock();
        if matches!(state.phase, Phase::Completed(_)) {
            return false;
        }
        let release = if state.call_id.is_some() { Release::Hold } else { Release::Advance };
        let finished = self.finish_locked(&mut state, outcome, None, release);
        drop(state);
        self.after_completion(finished);
        true
    }

    /// Register `listener` to run once the operation completes.
    ///
    /// Runs immediately if the future has already completed. Replaces any
    /// listener registered earlier for the same operation.
    pub fn add_completion_listener<F>(self: &Arc<Self>, listener: F)
    where
        F: FnOnce(&Arc<IoFuture>) + Send + 'static,
    {
        let mut state = self.state.lock();
        if matches!(state.phase, Phase::Completed(_)) {
            drop(state);
            let this = self.clone();
            run_isolated("completion listener", move || listener(&this));
            return;
        }
        state.listener = Some(Box::new(listener));
    }

    /// Block until completed. `Duration::ZERO` waits indefinitely.
    ///
    /// If the timeout elapses first, the owning channel is asked to cancel
    /// the operation and the future is completed with
    /// [`AioError::OperationTimedOut`]. When the native cancel is refused
    /// the operation's buffers stay pinned until the native completion
    /// arrives or the channel closes.
    pub fn wait_for_completion(self: &Arc<Self>, timeout: Duration) -> Result<u64> {
        if self.is_completed() {
            if let Some(outcome) = self.result() {
                return outcome;
            }
        }

        let mut state = self.state.lock();
        if timeout.is_zero() {
            while !matches!(state.phase, Phase::Completed(_)) {
                self.wake.wait(&mut state);
            }
        } else {
            let deadline = Instant::now() + timeout;
            while !matches!(state.phase, Phase::Completed(_)) {
                if self.wake.wait_until(&mut state, deadline).timed_out() {
                    break;
                }
            }
        }

        if let Phase::Completed(outcome) = &state.phase {
            return outcome.clone();
        }
        drop(state);

        let err = AioError::timed_out(timeout.as_millis() as u64);
        if let Some(channel) = self.channel.upgrade() {
            channel.cancel_with(self, err.clone());
        }
        // Cancel refused or no channel: the native layer may still own the
        // buffers.
        self.settle(Err(err.clone()), None, Release::Hold);
        self.result().unwrap_or(Err(err))
    }

    /// Return an idle or completed future to Idle.
    ///
    /// Disarms any soft timeout, bumps the reuse counter, clears the outcome
    /// and listener, and releases buffers of the last operation. Fails if
    /// an operation is outstanding, including one completed early whose
    /// native half has not finished.
    pub fn reset(&self) -> Result<()> {
        let mut state = self.state.lock();
        if matches!(state.phase, Phase::Pending) || state.held {
            return Err(AioError::OperationPending {
                selector: self.kind.as_str(),
            });
        }
        let record = self.reset_locked(&mut state);
        drop(state);
        self.release_record(record);
        Ok(())
    }

    /// Reset and move to Pending for a new operation.
    pub(crate) fn begin(&self) -> Result<()> {
        let mut state = self.state.lock();
        if matches!(state.phase, Phase::Pending) || state.held {
            return Err(AioError::OperationPending {
                selector: self.kind.as_str(),
            });
        }
        let record = self.reset_locked(&mut state);
        state.phase = Phase::Pending;
        drop(state);
        self.release_record(record);
        Ok(())
    }

    /// Record what the current operation has in flight.
    pub(crate) fn arm(&self, call_id: CallId, buffers: Vec<IoBuffer>) {
        let mut state = self.state.lock();
        state.call_id = Some(call_id);
        state.buffers = buffers;
    }

    /// Keep `record` with the pending operation. Hands it back if the
    /// operation already completed.
    pub(crate) fn attach_record(&self, record: Box<CompletionRecord>) -> Option<Box<CompletionRecord>> {
        let mut state = self.state.lock();
        if matches!(state.phase, Phase::Pending) {
            state.record = Some(record);
            None
        } else {
            Some(record)
        }
    }

    /// Arm a soft timeout if the operation is still pending.
    pub(crate) fn schedule_timeout(
        self: &Arc<Self>,
        timer: &TimerService,
        callback: Arc<dyn TimerCallback>,
        timeout: Duration,
    ) -> bool {
        let mut state = self.state.lock();
        if !matches!(state.phase, Phase::Pending) {
            return false;
        }
        let item = timer.schedule(timeout, callback, self, self.reuse_count());
        state.timer = Some(item);
        true
    }

    /// Complete an operation the provider finished during issue.
    pub(crate) fn complete_inline(self: &Arc<Self>, outcome: Result<u64>) -> bool {
        if self.channel_closed() {
            return false;
        }
        self.settle(outcome, None, Release::Advance)
    }

    /// Complete a failed setup. Never suppressed by a closed channel.
    pub(crate) fn fail(self: &Arc<Self>, err: AioError) -> bool {
        self.settle(Err(err), None, Release::Unpin)
    }

    /// Complete a pending operation with [`AioError::ClosedResource`].
    pub(crate) fn abandon(self: &Arc<Self>) -> bool {
        let mut state = self.state.lock();
        if !matches!(state.phase, Phase::Pending) {
            return false;
        }
        let finished = self.finish_locked(&mut state, Err(AioError::ClosedResource), None, Release::Unpin);
        drop(state);
        self.after_completion(finished);
        true
    }

    /// Completion delivered by the result handler.
    ///
    /// If a cancel is in flight the flag is cleared and the outcome parked;
    /// it is applied only if the cancel then fails. A completion for an
    /// operation that was completed early releases its held buffers.
    pub(crate) fn deliver(self: &Arc<Self>, outcome: Result<u64>, oob: Option<IoBuffer>) -> Delivery {
        if self.channel_closed() {
            return Delivery::Refused(oob);
        }
        let mut state = self.state.lock();
        if state.cancel_in_progress {
            state.cancel_in_progress = false;
            if matches!(state.phase, Phase::Pending) {
                state.deferred = Some((outcome, oob));
                return Delivery::Parked;
            }
            return Delivery::Refused(oob);
        }
        if matches!(state.phase, Phase::Completed(_)) {
            let record = self.unhold_locked(&mut state);
            drop(state);
            self.release_record(record);
            return Delivery::Refused(oob);
        }
        let finished = self.finish_locked(&mut state, outcome, oob, Release::Advance);
        drop(state);
        self.after_completion(finished);
        Delivery::Completed
    }

    /// Unpin buffers held past an early completion. The native side of the
    /// operation is gone.
    pub(crate) fn release_held(&self) {
        let mut state = self.state.lock();
        let record = self.unhold_locked(&mut state);
        drop(state);
        self.release_record(record);
    }

    /// Flag a cancel as in flight. Returns the call id to cancel, or `None`
    /// if nothing is pending.
    pub(crate) fn begin_cancel(&self) -> Option<CallId> {
        let mut state = self.state.lock();
        if !matches!(state.phase, Phase::Pending) {
            state.cancel_in_progress = false;
            return None;
        }
        state.cancel_in_progress = true;
        state.call_id
    }

    /// The provider confirmed the cancel.
    pub(crate) fn cancel_succeeded(self: &Arc<Self>, reason: AioError) -> bool {
        self.settle(Err(reason), None, Release::Unpin)
    }

    /// The provider refused the cancel; the operation is still in flight or
    /// its completion was parked.
    pub(crate) fn cancel_failed(self: &Arc<Self>) {
        let mut state = self.state.lock();
        state.cancel_in_progress = false;
        let Some((outcome, oob)) = state.deferred.take() else {
            return;
        };
        if !matches!(state.phase, Phase::Pending) {
            return;
        }
        let finished = self.finish_locked(&mut state, outcome, oob, Release::Advance);
        drop(state);
        self.after_completion(finished);
    }

    /// Timer entry point.
    fn on_soft_timeout(self: &Arc<Self>, reuse_count: u64, timeout: Duration) {
        {
            let mut state = self.state.lock();
            if !matches!(state.phase, Phase::Pending) || self.reuse_count() != reuse_count {
                tracing::trace!(
                    target: targets::TIMER,
                    kind = %self.kind,
                    armed = reuse_count,
                    current = self.reuse_count(),
                    "stale timeout ignored"
                );
                return;
            }
            state.cancel_in_progress = true;
            state.timer = None;
        }

        let err = AioError::timed_out(timeout.as_millis() as u64);
        match self.channel.upgrade() {
            Some(channel) => {
                channel.cancel_with(self, err);
            }
            None => {
                self.settle(Err(err), None, Release::Hold);
            }
        }
    }

    fn settle(self: &Arc<Self>, outcome: Result<u64>, oob: Option<IoBuffer>, release: Release) -> bool {
        let mut state = self.state.lock();
        if matches!(state.phase, Phase::Completed(_)) {
            return false;
        }
        let finished = self.finish_locked(&mut state, outcome, oob, release);
        drop(state);
        self.after_completion(finished);
        true
    }

    fn finish_locked(
        &self,
        state: &mut FutureState,
        outcome: Result<u64>,
        oob: Option<IoBuffer>,
        release: Release,
    ) -> Finished {
        if let Some(item) = state.timer.take() {
            item.cancel();
        }
        state.cancel_in_progress = false;
        let spare = state.deferred.take().and_then(|(_, oob)| oob);
        let delivered_out_of_band = oob.is_some();
        if delivered_out_of_band {
            state.oob = oob;
        }
        if matches!(&outcome, Err(err) if err.is_timeout()) {
            state.timed_out = true;
        }

        let mut record = None;
        if release == Release::Hold {
            state.held = !state.buffers.is_empty();
        } else {
            let buffers = std::mem::take(&mut state.buffers);
            // JIT data lands in the out-of-band buffer, not the caller's.
            if let (Release::Advance, Ok(bytes), false) = (release, &outcome, delivered_out_of_band) {
                advance_all(&buffers, *bytes);
            }
            for buffer in &buffers {
                buffer.unpin();
            }
            record = state.record.take();
        }

        state.phase = Phase::Completed(outcome);
        self.completed.store(true, Ordering::Release);
        self.completions.fetch_add(1, Ordering::Relaxed);

        Finished {
            listener: state.listener.take(),
            record,
            spare,
        }
    }

    fn unhold_locked(&self, state: &mut FutureState) -> Option<Box<CompletionRecord>> {
        if !state.held {
            return None;
        }
        state.held = false;
        for buffer in state.buffers.drain(..) {
            buffer.unpin();
        }
        tracing::trace!(target: targets::CHANNEL, kind = %self.kind, "held buffers released");
        state.record.take()
    }

    fn after_completion(self: &Arc<Self>, finished: Finished) {
        self.release_record(finished.record);
        if let (Some(buffer), Some(channel)) = (finished.spare, self.channel.upgrade()) {
            channel.context().jit_pool.release(buffer);
        }
        self.wake.notify_all();
        if let Some(listener) = finished.listener {
            self.dispatch(listener);
        }
    }

    fn dispatch(self: &Arc<Self>, listener: Listener) {
        let this = self.clone();
        let task: Task = Box::new(move || listener(&this));
        let executor = self.channel.upgrade().and_then(|c| c.context().executor.clone());
        match executor {
            Some(executor) => {
                if let Err(task) = executor.execute(task) {
                    run_isolated("completion listener", task);
                }
            }
            None => {
                run_isolated("completion listener", task);
            }
        }
    }

    fn reset_locked(&self, state: &mut FutureState) -> Option<Box<CompletionRecord>> {
        if let Some(item) = state.timer.take() {
            item.cancel();
        }
        // The generation must move before the latch reopens.
        self.reuse_count.fetch_add(1, Ordering::SeqCst);
        self.completed.store(false, Ordering::SeqCst);

        for buffer in state.buffers.drain(..) {
            buffer.unpin();
        }
        state.held = false;
        state.phase = Phase::Idle;
        state.timed_out = false;
        state.cancel_in_progress = false;
        state.deferred = None;
        state.listener = None;
        state.call_id = None;
        state.oob = None;
        state.record.take()
    }

    fn release_record(&self, record: Option<Box<CompletionRecord>>) {
        if let (Some(record), Some(channel)) = (record, self.channel.upgrade()) {
            channel.context().records.release(record);
        }
    }

    fn channel_closed(&self) -> bool {
        self.channel.upgrade().map_or(false, |c| c.is_closed())
    }
}

impl fmt::Debug for IoFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        let phase = match &state.phase {
            Phase::Idle => "idle",
            Phase::Pending => "pending",
            Phase::Completed(Ok(_)) => "completed",
            Phase::Completed(Err(_)) => "failed",
        };
        f.debug_struct("IoFuture")
            .field("kind", &self.kind)
            .field("phase", &phase)
            .field("reuse_count", &self.reuse_count())
            .field("call_id", &state.call_id)
            .field("timed_out", &state.timed_out)
            .finish()
    }
}

/// Timer callback that turns an expired timeout into a channel cancel.
#[derive(Debug, Default)]
pub(crate) struct SoftTimeout;

impl TimerCallback for SoftTimeout {
    fn timer_fired(&self, future: Arc<IoFuture>, reuse_count: u64, timeout: Duration) {
        future.on_soft_timeout(reuse_count, timeout);
    }
}
