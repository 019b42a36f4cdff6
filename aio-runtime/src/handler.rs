//! Result Handler
//!
//! Worker threads that drain a group's completion port.
//!
//! Each cycle a worker:
//!
//! 1. tops up its dequeue slots (attaching a JIT buffer to any slot that
//!    gave its buffer away, when the provider supports JIT delivery),
//! 2. blocks in `dequeue_completions` for up to the dequeue timeout,
//! 3. for each record: decodes the call id, resolves the channel through
//!    the lookup table and the future through the selector, and delivers
//!    the byte count or decoded failure.
//!
//! A record that names no live channel or no future is logged and dropped.
//! If a worker drains events and sees no other worker waiting on the port,
//! it starts another one, up to the configured cap.
//!
//! A worker exits when the group shuts down or when a dequeue times out and
//! the port is no longer valid. An unexpected failure ends that worker
//! unless shutdown is in progress, in which case it is swallowed.

use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::future::Delivery;
use crate::group::GroupCore;
use crate::log::targets;
use crate::panic::catch_panic;
use crate::provider::Capability;
use crate::record::{RecordSlot, FLAG_JIT_USED};

/// Spawn a worker thread for `group`. The caller has already counted it in
/// `running`.
pub(crate) fn spawn(group: Arc<GroupCore>, serial: usize) -> io::Result<JoinHandle<()>> {
    let name = format!("aio-handler-{}-{}", group.id, serial);
    thread::Builder::new().name(name).spawn(move || {
        let mut handler = ResultHandler::new(group.clone(), serial);
        handler.run();
        handler.release();
        group.stats.running.fetch_sub(1, Ordering::AcqRel);
    })
}

enum Cycle {
    Continue,
    Exit,
}

struct ResultHandler {
    group: Arc<GroupCore>,
    serial: usize,
    slots: Vec<RecordSlot>,
    use_jit: bool,
}

impl ResultHandler {
    fn new(group: Arc<GroupCore>, serial: usize) -> Self {
        let provider = &group.ctx.provider;
        let batch = if provider.has_capability(Capability::BatchDequeue) {
            group.ctx.config.handler.max_batched_events.max(1)
        } else {
            1
        };
        let use_jit = provider.has_capability(Capability::JitBuffers);
        Self {
            slots: (0..batch).map(|_| RecordSlot::new()).collect(),
            group,
            serial,
            use_jit,
        }
    }

    fn run(&mut self) {
        loop {
            if self.group.is_shutting_down() {
                break;
            }
            match catch_panic(|| self.cycle()) {
                Ok(Cycle::Continue) => {}
                Ok(Cycle::Exit) => break,
                Err(report) => {
                    if !self.group.is_shutting_down() {
                        tracing::error!(
                            target: targets::HANDLER,
                            group = self.group.id,
                            worker = self.serial,
                            panic = %report.message,
                            "result handler terminated"
                        );
                    }
                    break;
                }
            }
        }
        tracing::debug!(target: targets::HANDLER, group = self.group.id, worker = self.serial, "worker exiting");
    }

    fn cycle(&mut self) -> Cycle {
        self.prepare_slots();

        let ctx = &self.group.ctx;
        let provider = ctx.provider.provider();
        let timeout = ctx.config.handler.dequeue_timeout;

        self.group.stats.waiting.fetch_add(1, Ordering::AcqRel);
        let dequeued = provider.dequeue_completions(self.group.port, &mut self.slots, timeout);
        self.group.stats.waiting.fetch_sub(1, Ordering::AcqRel);

        match dequeued {
            Ok(0) => {
                if self.group.is_shutting_down() || !provider.is_port_valid(self.group.port) {
                    return Cycle::Exit;
                }
                Cycle::Continue
            }
            Ok(count) => {
                for index in 0..count.min(self.slots.len()) {
                    self.dispatch(index);
                }
                if self.group.stats.waiting.load(Ordering::Acquire) == 0 {
                    self.group.add_worker();
                }
                Cycle::Continue
            }
            Err(err) => {
                if !self.group.is_shutting_down() {
                    tracing::error!(
                        target: targets::HANDLER,
                        group = self.group.id,
                        worker = self.serial,
                        error = %err,
                        "dequeue failed"
                    );
                }
                Cycle::Exit
            }
        }
    }

    fn prepare_slots(&mut self) {
        if !self.use_jit {
            return;
        }
        let pool = &self.group.ctx.jit_pool;
        for slot in &mut self.slots {
            if slot.jit_buffer().is_none() {
                slot.attach_jit(pool.acquire());
            }
        }
    }

    fn dispatch(&mut self, index: usize) {
        let group = &self.group;
        let record = match self.slots[index].load() {
            Ok(record) => record,
            Err(err) => {
                group.stats.record_dropped();
                tracing::warn!(target: targets::HANDLER, group = group.id, error = %err, "undecodable completion record");
                return;
            }
        };
        let call = record.call_id();

        let Some(channel) = group.table.lookup(call.channel_index()) else {
            group.stats.record_dropped();
            tracing::debug!(target: targets::HANDLER, group = group.id, call = %call, "completion for unknown channel");
            return;
        };
        if channel.native_handle() != record.channel_id() {
            group.stats.record_dropped();
            tracing::debug!(
                target: targets::HANDLER,
                group = group.id,
                call = %call,
                expected = channel.native_handle(),
                got = record.channel_id(),
                "completion for a previous occupant of the slot"
            );
            return;
        }
        let Some(selector) = call.selector() else {
            group.stats.record_dropped();
            tracing::warn!(target: targets::HANDLER, group = group.id, call = %call, "completion names no future");
            return;
        };
        let future = channel.future_for(selector);

        let oob = if record.has_flag(FLAG_JIT_USED) {
            self.slots[index].take_jit().map(|buffer| {
                buffer.set_limit(record.bytes_affected().min(buffer.capacity() as u64) as usize);
                buffer
            })
        } else {
            None
        };

        tracing::trace!(
            target: targets::HANDLER,
            call = %call,
            rc = record.return_code(),
            bytes = record.bytes_affected(),
            "completion"
        );
        if let Delivery::Refused(Some(buffer)) = future.deliver(record.outcome(), oob) {
            group.ctx.jit_pool.release(buffer);
        }
        group.stats.record_dispatched();
    }

    fn release(&mut self) {
        let pool = &self.group.ctx.jit_pool;
        for slot in &mut self.slots {
            if let Some(buffer) = slot.take_jit() {
                pool.release(buffer);
            }
        }
    }
}

