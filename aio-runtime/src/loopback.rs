//! Loopback Provider
//!
//! An in-process [`AioProvider`]: every native handle is a byte pipe, and
//! completion ports are condition-variable queues. It exercises the full
//! engine path (pinned buffer addresses, pending reads, cancel, batched
//! dequeue, JIT delivery) without touching the OS.
//!
//! # Semantics
//!
//! - A write appends its gathered bytes to the handle's pipe and completes
//!   inline, or through the port when `force_queue` is set.
//! - A read completes inline when the pipe holds at least `max(min_bytes, 1)`
//!   bytes and `force_queue` is not set. Otherwise it waits for writes and is
//!   posted to the port once satisfied.
//! - With JIT delivery enabled, a queued read that allowed it carries its
//!   bytes to the dequeuing worker, which places them in the slot's JIT
//!   buffer instead of the caller's buffers.
//! - `cancel` succeeds only for reads still waiting on data.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::provider::{AioProvider, Capability, IssueOptions, Issued, PortHandle};
use crate::record::{BufferDescriptor, CallId, CompletionRecord, RecordSlot, FLAG_JIT_USED};

/// Non-zero code returned by a refused cancel.
pub const CANCEL_REFUSED: i32 = 1;

struct Posted {
    record: CompletionRecord,
    jit_data: Option<Vec<u8>>,
}

struct Port {
    queue: Mutex<VecDeque<Posted>>,
    ready: Condvar,
    open: AtomicBool,
}

impl Port {
    fn post(&self, posted: Posted) {
        self.queue.lock().push_back(posted);
        self.ready.notify_one();
    }
}

struct PendingRead {
    record: CompletionRecord,
    min_bytes: usize,
    use_jit: bool,
}

#[derive(Default)]
struct Pipe {
    data: VecDeque<u8>,
    port: Option<Arc<Port>>,
    readers: VecDeque<PendingRead>,
}

impl Pipe {
    /// Complete waiting readers, oldest first, while data satisfies them.
    fn satisfy_readers(&mut self) {
        let Some(port) = self.port.clone() else {
            return;
        };
        while let Some(reader) = self.readers.front() {
            if self.data.len() < reader.min_bytes {
                break;
            }
            let Some(mut reader) = self.readers.pop_front() else {
                break;
            };
            if reader.use_jit {
                let take = (reader.record.requested_bytes() as usize).min(self.data.len());
                let bytes: Vec<u8> = self.data.drain(..take).collect();
                reader.record.set_result(0, bytes.len() as u64);
                port.post(Posted {
                    record: reader.record,
                    jit_data: Some(bytes),
                });
            } else {
                // SAFETY: the descriptors name pinned buffer windows kept
                // alive by the issuing future until it completes.
                let moved = unsafe { scatter(reader.record.descriptors(), &mut self.data) };
                reader.record.set_result(0, moved);
                port.post(Posted {
                    record: reader.record,
                    jit_data: None,
                });
            }
        }
    }
}

/// In-process provider backed by byte pipes.
pub struct LoopbackProvider {
    pipes: Mutex<HashMap<u64, Pipe>>,
    ports: Mutex<HashMap<u64, Arc<Port>>>,
    next_port: AtomicU64,
    jit: bool,
    issued: AtomicU64,
    cancelled: AtomicU64,
}

impl LoopbackProvider {
    /// Provider with batch dequeue and no JIT delivery.
    pub fn new() -> Self {
        Self {
            pipes: Mutex::new(HashMap::new()),
            ports: Mutex::new(HashMap::new()),
            next_port: AtomicU64::new(1),
            jit: false,
            issued: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
        }
    }

    /// Provider that also offers JIT delivery for queued reads.
    pub fn with_jit() -> Self {
        Self {
            jit: true,
            ..Self::new()
        }
    }

    /// Bytes buffered on `native_handle` and not yet read.
    pub fn buffered(&self, native_handle: u64) -> usize {
        self.pipes.lock().get(&native_handle).map_or(0, |p| p.data.len())
    }

    /// Reads waiting for data on `native_handle`.
    pub fn waiting_reads(&self, native_handle: u64) -> usize {
        self.pipes.lock().get(&native_handle).map_or(0, |p| p.readers.len())
    }

    /// Operations issued so far.
    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }

    /// Successful cancels so far.
    pub fn cancelled(&self) -> u64 {
        self.cancelled.load(Ordering::Relaxed)
    }

    fn port(&self, port: PortHandle) -> Option<Arc<Port>> {
        self.ports.lock().get(&port.0).cloned()
    }
}

impl Default for LoopbackProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl AioProvider for LoopbackProvider {
    fn associate(&self, native_handle: u64, port: PortHandle) -> io::Result<()> {
        let port = self
            .port(port)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown completion port"))?;
        self.pipes.lock().entry(native_handle).or_default().port = Some(port);
        Ok(())
    }

    fn release_handle(&self, native_handle: u64) {
        self.pipes.lock().remove(&native_handle);
    }

    fn issue_multi_io(&self, record: &mut CompletionRecord, options: IssueOptions) -> io::Result<Issued> {
        self.issued.fetch_add(1, Ordering::Relaxed);
        let mut pipes = self.pipes.lock();
        let pipe = pipes
            .get_mut(&record.channel_id())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "handle not associated"))?;

        if !options.is_read {
            // SAFETY: the descriptors name pinned buffer windows that the
            // caller keeps alive for the duration of this call.
            let moved = unsafe { gather(record.descriptors(), &mut pipe.data) };
            record.set_result(0, moved);
            let issued = if options.force_queue {
                let port = pipe
                    .port
                    .clone()
                    .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no completion port"))?;
                port.post(Posted {
                    record: record.clone(),
                    jit_data: None,
                });
                Issued::Pending
            } else {
                Issued::Immediate
            };
            pipe.satisfy_readers();
            return Ok(issued);
        }

        let min_bytes = (options.min_bytes.max(1) as usize).min(record.requested_bytes() as usize);
        if !options.force_queue && pipe.readers.is_empty() && pipe.data.len() >= min_bytes {
            // SAFETY: as above.
            let moved = unsafe { scatter(record.descriptors(), &mut pipe.data) };
            record.set_result(0, moved);
            return Ok(Issued::Immediate);
        }

        if pipe.port.is_none() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "no completion port"));
        }
        pipe.readers.push_back(PendingRead {
            record: record.clone(),
            min_bytes,
            use_jit: options.use_jit && self.jit,
        });
        pipe.satisfy_readers();
        Ok(Issued::Pending)
    }

    fn cancel(&self, channel_id: u64, call_id: CallId) -> i32 {
        let mut pipes = self.pipes.lock();
        let Some(pipe) = pipes.get_mut(&channel_id) else {
            return CANCEL_REFUSED;
        };
        match pipe.readers.iter().position(|r| r.record.call_id() == call_id) {
            Some(at) => {
                pipe.readers.remove(at);
                self.cancelled.fetch_add(1, Ordering::Relaxed);
                0
            }
            None => CANCEL_REFUSED,
        }
    }

    fn dequeue_completions(
        &self,
        port: PortHandle,
        slots: &mut [RecordSlot],
        timeout: Duration,
    ) -> io::Result<usize> {
        let Some(port) = self.port(port) else {
            return Ok(0);
        };
        let deadline = Instant::now() + timeout;
        let mut queue = port.queue.lock();
        while queue.is_empty() && port.open.load(Ordering::Acquire) {
            if port.ready.wait_until(&mut queue, deadline).timed_out() {
                break;
            }
        }

        let mut filled = 0;
        while filled < slots.len() {
            let Some(mut posted) = queue.pop_front() else {
                break;
            };
            let slot = &mut slots[filled];
            if let Some(data) = posted.jit_data.take() {
                deliver_jit(&mut posted.record, slot, &data);
            }
            slot.store(&posted.record)
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
            filled += 1;
        }
        Ok(filled)
    }

    fn open_completion_port(&self) -> io::Result<PortHandle> {
        let id = self.next_port.fetch_add(1, Ordering::Relaxed);
        self.ports.lock().insert(
            id,
            Arc::new(Port {
                queue: Mutex::new(VecDeque::new()),
                ready: Condvar::new(),
                open: AtomicBool::new(true),
            }),
        );
        Ok(PortHandle(id))
    }

    fn close_completion_port(&self, port: PortHandle) {
        if let Some(port) = self.ports.lock().remove(&port.0) {
            port.open.store(false, Ordering::Release);
            port.ready.notify_all();
        }
    }

    fn is_port_valid(&self, port: PortHandle) -> bool {
        self.ports.lock().contains_key(&port.0)
    }

    fn capability_query(&self, capability: Capability) -> bool {
        match capability {
            Capability::BatchDequeue => true,
            Capability::JitBuffers => self.jit,
        }
    }
}

impl fmt::Debug for LoopbackProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackProvider")
            .field("pipes", &self.pipes.lock().len())
            .field("ports", &self.ports.lock().len())
            .field("jit", &self.jit)
            .field("issued", &self.issued())
            .finish()
    }
}

/// Place JIT data in the slot's buffer, or fall back to the record's own
/// buffers when the slot has none.
fn deliver_jit(record: &mut CompletionRecord, slot: &RecordSlot, data: &[u8]) {
    match slot.jit_buffer() {
        Some(buffer) if buffer.capacity() >= data.len() => {
            buffer.clear();
            // An unpinned JIT buffer always accepts the full slice here.
            let _ = buffer.put_slice(data);
            buffer.flip();
            record.set_flags(FLAG_JIT_USED);
        }
        _ => {
            let mut bytes: VecDeque<u8> = data.iter().copied().collect();
            // SAFETY: the descriptors name pinned buffer windows kept alive
            // by the issuing future until it completes.
            let moved = unsafe { scatter(record.descriptors(), &mut bytes) };
            record.set_result(0, moved);
        }
    }
}

/// Append every described window to `out`. Returns the bytes copied.
///
/// # Safety
///
/// Each descriptor must name `length` readable bytes at `address`.
unsafe fn gather(descriptors: &[BufferDescriptor], out: &mut VecDeque<u8>) -> u64 {
    let mut total = 0;
    for desc in descriptors {
        let window = std::slice::from_raw_parts(desc.address as *const u8, desc.length as usize);
        out.extend(window.iter().copied());
        total += desc.length;
    }
    total
}

/// Move bytes from the front of `data` into the described windows, in
/// order. Returns the bytes copied.
///
/// # Safety
///
/// Each descriptor must name `length` writable bytes at `address` that no
/// one else accesses during the call.
unsafe fn scatter(descriptors: &[BufferDescriptor], data: &mut VecDeque<u8>) -> u64 {
    let mut total = 0;
    for desc in descriptors {
        if data.is_empty() {
            break;
        }
        let take = (desc.length as usize).min(data.len());
        let dst = std::slice::from_raw_parts_mut(desc.address as *mut u8, take);
        for (byte, value) in dst.iter_mut().zip(data.drain(..take)) {
            *byte = value;
        }
        total += take as u64;
    }
    total
}
