//! Completion Records
//!
//! A completion record is the fixed-layout structure exchanged with the
//! native layer: the channel issues an operation by filling one in, and the
//! native layer reports the outcome by posting the same layout back through
//! the completion port.
//!
//! ## Layout
//!
//! All fields are native-endian. Offsets are in bytes.
//!
//! ```text
//! offset  size  field
//!      0     8  channel_id      native handle of the channel
//!      8     8  call_id         CallId (selector << 32 | table index)
//!     16     4  return_code     0 = success, otherwise platform error
//!     20     4  flags           FLAG_* bits
//!     24     8  bytes_affected  bytes transferred
//!     32     8  native_handle   provider-private structure handle
//!     40     8  position        file position, NO_POSITION for streams
//!     48     8  jit_address     JIT receive buffer address (0 = none)
//!     56     8  jit_length      JIT receive buffer length
//!     64     4  buffer_count    descriptors in use
//!     68     4  reserved
//!     72  16*N  buffers         (address: u64, length: u64) pairs
//! ```
//!
//! [`CompletionRecord::encode`] and [`CompletionRecord::decode`] are the
//! only places that know this layout; everything else works on the struct.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_queue::ArrayQueue;

use crate::buffer::IoBuffer;
use crate::error::{AioError, Result};

/// Maximum buffer descriptors carried by one record.
pub const MAX_BUFFERS: usize = 64;

/// Largest channel index that fits in a [`CallId`].
pub const MAX_CHANNEL_INDEX: usize = i32::MAX as usize;

/// `position` value for operations without a file position.
pub const NO_POSITION: u64 = u64::MAX;

/// The native layer placed the received data in the JIT buffer.
pub const FLAG_JIT_USED: u32 = 0b0001;
/// The record describes a read.
pub const FLAG_READ: u32 = 0b0010;
/// The caller asked for the operation to be queued even if it could complete now.
pub const FLAG_FORCE_QUEUE: u32 = 0b0100;

/// Byte offsets of the record fields.
pub mod layout {
    /// `channel_id` offset.
    pub const CHANNEL_ID: usize = 0;
    /// `call_id` offset.
    pub const CALL_ID: usize = 8;
    /// `return_code` offset.
    pub const RETURN_CODE: usize = 16;
    /// `flags` offset.
    pub const FLAGS: usize = 20;
    /// `bytes_affected` offset.
    pub const BYTES_AFFECTED: usize = 24;
    /// `native_handle` offset.
    pub const NATIVE_HANDLE: usize = 32;
    /// `position` offset.
    pub const POSITION: usize = 40;
    /// `jit_address` offset.
    pub const JIT_ADDRESS: usize = 48;
    /// `jit_length` offset.
    pub const JIT_LENGTH: usize = 56;
    /// `buffer_count` offset.
    pub const BUFFER_COUNT: usize = 64;
    /// First buffer descriptor offset.
    pub const BUFFERS: usize = 72;
    /// Size of one buffer descriptor.
    pub const DESCRIPTOR_SIZE: usize = 16;
    /// Total record size.
    pub const RECORD_SIZE: usize = BUFFERS + DESCRIPTOR_SIZE * super::MAX_BUFFERS;
}

pub use layout::RECORD_SIZE;

/// Which of a channel's futures an operation belongs to.
///
/// Encoded as a small negative number in the high half of a [`CallId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum FutureSelector {
    /// Asynchronous read.
    Read = -1,
    /// Asynchronous write.
    Write = -2,
    /// Blocking read issued through the async path.
    SyncRead = -3,
    /// Blocking write issued through the async path.
    SyncWrite = -4,
}

impl FutureSelector {
    /// Decode a raw selector value.
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            -1 => Some(FutureSelector::Read),
            -2 => Some(FutureSelector::Write),
            -3 => Some(FutureSelector::SyncRead),
            -4 => Some(FutureSelector::SyncWrite),
            _ => None,
        }
    }

    /// Raw selector value.
    pub fn as_raw(self) -> i32 {
        self as i32
    }

    /// Whether the selector resolves to the channel's read future.
    pub fn is_read(self) -> bool {
        matches!(self, FutureSelector::Read | FutureSelector::SyncRead)
    }

    /// Whether the selector marks a blocking operation.
    pub fn is_sync(self) -> bool {
        matches!(self, FutureSelector::SyncRead | FutureSelector::SyncWrite)
    }
}

impl fmt::Display for FutureSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FutureSelector::Read => "read",
            FutureSelector::Write => "write",
            FutureSelector::SyncRead => "sync-read",
            FutureSelector::SyncWrite => "sync-write",
        };
        f.write_str(name)
    }
}

/// Opaque 64-bit identifier correlating a completion with its future.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallId(pub u64);

impl CallId {
    /// Pack a selector and a channel index.
    pub fn new(selector: FutureSelector, index: usize) -> Result<Self> {
        if index > MAX_CHANNEL_INDEX {
            return Err(AioError::InvalidIndex { index });
        }
        let high = (selector.as_raw() as u32 as u64) << 32;
        Ok(CallId(high | index as u64))
    }

    /// The channel's lookup-table index.
    pub fn channel_index(self) -> usize {
        (self.0 & 0xFFFF_FFFF) as usize
    }

    /// The raw selector bits.
    pub fn raw_selector(self) -> i32 {
        (self.0 >> 32) as u32 as i32
    }

    /// The decoded selector, if valid.
    pub fn selector(self) -> Option<FutureSelector> {
        FutureSelector::from_raw(self.raw_selector())
    }

    /// Raw value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.selector() {
            Some(sel) => write!(f, "Call({}:{})", sel, self.channel_index()),
            None => write!(f, "Call({:#x})", self.0),
        }
    }
}

/// One (address, length) pair describing a native buffer window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct BufferDescriptor {
    /// Start address.
    pub address: u64,
    /// Length in bytes.
    pub length: u64,
}

/// Fixed-layout record exchanged with the native layer.
#[derive(Clone, PartialEq, Eq)]
#[repr(C)]
pub struct CompletionRecord {
    channel_id: u64,
    call_id: u64,
    return_code: i32,
    flags: u32,
    bytes_affected: u64,
    native_handle: u64,
    position: u64,
    jit_address: u64,
    jit_length: u64,
    buffer_count: u32,
    reserved: u32,
    buffers: [BufferDescriptor; MAX_BUFFERS],
}

const _: () = assert!(std::mem::size_of::<CompletionRecord>() == RECORD_SIZE);

impl Default for CompletionRecord {
    fn default() -> Self {
        Self {
            channel_id: 0,
            call_id: 0,
            return_code: 0,
            flags: 0,
            bytes_affected: 0,
            native_handle: 0,
            position: NO_POSITION,
            jit_address: 0,
            jit_length: 0,
            buffer_count: 0,
            reserved: 0,
            buffers: [BufferDescriptor::default(); MAX_BUFFERS],
        }
    }
}

impl CompletionRecord {
    /// Create a zeroed record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reinitialize for reuse.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Fill the request half of the record for a new operation.
    ///
    /// Each buffer contributes its `position..limit` window.
    pub fn prepare(
        &mut self,
        channel_id: u64,
        call_id: CallId,
        position: Option<u64>,
        buffers: &[IoBuffer],
    ) -> Result<()> {
        if buffers.len() > MAX_BUFFERS {
            return Err(AioError::ResourceExhausted {
                resource: "completion record buffer descriptors",
            });
        }
        self.reset();
        self.channel_id = channel_id;
        self.call_id = call_id.as_u64();
        self.position = position.unwrap_or(NO_POSITION);
        if call_id.selector().map_or(false, FutureSelector::is_read) {
            self.flags |= FLAG_READ;
        }
        for (slot, buffer) in self.buffers.iter_mut().zip(buffers) {
            let (address, length) = buffer.window();
            *slot = BufferDescriptor {
                address,
                length: length as u64,
            };
        }
        self.buffer_count = buffers.len() as u32;
        Ok(())
    }

    /// Native handle of the channel.
    pub fn channel_id(&self) -> u64 {
        self.channel_id
    }

    /// Call identifier.
    pub fn call_id(&self) -> CallId {
        CallId(self.call_id)
    }

    /// Provider return code.
    pub fn return_code(&self) -> i32 {
        self.return_code
    }

    /// Bytes transferred.
    pub fn bytes_affected(&self) -> u64 {
        self.bytes_affected
    }

    /// Byte count on success, decoded platform failure otherwise.
    pub fn outcome(&self) -> Result<u64> {
        match self.return_code {
            0 => Ok(self.bytes_affected),
            code => Err(AioError::native(code)),
        }
    }

    /// Flag bits.
    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// Whether the given flag bits are all set.
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag == flag
    }

    /// Provider-private structure handle.
    pub fn native_handle(&self) -> u64 {
        self.native_handle
    }

    /// File position, or `None` for streams.
    pub fn position(&self) -> Option<u64> {
        (self.position != NO_POSITION).then_some(self.position)
    }

    /// JIT receive buffer window, if one was attached.
    pub fn jit_window(&self) -> Option<BufferDescriptor> {
        (self.jit_address != 0).then_some(BufferDescriptor {
            address: self.jit_address,
            length: self.jit_length,
        })
    }

    /// Buffer descriptors in use.
    pub fn descriptors(&self) -> &[BufferDescriptor] {
        &self.buffers[..self.buffer_count as usize]
    }

    /// Total bytes described by the buffer descriptors.
    pub fn requested_bytes(&self) -> u64 {
        self.descriptors().iter().map(|d| d.length).sum()
    }

    /// Record the outcome of an operation.
    pub fn set_result(&mut self, return_code: i32, bytes_affected: u64) {
        self.return_code = return_code;
        self.bytes_affected = bytes_affected;
    }

    /// Set flag bits.
    pub fn set_flags(&mut self, flags: u32) {
        self.flags |= flags;
    }

    /// Clear flag bits.
    pub fn clear_flags(&mut self, flags: u32) {
        self.flags &= !flags;
    }

    /// Store the provider's structure handle.
    pub fn set_native_handle(&mut self, handle: u64) {
        self.native_handle = handle;
    }

    /// Attach a JIT receive window.
    pub fn set_jit_window(&mut self, address: u64, length: u64) {
        self.jit_address = address;
        self.jit_length = length;
    }

    /// Serialize into the fixed wire layout.
    pub fn encode(&self, out: &mut [u8]) -> Result<()> {
        if out.len() < RECORD_SIZE {
            return Err(AioError::CorruptRecord {
                reason: "output shorter than record size",
            });
        }
        put_u64(out, layout::CHANNEL_ID, self.channel_id);
        put_u64(out, layout::CALL_ID, self.call_id);
        out[layout::RETURN_CODE..layout::RETURN_CODE + 4].copy_from_slice(&self.return_code.to_ne_bytes());
        put_u32(out, layout::FLAGS, self.flags);
        put_u64(out, layout::BYTES_AFFECTED, self.bytes_affected);
        put_u64(out, layout::NATIVE_HANDLE, self.native_handle);
        put_u64(out, layout::POSITION, self.position);
        put_u64(out, layout::JIT_ADDRESS, self.jit_address);
        put_u64(out, layout::JIT_LENGTH, self.jit_length);
        put_u32(out, layout::BUFFER_COUNT, self.buffer_count);
        put_u32(out, layout::BUFFER_COUNT + 4, 0);
        for (i, desc) in self.buffers.iter().enumerate() {
            let at = layout::BUFFERS + i * layout::DESCRIPTOR_SIZE;
            put_u64(out, at, desc.address);
            put_u64(out, at + 8, desc.length);
        }
        Ok(())
    }

    /// Deserialize from the fixed wire layout.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < RECORD_SIZE {
            return Err(AioError::CorruptRecord {
                reason: "input shorter than record size",
            });
        }
        let buffer_count = get_u32(bytes, layout::BUFFER_COUNT);
        if buffer_count as usize > MAX_BUFFERS {
            return Err(AioError::CorruptRecord {
                reason: "buffer count exceeds descriptor capacity",
            });
        }
        let mut record = Self {
            channel_id: get_u64(bytes, layout::CHANNEL_ID),
            call_id: get_u64(bytes, layout::CALL_ID),
            return_code: get_u32(bytes, layout::RETURN_CODE) as i32,
            flags: get_u32(bytes, layout::FLAGS),
            bytes_affected: get_u64(bytes, layout::BYTES_AFFECTED),
            native_handle: get_u64(bytes, layout::NATIVE_HANDLE),
            position: get_u64(bytes, layout::POSITION),
            jit_address: get_u64(bytes, layout::JIT_ADDRESS),
            jit_length: get_u64(bytes, layout::JIT_LENGTH),
            buffer_count,
            reserved: 0,
            buffers: [BufferDescriptor::default(); MAX_BUFFERS],
        };
        for (i, desc) in record.buffers.iter_mut().enumerate() {
            let at = layout::BUFFERS + i * layout::DESCRIPTOR_SIZE;
            desc.address = get_u64(bytes, at);
            desc.length = get_u64(bytes, at + 8);
        }
        Ok(record)
    }
}

impl fmt::Debug for CompletionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionRecord")
            .field("channel_id", &self.channel_id)
            .field("call_id", &self.call_id())
            .field("return_code", &self.return_code)
            .field("flags", &format_args!("{:#06b}", self.flags))
            .field("bytes_affected", &self.bytes_affected)
            .field("position", &self.position())
            .field("buffers", &self.descriptors())
            .finish()
    }
}

fn put_u64(out: &mut [u8], at: usize, value: u64) {
    out[at..at + 8].copy_from_slice(&value.to_ne_bytes());
}

fn put_u32(out: &mut [u8], at: usize, value: u32) {
    out[at..at + 4].copy_from_slice(&value.to_ne_bytes());
}

fn get_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_ne_bytes(raw)
}

fn get_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_ne_bytes(raw)
}

/// A dequeue target: room for one encoded record plus an optional JIT buffer.
///
/// Result handlers prepare a batch of slots before each dequeue call; the
/// provider writes one completed record image into each slot it fills.
pub struct RecordSlot {
    bytes: Box<[u8; RECORD_SIZE]>,
    jit: Option<IoBuffer>,
}

impl RecordSlot {
    /// Create an empty slot.
    pub fn new() -> Self {
        Self {
            bytes: Box::new([0u8; RECORD_SIZE]),
            jit: None,
        }
    }

    /// Store a completed record image.
    pub fn store(&mut self, record: &CompletionRecord) -> Result<()> {
        record.encode(&mut self.bytes[..])
    }

    /// Decode the stored record image.
    pub fn load(&self) -> Result<CompletionRecord> {
        CompletionRecord::decode(&self.bytes[..])
    }

    /// Raw record image.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..]
    }

    /// Mutable raw record image, for providers that write the layout directly.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[..]
    }

    /// The JIT buffer attached to this slot.
    pub fn jit_buffer(&self) -> Option<&IoBuffer> {
        self.jit.as_ref()
    }

    /// Attach a JIT buffer, returning any previous one.
    pub fn attach_jit(&mut self, buffer: IoBuffer) -> Option<IoBuffer> {
        self.jit.replace(buffer)
    }

    /// Detach the JIT buffer so it can be handed to exactly one future.
    pub fn take_jit(&mut self) -> Option<IoBuffer> {
        self.jit.take()
    }
}

impl Default for RecordSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RecordSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordSlot")
            .field("jit", &self.jit)
            .finish_non_exhaustive()
    }
}

/// Bounded circular pool of completion records.
pub struct RecordPool {
    free: ArrayQueue<Box<CompletionRecord>>,
    allocated: AtomicU64,
}

impl RecordPool {
    /// Create a pool retaining up to `capacity` records.
    pub fn new(capacity: usize) -> Self {
        Self {
            free: ArrayQueue::new(capacity.max(1)),
            allocated: AtomicU64::new(0),
        }
    }

    /// Take a reinitialized record, allocating if the pool is empty.
    pub fn acquire(&self) -> Box<CompletionRecord> {
        match self.free.pop() {
            Some(mut record) => {
                record.reset();
                record
            }
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                Box::default()
            }
        }
    }

    /// Return a record once its completion has been post-processed.
    pub fn release(&self, record: Box<CompletionRecord>) {
        let _ = self.free.push(record);
    }

    /// Records available for reuse.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Records allocated over the life of the pool.
    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for RecordPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordPool")
            .field("available", &self.available())
            .field("allocated", &self.allocated())
            .finish()
    }
}
