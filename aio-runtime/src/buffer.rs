//! Pinned I/O Buffers
//!
//! The native layer reads and writes caller memory directly, so every buffer
//! handed to it needs an address that stays put for the life of the
//! operation. [`IoBuffer`] owns a fixed heap allocation that never moves or
//! reallocates, and exposes that address through [`IoBuffer::address`].
//!
//! A buffer carries a cursor in the usual style:
//!
//! ```text
//! 0 <= position <= limit <= capacity
//! ```
//!
//! Data is scattered into (or gathered from) `position..limit`; completion
//! advances `position`. The limit is never touched by the engine.
//!
//! While a buffer belongs to an in-flight operation it is *pinned*: the
//! content accessors refuse to touch it, because the native layer may be
//! writing into it concurrently.

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;

use crate::error::{AioError, Result};

#[derive(Debug, Clone, Copy)]
struct Cursor {
    position: usize,
    limit: usize,
}

struct BufferInner {
    /// Fixed heap storage; its address is published to the native layer.
    storage: Box<[UnsafeCell<u8>]>,
    cursor: Mutex<Cursor>,
    pinned: AtomicBool,
}

// Safety: content access from Rust happens only under `cursor` and only
// while unpinned. While pinned, the native layer is the sole writer.
unsafe impl Send for BufferInner {}
unsafe impl Sync for BufferInner {}

/// A shared, address-stable I/O buffer.
///
/// Cloning an `IoBuffer` produces another handle to the same memory.
#[derive(Clone)]
pub struct IoBuffer {
    inner: Arc<BufferInner>,
}

impl IoBuffer {
    /// Allocate a zeroed buffer with `position = 0` and `limit = capacity`.
    pub fn allocate(capacity: usize) -> Self {
        let storage: Box<[UnsafeCell<u8>]> = (0..capacity).map(|_| UnsafeCell::new(0)).collect();
        Self {
            inner: Arc::new(BufferInner {
                storage,
                cursor: Mutex::new(Cursor {
                    position: 0,
                    limit: capacity,
                }),
                pinned: AtomicBool::new(false),
            }),
        }
    }

    /// Allocate a buffer holding a copy of `data`, ready to be written out.
    pub fn from_slice(data: &[u8]) -> Self {
        let buffer = Self::allocate(data.len());
        // A fresh buffer is never pinned.
        let _ = buffer.put_slice(data);
        buffer.flip();
        buffer
    }

    /// Total size of the allocation.
    pub fn capacity(&self) -> usize {
        self.inner.storage.len()
    }

    /// Current position.
    pub fn position(&self) -> usize {
        self.inner.cursor.lock().position
    }

    /// Current limit.
    pub fn limit(&self) -> usize {
        self.inner.cursor.lock().limit
    }

    /// Bytes between position and limit.
    pub fn remaining(&self) -> usize {
        let cursor = self.inner.cursor.lock();
        cursor.limit - cursor.position
    }

    /// Whether any bytes remain between position and limit.
    pub fn has_remaining(&self) -> bool {
        self.remaining() > 0
    }

    /// Set the position; it is clamped to the limit.
    pub fn set_position(&self, position: usize) {
        let mut cursor = self.inner.cursor.lock();
        cursor.position = position.min(cursor.limit);
    }

    /// Set the limit; it is clamped to the capacity and the position follows it down.
    pub fn set_limit(&self, limit: usize) {
        let mut cursor = self.inner.cursor.lock();
        cursor.limit = limit.min(self.capacity());
        cursor.position = cursor.position.min(cursor.limit);
    }

    /// Set `limit = position` and `position = 0`.
    pub fn flip(&self) {
        let mut cursor = self.inner.cursor.lock();
        cursor.limit = cursor.position;
        cursor.position = 0;
    }

    /// Set `position = 0` and `limit = capacity`.
    pub fn clear(&self) {
        let mut cursor = self.inner.cursor.lock();
        cursor.position = 0;
        cursor.limit = self.capacity();
    }

    /// Whether the buffer is part of an in-flight operation.
    pub fn is_pinned(&self) -> bool {
        self.inner.pinned.load(Ordering::Acquire)
    }

    /// Base address of the allocation.
    pub fn address(&self) -> u64 {
        self.base_ptr() as u64
    }

    /// Copy `data` in at the position, advancing it. Returns the bytes copied.
    pub fn put_slice(&self, data: &[u8]) -> Result<usize> {
        let mut cursor = self.inner.cursor.lock();
        if self.is_pinned() {
            return Err(AioError::BufferInUse);
        }
        let count = data.len().min(cursor.limit - cursor.position);
        // Safety: unpinned, and the cursor lock excludes other Rust writers.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.base_ptr().add(cursor.position), count);
        }
        cursor.position += count;
        Ok(count)
    }

    /// Copy the bytes between position and limit without moving the cursor.
    pub fn copy_remaining(&self) -> Result<Vec<u8>> {
        let cursor = self.inner.cursor.lock();
        if self.is_pinned() {
            return Err(AioError::BufferInUse);
        }
        let len = cursor.limit - cursor.position;
        let mut out = vec![0u8; len];
        // Safety: see `put_slice`.
        unsafe {
            std::ptr::copy_nonoverlapping(self.base_ptr().add(cursor.position), out.as_mut_ptr(), len);
        }
        Ok(out)
    }

    /// Copy the first `len` bytes of the allocation, ignoring the cursor.
    pub fn copy_prefix(&self, len: usize) -> Result<Vec<u8>> {
        let _cursor = self.inner.cursor.lock();
        if self.is_pinned() {
            return Err(AioError::BufferInUse);
        }
        let len = len.min(self.capacity());
        let mut out = vec![0u8; len];
        // Safety: see `put_slice`.
        unsafe {
            std::ptr::copy_nonoverlapping(self.base_ptr(), out.as_mut_ptr(), len);
        }
        Ok(out)
    }

    /// Whether two handles refer to the same allocation.
    pub fn ptr_eq(&self, other: &IoBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Pin the buffer for an in-flight operation.
    pub(crate) fn pin(&self) -> Result<()> {
        let _cursor = self.inner.cursor.lock();
        self.inner
            .pinned
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| AioError::BufferInUse)
    }

    /// Release the pin taken by [`pin`](Self::pin).
    pub(crate) fn unpin(&self) {
        self.inner.pinned.store(false, Ordering::Release);
    }

    /// Move the position forward by up to `count` bytes; returns the bytes consumed.
    pub(crate) fn advance(&self, count: usize) -> usize {
        let mut cursor = self.inner.cursor.lock();
        let step = count.min(cursor.limit - cursor.position);
        cursor.position += step;
        step
    }

    /// Address and length of the `position..limit` window.
    pub(crate) fn window(&self) -> (u64, usize) {
        let cursor = self.inner.cursor.lock();
        (
            self.address() + cursor.position as u64,
            cursor.limit - cursor.position,
        )
    }

    fn base_ptr(&self) -> *mut u8 {
        // UnsafeCell<u8> has the same layout as u8.
        self.inner.storage.as_ptr() as *mut u8
    }
}

impl fmt::Debug for IoBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cursor = *self.inner.cursor.lock();
        f.debug_struct("IoBuffer")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("position", &cursor.position)
            .field("limit", &cursor.limit)
            .field("capacity", &self.capacity())
            .field("pinned", &self.is_pinned())
            .finish()
    }
}

/// Spread `count` transferred bytes over `buffers` in order, advancing each
/// position by at most its remaining space. Returns the bytes accounted for.
pub(crate) fn advance_all(buffers: &[IoBuffer], count: u64) -> u64 {
    let mut left = count as usize;
    for buffer in buffers {
        if left == 0 {
            break;
        }
        left -= buffer.advance(left);
    }
    count - left as u64
}

/// Bounded pool of fixed-size just-in-time receive buffers.
pub struct BufferPool {
    buffer_size: usize,
    free: ArrayQueue<IoBuffer>,
    allocated: AtomicU64,
}

impl BufferPool {
    /// Create a pool retaining up to `capacity` buffers of `buffer_size` bytes.
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        Self {
            buffer_size,
            free: ArrayQueue::new(capacity.max(1)),
            allocated: AtomicU64::new(0),
        }
    }

    /// Size of every buffer in this pool.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Take a cleared buffer, allocating one if the pool is empty.
    pub fn acquire(&self) -> IoBuffer {
        match self.free.pop() {
            Some(buffer) => buffer,
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                IoBuffer::allocate(self.buffer_size)
            }
        }
    }

    /// Return a buffer. Pinned, foreign-sized or surplus buffers are dropped.
    pub fn release(&self, buffer: IoBuffer) {
        if buffer.is_pinned() || buffer.capacity() != self.buffer_size {
            return;
        }
        buffer.clear();
        let _ = self.free.push(buffer);
    }

    /// Buffers currently available for reuse.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Buffers allocated over the life of the pool.
    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.buffer_size)
            .field("available", &self.available())
            .field("allocated", &self.allocated())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_cursor() {
        let buf = IoBuffer::allocate(16);
        assert_eq!(buf.capacity(), 16);
        assert_eq!(buf.position(), 0);
        assert_eq!(buf.limit(), 16);
        assert_eq!(buf.remaining(), 16);
    }

    #[test]
    fn test_put_flip_copy() {
        let buf = IoBuffer::allocate(8);
        assert_eq!(buf.put_slice(b"hello").unwrap(), 5);
        buf.flip();
        assert_eq!(buf.copy_remaining().unwrap(), b"hello");
        assert_eq!(buf.position(), 0);
        assert_eq!(buf.limit(), 5);
    }

    #[test]
    fn test_put_truncates_at_limit() {
        let buf = IoBuffer::allocate(3);
        assert_eq!(buf.put_slice(b"abcdef").unwrap(), 3);
        assert!(!buf.has_remaining());
    }

    #[test]
    fn test_from_slice_ready_for_write() {
        let buf = IoBuffer::from_slice(b"xyz");
        assert_eq!(buf.remaining(), 3);
        assert_eq!(buf.copy_remaining().unwrap(), b"xyz");
    }

    #[test]
    fn test_pin_blocks_access_and_second_pin() {
        let buf = IoBuffer::allocate(4);
        buf.pin().unwrap();
        assert!(buf.is_pinned());
        assert!(matches!(buf.put_slice(b"a"), Err(AioError::BufferInUse)));
        assert!(matches!(buf.copy_remaining(), Err(AioError::BufferInUse)));
        assert!(matches!(buf.pin(), Err(AioError::BufferInUse)));
        buf.unpin();
        assert!(buf.put_slice(b"a").is_ok());
    }

    #[test]
    fn test_window_tracks_position() {
        let buf = IoBuffer::allocate(10);
        buf.set_position(4);
        let (addr, len) = buf.window();
        assert_eq!(addr, buf.address() + 4);
        assert_eq!(len, 6);
    }

    #[test]
    fn test_advance_all_spreads_in_order() {
        let a = IoBuffer::allocate(60);
        let b = IoBuffer::allocate(40);
        let counted = advance_all(&[a.clone(), b.clone()], 70);
        assert_eq!(counted, 70);
        assert_eq!(a.position(), 60);
        assert_eq!(b.position(), 10);
        assert_eq!(a.limit(), 60);
        assert_eq!(b.limit(), 40);
    }

    #[test]
    fn test_advance_all_caps_at_remaining() {
        let a = IoBuffer::allocate(5);
        assert_eq!(advance_all(&[a.clone()], 9), 5);
        assert_eq!(a.position(), 5);
    }

    #[test]
    fn test_set_limit_pulls_position_down() {
        let buf = IoBuffer::allocate(10);
        buf.set_position(8);
        buf.set_limit(5);
        assert_eq!(buf.position(), 5);
        assert_eq!(buf.limit(), 5);
    }

    #[test]
    fn test_pool_reuses_buffers() {
        let pool = BufferPool::new(2, 32);
        let a = pool.acquire();
        let a_addr = a.address();
        a.set_position(10);
        pool.release(a);
        assert_eq!(pool.available(), 1);
        let b = pool.acquire();
        assert_eq!(b.address(), a_addr);
        assert_eq!(b.position(), 0);
        assert_eq!(pool.allocated(), 1);
    }

    #[test]
    fn test_pool_drops_pinned_and_foreign() {
        let pool = BufferPool::new(4, 32);
        let pinned = pool.acquire();
        pinned.pin().unwrap();
        pool.release(pinned);
        pool.release(IoBuffer::allocate(8));
        assert_eq!(pool.available(), 0);
    }
}
