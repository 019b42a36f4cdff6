//! Provider Interface
//!
//! The provider is the boundary to the platform's native asynchronous I/O
//! primitives: completion ports, epoll-style queues, kernel AIO. The engine
//! never talks to the OS directly; everything goes through [`AioProvider`].
//!
//! # Design
//!
//! - A provider is an injected dependency. [`ProviderHandle`] owns it along
//!   with the lifecycle state (initialized flag, cached capabilities) under
//!   one mutex, so there is no process-wide provider state.
//! - Operations are described by a [`CompletionRecord`] whose buffer
//!   descriptors point at pinned [`IoBuffer`](crate::buffer::IoBuffer)
//!   windows. An immediate completion fills the record on return; a pending
//!   one is reported later by posting the record image to the port.
//!
//! # Example
//!
//! ```rust,ignore
//! use aio_runtime::provider::{AioProvider, ProviderHandle, Capability};
//!
//! let handle = ProviderHandle::new(Arc::new(MyProvider::new()));
//! handle.initialize()?;
//! if handle.has_capability(Capability::BatchDequeue) {
//!     // size result-handler batches above one
//! }
//! ```

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::Result;
use crate::record::{CallId, CompletionRecord, RecordSlot};

/// Opaque completion-port handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortHandle(pub u64);

impl fmt::Display for PortHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Port({})", self.0)
    }
}

/// Optional provider features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// `dequeue_completions` can fill more than one slot per call.
    BatchDequeue,
    /// The provider may deliver read data into a just-in-time buffer
    /// supplied with the dequeue slot.
    JitBuffers,
}

/// Per-operation flags passed to [`AioProvider::issue_multi_io`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IssueOptions {
    /// Read (`true`) or write (`false`).
    pub is_read: bool,
    /// Always report through the completion port, never inline.
    pub force_queue: bool,
    /// Minimum bytes a read must transfer before it completes.
    pub min_bytes: u64,
    /// Allow delivery into a JIT buffer instead of the record's buffers.
    pub use_jit: bool,
}

/// Outcome of issuing an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Issued {
    /// The record's return code and byte count are already filled in.
    Immediate,
    /// The completion will arrive through the completion port.
    Pending,
}

/// Native asynchronous I/O primitives consumed by the engine.
pub trait AioProvider: Send + Sync {
    /// One-time setup, called by [`ProviderHandle::initialize`].
    fn initialize(&self) -> io::Result<()> {
        Ok(())
    }

    /// Release provider-wide resources.
    fn shutdown(&self) {}

    /// Route completions for `native_handle` to `port`.
    fn associate(&self, native_handle: u64, port: PortHandle) -> io::Result<()>;

    /// Stop tracking `native_handle`. Outstanding operations on it are
    /// abandoned.
    fn release_handle(&self, _native_handle: u64) {}

    /// Issue the multi-buffer operation described by `record`.
    fn issue_multi_io(&self, record: &mut CompletionRecord, options: IssueOptions) -> io::Result<Issued>;

    /// Cancel an outstanding operation. `0` means the operation will not
    /// complete; any other value means it is still in flight.
    fn cancel(&self, channel_id: u64, call_id: CallId) -> i32;

    /// Block up to `timeout` for completed records, writing one record image
    /// per slot. Returns the number of slots filled; `0` on timeout.
    fn dequeue_completions(
        &self,
        port: PortHandle,
        slots: &mut [RecordSlot],
        timeout: Duration,
    ) -> io::Result<usize>;

    /// Create a completion port.
    fn open_completion_port(&self) -> io::Result<PortHandle>;

    /// Destroy a completion port, waking blocked dequeuers.
    fn close_completion_port(&self, port: PortHandle);

    /// Whether `port` is still open.
    fn is_port_valid(&self, port: PortHandle) -> bool;

    /// Whether the provider supports `capability`.
    fn capability_query(&self, capability: Capability) -> bool;
}

#[derive(Debug, Default)]
struct ProviderState {
    initialized: bool,
    batch_dequeue: bool,
    jit_buffers: bool,
}

/// Owner of a provider instance and its lifecycle state.
pub struct ProviderHandle {
    provider: Arc<dyn AioProvider>,
    state: Mutex<ProviderState>,
}

impl ProviderHandle {
    /// Wrap a provider. Call [`initialize`](Self::initialize) before use.
    pub fn new(provider: Arc<dyn AioProvider>) -> Self {
        Self {
            provider,
            state: Mutex::new(ProviderState::default()),
        }
    }

    /// Initialize the provider and cache its capabilities. Idempotent.
    pub fn initialize(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.initialized {
            return Ok(());
        }
        self.provider.initialize()?;
        state.batch_dequeue = self.provider.capability_query(Capability::BatchDequeue);
        state.jit_buffers = self.provider.capability_query(Capability::JitBuffers);
        state.initialized = true;
        tracing::debug!(
            target: crate::log::targets::ENGINE,
            batch = state.batch_dequeue,
            jit = state.jit_buffers,
            "provider initialized"
        );
        Ok(())
    }

    /// Shut the provider down. Idempotent.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        if !state.initialized {
            return;
        }
        self.provider.shutdown();
        *state = ProviderState::default();
    }

    /// Whether [`initialize`](Self::initialize) has run.
    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    /// Cached capability answer; `false` before initialization.
    pub fn has_capability(&self, capability: Capability) -> bool {
        let state = self.state.lock();
        match capability {
            Capability::BatchDequeue => state.batch_dequeue,
            Capability::JitBuffers => state.jit_buffers,
        }
    }

    /// The wrapped provider.
    pub fn provider(&self) -> &dyn AioProvider {
        self.provider.as_ref()
    }
}

impl fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}
