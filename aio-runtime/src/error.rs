//! Error Taxonomy
//!
//! Every failure an asynchronous operation can end with is an [`AioError`].
//! A future stores its outcome once and hands clones of it to every observer
//! (listener, waiter, `result()` caller), so the error type is `Clone`; the
//! one non-clonable source, `std::io::Error`, is held behind an `Arc`.
//!
//! # Propagation
//!
//! - Failures during operation setup complete the future with the error;
//!   they are never returned directly from `read`/`write`.
//! - Failures that cannot be attributed to a future (a completion record
//!   with no matching channel) are logged and dropped by the result handler.
//! - A non-zero native return code becomes [`AioError::NativeOperationFailed`]
//!   carrying the decoded platform message.

use std::fmt;
use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::config::ConfigError;

/// Result alias used throughout the crate.
pub type Result<T, E = AioError> = std::result::Result<T, E>;

/// Errors produced by the completion engine.
#[derive(Debug, Clone, Error)]
pub enum AioError {
    /// The channel was closed before or during the operation.
    #[error("channel is closed")]
    ClosedResource,

    /// A soft timeout fired before the operation completed naturally.
    ///
    /// The channel is left in an indeterminate state and should be closed.
    #[error("operation timed out after {timeout_ms} ms")]
    OperationTimedOut {
        /// The timeout that elapsed, in milliseconds.
        timeout_ms: u64,
    },

    /// The provider reported a non-zero return code.
    #[error("native operation failed with code {code}: {message}")]
    NativeOperationFailed {
        /// Raw provider return code.
        code: i32,
        /// Decoded platform error string.
        message: String,
    },

    /// No usable buffer was supplied for a read or write.
    #[error("no buffers supplied for {operation}")]
    NoBuffersSupplied {
        /// The operation that was attempted.
        operation: &'static str,
    },

    /// A bounded resource (lookup table, pool) cannot grow any further.
    #[error("resource exhausted: {resource}")]
    ResourceExhausted {
        /// Which resource overflowed.
        resource: &'static str,
    },

    /// A buffer is already part of another in-flight operation.
    #[error("buffer is pinned by an in-flight operation")]
    BufferInUse,

    /// A lookup-table index was out of range or unoccupied.
    #[error("invalid table index {index}")]
    InvalidIndex {
        /// The offending index.
        index: usize,
    },

    /// The operation was cancelled by the caller.
    #[error("operation cancelled: {reason}")]
    Cancelled {
        /// Caller-supplied reason.
        reason: String,
    },

    /// A completion record could not be decoded.
    #[error("corrupt completion record: {reason}")]
    CorruptRecord {
        /// What was wrong with the record.
        reason: &'static str,
    },

    /// A read or write is already outstanding on the channel.
    #[error("a {selector} operation is already pending on this channel")]
    OperationPending {
        /// Which future was busy.
        selector: &'static str,
    },

    /// The engine configuration was rejected.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// An I/O error raised by the provider outside a completion record.
    #[error("provider I/O error: {0}")]
    Io(#[source] Arc<io::Error>),
}

impl AioError {
    /// Build a native failure from a provider return code.
    pub fn native(code: i32) -> Self {
        AioError::NativeOperationFailed {
            code,
            message: decode_native_message(code),
        }
    }

    /// Build a caller cancellation error.
    pub fn cancelled(reason: impl Into<String>) -> Self {
        AioError::Cancelled {
            reason: reason.into(),
        }
    }

    /// Build a soft-timeout error.
    pub fn timed_out(timeout_ms: u64) -> Self {
        AioError::OperationTimedOut { timeout_ms }
    }

    /// Whether this error is a soft timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, AioError::OperationTimedOut { .. })
    }

    /// Whether this error reports a closed channel.
    pub fn is_closed(&self) -> bool {
        matches!(self, AioError::ClosedResource)
    }

    /// Short classification used in log fields.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AioError::ClosedResource => ErrorKind::ClosedResource,
            AioError::OperationTimedOut { .. } => ErrorKind::OperationTimedOut,
            AioError::NativeOperationFailed { .. } => ErrorKind::NativeOperationFailed,
            AioError::NoBuffersSupplied { .. } => ErrorKind::NoBuffersSupplied,
            AioError::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            AioError::BufferInUse => ErrorKind::BufferInUse,
            AioError::InvalidIndex { .. } => ErrorKind::InvalidIndex,
            AioError::Cancelled { .. } => ErrorKind::Cancelled,
            AioError::CorruptRecord { .. } => ErrorKind::CorruptRecord,
            AioError::OperationPending { .. } => ErrorKind::OperationPending,
            AioError::Config(_) => ErrorKind::Config,
            AioError::Io(_) => ErrorKind::Io,
        }
    }
}

impl From<io::Error> for AioError {
    fn from(err: io::Error) -> Self {
        AioError::Io(Arc::new(err))
    }
}

/// Coarse error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`AioError::ClosedResource`].
    ClosedResource,
    /// See [`AioError::OperationTimedOut`].
    OperationTimedOut,
    /// See [`AioError::NativeOperationFailed`].
    NativeOperationFailed,
    /// See [`AioError::NoBuffersSupplied`].
    NoBuffersSupplied,
    /// See [`AioError::ResourceExhausted`].
    ResourceExhausted,
    /// See [`AioError::BufferInUse`].
    BufferInUse,
    /// See [`AioError::InvalidIndex`].
    InvalidIndex,
    /// See [`AioError::Cancelled`].
    Cancelled,
    /// See [`AioError::CorruptRecord`].
    CorruptRecord,
    /// See [`AioError::OperationPending`].
    OperationPending,
    /// See [`AioError::Config`].
    Config,
    /// See [`AioError::Io`].
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::ClosedResource => "closed",
            ErrorKind::OperationTimedOut => "timed-out",
            ErrorKind::NativeOperationFailed => "native",
            ErrorKind::NoBuffersSupplied => "no-buffers",
            ErrorKind::ResourceExhausted => "exhausted",
            ErrorKind::BufferInUse => "buffer-in-use",
            ErrorKind::InvalidIndex => "invalid-index",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::CorruptRecord => "corrupt-record",
            ErrorKind::OperationPending => "pending",
            ErrorKind::Config => "config",
            ErrorKind::Io => "io",
        };
        f.write_str(name)
    }
}

/// Decode a provider return code into a platform error string.
fn decode_native_message(code: i32) -> String {
    io::Error::from_raw_os_error(code).to_string()
}
