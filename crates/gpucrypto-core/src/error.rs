//! Error types for device and stream context operations.

use thiserror::Error;

use crate::stream::{StreamId, StreamState};

/// Errors from device context operations.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// More streams were requested than the context can hold.
    #[error("Requested {requested} streams, maximum is {max}")]
    TooManyStreams {
        /// Requested stream count.
        requested: usize,
        /// Maximum supported stream count.
        max: usize,
    },

    /// Configuration rejected before any resource was acquired.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Device or host-mapped memory allocation failed.
    #[error("Allocation of {size} bytes failed: {reason}")]
    AllocationFailed {
        /// Requested size in bytes.
        size: usize,
        /// Backend-specific reason.
        reason: String,
    },

    /// Hardware stream creation failed.
    #[error("Failed to create stream: {0}")]
    StreamCreationFailed(String),

    /// The selected backend cannot be used on this host.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Stream id does not name an initialized slot.
    #[error("Invalid stream {id}: {stream_count} streams initialized")]
    InvalidStream {
        /// Offending stream id.
        id: StreamId,
        /// Number of created streams.
        stream_count: usize,
    },

    /// Block count exceeds the checkbit buffer capacity.
    #[error("{requested} blocks exceeds checkbit capacity of {max}")]
    TooManyBlocks {
        /// Requested block count.
        requested: usize,
        /// Checkbit buffer capacity.
        max: usize,
    },

    /// Device address does not name a live mapped region.
    #[error("No mapped region at device address {0:#x}")]
    InvalidAddress(u64),

    /// Copy range falls outside a device buffer.
    #[error("Copy of {len} bytes at offset {offset} exceeds buffer of {size} bytes")]
    OutOfBounds {
        /// Start of the range.
        offset: usize,
        /// Length of the range.
        len: usize,
        /// Buffer size in bytes.
        size: usize,
    },

    /// Non-blocking stream query reported an error.
    #[error("Stream query failed: {0}")]
    QueryFailed(String),

    /// A stream still has an operation in flight.
    #[error("Stream {id} is busy ({state})")]
    StreamBusy {
        /// Busy stream.
        id: StreamId,
        /// Its current state.
        state: StreamState,
    },

    /// The device context has been torn down.
    #[error("Device context has been released")]
    Released,
}

impl DeviceError {
    /// Returns true for programming errors (bad stream id, oversized block
    /// count, out-of-range copy).
    ///
    /// These are caller bugs rather than runtime conditions and should not be
    /// retried.
    #[must_use]
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Self::InvalidStream { .. }
                | Self::TooManyBlocks { .. }
                | Self::InvalidAddress(_)
                | Self::OutOfBounds { .. }
                | Self::Released
        )
    }

    /// Returns true when the caller may retry with different parameters,
    /// e.g. initializing again with fewer streams or less memory.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::TooManyStreams { .. }
                | Self::InvalidConfig(_)
                | Self::AllocationFailed { .. }
                | Self::StreamCreationFailed(_)
                | Self::StreamBusy { .. }
        )
    }
}

/// Result type for device context operations.
pub type Result<T> = std::result::Result<T, DeviceError>;
