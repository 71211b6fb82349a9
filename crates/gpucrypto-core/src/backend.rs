//! Seam between the stream context manager and the accelerator runtime.
//!
//! A backend provides the three resources a device context needs per slot:
//! a hardware stream, a device data region, and a host-mapped checkbit
//! region. It is also the only place that knows how to ask a stream whether
//! its queued work has drained without blocking other streams.

use crate::checkbits::MappedRegion;
use crate::error::Result;

/// A hardware execution stream.
pub trait StreamHandle: Send + Sync {
    /// Non-blocking, stream-local completion query.
    ///
    /// Returns `Ok(true)` once every operation queued on this stream has
    /// completed. Implementations must not drain or wait on other streams.
    fn query(&self) -> Result<bool>;

    /// Whether this handle is the implicit default (null) stream.
    fn is_default(&self) -> bool;
}

/// Allocator and stream factory for one accelerator device.
pub trait DeviceBackend: Send + Sync {
    /// Stream handle type.
    type Stream: StreamHandle;
    /// Per-stream device data region.
    type Buffer: Send + Sync;
    /// Host-mapped region used for checkbits.
    type Checkbits: MappedRegion;

    /// Human readable backend name for logs.
    fn name(&self) -> &str;

    /// Handle to the default stream. Never fails once the backend exists.
    fn default_stream(&self) -> Self::Stream;

    /// Creates a dedicated stream.
    fn create_stream(&self) -> Result<Self::Stream>;

    /// Allocates `size` bytes of device memory.
    fn alloc_device(&self, size: usize) -> Result<Self::Buffer>;

    /// Allocates `len` bytes of host-mapped memory visible to the device.
    fn alloc_checkbits(&self, len: usize) -> Result<Self::Checkbits>;
}
