//! CUDA implementation of [`DeviceBackend`].

use std::sync::Arc;

use cudarc::driver::CudaContext;

use gpucrypto_core::error::{DeviceError, Result};
use gpucrypto_core::DeviceBackend;

use crate::memory::{CudaDeviceBuffer, CudaMappedRegion};
use crate::stream::CudaStreamHandle;

/// One CUDA device, wrapping a cudarc context.
#[derive(Clone)]
pub struct CudaBackend {
    ctx: Arc<CudaContext>,
    ordinal: usize,
    name: String,
}

impl CudaBackend {
    /// Opens device `ordinal`.
    pub fn new(ordinal: usize) -> Result<Self> {
        let ctx = CudaContext::new(ordinal).map_err(|e| {
            DeviceError::BackendUnavailable(format!(
                "Failed to create CUDA device {}: {}",
                ordinal, e
            ))
        })?;

        let name = ctx.name().map_err(|e| {
            DeviceError::BackendUnavailable(format!("Failed to get device name: {}", e))
        })?;

        tracing::info!(ordinal, device = %name, "Opened CUDA device");

        Ok(Self { ctx, ordinal, name })
    }

    /// Device ordinal.
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// Underlying cudarc context, for loading modules.
    pub fn inner(&self) -> &Arc<CudaContext> {
        &self.ctx
    }
}

impl DeviceBackend for CudaBackend {
    type Stream = CudaStreamHandle;
    type Buffer = CudaDeviceBuffer;
    type Checkbits = CudaMappedRegion;

    fn name(&self) -> &str {
        &self.name
    }

    fn default_stream(&self) -> CudaStreamHandle {
        CudaStreamHandle::new(Arc::clone(&self.ctx), self.ctx.default_stream(), true)
    }

    fn create_stream(&self) -> Result<CudaStreamHandle> {
        let stream = self
            .ctx
            .new_stream()
            .map_err(|e| DeviceError::StreamCreationFailed(e.to_string()))?;
        Ok(CudaStreamHandle::new(Arc::clone(&self.ctx), stream, false))
    }

    fn alloc_device(&self, size: usize) -> Result<CudaDeviceBuffer> {
        let data = self
            .ctx
            .default_stream()
            .alloc_zeros::<u8>(size)
            .map_err(|e| DeviceError::AllocationFailed {
                size,
                reason: e.to_string(),
            })?;
        Ok(CudaDeviceBuffer::new(data))
    }

    fn alloc_checkbits(&self, len: usize) -> Result<CudaMappedRegion> {
        CudaMappedRegion::new(&self.ctx, len)
    }
}

impl std::fmt::Debug for CudaBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CudaBackend")
            .field("ordinal", &self.ordinal)
            .field("name", &self.name)
            .finish()
    }
}
