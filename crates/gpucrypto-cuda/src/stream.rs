//! CUDA stream handles.

use std::sync::Arc;

use cudarc::driver::sys as cuda_sys;
use cudarc::driver::{CudaContext, CudaStream};

use gpucrypto_core::error::{DeviceError, Result};
use gpucrypto_core::StreamHandle;

/// A CUDA stream owned by a device context slot.
#[derive(Clone)]
pub struct CudaStreamHandle {
    ctx: Arc<CudaContext>,
    stream: Arc<CudaStream>,
    default: bool,
}

impl CudaStreamHandle {
    pub(crate) fn new(ctx: Arc<CudaContext>, stream: Arc<CudaStream>, default: bool) -> Self {
        Self {
            ctx,
            stream,
            default,
        }
    }

    /// Underlying cudarc stream, for launching kernels and async copies.
    pub fn inner(&self) -> &Arc<CudaStream> {
        &self.stream
    }

    /// Raw driver handle.
    pub fn raw(&self) -> cuda_sys::CUstream {
        self.stream.cu_stream()
    }
}

impl StreamHandle for CudaStreamHandle {
    /// `cuStreamQuery`: reports whether this stream has drained without
    /// waiting on it or on any other stream.
    fn query(&self) -> Result<bool> {
        self.ctx
            .bind_to_thread()
            .map_err(|e| DeviceError::QueryFailed(format!("Failed to bind context: {}", e)))?;

        let result = unsafe { cuda_sys::lib().cuStreamQuery(self.raw()) };
        match result {
            cuda_sys::CUresult::CUDA_SUCCESS => Ok(true),
            cuda_sys::CUresult::CUDA_ERROR_NOT_READY => Ok(false),
            other => Err(DeviceError::QueryFailed(format!(
                "cuStreamQuery failed: {:?}",
                other
            ))),
        }
    }

    fn is_default(&self) -> bool {
        self.default
    }
}

impl std::fmt::Debug for CudaStreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CudaStreamHandle")
            .field("stream", &self.raw())
            .field("default", &self.default)
            .finish()
    }
}

impl PartialEq for CudaStreamHandle {
    fn eq(&self, other: &Self) -> bool {
        self.default == other.default && Arc::ptr_eq(&self.stream, &other.stream)
    }
}
