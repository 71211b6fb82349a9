//! # gpucrypto CUDA Backend
//!
//! CUDA implementation of the gpucrypto device backend, built on cudarc.
//!
//! Streams are non-blocking cudarc streams, checkbits live in pinned host
//! memory mapped into the device address space, and a stream's copy
//! completion is observed with `cuStreamQuery` so that polling one stream
//! never drains another.
//!
//! # Feature Flags
//!
//! - `cuda` - Enable the CUDA backend (requires the CUDA toolkit)
//!
//! Without the `cuda` feature only [`is_cuda_available`] and a
//! [`CudaBackend`] stub that reports `BackendUnavailable` are compiled.
//!
//! # Kernel Contract
//!
//! A kernel launched on a context stream signals completion by writing `1`
//! to `checkbits[blockIdx.x]` once the block is done. Include
//! [`CHECKBIT_SIGNAL_SOURCE`] in the kernel source and call
//! `gpucrypto_signal_block(checkbits)` as the last statement of the kernel.

#![warn(missing_docs)]

#[cfg(feature = "cuda")]
mod backend;
#[cfg(feature = "cuda")]
mod memory;
#[cfg(feature = "cuda")]
mod stream;

#[cfg(feature = "cuda")]
pub use backend::CudaBackend;
#[cfg(feature = "cuda")]
pub use memory::{CudaDeviceBuffer, CudaMappedRegion};
#[cfg(feature = "cuda")]
pub use stream::CudaStreamHandle;

#[cfg(not(feature = "cuda"))]
mod stub {
    use gpucrypto_core::error::{DeviceError, Result};

    /// Stub CUDA backend when the CUDA feature is disabled.
    #[derive(Debug)]
    pub struct CudaBackend {
        _private: (),
    }

    impl CudaBackend {
        /// Always fails: the crate was built without the `cuda` feature.
        pub fn new(_ordinal: usize) -> Result<Self> {
            Err(DeviceError::BackendUnavailable(
                "CUDA feature not enabled".to_string(),
            ))
        }
    }
}

#[cfg(not(feature = "cuda"))]
pub use stub::CudaBackend;

/// Device helper that publishes a block's checkbit.
///
/// Waits for every thread of the block, fences so that the block's writes
/// are visible system wide, then lets thread 0 set the flag.
pub const CHECKBIT_SIGNAL_SOURCE: &str = r#"
__device__ __forceinline__ void gpucrypto_signal_block(unsigned char* checkbits) {
    __syncthreads();
    if (threadIdx.x == 0 && threadIdx.y == 0 && threadIdx.z == 0) {
        __threadfence_system();
        ((volatile unsigned char*)checkbits)[blockIdx.x] = 1;
    }
}
"#;

/// Check if CUDA is available at runtime.
///
/// Returns false when the feature is disabled, the driver library is not
/// installed, or no device is present.
pub fn is_cuda_available() -> bool {
    cuda_device_count() > 0
}

/// Number of visible CUDA devices, 0 if CUDA is unavailable.
pub fn cuda_device_count() -> usize {
    #[cfg(feature = "cuda")]
    {
        // cudarc panics if the driver library cannot be loaded
        std::panic::catch_unwind(|| {
            cudarc::driver::CudaContext::device_count().unwrap_or(0) as usize
        })
        .unwrap_or(0)
    }
    #[cfg(not(feature = "cuda"))]
    {
        0
    }
}

/// Compiles CUDA C source to PTX with NVRTC.
#[cfg(feature = "cuda")]
pub fn compile_ptx(cuda_source: &str) -> gpucrypto_core::Result<cudarc::nvrtc::Ptx> {
    cudarc::nvrtc::compile_ptx(cuda_source).map_err(|e| {
        gpucrypto_core::DeviceError::BackendUnavailable(format!(
            "NVRTC compilation failed: {}",
            e
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(not(feature = "cuda"))]
    fn test_stub_reports_unavailable() {
        let err = CudaBackend::new(0).unwrap_err();
        assert!(matches!(
            err,
            gpucrypto_core::DeviceError::BackendUnavailable(_)
        ));
        assert!(!is_cuda_available());
        assert_eq!(cuda_device_count(), 0);
    }

    #[test]
    fn test_signal_source_names_helper() {
        assert!(CHECKBIT_SIGNAL_SOURCE.contains("gpucrypto_signal_block"));
        assert!(CHECKBIT_SIGNAL_SOURCE.contains("__threadfence_system"));
    }
}
