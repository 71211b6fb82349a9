//! # gpucrypto
//!
//! Device and stream context manager for GPU cryptographic workloads.
//!
//! A [`DeviceContext`] owns the default stream plus up to [`MAX_STREAM`]
//! dedicated streams, each with its own device buffer and host-mapped
//! checkbit array. Callers mark a stream as waiting on a kernel or a copy,
//! launch the work, then [`sync`](DeviceContext::sync) the stream. Kernel
//! completion is read from the checkbits, copy completion from a
//! stream-local query, so polling one stream never stalls the others.
//!
//! ## Backends
//!
//! - **CPU** - host emulation for tests and machines without a GPU (`cpu`, default)
//! - **CUDA** - NVIDIA GPUs through cudarc (`cuda`)
//!
//! ## Example
//!
//! ```
//! # #[cfg(feature = "cpu")]
//! # fn main() -> gpucrypto::Result<()> {
//! use gpucrypto::prelude::*;
//!
//! let config = DeviceConfig::builder().with_streams(2).build()?;
//! let backend = CpuBackend::new();
//! let mut ctx = DeviceContext::from_config(backend.clone(), &config)?;
//!
//! let id = StreamId::Dedicated(1);
//! ctx.set_state(id, StreamState::WaitKernel)?;
//! ctx.clear_checkbits(id, 8)?;
//! backend.launch_kernel(ctx.get_stream(id)?, ctx.get_device_checkbits(id)?, 8, |_| {})?;
//!
//! assert!(ctx.sync(id, true)?);
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "cpu"))]
//! # fn main() {}
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(hidden_glob_reexports)]

pub use gpucrypto_core::*;

#[cfg(feature = "cpu")]
pub use gpucrypto_cpu::{CpuBackend, CpuStream, HostBuffer, HostRegion, InFlight};

pub use gpucrypto_cuda::{cuda_device_count, is_cuda_available, CudaBackend};

#[cfg(feature = "cuda")]
pub use gpucrypto_cuda::{
    compile_ptx, CudaDeviceBuffer, CudaMappedRegion, CudaStreamHandle, CHECKBIT_SIGNAL_SOURCE,
};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use gpucrypto_core::prelude::*;

    #[cfg(feature = "cpu")]
    pub use gpucrypto_cpu::CpuBackend;

    pub use gpucrypto_cuda::CudaBackend;
}

/// Opens an emulated device context from `config`.
#[cfg(feature = "cpu")]
pub fn open_cpu(config: &DeviceConfig) -> Result<DeviceContext<CpuBackend>> {
    tracing::debug!(streams = config.stream_count, "Opening emulated device context");
    DeviceContext::from_config(CpuBackend::new(), config)
}

/// Opens a context on CUDA device `ordinal` from `config`.
#[cfg(feature = "cuda")]
pub fn open_cuda(ordinal: usize, config: &DeviceConfig) -> Result<DeviceContext<CudaBackend>> {
    let backend = CudaBackend::new(ordinal)?;
    tracing::debug!(ordinal, streams = config.stream_count, "Opening CUDA context");
    DeviceContext::from_config(backend, config)
}
