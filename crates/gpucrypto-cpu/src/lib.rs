//! CPU Backend for gpucrypto
//!
//! Emulates a device in host memory so the stream context manager can run
//! and be tested on machines without a GPU. Streams, device regions and
//! host-mapped checkbit regions behave like their hardware counterparts:
//!
//! - streams report queued work through a non-blocking query,
//! - kernels launched through [`CpuBackend::launch_kernel`] or
//!   [`CpuBackend::spawn_kernel`] set one checkbit per block on exit,
//! - an optional memory limit makes allocation failure reproducible.
//!
//! # Example
//!
//! ```
//! use gpucrypto_core::prelude::*;
//! use gpucrypto_cpu::CpuBackend;
//!
//! let backend = CpuBackend::new();
//! let mut ctx = DeviceContext::init(backend.clone(), 4096, 2)?;
//! let id = StreamId::Dedicated(1);
//!
//! ctx.set_state(id, StreamState::WaitKernel)?;
//! ctx.clear_checkbits(id, 4)?;
//! backend.launch_kernel(ctx.get_stream(id)?, ctx.get_device_checkbits(id)?, 4, |_| {})?;
//!
//! assert!(ctx.sync(id, true)?);
//! assert_eq!(ctx.get_state(id)?, StreamState::Ready);
//! # Ok::<(), DeviceError>(())
//! ```

#![warn(missing_docs)]

mod backend;
mod memory;
mod stream;

pub use backend::CpuBackend;
pub use memory::{HostBuffer, HostRegion};
pub use stream::{CpuStream, InFlight};
