//! # gpucrypto Core
//!
//! Stream context manager for the gpucrypto GPU cryptography library.
//!
//! A [`DeviceContext`] owns a fixed pool of hardware streams (the default
//! stream plus up to [`MAX_STREAM`] dedicated ones) so that copies and kernels
//! for independent requests can overlap. Kernel completion is detected by
//! polling host-mapped checkbits written by the kernel itself, never through
//! the runtime's blocking stream synchronize, which would stall launches on
//! every other stream.
//!
//! ## Example
//!
//! ```ignore
//! use gpucrypto_core::prelude::*;
//!
//! let mut ctx = DeviceContext::init(backend, 1 << 20, 2)?;
//! let id = StreamId::Dedicated(1);
//!
//! ctx.set_state(id, StreamState::WaitKernel)?;
//! ctx.clear_checkbits(id, num_blocks)?;
//! launch_kernel(ctx.get_stream(id)?, ctx.get_device_checkbits(id)?);
//!
//! ctx.sync(id, true)?;
//! println!("kernel took {}us", ctx.get_elapsed_time(id)?);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod checkbits;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod poll;
pub mod stats;
pub mod stream;

pub use backend::{DeviceBackend, StreamHandle};
pub use checkbits::{CheckbitBuffer, DeviceCheckbits, MappedRegion};
pub use clock::{ManualClock, MonotonicClock, TimestampSource};
pub use config::{load_config, DeviceConfig, DeviceConfigBuilder};
pub use context::{DeviceContext, DeviceContextBuilder, MAX_BLOCKS, MAX_STREAM};
pub use error::{DeviceError, Result};
pub use poll::{Backoff, PollPolicy};
pub use stats::{DeviceStats, StreamStats};
pub use stream::{StreamContext, StreamId, StreamState};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::backend::{DeviceBackend, StreamHandle};
    pub use crate::checkbits::{CheckbitBuffer, DeviceCheckbits, MappedRegion};
    pub use crate::clock::{MonotonicClock, TimestampSource};
    pub use crate::config::DeviceConfig;
    pub use crate::context::{DeviceContext, MAX_BLOCKS, MAX_STREAM};
    pub use crate::error::{DeviceError, Result};
    pub use crate::poll::PollPolicy;
    pub use crate::stream::{StreamContext, StreamId, StreamState};
}
