//! Host-mapped checkbit buffers.
//!
//! A checkbit buffer is one allocation with two views: the host polls it
//! through [`MappedRegion::host_bytes`] and kernels write into it through the
//! device address in [`DeviceCheckbits`]. Every execution block owns one byte.
//!
//! # Memory Model
//!
//! - The host zeroes the first `num_blocks` bytes with release stores before
//!   the kernel is launched.
//! - Each block writes `1` to its own byte exactly once, after a
//!   system-scope fence (`__threadfence_system()` on CUDA), and never clears it.
//! - The host reads with acquire loads. Observing every byte as non-zero means
//!   every block has finished and its prior writes are visible.
//!
//! No runtime synchronization call is involved, so polling one stream never
//! forces ordering on any other stream.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::{DeviceError, Result};

/// Memory mapped into both the host and the device address space.
pub trait MappedRegion: Send + Sync {
    /// Host view of the region.
    fn host_bytes(&self) -> &[AtomicU8];

    /// Device address of the same region.
    fn device_ptr(&self) -> u64;

    /// Size of the region in bytes.
    fn len(&self) -> usize {
        self.host_bytes().len()
    }

    /// Whether the region is zero-sized.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Device-side view of a checkbit buffer, passed to kernels as an argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceCheckbits {
    ptr: u64,
    capacity: usize,
}

impl DeviceCheckbits {
    /// Creates a view from a raw device address.
    #[must_use]
    pub fn new(ptr: u64, capacity: usize) -> Self {
        Self { ptr, capacity }
    }

    /// Device address of the first checkbit.
    #[inline]
    #[must_use]
    pub fn ptr(&self) -> u64 {
        self.ptr
    }

    /// Number of checkbits addressable through this view.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Kernel parameter value (`uint8_t*` on the device).
    #[inline]
    #[must_use]
    pub fn as_kernel_arg(&self) -> u64 {
        self.ptr
    }
}

/// Completion signal buffer with one byte per execution block.
pub struct CheckbitBuffer<R: MappedRegion> {
    region: R,
    num_blocks: usize,
}

impl<R: MappedRegion> CheckbitBuffer<R> {
    /// Wraps a mapped region. The region is zeroed.
    pub fn new(region: R) -> Result<Self> {
        if region.is_empty() {
            return Err(DeviceError::AllocationFailed {
                size: 0,
                reason: "checkbit region is empty".to_string(),
            });
        }
        for byte in region.host_bytes() {
            byte.store(0, Ordering::Relaxed);
        }
        Ok(Self {
            region,
            num_blocks: 0,
        })
    }

    /// Maximum number of blocks this buffer can track.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.region.len()
    }

    /// Blocks expected to signal for the current operation.
    #[inline]
    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    /// Resets the first `num_blocks` checkbits and records the block count.
    pub fn clear(&mut self, num_blocks: usize) -> Result<()> {
        let capacity = self.capacity();
        if num_blocks > capacity {
            return Err(DeviceError::TooManyBlocks {
                requested: num_blocks,
                max: capacity,
            });
        }
        for byte in &self.region.host_bytes()[..num_blocks] {
            byte.store(0, Ordering::Release);
        }
        self.num_blocks = num_blocks;
        Ok(())
    }

    /// Whether every expected block has signalled.
    ///
    /// Trivially true when no blocks are expected.
    pub fn all_set(&self) -> bool {
        self.active()
            .iter()
            .all(|byte| byte.load(Ordering::Acquire) != 0)
    }

    /// Number of expected blocks that have signalled so far.
    pub fn count_set(&self) -> usize {
        self.active()
            .iter()
            .filter(|byte| byte.load(Ordering::Acquire) != 0)
            .count()
    }

    /// Copies the expected checkbits out of the host view.
    pub fn snapshot(&self) -> Vec<u8> {
        self.active()
            .iter()
            .map(|byte| byte.load(Ordering::Acquire))
            .collect()
    }

    /// Device view to hand to the kernel launcher.
    pub fn device_view(&self) -> DeviceCheckbits {
        DeviceCheckbits::new(self.region.device_ptr(), self.capacity())
    }

    /// Underlying mapped region.
    pub fn region(&self) -> &R {
        &self.region
    }

    fn active(&self) -> &[AtomicU8] {
        &self.region.host_bytes()[..self.num_blocks]
    }
}

impl<R: MappedRegion> std::fmt::Debug for CheckbitBuffer<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckbitBuffer")
            .field("device_ptr", &format_args!("{:#x}", self.region.device_ptr()))
            .field("capacity", &self.capacity())
            .field("num_blocks", &self.num_blocks)
            .finish()
    }
}
