//! Device regions and host-mapped checkbit memory.

use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::AtomicU8;
use std::sync::Arc;

use cudarc::driver::sys as cuda_sys;
use cudarc::driver::{CudaContext, CudaSlice};

use gpucrypto_core::error::{DeviceError, Result};
use gpucrypto_core::MappedRegion;

/// Per-stream device data region.
pub struct CudaDeviceBuffer {
    data: CudaSlice<u8>,
}

impl CudaDeviceBuffer {
    pub(crate) fn new(data: CudaSlice<u8>) -> Self {
        Self { data }
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the buffer is zero-sized.
    pub fn is_empty(&self) -> bool {
        self.data.len() == 0
    }

    /// Slice for kernel arguments and async copies.
    pub fn as_slice(&self) -> &CudaSlice<u8> {
        &self.data
    }

    /// Mutable slice for uploads.
    pub fn as_mut_slice(&mut self) -> &mut CudaSlice<u8> {
        &mut self.data
    }
}

/// Pinned host memory mapped into the device address space.
///
/// Allocated with `cuMemHostAlloc(DEVICEMAP | PORTABLE)`. The host view is
/// exposed as atomic bytes; kernels write through the device pointer after a
/// `__threadfence_system()`, which makes the write visible to host acquire
/// loads without any stream synchronization.
pub struct CudaMappedRegion {
    host_ptr: *mut u8,
    device_ptr: u64,
    len: usize,
    ctx: Arc<CudaContext>,
}

// Safety: the region is pinned memory owned by this value; every host access
// goes through `AtomicU8`.
unsafe impl Send for CudaMappedRegion {}
unsafe impl Sync for CudaMappedRegion {}

impl CudaMappedRegion {
    pub(crate) fn new(ctx: &Arc<CudaContext>, len: usize) -> Result<Self> {
        let fail = |reason: String| DeviceError::AllocationFailed { size: len, reason };
        if len == 0 {
            return Err(fail("checkbit region needs at least one block".to_string()));
        }
        ctx.bind_to_thread()
            .map_err(|e| fail(format!("cannot bind CUDA context: {}", e)))?;

        let flags = cuda_sys::CU_MEMHOSTALLOC_DEVICEMAP | cuda_sys::CU_MEMHOSTALLOC_PORTABLE;
        let mut host: *mut c_void = ptr::null_mut();
        // Safety: `host` receives a fresh pinned allocation of `len` bytes,
        // owned by `region` (and freed by its Drop) from the moment it exists.
        unsafe {
            driver_call(
                cuda_sys::lib().cuMemHostAlloc(&mut host, len, flags),
                "pinning checkbit region",
            )
            .map_err(fail)?;

            let mut region = Self {
                host_ptr: host.cast(),
                device_ptr: 0,
                len,
                ctx: Arc::clone(ctx),
            };
            driver_call(
                cuda_sys::lib().cuMemHostGetDevicePointer_v2(&mut region.device_ptr, host, 0),
                "mapping checkbit region into device space",
            )
            .map_err(fail)?;

            ptr::write_bytes(region.host_ptr, 0, len);
            Ok(region)
        }
    }
}

fn driver_call(result: cuda_sys::CUresult, what: &str) -> std::result::Result<(), String> {
    match result {
        cuda_sys::CUresult::CUDA_SUCCESS => Ok(()),
        err => Err(format!("{} failed: {:?}", what, err)),
    }
}

impl MappedRegion for CudaMappedRegion {
    fn host_bytes(&self) -> &[AtomicU8] {
        // Safety: `host_ptr` is a live allocation of `len` bytes and AtomicU8
        // has the same layout as u8.
        unsafe { std::slice::from_raw_parts(self.host_ptr as *const AtomicU8, self.len) }
    }

    fn device_ptr(&self) -> u64 {
        self.device_ptr
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl Drop for CudaMappedRegion {
    fn drop(&mut self) {
        let _ = self.ctx.bind_to_thread();
        unsafe {
            let _ = cuda_sys::lib().cuMemFreeHost(self.host_ptr as *mut c_void);
        }
    }
}
