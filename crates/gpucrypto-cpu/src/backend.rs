//! Host-emulated device backend.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, trace};

use gpucrypto_core::error::{DeviceError, Result};
use gpucrypto_core::{DeviceBackend, DeviceCheckbits, MappedRegion};

use crate::memory::{HostBuffer, HostRegion, Reservation};
use crate::stream::CpuStream;

/// Backend that emulates a device in host memory.
///
/// Device regions are plain host buffers and mapped regions are host memory
/// whose device address equals its host address. Emulated kernels resolve a
/// [`DeviceCheckbits`] back to its region through a registry, so signalling
/// completion is bounds checked and never dereferences a raw address.
///
/// Cloning is cheap; clones share streams, regions and the memory budget.
#[derive(Clone)]
pub struct CpuBackend {
    inner: Arc<Inner>,
}

struct Inner {
    memory_limit: Option<usize>,
    allocated: Arc<AtomicUsize>,
    next_stream: AtomicU64,
    default_stream: CpuStream,
    regions: Mutex<HashMap<u64, Weak<[AtomicU8]>>>,
}

impl CpuBackend {
    /// Creates a backend without a memory limit.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Creates a backend whose allocations fail past `bytes` in use.
    pub fn with_memory_limit(bytes: usize) -> Self {
        Self::build(Some(bytes))
    }

    fn build(memory_limit: Option<usize>) -> Self {
        debug!(?memory_limit, "Initializing CPU device backend");
        Self {
            inner: Arc::new(Inner {
                memory_limit,
                allocated: Arc::new(AtomicUsize::new(0)),
                next_stream: AtomicU64::new(1),
                default_stream: CpuStream::new(0),
                regions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Bytes currently allocated through this backend.
    pub fn allocated_bytes(&self) -> usize {
        self.inner.allocated.load(Ordering::Acquire)
    }

    /// Number of mapped regions still alive.
    pub fn live_regions(&self) -> usize {
        self.inner
            .regions
            .lock()
            .values()
            .filter(|region| region.strong_count() > 0)
            .count()
    }

    /// Sets the checkbits of `blocks`, as the kernel's blocks would on exit.
    pub fn signal_checkbits(&self, checkbits: DeviceCheckbits, blocks: Range<usize>) -> Result<()> {
        let region = self.resolve(checkbits)?;
        let targets = region
            .get(blocks.clone())
            .ok_or(DeviceError::TooManyBlocks {
                requested: blocks.end,
                max: region.len(),
            })?;
        for byte in targets {
            byte.store(1, Ordering::Release);
        }
        trace!(ptr = checkbits.ptr(), ?blocks, "Signalled checkbits");
        Ok(())
    }

    /// Reads `len` checkbits through the device address.
    pub fn read_device(&self, checkbits: DeviceCheckbits, len: usize) -> Result<Vec<u8>> {
        let region = self.resolve(checkbits)?;
        let bytes = region.get(..len).ok_or(DeviceError::TooManyBlocks {
            requested: len,
            max: region.len(),
        })?;
        Ok(bytes.iter().map(|b| b.load(Ordering::Acquire)).collect())
    }

    /// Runs a kernel of `num_blocks` blocks on the calling thread.
    ///
    /// `body` runs once per block, after which that block's checkbit is set.
    pub fn launch_kernel<F>(
        &self,
        stream: &CpuStream,
        checkbits: DeviceCheckbits,
        num_blocks: usize,
        mut body: F,
    ) -> Result<()>
    where
        F: FnMut(usize),
    {
        let region = self.checked_region(checkbits, num_blocks)?;
        let op = stream.begin_op();
        for block in 0..num_blocks {
            body(block);
            region[block].store(1, Ordering::Release);
        }
        op.complete();
        Ok(())
    }

    /// Runs a kernel on a separate thread, returning immediately.
    ///
    /// Blocks execute in order. The stream reports queued work until the
    /// whole kernel has finished.
    pub fn spawn_kernel<F>(
        &self,
        stream: &CpuStream,
        checkbits: DeviceCheckbits,
        num_blocks: usize,
        body: F,
    ) -> Result<JoinHandle<()>>
    where
        F: Fn(usize) + Send + 'static,
    {
        let region = self.checked_region(checkbits, num_blocks)?;
        let op = stream.begin_op();
        let stream_id = stream.id();
        Ok(std::thread::spawn(move || {
            for block in 0..num_blocks {
                body(block);
                region[block].store(1, Ordering::Release);
            }
            trace!(stream = stream_id, num_blocks, "Emulated kernel finished");
            op.complete();
        }))
    }

    fn checked_region(&self, checkbits: DeviceCheckbits, num_blocks: usize) -> Result<Arc<[AtomicU8]>> {
        let region = self.resolve(checkbits)?;
        if num_blocks > region.len() {
            return Err(DeviceError::TooManyBlocks {
                requested: num_blocks,
                max: region.len(),
            });
        }
        Ok(region)
    }

    fn resolve(&self, checkbits: DeviceCheckbits) -> Result<Arc<[AtomicU8]>> {
        self.inner
            .regions
            .lock()
            .get(&checkbits.ptr())
            .and_then(Weak::upgrade)
            .ok_or(DeviceError::InvalidAddress(checkbits.ptr()))
    }

    fn reserve(&self, size: usize) -> Result<Reservation> {
        Reservation::acquire(&self.inner.allocated, size, self.inner.memory_limit)
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CpuBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuBackend")
            .field("memory_limit", &self.inner.memory_limit)
            .field("allocated", &self.allocated_bytes())
            .finish()
    }
}

impl DeviceBackend for CpuBackend {
    type Stream = CpuStream;
    type Buffer = HostBuffer;
    type Checkbits = HostRegion;

    fn name(&self) -> &str {
        "cpu"
    }

    fn default_stream(&self) -> CpuStream {
        self.inner.default_stream.clone()
    }

    fn create_stream(&self) -> Result<CpuStream> {
        let id = self.inner.next_stream.fetch_add(1, Ordering::Relaxed);
        trace!(stream = id, "Created emulated stream");
        Ok(CpuStream::new(id))
    }

    fn alloc_device(&self, size: usize) -> Result<HostBuffer> {
        let reservation = self.reserve(size)?;
        Ok(HostBuffer::new(size, reservation))
    }

    fn alloc_checkbits(&self, len: usize) -> Result<HostRegion> {
        let reservation = self.reserve(len)?;
        let region = HostRegion::new(len, reservation);

        let mut regions = self.inner.regions.lock();
        regions.retain(|_, weak| weak.strong_count() > 0);
        regions.insert(region.device_ptr(), Arc::downgrade(region.shared()));
        Ok(region)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpucrypto_core::{CheckbitBuffer, StreamHandle};

    #[test]
    fn test_streams_are_distinct() {
        let backend = CpuBackend::new();
        let a = backend.create_stream().unwrap();
        let b = backend.create_stream().unwrap();
        assert_ne!(a, b);
        assert!(!a.is_default());
        assert!(backend.default_stream().is_default());
        assert_eq!(backend.default_stream(), backend.default_stream());
    }

    #[test]
    fn test_signal_and_read_through_device_address() {
        let backend = CpuBackend::new();
        let mut checkbits = CheckbitBuffer::new(backend.alloc_checkbits(8).unwrap()).unwrap();
        checkbits.clear(4).unwrap();
        let dev = checkbits.device_view();

        assert_eq!(backend.read_device(dev, 4).unwrap(), vec![0; 4]);
        backend.signal_checkbits(dev, 1..3).unwrap();
        assert_eq!(backend.read_device(dev, 4).unwrap(), vec![0, 1, 1, 0]);
        assert_eq!(checkbits.count_set(), 2);

        assert!(matches!(
            backend.signal_checkbits(dev, 6..9),
            Err(DeviceError::TooManyBlocks { requested: 9, max: 8 })
        ));
    }

    #[test]
    fn test_freed_region_is_unreachable() {
        let backend = CpuBackend::new();
        let region = backend.alloc_checkbits(8).unwrap();
        let dev = DeviceCheckbits::new(region.device_ptr(), region.len());
        assert_eq!(backend.live_regions(), 1);

        drop(region);
        assert_eq!(backend.live_regions(), 0);
        assert!(matches!(
            backend.signal_checkbits(dev, 0..1),
            Err(DeviceError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_memory_limit() {
        let backend = CpuBackend::with_memory_limit(100);
        let buffer = backend.alloc_device(80).unwrap();
        assert_eq!(backend.allocated_bytes(), 80);
        assert!(matches!(
            backend.alloc_checkbits(32),
            Err(DeviceError::AllocationFailed { size: 32, .. })
        ));
        drop(buffer);
        assert_eq!(backend.allocated_bytes(), 0);
        assert!(backend.alloc_checkbits(32).is_ok());
    }

    #[test]
    fn test_launch_kernel_runs_every_block() {
        let backend = CpuBackend::new();
        let stream = backend.create_stream().unwrap();
        let mut checkbits = CheckbitBuffer::new(backend.alloc_checkbits(16).unwrap()).unwrap();
        checkbits.clear(5).unwrap();

        let mut visited = Vec::new();
        backend
            .launch_kernel(&stream, checkbits.device_view(), 5, |block| visited.push(block))
            .unwrap();
        assert_eq!(visited, vec![0, 1, 2, 3, 4]);
        assert!(checkbits.all_set());
        assert!(stream.query().unwrap());

        assert!(backend
            .launch_kernel(&stream, checkbits.device_view(), 17, |_| {})
            .is_err());
    }

    #[test]
    fn test_spawn_kernel_holds_stream_until_done() {
        let backend = CpuBackend::new();
        let stream = backend.create_stream().unwrap();
        let mut checkbits = CheckbitBuffer::new(backend.alloc_checkbits(4).unwrap()).unwrap();
        checkbits.clear(4).unwrap();

        let gate = Arc::new(parking_lot::Mutex::new(()));
        let held = gate.lock();
        let kernel_gate = Arc::clone(&gate);
        let handle = backend
            .spawn_kernel(&stream, checkbits.device_view(), 4, move |_| {
                drop(kernel_gate.lock());
            })
            .unwrap();

        assert!(!stream.query().unwrap());
        assert!(!checkbits.all_set());
        drop(held);
        handle.join().unwrap();
        assert!(checkbits.all_set());
        assert!(stream.query().unwrap());
    }

    #[test]
    fn test_spawned_kernel_panic_surfaces_on_join() {
        let backend = CpuBackend::new();
        let stream = backend.create_stream().unwrap();
        let mut checkbits = CheckbitBuffer::new(backend.alloc_checkbits(8).unwrap()).unwrap();
        checkbits.clear(4).unwrap();

        let handle = backend
            .spawn_kernel(&stream, checkbits.device_view(), 4, |block| {
                assert!(block < 2, "block {} faulted", block);
            })
            .unwrap();

        assert!(handle.join().is_err());
        assert_eq!(checkbits.count_set(), 2);
        assert!(!checkbits.all_set());
        assert!(stream.query().unwrap());
    }
}
