//! Host memory standing in for device and host-mapped allocations.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use gpucrypto_core::error::{DeviceError, Result};
use gpucrypto_core::MappedRegion;

/// Bytes charged against a backend's memory budget, returned on drop.
#[derive(Debug)]
pub(crate) struct Reservation {
    size: usize,
    allocated: Arc<AtomicUsize>,
}

impl Reservation {
    pub(crate) fn acquire(
        allocated: &Arc<AtomicUsize>,
        size: usize,
        limit: Option<usize>,
    ) -> Result<Self> {
        allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let next = current.checked_add(size)?;
                match limit {
                    Some(limit) if next > limit => None,
                    _ => Some(next),
                }
            })
            .map_err(|current| DeviceError::AllocationFailed {
                size,
                reason: format!(
                    "memory limit reached: {} of {} bytes in use",
                    current,
                    limit.unwrap_or(usize::MAX)
                ),
            })?;
        Ok(Self {
            size,
            allocated: Arc::clone(allocated),
        })
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.allocated.fetch_sub(self.size, Ordering::AcqRel);
    }
}

/// Emulated device data region.
#[derive(Debug)]
pub struct HostBuffer {
    data: Vec<u8>,
    _reservation: Reservation,
}

impl HostBuffer {
    pub(crate) fn new(size: usize, reservation: Reservation) -> Self {
        Self {
            data: vec![0; size],
            _reservation: reservation,
        }
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the buffer is zero-sized.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Buffer contents.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Mutable buffer contents.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Copies `src` into the buffer at `offset`.
    pub fn copy_from_host(&mut self, offset: usize, src: &[u8]) -> Result<()> {
        let end = self.checked_end(offset, src.len())?;
        self.data[offset..end].copy_from_slice(src);
        Ok(())
    }

    /// Copies buffer contents at `offset` into `dst`.
    pub fn copy_to_host(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        let end = self.checked_end(offset, dst.len())?;
        dst.copy_from_slice(&self.data[offset..end]);
        Ok(())
    }

    fn checked_end(&self, offset: usize, len: usize) -> Result<usize> {
        offset
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(DeviceError::OutOfBounds {
                offset,
                len,
                size: self.data.len(),
            })
    }
}

/// Emulated host-mapped region. Its device address is its host address.
#[derive(Debug)]
pub struct HostRegion {
    bytes: Arc<[AtomicU8]>,
    _reservation: Reservation,
}

impl HostRegion {
    pub(crate) fn new(len: usize, reservation: Reservation) -> Self {
        Self {
            bytes: (0..len).map(|_| AtomicU8::new(0)).collect(),
            _reservation: reservation,
        }
    }

    pub(crate) fn shared(&self) -> &Arc<[AtomicU8]> {
        &self.bytes
    }
}

impl MappedRegion for HostRegion {
    fn host_bytes(&self) -> &[AtomicU8] {
        &self.bytes
    }

    fn device_ptr(&self) -> u64 {
        self.bytes.as_ptr() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reservation_limit() {
        let allocated = Arc::new(AtomicUsize::new(0));
        let a = Reservation::acquire(&allocated, 60, Some(100)).unwrap();
        assert_eq!(allocated.load(Ordering::Relaxed), 60);

        let err = Reservation::acquire(&allocated, 60, Some(100)).unwrap_err();
        assert!(matches!(err, DeviceError::AllocationFailed { size: 60, .. }));
        assert_eq!(allocated.load(Ordering::Relaxed), 60);

        drop(a);
        assert_eq!(allocated.load(Ordering::Relaxed), 0);
        assert!(Reservation::acquire(&allocated, 100, Some(100)).is_ok());
    }

    #[test]
    fn test_host_buffer_copies() {
        let allocated = Arc::new(AtomicUsize::new(0));
        let mut buffer = HostBuffer::new(8, Reservation::acquire(&allocated, 8, None).unwrap());
        buffer.copy_from_host(2, &[1, 2, 3]).unwrap();

        let mut out = [0u8; 4];
        buffer.copy_to_host(1, &mut out).unwrap();
        assert_eq!(out, [0, 1, 2, 3]);

        assert!(buffer.copy_from_host(6, &[0; 3]).is_err());
        assert!(buffer.copy_to_host(usize::MAX, &mut out).is_err());
    }

    #[test]
    fn test_out_of_range_copy_is_contract_violation() {
        let allocated = Arc::new(AtomicUsize::new(0));
        let mut buffer = HostBuffer::new(16, Reservation::acquire(&allocated, 16, None).unwrap());

        let err = buffer.copy_from_host(10, &[0; 10]).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::OutOfBounds {
                offset: 10,
                len: 10,
                size: 16
            }
        ));
        assert!(err.is_contract_violation());
        assert!(!err.is_recoverable());

        let mut out = [0u8; 4];
        let err = buffer.copy_to_host(usize::MAX, &mut out).unwrap_err();
        assert!(err.is_contract_violation());
        assert_eq!(buffer.as_slice(), &[0u8; 16][..]);
    }

    #[test]
    fn test_host_region_views_alias() {
        let allocated = Arc::new(AtomicUsize::new(0));
        let region = HostRegion::new(16, Reservation::acquire(&allocated, 16, None).unwrap());
        assert_eq!(region.len(), 16);
        assert_eq!(region.device_ptr(), region.host_bytes().as_ptr() as u64);
        assert_eq!(allocated.load(Ordering::Relaxed), 16);
        drop(region);
        assert_eq!(allocated.load(Ordering::Relaxed), 0);
    }
}
