//! Emulated hardware streams.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use gpucrypto_core::error::Result;
use gpucrypto_core::StreamHandle;

/// Emulated stream. Tracks how many operations are still queued on it.
#[derive(Debug, Clone)]
pub struct CpuStream {
    id: u64,
    pending: Arc<AtomicUsize>,
}

impl CpuStream {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Stream number (0 for the default stream).
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Operations queued and not yet completed.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Queues an operation; it completes when the returned guard is dropped
    /// or [`InFlight::complete`] is called.
    pub fn begin_op(&self) -> InFlight {
        self.pending.fetch_add(1, Ordering::AcqRel);
        InFlight {
            pending: Arc::clone(&self.pending),
        }
    }
}

impl PartialEq for CpuStream {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for CpuStream {}

impl StreamHandle for CpuStream {
    fn query(&self) -> Result<bool> {
        Ok(self.pending() == 0)
    }

    fn is_default(&self) -> bool {
        self.id == 0
    }
}

/// An operation queued on a [`CpuStream`].
#[derive(Debug)]
#[must_use = "the operation completes as soon as the guard is dropped"]
pub struct InFlight {
    pending: Arc<AtomicUsize>,
}

impl InFlight {
    /// Marks the operation complete.
    pub fn complete(self) {}
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }
}
