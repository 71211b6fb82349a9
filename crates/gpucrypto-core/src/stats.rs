//! Per-stream completion telemetry.

use std::fmt;

use crate::stream::{StreamId, StreamState};

/// Completion counters for one stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Kernel operations observed complete.
    pub kernels_completed: u64,
    /// Copy operations observed complete.
    pub copies_completed: u64,
    /// Sum of completed operation durations (microseconds).
    pub busy_usec: u64,
    /// Completion checks performed by sync calls that succeeded.
    pub polls: u64,
    /// Duration of the most recent operation (microseconds). In merged
    /// totals, the longest of the merged streams' last durations.
    pub last_elapsed_usec: u64,
}

impl StreamStats {
    pub(crate) fn record(&mut self, kind: StreamState, elapsed_usec: u64, polls: u64) {
        match kind {
            StreamState::WaitCopy => self.copies_completed += 1,
            _ => self.kernels_completed += 1,
        }
        self.busy_usec = self.busy_usec.saturating_add(elapsed_usec);
        self.polls = self.polls.saturating_add(polls);
        self.last_elapsed_usec = elapsed_usec;
    }

    /// Total completed operations.
    #[must_use]
    pub fn operations(&self) -> u64 {
        self.kernels_completed + self.copies_completed
    }

    /// Mean operation latency in microseconds.
    #[must_use]
    pub fn mean_latency_usec(&self) -> f64 {
        match self.operations() {
            0 => 0.0,
            n => self.busy_usec as f64 / n as f64,
        }
    }

    /// Merges another stream's counters into this one.
    pub fn merge(&mut self, other: &StreamStats) {
        self.kernels_completed += other.kernels_completed;
        self.copies_completed += other.copies_completed;
        self.busy_usec = self.busy_usec.saturating_add(other.busy_usec);
        self.polls = self.polls.saturating_add(other.polls);
        self.last_elapsed_usec = self.last_elapsed_usec.max(other.last_elapsed_usec);
    }
}

/// Snapshot of every live stream of a device context.
#[derive(Debug, Clone, Default)]
pub struct DeviceStats {
    /// Per-stream counters in slot order.
    pub streams: Vec<(StreamId, StreamStats)>,
}

impl DeviceStats {
    /// Counters summed over all streams.
    #[must_use]
    pub fn totals(&self) -> StreamStats {
        let mut total = StreamStats::default();
        for (_, stats) in &self.streams {
            total.merge(stats);
        }
        total
    }

    /// Counters of one stream.
    #[must_use]
    pub fn stream(&self, id: StreamId) -> Option<&StreamStats> {
        self.streams
            .iter()
            .find(|(sid, _)| *sid == id)
            .map(|(_, stats)| stats)
    }
}

impl fmt::Display for DeviceStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total = self.totals();
        write!(
            f,
            "DeviceStats: {} streams, {} kernels, {} copies, {:.1}us mean latency",
            self.streams.len(),
            total.kernels_completed,
            total.copies_completed,
            total.mean_latency_usec()
        )
    }
}
