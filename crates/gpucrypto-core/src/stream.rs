//! Per-stream state machine and completion detection.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::backend::{DeviceBackend, StreamHandle};
use crate::checkbits::{CheckbitBuffer, DeviceCheckbits};
use crate::clock::TimestampSource;
use crate::error::Result;
use crate::poll::PollPolicy;
use crate::stats::StreamStats;

/// Stream identifier.
///
/// Slot 0 of a device context is always the default stream; created streams
/// are numbered from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StreamId {
    /// Default (null) stream, slot 0.
    Default,
    /// Dedicated stream created at initialization, numbered 1..=N.
    Dedicated(usize),
}

impl StreamId {
    /// Maps a raw slot index to a stream id (0 is the default stream).
    #[must_use]
    pub fn from_index(index: usize) -> Self {
        match index {
            0 => Self::Default,
            n => Self::Dedicated(n),
        }
    }

    /// Returns the slot index for this stream.
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::Default => 0,
            Self::Dedicated(n) => n,
        }
    }

    /// Whether this is the default stream.
    #[must_use]
    pub fn is_default(self) -> bool {
        matches!(self, Self::Default)
    }
}

impl From<usize> for StreamId {
    fn from(index: usize) -> Self {
        Self::from_index(index)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.index())
    }
}

/// What a stream is currently waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StreamState {
    /// No outstanding operation.
    #[default]
    Ready,
    /// A kernel was dispatched; completion is signalled through checkbits.
    WaitKernel,
    /// A copy was dispatched; completion is detected by a stream query.
    WaitCopy,
}

impl StreamState {
    /// Whether an operation is in flight.
    #[must_use]
    pub fn is_waiting(self) -> bool {
        !matches!(self, Self::Ready)
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ready => "READY",
            Self::WaitKernel => "WAIT_KERNEL",
            Self::WaitCopy => "WAIT_COPY",
        };
        f.write_str(name)
    }
}

/// State of one slot of a device context.
///
/// A stream context is only ever driven by one thread at a time; distinct
/// contexts share nothing and can be driven from different threads
/// concurrently (see [`crate::DeviceContext::streams_mut`]).
pub struct StreamContext<B: DeviceBackend> {
    id: StreamId,
    handle: B::Stream,
    state: StreamState,
    finished: bool,
    checkbits: CheckbitBuffer<B::Checkbits>,
    buffer: B::Buffer,
    begin_usec: u64,
    end_usec: u64,
    elapsed_usec: u64,
    clock: Arc<dyn TimestampSource>,
    poll: PollPolicy,
    stats: StreamStats,
}

impl<B: DeviceBackend> StreamContext<B> {
    pub(crate) fn new(
        id: StreamId,
        handle: B::Stream,
        checkbits: CheckbitBuffer<B::Checkbits>,
        buffer: B::Buffer,
        clock: Arc<dyn TimestampSource>,
        poll: PollPolicy,
    ) -> Self {
        Self {
            id,
            handle,
            state: StreamState::Ready,
            finished: true,
            checkbits,
            buffer,
            begin_usec: 0,
            end_usec: 0,
            elapsed_usec: 0,
            clock,
            poll,
            stats: StreamStats::default(),
        }
    }

    /// Stream id of this slot.
    #[must_use]
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Hardware stream to dispatch work on.
    pub fn handle(&self) -> &B::Stream {
        &self.handle
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Whether completion of the last operation has been observed.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Ready with the last operation confirmed complete.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.state == StreamState::Ready && self.finished
    }

    /// Declares what the stream is about to wait on.
    ///
    /// Leaving `Ready` starts the operation timer. Switching between the two
    /// wait states keeps the original start time, so a copy, kernel, copy
    /// pipeline is timed as one operation. Setting `Ready` acknowledges
    /// completion without polling.
    pub fn set_state(&mut self, state: StreamState) {
        match (self.state, state) {
            (StreamState::Ready, StreamState::Ready) => {}
            (StreamState::Ready, _) => {
                self.begin_usec = self.clock.now_usec();
                self.finished = false;
                debug!(stream = %self.id, state = %state, "Stream dispatched");
            }
            (previous, StreamState::Ready) => {
                let now = self.clock.now_usec();
                self.complete(previous, now, 0);
            }
            (previous, _) => {
                debug!(stream = %self.id, from = %previous, to = %state, "Stream state changed");
            }
        }
        self.state = state;
    }

    /// Resets the first `num_blocks` checkbits for the next kernel.
    pub fn clear_checkbits(&mut self, num_blocks: usize) -> Result<()> {
        self.checkbits.clear(num_blocks)
    }

    /// Device view of the checkbits for the kernel launcher.
    #[must_use]
    pub fn device_checkbits(&self) -> DeviceCheckbits {
        self.checkbits.device_view()
    }

    /// Host view of the checkbits.
    pub fn checkbits(&self) -> &CheckbitBuffer<B::Checkbits> {
        &self.checkbits
    }

    /// Blocks expected to signal for the current kernel.
    #[must_use]
    pub fn num_blocks(&self) -> usize {
        self.checkbits.num_blocks()
    }

    /// Device data region owned by this stream.
    pub fn buffer(&self) -> &B::Buffer {
        &self.buffer
    }

    /// Mutable device data region owned by this stream.
    pub fn buffer_mut(&mut self) -> &mut B::Buffer {
        &mut self.buffer
    }

    /// Timestamp taken when the current or last operation started.
    #[must_use]
    pub fn begin_usec(&self) -> u64 {
        self.begin_usec
    }

    /// Timestamp taken when the last operation completed.
    #[must_use]
    pub fn end_usec(&self) -> u64 {
        self.end_usec
    }

    /// Duration of the most recently completed operation.
    ///
    /// Zero before the first completion. While an operation is in flight this
    /// still reports the previous operation.
    #[must_use]
    pub fn elapsed_usec(&self) -> u64 {
        self.elapsed_usec
    }

    /// Completion counters for this stream.
    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    /// Checks for completion of the current operation.
    ///
    /// Without `block` this is a single check; `Ok(false)` leaves the stream
    /// untouched. With `block` the host busy-polls, paced by the poll policy,
    /// until the operation completes. On completion the stream returns to
    /// `Ready`, is marked finished and the end time is recorded. An idle
    /// stream returns `Ok(true)` immediately.
    pub fn sync(&mut self, block: bool) -> Result<bool> {
        if self.is_idle() {
            return Ok(true);
        }

        let mut backoff = self.poll.backoff();
        loop {
            if self.poll_once()? {
                let now = self.clock.now_usec();
                self.complete(self.state, now, u64::from(backoff.attempts()) + 1);
                return Ok(true);
            }
            if !block {
                trace!(
                    stream = %self.id,
                    state = %self.state,
                    signalled = self.checkbits.count_set(),
                    expected = self.checkbits.num_blocks(),
                    "Stream still busy"
                );
                return Ok(false);
            }
            backoff.snooze();
        }
    }

    fn poll_once(&self) -> Result<bool> {
        match self.state {
            StreamState::Ready => Ok(true),
            StreamState::WaitKernel => Ok(self.checkbits.all_set()),
            StreamState::WaitCopy => self.handle.query(),
        }
    }

    fn complete(&mut self, kind: StreamState, now: u64, polls: u64) {
        self.state = StreamState::Ready;
        self.finished = true;
        self.end_usec = now;
        self.elapsed_usec = now.saturating_sub(self.begin_usec);
        self.stats.record(kind, self.elapsed_usec, polls);
        debug!(
            stream = %self.id,
            kind = %kind,
            elapsed_usec = self.elapsed_usec,
            polls,
            "Stream operation complete"
        );
    }
}

impl<B: DeviceBackend> fmt::Debug for StreamContext<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamContext")
            .field("id", &self.id)
            .field("default", &self.handle.is_default())
            .field("state", &self.state)
            .field("finished", &self.finished)
            .field("checkbits", &self.checkbits)
            .field("begin_usec", &self.begin_usec)
            .field("end_usec", &self.end_usec)
            .finish()
    }
}
