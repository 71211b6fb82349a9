//! Device context: the fixed pool of stream slots.

use std::sync::Arc;

use tracing::{info, warn};

use crate::backend::DeviceBackend;
use crate::checkbits::{CheckbitBuffer, DeviceCheckbits};
use crate::clock::{MonotonicClock, TimestampSource};
use crate::config::DeviceConfig;
use crate::error::{DeviceError, Result};
use crate::poll::PollPolicy;
use crate::stats::DeviceStats;
use crate::stream::{StreamContext, StreamId, StreamState};

/// Maximum number of dedicated streams.
pub const MAX_STREAM: usize = 16;

/// Checkbit capacity per stream (one byte per kernel block).
pub const MAX_BLOCKS: usize = 8192;

/// Owns every stream slot of one device.
///
/// Slot 0 holds the default stream and is always present; slots `1..=N` hold
/// streams created at initialization. The slot count is fixed for the
/// lifetime of the context.
pub struct DeviceContext<B: DeviceBackend> {
    backend: B,
    slots: Vec<StreamContext<B>>,
    stream_count: usize,
    capacity_per_stream: usize,
    released: bool,
}

impl<B: DeviceBackend> DeviceContext<B> {
    /// Allocates `stream_count` dedicated streams plus the default slot, each
    /// with `capacity_per_stream` bytes of device memory and a checkbit
    /// buffer of [`MAX_BLOCKS`] bytes.
    ///
    /// Every slot starts `Ready` and finished. Partially acquired resources
    /// are released on failure.
    pub fn init(backend: B, capacity_per_stream: usize, stream_count: usize) -> Result<Self> {
        Self::builder(backend)
            .capacity_per_stream(capacity_per_stream)
            .streams(stream_count)
            .build()
    }

    /// Initializes from a configuration.
    pub fn from_config(backend: B, config: &DeviceConfig) -> Result<Self> {
        Self::builder(backend)
            .capacity_per_stream(config.capacity_per_stream)
            .streams(config.stream_count)
            .poll_policy(config.poll)
            .build()
    }

    /// Starts a builder for custom clocks or poll policies.
    pub fn builder(backend: B) -> DeviceContextBuilder<B> {
        DeviceContextBuilder::new(backend)
    }

    /// Whether dedicated streams were created. When false, callers always use
    /// [`StreamId::Default`].
    #[must_use]
    pub fn use_stream(&self) -> bool {
        self.stream_count > 0
    }

    /// Number of dedicated streams.
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.stream_count
    }

    /// Device memory reserved per stream.
    #[must_use]
    pub fn capacity_per_stream(&self) -> usize {
        self.capacity_per_stream
    }

    /// Backend the context was created with.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Whether [`teardown`](Self::teardown) has run.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Every valid stream id, default stream first.
    pub fn stream_ids(&self) -> impl Iterator<Item = StreamId> + '_ {
        self.slots.iter().map(StreamContext::id)
    }

    /// Hardware stream for `id`.
    pub fn get_stream(&self, id: StreamId) -> Result<&B::Stream> {
        Ok(self.stream(id)?.handle())
    }

    /// Slot for `id`.
    pub fn stream(&self, id: StreamId) -> Result<&StreamContext<B>> {
        let slot = self.slot(id)?;
        Ok(&self.slots[slot])
    }

    /// Mutable slot for `id`.
    pub fn stream_mut(&mut self, id: StreamId) -> Result<&mut StreamContext<B>> {
        let slot = self.slot(id)?;
        Ok(&mut self.slots[slot])
    }

    /// All live slots, default stream first.
    pub fn streams(&self) -> std::slice::Iter<'_, StreamContext<B>> {
        self.slots.iter()
    }

    /// Disjoint mutable access to every live slot.
    ///
    /// Each `&mut StreamContext` can be handed to a different thread, which is
    /// how distinct streams are driven concurrently without locking.
    pub fn streams_mut(&mut self) -> std::slice::IterMut<'_, StreamContext<B>> {
        self.slots.iter_mut()
    }

    /// Declares the operation the stream is waiting on.
    pub fn set_state(&mut self, id: StreamId, state: StreamState) -> Result<()> {
        self.stream_mut(id)?.set_state(state);
        Ok(())
    }

    /// Current state of the stream.
    pub fn get_state(&self, id: StreamId) -> Result<StreamState> {
        Ok(self.stream(id)?.state())
    }

    /// Checks whether the stream's current operation has finished,
    /// busy-polling until it has when `block` is set.
    pub fn sync(&mut self, id: StreamId, block: bool) -> Result<bool> {
        self.stream_mut(id)?.sync(block)
    }

    /// Syncs every live stream in slot order. Returns whether all are idle.
    pub fn sync_all(&mut self, block: bool) -> Result<bool> {
        if self.released {
            return Err(DeviceError::Released);
        }
        let mut all_idle = true;
        for stream in &mut self.slots {
            all_idle &= stream.sync(block)?;
        }
        Ok(all_idle)
    }

    /// Device-visible checkbit buffer the next kernel on `id` writes into.
    pub fn get_device_checkbits(&self, id: StreamId) -> Result<DeviceCheckbits> {
        Ok(self.stream(id)?.device_checkbits())
    }

    /// Host view of the checkbits of `id`.
    pub fn checkbits(&self, id: StreamId) -> Result<&CheckbitBuffer<B::Checkbits>> {
        Ok(self.stream(id)?.checkbits())
    }

    /// Resets the first `num_blocks` checkbits of `id` before a kernel launch.
    pub fn clear_checkbits(&mut self, id: StreamId, num_blocks: usize) -> Result<()> {
        self.stream_mut(id)?.clear_checkbits(num_blocks)
    }

    /// Duration in microseconds of the last completed operation on `id`.
    ///
    /// Zero before the first completion; while an operation is in flight the
    /// previous duration is reported.
    pub fn get_elapsed_time(&self, id: StreamId) -> Result<u64> {
        Ok(self.stream(id)?.elapsed_usec())
    }

    /// Device data region of `id`.
    pub fn device_buffer(&self, id: StreamId) -> Result<&B::Buffer> {
        Ok(self.stream(id)?.buffer())
    }

    /// Mutable device data region of `id`.
    pub fn device_buffer_mut(&mut self, id: StreamId) -> Result<&mut B::Buffer> {
        Ok(self.stream_mut(id)?.buffer_mut())
    }

    /// Completion counters for every live stream.
    #[must_use]
    pub fn stats(&self) -> DeviceStats {
        DeviceStats {
            streams: self
                .slots
                .iter()
                .map(|s| (s.id(), s.stats().clone()))
                .collect(),
        }
    }

    /// Destroys all streams and frees their memory.
    ///
    /// Refuses with [`DeviceError::StreamBusy`] while any stream has an
    /// operation in flight; nothing is released in that case. Calling it
    /// again after success is a no-op.
    pub fn teardown(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        if let Some(busy) = self.slots.iter().find(|s| !s.is_idle()) {
            return Err(DeviceError::StreamBusy {
                id: busy.id(),
                state: busy.state(),
            });
        }

        let released = self.slots.len();
        self.slots.clear();
        self.stream_count = 0;
        self.released = true;

        info!(
            backend = self.backend.name(),
            slots = released,
            "Released device context"
        );
        Ok(())
    }

    fn slot(&self, id: StreamId) -> Result<usize> {
        if self.released {
            return Err(DeviceError::Released);
        }
        match id {
            StreamId::Default => Ok(0),
            StreamId::Dedicated(n) if (1..=self.stream_count).contains(&n) => Ok(n),
            StreamId::Dedicated(_) => Err(DeviceError::InvalidStream {
                id,
                stream_count: self.stream_count,
            }),
        }
    }
}

impl<B: DeviceBackend> Drop for DeviceContext<B> {
    fn drop(&mut self) {
        for stream in self.slots.iter().filter(|s| !s.is_idle()) {
            warn!(
                stream = %stream.id(),
                state = %stream.state(),
                "Dropping device context with operation in flight"
            );
        }
    }
}

impl<B: DeviceBackend> std::fmt::Debug for DeviceContext<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("backend", &self.backend.name())
            .field("stream_count", &self.stream_count)
            .field("capacity_per_stream", &self.capacity_per_stream)
            .field("released", &self.released)
            .field("slots", &self.slots)
            .finish()
    }
}

/// Builder for DeviceContext.
pub struct DeviceContextBuilder<B: DeviceBackend> {
    backend: B,
    stream_count: usize,
    capacity_per_stream: usize,
    clock: Option<Arc<dyn TimestampSource>>,
    poll: PollPolicy,
}

impl<B: DeviceBackend> DeviceContextBuilder<B> {
    /// Creates a builder with the default configuration.
    pub fn new(backend: B) -> Self {
        let defaults = DeviceConfig::default();
        Self {
            backend,
            stream_count: defaults.stream_count,
            capacity_per_stream: defaults.capacity_per_stream,
            clock: None,
            poll: defaults.poll,
        }
    }

    /// Sets the number of dedicated streams.
    #[must_use]
    pub fn streams(mut self, count: usize) -> Self {
        self.stream_count = count;
        self
    }

    /// Sets the device memory reserved per stream.
    #[must_use]
    pub fn capacity_per_stream(mut self, bytes: usize) -> Self {
        self.capacity_per_stream = bytes;
        self
    }

    /// Sets the timestamp source used for operation timing.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn TimestampSource>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Sets the pacing of blocking sync.
    #[must_use]
    pub fn poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    /// Allocates every slot.
    pub fn build(self) -> Result<DeviceContext<B>> {
        let Self {
            backend,
            stream_count,
            capacity_per_stream,
            clock,
            poll,
        } = self;

        if stream_count > MAX_STREAM {
            return Err(DeviceError::TooManyStreams {
                requested: stream_count,
                max: MAX_STREAM,
            });
        }
        if capacity_per_stream == 0 {
            return Err(DeviceError::InvalidConfig(
                "capacity_per_stream must be non-zero".to_string(),
            ));
        }

        let clock = clock.unwrap_or_else(|| Arc::new(MonotonicClock::new()));
        let mut slots = Vec::with_capacity(MAX_STREAM + 1);
        for index in 0..=stream_count {
            let id = StreamId::from_index(index);
            let slot = allocate_slot(&backend, id, capacity_per_stream, &clock, poll)
                .map_err(|e| {
                    warn!(backend = backend.name(), stream = %id, error = %e, "Device context initialization failed");
                    e
                })?;
            slots.push(slot);
        }

        info!(
            backend = backend.name(),
            streams = stream_count,
            capacity_per_stream,
            "Initialized device context"
        );

        Ok(DeviceContext {
            backend,
            slots,
            stream_count,
            capacity_per_stream,
            released: false,
        })
    }
}

fn allocate_slot<B: DeviceBackend>(
    backend: &B,
    id: StreamId,
    capacity: usize,
    clock: &Arc<dyn TimestampSource>,
    poll: PollPolicy,
) -> Result<StreamContext<B>> {
    let handle = match id {
        StreamId::Default => backend.default_stream(),
        StreamId::Dedicated(_) => backend.create_stream()?,
    };
    let buffer = backend.alloc_device(capacity)?;
    let checkbits = CheckbitBuffer::new(backend.alloc_checkbits(MAX_BLOCKS)?)?;
    Ok(StreamContext::new(
        id,
        handle,
        checkbits,
        buffer,
        Arc::clone(clock),
        poll,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StreamHandle;
    use crate::checkbits::MappedRegion;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

    #[derive(Clone)]
    struct TestStream {
        default: bool,
        drained: Arc<AtomicBool>,
    }

    impl StreamHandle for TestStream {
        fn query(&self) -> Result<bool> {
            Ok(self.drained.load(Ordering::Acquire))
        }

        fn is_default(&self) -> bool {
            self.default
        }
    }

    struct TestRegion(Box<[AtomicU8]>);

    impl MappedRegion for TestRegion {
        fn host_bytes(&self) -> &[AtomicU8] {
            &self.0
        }

        fn device_ptr(&self) -> u64 {
            self.0.as_ptr() as u64
        }
    }

    #[derive(Default)]
    struct TestBackend {
        drained: Arc<AtomicBool>,
        fail_after_streams: Option<usize>,
        created: AtomicUsize,
    }

    impl DeviceBackend for TestBackend {
        type Stream = TestStream;
        type Buffer = Vec<u8>;
        type Checkbits = TestRegion;

        fn name(&self) -> &str {
            "test"
        }

        fn default_stream(&self) -> TestStream {
            TestStream {
                default: true,
                drained: Arc::clone(&self.drained),
            }
        }

        fn create_stream(&self) -> Result<TestStream> {
            let created = self.created.fetch_add(1, Ordering::Relaxed);
            if self.fail_after_streams.is_some_and(|limit| created >= limit) {
                return Err(DeviceError::StreamCreationFailed("limit".to_string()));
            }
            Ok(TestStream {
                default: false,
                drained: Arc::clone(&self.drained),
            })
        }

        fn alloc_device(&self, size: usize) -> Result<Vec<u8>> {
            Ok(vec![0; size])
        }

        fn alloc_checkbits(&self, len: usize) -> Result<TestRegion> {
            Ok(TestRegion((0..len).map(|_| AtomicU8::new(0)).collect()))
        }
    }

    fn signal_all(ctx: &DeviceContext<TestBackend>, id: StreamId) {
        let checkbits = ctx.checkbits(id).unwrap();
        for byte in &checkbits.region().host_bytes()[..checkbits.num_blocks()] {
            byte.store(1, Ordering::Release);
        }
    }

    #[test]
    fn test_init_stream_counts() {
        for count in 0..=MAX_STREAM {
            let ctx = DeviceContext::init(TestBackend::default(), 64, count).unwrap();
            assert_eq!(ctx.stream_count(), count);
            assert_eq!(ctx.use_stream(), count > 0);
            assert_eq!(ctx.streams().count(), count + 1);
            for stream in ctx.streams() {
                assert_eq!(stream.state(), StreamState::Ready);
                assert!(stream.is_finished());
                assert_eq!(stream.num_blocks(), 0);
                assert_eq!(stream.begin_usec(), 0);
                assert_eq!(stream.end_usec(), 0);
                assert_eq!(stream.checkbits().capacity(), MAX_BLOCKS);
                assert_eq!(stream.buffer().len(), 64);
            }
        }

        let err = DeviceContext::init(TestBackend::default(), 64, MAX_STREAM + 1).unwrap_err();
        assert!(matches!(err, DeviceError::TooManyStreams { requested: 17, max: 16 }));
    }

    #[test]
    fn test_init_rejects_zero_capacity() {
        let err = DeviceContext::init(TestBackend::default(), 0, 1).unwrap_err();
        assert!(matches!(err, DeviceError::InvalidConfig(_)));
    }

    #[test]
    fn test_init_propagates_stream_failure() {
        let backend = TestBackend {
            fail_after_streams: Some(2),
            ..TestBackend::default()
        };
        let err = DeviceContext::init(backend, 64, 4).unwrap_err();
        assert!(matches!(err, DeviceError::StreamCreationFailed(_)));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_default_stream_slot() {
        let ctx = DeviceContext::init(TestBackend::default(), 64, 0).unwrap();
        assert!(ctx.get_stream(StreamId::Default).unwrap().is_default());
        assert!(matches!(
            ctx.get_stream(StreamId::Dedicated(1)),
            Err(DeviceError::InvalidStream { stream_count: 0, .. })
        ));

        let ctx = DeviceContext::init(TestBackend::default(), 64, 2).unwrap();
        assert!(ctx.get_stream(StreamId::Default).unwrap().is_default());
        assert!(!ctx.get_stream(StreamId::Dedicated(2)).unwrap().is_default());
        assert!(ctx.get_stream(StreamId::Dedicated(3)).is_err());
        assert!(ctx.get_stream(StreamId::Dedicated(0)).is_err());
    }

    #[test]
    fn test_kernel_cycle_with_manual_clock() {
        let clock = Arc::new(ManualClock::new(1_000));
        let mut ctx = DeviceContext::builder(TestBackend::default())
            .streams(1)
            .capacity_per_stream(64)
            .clock(clock.clone())
            .build()
            .unwrap();
        let id = StreamId::Dedicated(1);

        ctx.set_state(id, StreamState::WaitKernel).unwrap();
        assert_eq!(ctx.get_state(id).unwrap(), StreamState::WaitKernel);
        ctx.clear_checkbits(id, 4).unwrap();
        assert!(!ctx.sync(id, false).unwrap());
        assert_eq!(ctx.get_state(id).unwrap(), StreamState::WaitKernel);

        clock.advance(250);
        signal_all(&ctx, id);
        assert!(ctx.sync(id, true).unwrap());
        assert_eq!(ctx.get_state(id).unwrap(), StreamState::Ready);
        assert_eq!(ctx.get_elapsed_time(id).unwrap(), 250);

        // Idempotent: no re-timing.
        clock.advance(1_000);
        assert!(ctx.sync(id, true).unwrap());
        assert_eq!(ctx.get_elapsed_time(id).unwrap(), 250);
        assert_eq!(ctx.stream(id).unwrap().end_usec(), 1_250);
    }

    #[test]
    fn test_copy_completion_uses_stream_query() {
        let backend = TestBackend::default();
        let drained = Arc::clone(&backend.drained);
        let mut ctx = DeviceContext::init(backend, 64, 1).unwrap();
        let id = StreamId::Dedicated(1);

        ctx.set_state(id, StreamState::WaitCopy).unwrap();
        assert!(!ctx.sync(id, false).unwrap());
        drained.store(true, Ordering::Release);
        assert!(ctx.sync(id, false).unwrap());
        assert_eq!(ctx.get_state(id).unwrap(), StreamState::Ready);
        assert_eq!(ctx.stream(id).unwrap().stats().copies_completed, 1);
    }

    #[test]
    fn test_clear_checkbits_bounds() {
        let mut ctx = DeviceContext::init(TestBackend::default(), 64, 1).unwrap();
        assert!(ctx.clear_checkbits(StreamId::Default, MAX_BLOCKS).is_ok());
        let err = ctx
            .clear_checkbits(StreamId::Default, MAX_BLOCKS + 1)
            .unwrap_err();
        assert!(err.is_contract_violation());
        assert!(ctx.clear_checkbits(StreamId::Dedicated(2), 1).is_err());
    }

    #[test]
    fn test_teardown_requires_idle_streams() {
        let mut ctx = DeviceContext::init(TestBackend::default(), 64, 2).unwrap();
        ctx.set_state(StreamId::Dedicated(2), StreamState::WaitKernel)
            .unwrap();
        ctx.clear_checkbits(StreamId::Dedicated(2), 1).unwrap();

        let err = ctx.teardown().unwrap_err();
        assert!(matches!(
            err,
            DeviceError::StreamBusy {
                id: StreamId::Dedicated(2),
                state: StreamState::WaitKernel
            }
        ));
        assert!(!ctx.is_released());

        signal_all(&ctx, StreamId::Dedicated(2));
        assert!(ctx.sync_all(true).unwrap());
        ctx.teardown().unwrap();
        assert!(ctx.is_released());
        assert!(!ctx.use_stream());
        assert!(matches!(
            ctx.get_stream(StreamId::Default),
            Err(DeviceError::Released)
        ));
        assert!(ctx.teardown().is_ok());
    }
}
