//! A bounded ring of send buffers per sink instance.
//!
//! Grounded on netdata's `struct simple_connector_buffer` / `struct
//! simple_connector_data`: each tick's formatted output is accumulated into one buffer
//! (`header` + `buffer`), which is then linked onto a ring so the worker thread can pick
//! it up independently of the pipeline filling the next one. The ring is bounded
//! (`buffer_on_failures` deep); when full, the oldest buffer is dropped and its metrics
//! counted as lost, matching the original's "replace the oldest" backpressure policy.

use std::collections::VecDeque;

/// One formatted batch awaiting transmission.
///
/// `body` is raw bytes rather than `String` so binary wire formats (Prometheus
/// remote-write's snappy-compressed protobuf) and text formats (Graphite, OpenTSDB,
/// JSON) share the same buffer type, matching netdata's `BUFFER*` which is
/// byte-oriented regardless of the connector.
#[derive(Debug, Default, Clone)]
pub struct SendBuffer {
    pub header: String,
    pub body: Vec<u8>,
    pub buffered_metrics: usize,
    pub buffered_bytes: usize,
}

impl SendBuffer {
    pub fn is_empty(&self) -> bool {
        self.buffered_metrics == 0
    }

    fn clear(&mut self) {
        self.header.clear();
        self.body.clear();
        self.buffered_metrics = 0;
        self.buffered_bytes = 0;
    }

    /// A `std::fmt::Write` view onto `body`, for text-protocol formatters (Graphite,
    /// OpenTSDB, JSON) that build their payload with `write!`/`writeln!`.
    pub fn body_as_string(&mut self) -> BodyWriter<'_> {
        BodyWriter(self)
    }
}

/// Adapts [`SendBuffer::body`] (raw bytes) to [`std::fmt::Write`].
pub struct BodyWriter<'a>(&'a mut SendBuffer);

impl std::fmt::Write for BodyWriter<'_> {
    fn write_str(&mut self, s: &str) -> std::fmt::Result {
        self.0.body.extend_from_slice(s.as_bytes());
        Ok(())
    }
}

/// A dropped buffer's accounting, returned so the caller can bump lost-metric counters.
#[derive(Debug, Clone, Copy)]
pub struct Dropped {
    pub metrics: usize,
    pub bytes: usize,
}

/// The bounded ring of send buffers for one instance.
pub struct BufferRing {
    capacity: usize,
    ring: VecDeque<SendBuffer>,
    free: Vec<SendBuffer>,
    current: SendBuffer,
}

impl BufferRing {
    /// Creates a ring bounded to `capacity` queued buffers (the instance's
    /// `buffer_on_failures` setting).
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), ring: VecDeque::new(), free: Vec::new(), current: SendBuffer::default() }
    }

    /// The buffer currently being filled by the formatter pipeline.
    pub fn current_mut(&mut self) -> &mut SendBuffer {
        &mut self.current
    }

    /// Finishes the current buffer, queuing it for the worker to send, and starts a
    /// fresh one (reused from the free list when available). Returns the evicted
    /// oldest buffer's accounting if the ring was already at capacity.
    ///
    /// An empty current buffer (no metrics collected this tick) is discarded instead of
    /// queued, mirroring the original's defensive "nothing to send" no-op.
    pub fn finish_current(&mut self) -> Option<Dropped> {
        if self.current.is_empty() {
            self.current.clear();
            return None;
        }

        let finished = std::mem::replace(&mut self.current, self.free.pop().unwrap_or_default());
        let dropped = if self.ring.len() >= self.capacity {
            self.ring.pop_front().map(|b| Dropped { metrics: b.buffered_metrics, bytes: b.buffered_bytes })
        } else {
            None
        };
        self.ring.push_back(finished);
        dropped
    }

    /// Takes the oldest queued buffer for the worker to send, if any is queued.
    pub fn take_oldest(&mut self) -> Option<SendBuffer> {
        self.ring.pop_front()
    }

    /// Puts a buffer back at the front of the queue after a failed send attempt, so it
    /// is retried before newer buffers.
    pub fn requeue_front(&mut self, buf: SendBuffer) {
        self.ring.push_front(buf);
    }

    /// Returns a successfully-sent buffer to the free list for reuse, avoiding
    /// repeated allocation the way the original reuses `BUFFER*` objects.
    pub fn recycle(&mut self, mut buf: SendBuffer) {
        buf.clear();
        self.free.push(buf);
    }

    /// Number of buffers currently queued for sending.
    pub fn queued_len(&self) -> usize {
        self.ring.len()
    }
}
