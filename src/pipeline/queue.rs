//! Bounded frame queue between the engine's delivery context and consumers

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use parking_lot::{Condvar, Mutex};
use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::HeapRb;
use tracing::{debug, trace, warn};

use crate::capture::Frame;

/// Bounded, thread-safe holding area for completed frames.
///
/// `push` never blocks: when the queue is full the oldest unconsumed frame is
/// evicted and released. Only `poll_next` waits, and never past its timeout.
pub struct FrameQueue {
    inner: Mutex<Inner>,
    available: Condvar,
    capacity: usize,

    /// Statistics
    stats: CachePadded<Stats>,
}

struct Inner {
    ring: HeapRb<Frame>,
    last_timestamp: Option<u64>,
}

#[derive(Default)]
struct Stats {
    frames_pushed: AtomicUsize,
    frames_consumed: AtomicUsize,
    frames_dropped: AtomicUsize,
}

/// Snapshot of queue counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pushed: usize,
    pub consumed: usize,
    pub dropped: usize,
}

impl FrameQueue {
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                ring: HeapRb::new(capacity),
                last_timestamp: None,
            }),
            available: Condvar::new(),
            capacity,
            stats: CachePadded::new(Stats::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().ring.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().ring.is_empty()
    }

    /// Producer: store a frame, evicting the oldest one when full.
    ///
    /// Returns false if the frame was rejected because it is older than the
    /// last frame accepted.
    pub fn push(&self, frame: Frame) -> bool {
        let evicted = {
            let mut inner = self.inner.lock();

            if let Some(last) = inner.last_timestamp {
                if frame.timestamp_nanos < last {
                    warn!(
                        timestamp = frame.timestamp_nanos,
                        last, "Discarding out-of-order frame"
                    );
                    drop(inner);
                    self.record_drop(1);
                    frame.release();
                    return false;
                }
            }

            let evicted = if inner.ring.is_full() {
                // Drop oldest frame
                inner.ring.try_pop()
            } else {
                None
            };

            inner.last_timestamp = Some(frame.timestamp_nanos);
            if let Err(frame) = inner.ring.try_push(frame) {
                // Unreachable with the eviction above; never block the producer.
                frame.release();
            }
            evicted
        };

        self.stats.frames_pushed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("camstream_frames_pushed").increment(1);
        self.available.notify_one();

        if let Some(old) = evicted {
            trace!(timestamp = old.timestamp_nanos, "Evicted stale frame");
            self.record_drop(1);
            old.release();
        }
        true
    }

    /// Consumer: next frame in arrival order, waiting at most `timeout`.
    pub fn poll_next(&self, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now().checked_add(timeout);
        let mut inner = self.inner.lock();

        loop {
            if let Some(frame) = inner.ring.try_pop() {
                drop(inner);
                self.record_consumed();
                return Some(frame);
            }

            let Some(deadline) = deadline else {
                // Timeout too large to represent; wait for a notification.
                self.available.wait(&mut inner);
                continue;
            };
            if Instant::now() >= deadline {
                return None;
            }
            if self
                .available
                .wait_until(&mut inner, deadline)
                .timed_out()
            {
                let frame = inner.ring.try_pop();
                drop(inner);
                if frame.is_some() {
                    self.record_consumed();
                }
                return frame;
            }
        }
    }

    /// Consumer: the most recent frame, discarding every earlier one. Never blocks.
    pub fn poll_latest(&self) -> Option<Frame> {
        let mut stale = Vec::new();
        let latest = {
            let mut inner = self.inner.lock();
            let mut latest = None;
            while let Some(frame) = inner.ring.try_pop() {
                if let Some(previous) = latest.replace(frame) {
                    stale.push(previous);
                }
            }
            latest
        };

        if !stale.is_empty() {
            debug!(discarded = stale.len(), "Skipped to latest frame");
            self.record_drop(stale.len());
            stale.into_iter().for_each(Frame::release);
        }
        if latest.is_some() {
            self.record_consumed();
        }
        latest
    }

    /// Release every queued frame. Returns how many were discarded.
    pub fn clear(&self) -> usize {
        let drained: Vec<Frame> = {
            let mut inner = self.inner.lock();
            std::iter::from_fn(|| inner.ring.try_pop()).collect()
        };
        let count = drained.len();
        if count > 0 {
            self.record_drop(count);
            drained.into_iter().for_each(Frame::release);
        }
        count
    }

    /// Timestamp of the last accepted frame, if any.
    pub fn last_timestamp(&self) -> Option<u64> {
        self.inner.lock().last_timestamp
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pushed: self.stats.frames_pushed.load(Ordering::Relaxed),
            consumed: self.stats.frames_consumed.load(Ordering::Relaxed),
            dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
        }
    }

    fn record_drop(&self, count: usize) {
        self.stats.frames_dropped.fetch_add(count, Ordering::Relaxed);
        metrics::counter!("camstream_frames_dropped").increment(count as u64);
    }

    fn record_consumed(&self) {
        self.stats.frames_consumed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("camstream_frames_consumed").increment(1);
    }
}

impl std::fmt::Debug for FrameQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameQueue")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("stats", &self.stats())
            .finish()
    }
}
