//! `BoundedFrameQueue` (§3) — fixed-capacity FIFO of audio frames with
//! drop-newest-on-full semantics, one per direction per call.
//!
//! A plain FIFO (not a map keyed by handle), with the eviction policy
//! drop-the-incoming-frame, not evict-the-oldest, per §3's
//! "drop-newest-on-full".

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Default capacity: 15 frames of 20 ms each ≈ 300 ms of buffered audio.
pub const DEFAULT_CAPACITY: usize = 15;

#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub payload: Vec<u8>,
    pub timestamp_ms: u64,
    pub source_rate: u32,
    pub bit_depth: u8,
}

struct Inner {
    frames: VecDeque<AudioFrame>,
    capacity: usize,
}

/// A fixed-capacity FIFO with drop-newest-on-full semantics.
pub struct BoundedFrameQueue {
    inner: Mutex<Inner>,
    dropped: AtomicU64,
}

impl BoundedFrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                frames: VecDeque::with_capacity(capacity),
                capacity,
            }),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }

    /// Enqueue a frame. If the queue is at capacity, the new frame is
    /// dropped (not the oldest one) and the drop counter is incremented.
    pub fn push(&self, frame: AudioFrame) {
        let mut inner = self.inner.lock();
        if inner.frames.len() >= inner.capacity {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        inner.frames.push_back(frame);
    }

    pub fn pop(&self) -> Option<AudioFrame> {
        self.inner.lock().frames.pop_front()
    }

    /// Drop every buffered frame immediately. Used for the barge-in flush
    /// (§4.7): must be callable without blocking on the outbound worker.
    pub fn flush(&self) {
        self.inner.lock().frames.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(n: u64) -> AudioFrame {
        AudioFrame {
            payload: vec![0u8; 4],
            timestamp_ms: n,
            source_rate: 24000,
            bit_depth: 16,
        }
    }

    #[test]
    fn drops_newest_when_full() {
        let q = BoundedFrameQueue::new(2);
        q.push(frame(1));
        q.push(frame(2));
        q.push(frame(3)); // dropped
        assert_eq!(q.len(), 2);
        assert_eq!(q.dropped_count(), 1);
        assert_eq!(q.pop().unwrap().timestamp_ms, 1);
        assert_eq!(q.pop().unwrap().timestamp_ms, 2);
        assert!(q.pop().is_none());
    }

    #[test]
    fn flush_clears_immediately() {
        let q = BoundedFrameQueue::new(5);
        for i in 0..5 {
            q.push(frame(i));
        }
        assert_eq!(q.len(), 5);
        q.flush();
        assert!(q.is_empty());
        assert!(q.pop().is_none());
    }

    #[test]
    fn barge_in_flush_drops_all_frames_queued_before_it() {
        let q = BoundedFrameQueue::new(15);
        for i in 0..8 {
            q.push(frame(i)); // AI speech queued before the caller interrupts
        }
        q.flush(); // AiEvent::Interruption triggers this
        for i in 100..103 {
            q.push(frame(i)); // frames generated after response.cancel
        }
        let mut seen = Vec::new();
        while let Some(f) = q.pop() {
            seen.push(f.timestamp_ms);
        }
        assert!(seen.iter().all(|&ts| ts >= 100), "no pre-barge-in frame may survive the flush: {seen:?}");
    }

    #[test]
    fn fifo_order_preserved() {
        let q = BoundedFrameQueue::new(10);
        for i in 0..5 {
            q.push(frame(i));
        }
        for i in 0..5 {
            assert_eq!(q.pop().unwrap().timestamp_ms, i);
        }
    }
}
