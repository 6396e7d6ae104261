//! Bounded spectrum queues.
//!
//! Each feed (raw, treated) has its own [`SpectrumQueue`]. The notification
//! side pushes and never waits; the consumer pops in arrival order. When the
//! consumer falls behind and the ring is full, the oldest sample is dropped
//! and counted so memory stays bounded for multi-hour runs.

use crate::instrument::spectrum::{Spectrum, SpectrumKind};
use ringbuf::ring_buffer::RbBase;
use ringbuf::{HeapRb, Rb};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

struct QueueInner {
    kind: SpectrumKind,
    ring: Mutex<HeapRb<Spectrum>>,
    notify: Notify,
    pushed: AtomicU64,
    dropped: AtomicU64,
}

/// FIFO hand-off between notification delivery and a consumer.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct SpectrumQueue {
    inner: Arc<QueueInner>,
}

impl SpectrumQueue {
    /// Create a queue holding at most `capacity` samples
    pub fn new(kind: SpectrumKind, capacity: usize) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                kind,
                ring: Mutex::new(HeapRb::new(capacity.max(1))),
                notify: Notify::new(),
                pushed: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    pub fn kind(&self) -> SpectrumKind {
        self.inner.kind
    }

    /// Append a sample, evicting the oldest one if the queue is full.
    ///
    /// Returns the evicted sample.
    pub fn push(&self, spectrum: Spectrum) -> Option<Spectrum> {
        let evicted = self.ring().push_overwrite(spectrum);
        self.inner.pushed.fetch_add(1, Ordering::Relaxed);
        if evicted.is_some() {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.inner.notify.notify_one();
        evicted
    }

    /// Take the oldest sample without waiting
    pub fn pop(&self) -> Option<Spectrum> {
        self.ring().pop()
    }

    /// Take every queued sample, oldest first
    pub fn drain(&self) -> Vec<Spectrum> {
        let mut ring = self.ring();
        std::iter::from_fn(|| ring.pop()).collect()
    }

    /// Wait for the next sample
    pub async fn recv(&self) -> Spectrum {
        loop {
            if let Some(spectrum) = self.pop() {
                return spectrum;
            }
            self.inner.notify.notified().await;
        }
    }

    /// Wait up to `timeout` for the next sample
    pub async fn recv_timeout(&self, timeout: Duration) -> Option<Spectrum> {
        tokio::time::timeout(timeout, self.recv()).await.ok()
    }

    pub fn len(&self) -> usize {
        self.ring().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.ring().capacity()
    }

    /// Samples ever pushed, including dropped ones
    pub fn pushed_count(&self) -> u64 {
        self.inner.pushed.load(Ordering::Relaxed)
    }

    /// Samples evicted because the consumer fell behind
    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    fn ring(&self) -> MutexGuard<'_, HeapRb<Spectrum>> {
        // A panic while holding the lock cannot leave the ring half-written.
        self.inner
            .ring
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for SpectrumQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpectrumQueue")
            .field("kind", &self.inner.kind)
            .field("len", &self.len())
            .field("dropped", &self.dropped_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(seq: u64) -> Spectrum {
        Spectrum::new(SpectrumKind::Raw, seq, vec![1.0].into(), vec![seq as f64])
    }

    #[test]
    fn test_fifo_order() {
        let queue = SpectrumQueue::new(SpectrumKind::Raw, 8);
        for i in 0..5 {
            assert!(queue.push(sample(i)).is_none());
        }
        let seqs: Vec<_> = queue.drain().iter().map(|s| s.sequence).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let queue = SpectrumQueue::new(SpectrumKind::Raw, 3);
        for i in 0..5 {
            queue.push(sample(i));
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped_count(), 2);
        assert_eq!(queue.pushed_count(), 5);
        let seqs: Vec<_> = queue.drain().iter().map(|s| s.sequence).collect();
        assert_eq!(seqs, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_recv_wakes_on_push() {
        let queue = SpectrumQueue::new(SpectrumKind::Treated, 4);
        let producer = queue.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer.push(sample(7));
        });

        let received = queue.recv().await;
        assert_eq!(received.sequence, 7);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_recv_timeout_on_empty_queue() {
        let queue = SpectrumQueue::new(SpectrumKind::Raw, 4);
        assert!(queue
            .recv_timeout(Duration::from_secs(1))
            .await
            .is_none());
    }
}
