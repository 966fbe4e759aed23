//! Cache drain: replays spillover records after a reconnect, off the event loop.
//!
//! The drain runs on one blocking worker. It shares the cache and tracker with the event
//! loop through `SharedStore` and checks its cancellation flag between records.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::core::SharedStore;
use crate::protocol::Message;

/// Records popped per step.
pub const DRAIN_BATCH: usize = 100;

/// Pause draining while more than this many messages await acknowledgment.
pub const DRAIN_HIGH_WATER: usize = 500;

/// Result of one drain step.
#[derive(Debug, PartialEq)]
pub enum DrainStep {
    /// Records popped from the cache, newest first. Hand them to the relay for sending.
    Batch(Vec<Message>),
    /// Too many unacknowledged messages; wait before the next step.
    Throttled,
    /// The cache is empty (and has been cleared).
    Done,
    Cancelled,
}

pub struct Drainer {
    store: SharedStore,
    cancel: Arc<AtomicBool>,
    batch: usize,
    high_water: usize,
}

impl Drainer {
    pub fn new(store: SharedStore, cancel: Arc<AtomicBool>) -> Self {
        Self {
            store,
            cancel,
            batch: DRAIN_BATCH,
            high_water: DRAIN_HIGH_WATER,
        }
    }

    pub fn with_limits(mut self, batch: usize, high_water: usize) -> Self {
        self.batch = batch.max(1);
        self.high_water = high_water;
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Pop the next batch. Records already popped when cancellation is observed are still
    /// returned so the caller can route them back through the relay.
    pub fn step(&self) -> DrainStep {
        let mut out = Vec::new();
        let mut finished = false;
        while out.len() < self.batch {
            if self.cancelled() {
                break;
            }
            let mut store = self.store.lock();
            if store.cache.is_empty() {
                if let Err(e) = store.cache.clear() {
                    tracing::warn!(error = %e, "cannot clear drained cache");
                }
                finished = true;
                break;
            }
            if out.is_empty() && store.acks.len() > self.high_water {
                return DrainStep::Throttled;
            }
            match store.cache.read_latest(1) {
                Ok(records) => out.extend(records),
                Err(e) => {
                    tracing::warn!(error = %e, "cache read failed, stopping drain");
                    finished = true;
                    break;
                }
            }
        }
        if !out.is_empty() {
            return DrainStep::Batch(out);
        }
        if finished {
            DrainStep::Done
        } else {
            DrainStep::Cancelled
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ack::AckTracker;
    use crate::cache::{SpilloverCache, BYTES_PER_MB};
    use crate::core::Store;
    use crate::protocol::Body;

    fn store_with(n: u32) -> (tempfile::TempDir, SharedStore) {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = SpilloverCache::open(dir.path().join("c.bin"), BYTES_PER_MB).unwrap();
        for i in 0..n {
            cache.append_message(&Message::new(Body::Info {
                timestamp: f64::from(i),
                info: "queued".into(),
            }));
        }
        (dir, Store::new(cache, AckTracker::new()).into_shared())
    }

    #[test]
    fn drains_in_batches_then_done() {
        let (_dir, store) = store_with(5);
        let drainer = Drainer::new(store.clone(), Arc::new(AtomicBool::new(false))).with_limits(2, 10);
        let mut seen = 0;
        loop {
            match drainer.step() {
                DrainStep::Batch(b) => {
                    assert!(b.len() <= 2);
                    seen += b.len();
                }
                DrainStep::Done => break,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(seen, 5);
        assert!(store.lock().cache.is_empty());
    }

    #[test]
    fn cancelled_before_start() {
        let (_dir, store) = store_with(3);
        let drainer = Drainer::new(store.clone(), Arc::new(AtomicBool::new(true)));
        assert_eq!(drainer.step(), DrainStep::Cancelled);
        assert!(!store.lock().cache.is_empty());
    }

    #[test]
    fn throttled_by_unacknowledged() {
        let (_dir, store) = store_with(3);
        {
            let mut s = store.lock();
            for i in 0..4 {
                s.acks
                    .register(Message::new(Body::Info {
                        timestamp: f64::from(100 + i),
                        info: "in flight".into(),
                    }))
                    .unwrap();
            }
        }
        let drainer = Drainer::new(store, Arc::new(AtomicBool::new(false))).with_limits(10, 3);
        assert_eq!(drainer.step(), DrainStep::Throttled);
    }

    #[test]
    fn full_cache_cleared_when_drained() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = SpilloverCache::open(dir.path().join("c.bin"), 1).unwrap();
        cache.append_message(&Message::new(Body::Keepalive));
        assert!(cache.is_full());
        let store = Store::new(cache, AckTracker::new()).into_shared();
        let drainer = Drainer::new(store.clone(), Arc::new(AtomicBool::new(false)));
        assert!(matches!(drainer.step(), DrainStep::Batch(_)));
        assert_eq!(drainer.step(), DrainStep::Done);
        assert!(!store.lock().cache.is_full());
    }
}
