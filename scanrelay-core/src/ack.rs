//! Acknowledgment tracker: messages awaiting collector confirmation, periodic resend, eviction.

use std::collections::HashMap;

use crate::cache::SpilloverCache;
use crate::integrity;
use crate::protocol::Message;
use crate::wire::WireError;

/// Default number of ticks between resends of an unacknowledged message.
pub const DEFAULT_RESEND_THRESHOLD: i32 = 5;

/// Entries are evicted after this many resend periods without an acknowledgment.
pub const EVICTION_FACTOR: i32 = 10;

/// A message sent and not yet acknowledged.
#[derive(Debug, Clone)]
pub struct AckEntry {
    pub message: Message,
    pub checksum: String,
    pub miss_count: i32,
}

/// What one tick produced.
#[derive(Debug, Default)]
pub struct TickOutcome {
    /// Messages to write to the wire again, already flagged `cached`.
    pub resend: Vec<Message>,
    /// Entries dropped after exceeding the eviction threshold.
    pub evicted: usize,
}

/// Registry of in-flight messages keyed by content checksum. Two messages with identical
/// serialized bytes share one entry; the later registration replaces the earlier one.
#[derive(Debug)]
pub struct AckTracker {
    entries: HashMap<String, AckEntry>,
    resend_threshold: i32,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::with_threshold(DEFAULT_RESEND_THRESHOLD)
    }

    pub fn with_threshold(resend_threshold: i32) -> Self {
        Self {
            entries: HashMap::new(),
            resend_threshold: resend_threshold.max(1),
        }
    }

    /// Track `msg` until acknowledged. Returns its checksum.
    pub fn register(&mut self, msg: Message) -> Result<String, WireError> {
        let (_, checksum) = integrity::serialize_with_checksum(&msg)?;
        self.track(msg, checksum.clone());
        Ok(checksum)
    }

    /// Track `msg` under a checksum the caller already computed from its payload.
    pub fn track(&mut self, msg: Message, checksum: String) {
        self.entries.insert(
            checksum.clone(),
            AckEntry {
                message: msg,
                checksum,
                miss_count: 0,
            },
        );
    }

    /// Release the entry matching `checksum`. Returns whether one was tracked.
    pub fn acknowledge(&mut self, checksum: &str) -> bool {
        self.entries.remove(checksum).is_some()
    }

    pub fn contains(&self, checksum: &str) -> bool {
        self.entries.contains_key(checksum)
    }

    pub fn get(&self, checksum: &str) -> Option<&AckEntry> {
        self.entries.get(checksum)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// One supervision period. Increments every miss count; entries past
    /// `EVICTION_FACTOR * threshold` are evicted, entries on a multiple of the threshold are
    /// flagged cached, re-keyed by their new checksum and returned for resending when
    /// `connected`.
    pub fn tick(&mut self, connected: bool) -> TickOutcome {
        let mut outcome = TickOutcome::default();
        let threshold = self.resend_threshold;
        let limit = threshold * EVICTION_FACTOR;
        let mut rekeyed = Vec::new();

        self.entries.retain(|_, entry| {
            entry.miss_count = entry.miss_count.saturating_add(1);
            if entry.miss_count > limit {
                outcome.evicted += 1;
                return false;
            }
            let due = entry.miss_count < 0 || entry.miss_count % threshold == 0;
            if due && connected {
                let mut msg = entry.message.clone();
                msg.cached = true;
                match integrity::serialize_with_checksum(&msg) {
                    Ok((_, checksum)) if checksum != entry.checksum => {
                        rekeyed.push(AckEntry {
                            message: msg.clone(),
                            checksum,
                            miss_count: entry.miss_count,
                        });
                        outcome.resend.push(msg);
                        return false;
                    }
                    Ok(_) => outcome.resend.push(msg),
                    Err(e) => tracing::warn!(error = %e, "cannot re-serialize tracked message"),
                }
            }
            true
        });

        for entry in rekeyed {
            self.entries.insert(entry.checksum.clone(), entry);
        }
        if outcome.evicted > 0 {
            tracing::info!(evicted = outcome.evicted, "evicted unacknowledged messages");
        }
        outcome
    }

    /// Forget every tracked message. Returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let n = self.entries.len();
        self.entries.clear();
        n
    }

    /// Move every tracked message into the spillover cache (when it accepts writes) and
    /// empty the registry. Returns how many were cached.
    pub fn drain_to_cache(&mut self, cache: &mut SpilloverCache) -> usize {
        let mut cached = 0;
        for (_, entry) in self.entries.drain() {
            if cache.is_full() {
                continue;
            }
            if cache.append_message(&entry.message) {
                cached += 1;
            }
        }
        cached
    }
}

impl Default for AckTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::BYTES_PER_MB;
    use crate::protocol::Body;

    fn info(n: u32) -> Message {
        Message::new(Body::Info {
            timestamp: f64::from(n),
            info: "tracked".into(),
        })
    }

    #[test]
    fn register_then_acknowledge() {
        let mut t = AckTracker::new();
        let sum = t.register(info(1)).unwrap();
        assert!(t.contains(&sum));
        assert!(t.acknowledge(&sum));
        assert!(t.is_empty());
        assert!(!t.acknowledge(&sum));
    }

    #[test]
    fn no_resend_before_threshold() {
        let mut t = AckTracker::new();
        t.register(info(1)).unwrap();
        for _ in 0..4 {
            assert!(t.tick(true).resend.is_empty());
        }
        let out = t.tick(true);
        assert_eq!(out.resend.len(), 1);
        assert!(out.resend[0].cached);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn resend_rekeys_entry_and_keeps_count() {
        let mut t = AckTracker::new();
        let original = t.register(info(1)).unwrap();
        for _ in 0..5 {
            t.tick(true);
        }
        assert!(!t.contains(&original));
        let (_, resent) = integrity::serialize_with_checksum(&{
            let mut m = info(1);
            m.cached = true;
            m
        })
        .unwrap();
        assert_eq!(t.get(&resent).unwrap().miss_count, 5);
        assert!(t.acknowledge(&resent));
    }

    #[test]
    fn resend_skipped_without_connection() {
        let mut t = AckTracker::new();
        t.register(info(1)).unwrap();
        for _ in 0..5 {
            assert!(t.tick(false).resend.is_empty());
        }
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn evicted_after_fifty_one_ticks() {
        let mut t = AckTracker::new();
        t.register(info(1)).unwrap();
        let mut resends = 0;
        for _ in 0..50 {
            resends += t.tick(true).resend.len();
        }
        assert_eq!(t.len(), 1);
        assert_eq!(resends, 10);
        let out = t.tick(true);
        assert_eq!(out.evicted, 1);
        assert!(t.is_empty());
    }

    #[test]
    fn identical_content_collides() {
        // Two duplicate telemetry lines serialize identically and share one entry:
        // the second registration replaces the first and restarts its miss count.
        let mut t = AckTracker::new();
        let a = t.register(info(1)).unwrap();
        t.tick(true);
        t.tick(true);
        let b = t.register(info(1)).unwrap();
        assert_eq!(a, b);
        assert_eq!(t.len(), 1);
        assert_eq!(t.get(&a).unwrap().miss_count, 0);
        assert!(t.acknowledge(&a));
        assert!(t.is_empty());
    }

    #[test]
    fn drain_to_cache_moves_everything() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = SpilloverCache::open(dir.path().join("c.bin"), BYTES_PER_MB).unwrap();
        let mut t = AckTracker::new();
        for n in 0..3 {
            t.register(info(n)).unwrap();
        }
        assert_eq!(t.drain_to_cache(&mut cache), 3);
        assert!(t.is_empty());
        assert_eq!(cache.read_latest(10).unwrap().len(), 3);
    }

    #[test]
    fn drain_to_full_cache_discards() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = SpilloverCache::open(dir.path().join("c.bin"), 1).unwrap();
        let mut t = AckTracker::new();
        for n in 0..3 {
            t.register(info(n)).unwrap();
        }
        assert_eq!(t.drain_to_cache(&mut cache), 1);
        assert!(cache.is_full());
        assert!(t.is_empty());
    }
}
