//! Bounded LRU index of recently committed event ids.
//!
//! Appends with `ExpectedVersion::Any` carry no version to compare against, so a
//! retried `Any` append is recognised by its event ids instead. The index maps each
//! recently committed event id to the stream and event number it was committed as.
//! Older entries are evicted, so a retry arriving after eviction is written again;
//! that is the documented limit of `Any` idempotency.

use std::num::NonZeroUsize;

use lru::LruCache;
use uuid::Uuid;

/// Where a committed event lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventKey {
    /// Stream the event was committed to.
    pub stream_id: String,
    /// Event number assigned by the commit.
    pub event_number: u64,
}

/// Bounded LRU index mapping event ids to their committed location.
#[derive(Debug)]
pub struct DedupIndex {
    cache: LruCache<Uuid, EventKey>,
}

impl DedupIndex {
    /// Create an index tracking at most `capacity` event ids.
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            cache: LruCache::new(capacity),
        }
    }

    /// Look up where `event_id` was committed.
    ///
    /// Uses `peek`, so lookups work through a shared reference (the commit validator
    /// only holds a read lock) and do not change the eviction order.
    pub fn lookup(&self, event_id: &Uuid) -> Option<&EventKey> {
        self.cache.peek(event_id)
    }

    /// Remember a committed event.
    ///
    /// Called in commit order, both live and while replaying the log at open, so the
    /// most recently committed events end up hottest.
    pub fn record(&mut self, event_id: Uuid, stream_id: &str, event_number: u64) {
        self.cache.put(
            event_id,
            EventKey {
                stream_id: stream_id.to_string(),
                event_number,
            },
        );
    }

    /// Number of event ids currently tracked.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// `true` if no event ids are tracked.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index(capacity: usize) -> DedupIndex {
        DedupIndex::new(NonZeroUsize::new(capacity).expect("non-zero"))
    }

    #[test]
    fn lookup_unknown_id_returns_none() {
        let dedup = index(4);
        assert!(dedup.lookup(&Uuid::new_v4()).is_none());
        assert!(dedup.is_empty());
    }

    #[test]
    fn recorded_id_resolves_to_its_location() {
        let mut dedup = index(4);
        let id = Uuid::new_v4();
        dedup.record(id, "orders-1", 7);

        let key = dedup.lookup(&id).expect("recorded");
        assert_eq!(key.stream_id, "orders-1");
        assert_eq!(key.event_number, 7);
        assert_eq!(dedup.len(), 1);
    }

    #[test]
    fn oldest_ids_are_evicted_first() {
        let mut dedup = index(2);
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for (n, id) in ids.iter().enumerate() {
            dedup.record(*id, "s", n as u64);
        }

        assert!(dedup.lookup(&ids[0]).is_none(), "oldest evicted");
        assert_eq!(dedup.lookup(&ids[1]).map(|k| k.event_number), Some(1));
        assert_eq!(dedup.lookup(&ids[2]).map(|k| k.event_number), Some(2));
    }

    #[test]
    fn lookup_does_not_refresh_entries() {
        let mut dedup = index(2);
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        dedup.record(first, "s", 0);
        dedup.record(second, "s", 1);

        assert!(dedup.lookup(&first).is_some());
        dedup.record(Uuid::new_v4(), "s", 2);
        assert!(dedup.lookup(&first).is_none(), "peek must not promote");
        assert!(dedup.lookup(&second).is_some());
    }

    #[test]
    fn re_recording_an_id_moves_it() {
        let mut dedup = index(4);
        let id = Uuid::new_v4();
        dedup.record(id, "a", 0);
        dedup.record(id, "b", 3);
        let key = dedup.lookup(&id).expect("recorded");
        assert_eq!(key.stream_id, "b");
        assert_eq!(key.event_number, 3);
        assert_eq!(dedup.len(), 1);
    }
}
