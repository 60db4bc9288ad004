//! Local content store: a bounded LRU of key-addressed values with
//! time-to-live expiry and republish bookkeeping.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use bytes::Bytes;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::common::{Id, ID_SIZE};

#[derive(Debug, Clone)]
pub struct StorageEntry {
    value: Bytes,
    owner: Id,
    published_at: Instant,
    /// Last time the owner pushed this value again, which restarts the
    /// expiry clock.
    last_refreshed: Instant,
}

impl StorageEntry {
    pub fn value(&self) -> &Bytes {
        &self.value
    }

    pub fn owner(&self) -> &Id {
        &self.owner
    }

    pub fn published_at(&self) -> Instant {
        self.published_at
    }

    fn is_expired(&self, ttl: Duration, now: Instant) -> bool {
        now.duration_since(self.last_refreshed) >= ttl
    }
}

#[derive(Debug)]
/// Values this node holds on behalf of the overlay, bounded in count with
/// least-recently-used eviction.
pub struct ContentStore {
    entries: LruCache<Id, StorageEntry>,
    ttl: Duration,
}

impl ContentStore {
    pub fn new(max_keys: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(max_keys.max(1)).unwrap_or(NonZeroUsize::MIN);

        Self {
            entries: LruCache::new(capacity),
            ttl,
        }
    }

    // === Getters ===

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // === Public Methods ===

    pub fn put(&mut self, key: Id, value: Bytes, owner: Id) {
        self.put_at(key, value, owner, Instant::now())
    }

    pub fn put_at(&mut self, key: Id, value: Bytes, owner: Id, now: Instant) {
        if let Some(entry) = self.entries.get_mut(&key) {
            // Same key, refreshed payload. Restart the expiry clock.
            entry.value = value;
            entry.owner = owner;
            entry.last_refreshed = now;

            return;
        }

        self.entries.put(
            key,
            StorageEntry {
                value,
                owner,
                published_at: now,
                last_refreshed: now,
            },
        );
    }

    pub fn get(&mut self, key: &Id) -> Option<&StorageEntry> {
        self.get_at(key, Instant::now())
    }

    /// Fetch an entry, dropping it instead if its time-to-live has lapsed.
    pub fn get_at(&mut self, key: &Id, now: Instant) -> Option<&StorageEntry> {
        let ttl = self.ttl;

        if self
            .entries
            .peek(key)
            .map(|entry| entry.is_expired(ttl, now))
            .unwrap_or(true)
        {
            self.entries.pop(key);

            return None;
        }

        self.entries.get(key)
    }

    pub fn remove(&mut self, key: &Id) {
        self.entries.pop(key);
    }

    /// Keys whose entries outlived their time-to-live without a refresh.
    pub fn expired_keys(&self, now: Instant) -> Vec<Id> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(self.ttl, now))
            .map(|(key, _)| *key)
            .collect()
    }

    /// Values published by `owner` whose last push to the overlay is older
    /// than `interval`, due to be stored again on the closest nodes.
    pub fn republish_due(&self, owner: &Id, interval: Duration, now: Instant) -> Vec<(Id, Bytes)> {
        self.entries
            .iter()
            .filter(|(_, entry)| {
                entry.owner == *owner && now.duration_since(entry.last_refreshed) >= interval
            })
            .map(|(key, entry)| (*key, entry.value.clone()))
            .collect()
    }

    pub fn mark_refreshed(&mut self, key: &Id, now: Instant) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.last_refreshed = now;
        }
    }

    /// Serializable snapshot of all live entries, for persisting across
    /// restarts. Ages are relative so they survive the wall-clock gap.
    pub fn snapshot(&self, now: Instant) -> Vec<StoredItem> {
        self.entries
            .iter()
            .filter(|(_, entry)| !entry.is_expired(self.ttl, now))
            .map(|(key, entry)| StoredItem {
                key: *key.as_bytes(),
                owner: *entry.owner.as_bytes(),
                value: ByteBuf::from(entry.value.to_vec()),
                age_secs: now.duration_since(entry.published_at).as_secs(),
                since_refresh_secs: now.duration_since(entry.last_refreshed).as_secs(),
            })
            .collect()
    }

    pub fn restore(&mut self, items: Vec<StoredItem>, now: Instant) {
        for item in items {
            let since_refresh = Duration::from_secs(item.since_refresh_secs);

            if since_refresh >= self.ttl {
                continue;
            }

            self.entries.put(
                Id::from(item.key),
                StorageEntry {
                    value: Bytes::from(item.value.into_vec()),
                    owner: Id::from(item.owner),
                    published_at: now
                        .checked_sub(Duration::from_secs(item.age_secs))
                        .unwrap_or(now),
                    last_refreshed: now.checked_sub(since_refresh).unwrap_or(now),
                },
            );
        }
    }
}

/// One stored value in a portable form, [Serialize]able for persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredItem {
    #[serde(with = "serde_bytes")]
    pub key: [u8; ID_SIZE],

    #[serde(with = "serde_bytes")]
    pub owner: [u8; ID_SIZE],

    pub value: ByteBuf,

    /// Seconds since the value was first stored here.
    pub age_secs: u64,

    /// Seconds since the owner last refreshed the value.
    pub since_refresh_secs: u64,
}

#[cfg(test)]
mod test {
    use super::*;

    fn store() -> ContentStore {
        ContentStore::new(100, Duration::from_secs(60))
    }

    #[test]
    fn put_get_roundtrip() {
        let mut store = store();
        let value = Bytes::from_static(b"stored bytes");
        let key = Id::hash(&value);
        let owner = Id::random();

        store.put(key, value.clone(), owner);

        let entry = store.get(&key).expect("present");
        assert_eq!(entry.value(), &value);
        assert_eq!(entry.owner(), &owner);
    }

    #[test]
    fn get_missing() {
        let mut store = store();
        assert!(store.get(&Id::random()).is_none());
    }

    #[test]
    fn entries_expire_after_ttl() {
        let mut store = store();
        let key = Id::random();
        let now = Instant::now();

        store.put_at(key, Bytes::from_static(b"v"), Id::random(), now);

        let before_ttl = now + Duration::from_secs(59);
        assert!(store.get_at(&key, before_ttl).is_some());

        let after_ttl = now + Duration::from_secs(61);
        assert_eq!(store.expired_keys(after_ttl), vec![key]);
        assert!(store.get_at(&key, after_ttl).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn refresh_restarts_the_expiry_clock() {
        let mut store = store();
        let key = Id::random();
        let now = Instant::now();

        store.put_at(key, Bytes::from_static(b"v"), Id::random(), now);
        store.mark_refreshed(&key, now + Duration::from_secs(50));

        let after_original_ttl = now + Duration::from_secs(70);
        assert!(store.get_at(&key, after_original_ttl).is_some());
    }

    #[test]
    fn republish_due_only_for_own_stale_values() {
        let mut store = store();
        let owner = Id::random();
        let now = Instant::now();
        let interval = Duration::from_secs(30);

        let own_value = Bytes::from_static(b"mine");
        let own_key = Id::hash(&own_value);
        store.put_at(own_key, own_value.clone(), owner, now);

        // Held for someone else; never republished by this node.
        store.put_at(Id::random(), Bytes::from_static(b"theirs"), Id::random(), now);

        assert!(store.republish_due(&owner, interval, now).is_empty());

        let later = now + interval;
        assert_eq!(
            store.republish_due(&owner, interval, later),
            vec![(own_key, own_value)]
        );
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let mut store = ContentStore::new(2, Duration::from_secs(60));

        let first = Id::random();
        let second = Id::random();

        store.put(first, Bytes::from_static(b"1"), Id::random());
        store.put(second, Bytes::from_static(b"2"), Id::random());

        // Touch `first` so `second` becomes the eviction candidate.
        assert!(store.get(&first).is_some());

        store.put(Id::random(), Bytes::from_static(b"3"), Id::random());

        assert_eq!(store.len(), 2);
        assert!(store.get(&first).is_some());
        assert!(store.get(&second).is_none());
    }

    #[test]
    fn snapshot_restore_preserves_entries() {
        let mut store = store();
        let now = Instant::now();
        let owner = Id::random();
        let value = Bytes::from_static(b"persisted");
        let key = Id::hash(&value);

        store.put_at(key, value.clone(), owner, now);

        let snapshot = store.snapshot(now + Duration::from_secs(10));

        let mut restored = ContentStore::new(100, Duration::from_secs(60));
        restored.restore(snapshot, Instant::now());

        let entry = restored.get(&key).expect("restored");
        assert_eq!(entry.value(), &value);
        assert_eq!(entry.owner(), &owner);
    }

    #[test]
    fn restore_skips_expired_items() {
        let mut restored = ContentStore::new(100, Duration::from_secs(60));

        restored.restore(
            vec![StoredItem {
                key: *Id::random().as_bytes(),
                owner: *Id::random().as_bytes(),
                value: ByteBuf::from(b"old".to_vec()),
                age_secs: 3600,
                since_refresh_secs: 3600,
            }],
            Instant::now(),
        );

        assert!(restored.is_empty());
    }
}
