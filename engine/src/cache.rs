//! Versioned record cache.
//!
//! Holds the client-local copy of each document. Local puts bump the version
//! and mark the record pending; remote puts mark it synced. Expiry is
//! advisory: an expired entry reads as a miss but still anchors the version
//! sequence until it is evicted. Pending work is never lost to eviction since
//! the operation log is the durable record.

use crate::{record::Origin, DocumentKey, SyncStatus, Timestamp, VersionedRecord};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone)]
struct CacheEntry {
    record: VersionedRecord,
    expires_at: Option<Timestamp>,
}

impl CacheEntry {
    fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Client-local records by (owner, collection, document).
#[derive(Debug, Clone, Default)]
pub struct RecordCache {
    entries: HashMap<DocumentKey, CacheEntry>,
}

impl RecordCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a record.
    ///
    /// With [`Origin::Local`] the version becomes previous + 1 when a previous
    /// copy exists, and the status becomes pending. A conflicted record stays
    /// in conflict with its server copy attached. With [`Origin::Remote`] the
    /// record is stored as synced at `now`.
    pub fn put(
        &mut self,
        mut record: VersionedRecord,
        ttl: Option<Duration>,
        origin: Origin,
        now: Timestamp,
    ) -> &VersionedRecord {
        let key = record.key();
        let previous = self.entries.get(&key).map(|e| &e.record);

        match origin {
            Origin::Local => {
                record.last_modified = now;
                match previous {
                    Some(prev) if prev.is_conflicted() => {
                        record.version = prev.version + 1;
                        record.sync_status = SyncStatus::Conflict;
                        record.server_version = prev.server_version.clone();
                        record.last_synced = prev.last_synced;
                    }
                    Some(prev) => {
                        record.version = prev.version + 1;
                        record.sync_status = SyncStatus::Pending;
                        record.last_synced = prev.last_synced;
                    }
                    None => record.sync_status = SyncStatus::Pending,
                }
            }
            Origin::Remote => record.mark_synced(now),
        }

        let expires_at = ttl.map(|ttl| now.saturating_add(ttl.as_millis() as Timestamp));
        let entry = CacheEntry { record, expires_at };
        self.entries.insert(key.clone(), entry);
        &self.entries[&key].record
    }

    /// Store a record exactly as given, keeping its version and status.
    ///
    /// Used to put back a record after a failed write, or to store one whose
    /// bookkeeping was computed elsewhere.
    pub fn restore(&mut self, record: VersionedRecord, ttl: Option<Duration>, now: Timestamp) {
        let expires_at = ttl.map(|ttl| now.saturating_add(ttl.as_millis() as Timestamp));
        self.entries
            .insert(record.key(), CacheEntry { record, expires_at });
    }

    /// Live record by key. Expired entries read as a miss.
    pub fn get(&self, key: &DocumentKey, now: Timestamp) -> Option<&VersionedRecord> {
        self.entries
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| &e.record)
    }

    /// Mutable access to a live record.
    pub fn get_mut(&mut self, key: &DocumentKey, now: Timestamp) -> Option<&mut VersionedRecord> {
        self.entries
            .get_mut(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| &mut e.record)
    }

    /// Record by key regardless of expiry.
    pub fn peek(&self, key: &DocumentKey) -> Option<&VersionedRecord> {
        self.entries.get(key).map(|e| &e.record)
    }

    /// Mutable access regardless of expiry.
    pub fn peek_mut(&mut self, key: &DocumentKey) -> Option<&mut VersionedRecord> {
        self.entries.get_mut(key).map(|e| &mut e.record)
    }

    /// Remove a record, returning it.
    pub fn delete(&mut self, key: &DocumentKey) -> Option<VersionedRecord> {
        self.entries.remove(key).map(|e| e.record)
    }

    /// Live records of one owner, ordered by collection then id.
    pub fn list_by_owner(&self, owner_id: &str, now: Timestamp) -> Vec<&VersionedRecord> {
        let mut records: Vec<&VersionedRecord> = self
            .entries
            .values()
            .filter(|e| !e.is_expired(now) && e.record.owner_id == owner_id)
            .map(|e| &e.record)
            .collect();
        records.sort_by(|a, b| (&a.collection, &a.id).cmp(&(&b.collection, &b.id)));
        records
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn evict_expired(&mut self, now: Timestamp) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        before - self.entries.len()
    }

    /// Number of entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ServerDocument;
    use serde_json::json;

    fn record(id: &str, owner: &str, collection: &str) -> VersionedRecord {
        VersionedRecord::new_local(id, collection, owner, json!({"title": id}), 1_000)
    }

    fn key(id: &str) -> DocumentKey {
        DocumentKey::new("u1", "recipes", id)
    }

    #[test]
    fn miss_returns_none() {
        let cache = RecordCache::new();
        assert!(cache.get(&key("nope"), 0).is_none());
    }

    #[test]
    fn local_put_increments_previous_version() {
        let mut cache = RecordCache::new();
        assert_eq!(cache.put(record("r1", "u1", "recipes"), None, Origin::Local, 1_000).version, 1);

        let stored = cache.put(record("r1", "u1", "recipes"), None, Origin::Local, 2_000);
        assert_eq!(stored.version, 2);
        assert_eq!(stored.sync_status, SyncStatus::Pending);
        assert_eq!(stored.last_modified, 2_000);

        let stored = cache.put(record("r1", "u1", "recipes"), None, Origin::Local, 3_000);
        assert_eq!(stored.version, 3);
    }

    #[test]
    fn remote_put_marks_synced() {
        let mut cache = RecordCache::new();
        cache.put(record("r1", "u1", "recipes"), None, Origin::Local, 1_000);

        let mut confirmed = record("r1", "u1", "recipes");
        confirmed.version = 1;
        let stored = cache.put(confirmed, None, Origin::Remote, 4_000);
        assert_eq!(stored.sync_status, SyncStatus::Synced);
        assert_eq!(stored.last_synced, Some(4_000));
        assert_eq!(stored.version, 1);
    }

    #[test]
    fn local_put_keeps_conflict() {
        let mut cache = RecordCache::new();
        cache.put(record("r1", "u1", "recipes"), None, Origin::Local, 1_000);
        let server = ServerDocument::new("r1", "recipes", "u1", json!({"title": "S"}), 5, 900);
        cache.get_mut(&key("r1"), 1_000).unwrap().mark_conflict(server.clone());

        let stored = cache.put(record("r1", "u1", "recipes"), None, Origin::Local, 2_000);
        assert_eq!(stored.version, 2);
        assert!(stored.is_conflicted());
        assert_eq!(stored.server_version.as_ref(), Some(&server));
    }

    #[test]
    fn ttl_expiry_is_a_miss() {
        let mut cache = RecordCache::new();
        cache.put(
            record("r1", "u1", "recipes"),
            Some(Duration::from_millis(500)),
            Origin::Local,
            1_000,
        );

        assert!(cache.get(&key("r1"), 1_499).is_some());
        assert!(cache.get(&key("r1"), 1_500).is_none());
        assert!(cache.peek(&key("r1")).is_some());
        assert!(cache.peek_mut(&key("r1")).is_some());
    }

    #[test]
    fn expired_entry_still_anchors_version() {
        let mut cache = RecordCache::new();
        let ttl = Some(Duration::from_millis(10));
        cache.put(record("r1", "u1", "recipes"), ttl, Origin::Local, 1_000);
        cache.put(record("r1", "u1", "recipes"), ttl, Origin::Local, 1_001);

        let stored = cache.put(record("r1", "u1", "recipes"), ttl, Origin::Local, 9_000);
        assert_eq!(stored.version, 3);
    }

    #[test]
    fn evict_expired_removes_entries() {
        let mut cache = RecordCache::new();
        cache.put(
            record("r1", "u1", "recipes"),
            Some(Duration::from_millis(10)),
            Origin::Local,
            1_000,
        );
        cache.put(record("r2", "u1", "recipes"), None, Origin::Local, 1_000);

        assert_eq!(cache.evict_expired(5_000), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.peek(&key("r1")).is_none());
    }

    #[test]
    fn list_by_owner_filters_and_sorts() {
        let mut cache = RecordCache::new();
        cache.put(record("r2", "u1", "recipes"), None, Origin::Local, 1_000);
        cache.put(record("r1", "u1", "recipes"), None, Origin::Local, 1_000);
        cache.put(record("m1", "u1", "meal_plans"), None, Origin::Local, 1_000);
        cache.put(record("r3", "u2", "recipes"), None, Origin::Local, 1_000);

        let ids: Vec<_> = cache
            .list_by_owner("u1", 1_000)
            .into_iter()
            .map(|r| r.id.as_str())
            .collect();
        assert_eq!(ids, vec!["m1", "r1", "r2"]);
    }

    #[test]
    fn same_id_under_other_owner_or_collection_is_separate() {
        let mut cache = RecordCache::new();
        cache.put(record("r1", "u1", "recipes"), None, Origin::Local, 1_000);
        cache.put(record("r1", "u1", "recipes"), None, Origin::Local, 1_001);

        let theirs = cache.put(record("r1", "u2", "recipes"), None, Origin::Local, 1_002);
        assert_eq!(theirs.version, 1);
        assert_eq!(theirs.owner_id, "u2");
        let plan = cache.put(record("r1", "u1", "meal_plans"), None, Origin::Local, 1_003);
        assert_eq!(plan.version, 1);

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get(&key("r1"), 1_003).unwrap().version, 2);
        assert!(cache.get(&DocumentKey::new("u3", "recipes", "r1"), 1_003).is_none());
    }

    #[test]
    fn restore_keeps_bookkeeping() {
        let mut cache = RecordCache::new();
        cache.put(record("r1", "u1", "recipes"), None, Origin::Local, 1_000);

        let mut original = record("r1", "u1", "recipes");
        original.version = 7;
        original.mark_synced(800);
        cache.restore(original.clone(), None, 2_000);

        assert_eq!(cache.get(&key("r1"), 2_000), Some(&original));
    }

    #[test]
    fn delete_removes() {
        let mut cache = RecordCache::new();
        cache.put(record("r1", "u1", "recipes"), None, Origin::Local, 1_000);
        assert!(cache.delete(&key("r1")).is_some());
        assert!(cache.delete(&key("r1")).is_none());
        assert!(cache.is_empty());
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // Version after N local saves is N, whatever syncs happen in between.
            #[test]
            fn prop_version_counts_local_saves(steps in prop::collection::vec(any::<bool>(), 1..40)) {
                let mut cache = RecordCache::new();
                let mut saves = 0u64;
                let mut now = 1_000;

                for is_save in steps {
                    now += 1;
                    if is_save || saves == 0 {
                        saves += 1;
                        let stored = cache.put(record("r1", "u1", "recipes"), None, Origin::Local, now);
                        prop_assert_eq!(stored.sync_status, SyncStatus::Pending);
                    } else {
                        cache.get_mut(&key("r1"), now).unwrap().mark_synced(now);
                    }
                    prop_assert_eq!(cache.get(&key("r1"), now).unwrap().version, saves);
                }
            }
        }
    }
}
