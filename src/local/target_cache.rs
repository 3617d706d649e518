use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::local::persistence::PersistenceTransaction;
use crate::model::{DocumentKey, SnapshotVersion};
use crate::query::Target;

/// Why a target is being listened to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetPurpose {
    /// A user-issued listen.
    Listen,
    /// Re-listen after an existence filter mismatch, without a resume token.
    ExistenceFilterMismatch,
    /// A single-document listen resolving a limbo document.
    LimboResolution,
}

/// An allocated target plus its locally persisted listen state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TargetData {
    pub target: Target,
    pub target_id: i32,
    pub sequence_number: i64,
    pub purpose: TargetPurpose,
    pub snapshot_version: SnapshotVersion,
    pub last_limbo_free_snapshot_version: SnapshotVersion,
    pub resume_token: Bytes,
}

impl TargetData {
    pub fn new(target: Target, target_id: i32, sequence_number: i64, purpose: TargetPurpose) -> Self {
        Self {
            target,
            target_id,
            sequence_number,
            purpose,
            snapshot_version: SnapshotVersion::MIN,
            last_limbo_free_snapshot_version: SnapshotVersion::MIN,
            resume_token: Bytes::new(),
        }
    }

    pub fn with_resume_token(mut self, resume_token: Bytes, snapshot_version: SnapshotVersion) -> Self {
        self.resume_token = resume_token;
        self.snapshot_version = snapshot_version;
        self
    }

    pub fn with_sequence_number(mut self, sequence_number: i64) -> Self {
        self.sequence_number = sequence_number;
        self
    }

    pub fn with_last_limbo_free_snapshot_version(mut self, version: SnapshotVersion) -> Self {
        self.last_limbo_free_snapshot_version = version;
        self
    }
}

#[derive(Default)]
struct TargetCacheState {
    targets: BTreeMap<i32, TargetData>,
    target_ids_by_canonical_id: BTreeMap<String, BTreeSet<i32>>,
    keys_by_target: BTreeMap<i32, BTreeSet<DocumentKey>>,
    targets_by_key: BTreeMap<DocumentKey, BTreeSet<i32>>,
    highest_target_id: i32,
    highest_sequence_number: i64,
    last_remote_snapshot_version: SnapshotVersion,
    // Last sequence number at which a document was still referenced, for
    // collecting orphaned cache entries.
    document_sequence_numbers: BTreeMap<DocumentKey, i64>,
}

/// Persisted listen targets, their membership sets, and the global listen
/// counters.
pub struct MemoryTargetCache {
    state: Mutex<TargetCacheState>,
}

impl MemoryTargetCache {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TargetCacheState::default()),
        }
    }

    /// Target ids grow monotonically and are never recycled, even after
    /// removal.
    pub fn allocate_target_id(&self, _txn: &PersistenceTransaction) -> i32 {
        let mut state = self.state.lock().unwrap();
        state.highest_target_id += 2;
        state.highest_target_id
    }

    pub fn highest_target_id(&self) -> i32 {
        self.state.lock().unwrap().highest_target_id
    }

    pub fn highest_sequence_number(&self) -> i64 {
        self.state.lock().unwrap().highest_sequence_number
    }

    pub fn last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.state.lock().unwrap().last_remote_snapshot_version
    }

    pub fn set_last_remote_snapshot_version(
        &self,
        _txn: &PersistenceTransaction,
        version: SnapshotVersion,
    ) {
        self.state.lock().unwrap().last_remote_snapshot_version = version;
    }

    pub fn add_target_data(&self, _txn: &PersistenceTransaction, data: TargetData) {
        let mut state = self.state.lock().unwrap();
        state.highest_target_id = state.highest_target_id.max(data.target_id);
        state.highest_sequence_number = state.highest_sequence_number.max(data.sequence_number);
        state
            .target_ids_by_canonical_id
            .entry(data.target.canonical_id())
            .or_default()
            .insert(data.target_id);
        state.targets.insert(data.target_id, data);
    }

    pub fn update_target_data(&self, txn: &PersistenceTransaction, data: TargetData) {
        self.add_target_data(txn, data);
    }

    pub fn remove_target_data(&self, _txn: &PersistenceTransaction, target_id: i32) {
        let mut state = self.state.lock().unwrap();
        if let Some(data) = state.targets.remove(&target_id) {
            let canonical = data.target.canonical_id();
            if let Some(bucket) = state.target_ids_by_canonical_id.get_mut(&canonical) {
                bucket.remove(&target_id);
                if bucket.is_empty() {
                    state.target_ids_by_canonical_id.remove(&canonical);
                }
            }
        }
        if let Some(keys) = state.keys_by_target.remove(&target_id) {
            for key in keys {
                if let Some(targets) = state.targets_by_key.get_mut(&key) {
                    targets.remove(&target_id);
                    if targets.is_empty() {
                        state.targets_by_key.remove(&key);
                    }
                }
            }
        }
    }

    /// Finds an existing allocation for a target equal to `target`.
    pub fn get_target_data(&self, target: &Target) -> Option<TargetData> {
        let state = self.state.lock().unwrap();
        let bucket = state.target_ids_by_canonical_id.get(&target.canonical_id())?;
        bucket
            .iter()
            .filter_map(|target_id| state.targets.get(target_id))
            .find(|data| &data.target == target)
            .cloned()
    }

    pub fn get_target_data_for_id(&self, target_id: i32) -> Option<TargetData> {
        self.state.lock().unwrap().targets.get(&target_id).cloned()
    }

    pub fn target_count(&self) -> usize {
        self.state.lock().unwrap().targets.len()
    }

    pub fn add_matching_keys(
        &self,
        _txn: &PersistenceTransaction,
        keys: impl IntoIterator<Item = DocumentKey>,
        target_id: i32,
    ) {
        let mut state = self.state.lock().unwrap();
        for key in keys {
            state
                .keys_by_target
                .entry(target_id)
                .or_default()
                .insert(key.clone());
            state.targets_by_key.entry(key).or_default().insert(target_id);
        }
    }

    pub fn remove_matching_keys(
        &self,
        _txn: &PersistenceTransaction,
        keys: impl IntoIterator<Item = DocumentKey>,
        target_id: i32,
    ) {
        let mut state = self.state.lock().unwrap();
        for key in keys {
            if let Some(members) = state.keys_by_target.get_mut(&target_id) {
                members.remove(&key);
            }
            if let Some(targets) = state.targets_by_key.get_mut(&key) {
                targets.remove(&target_id);
                if targets.is_empty() {
                    state.targets_by_key.remove(&key);
                }
            }
        }
    }

    pub fn matching_keys_for_target(&self, target_id: i32) -> BTreeSet<DocumentKey> {
        self.state
            .lock()
            .unwrap()
            .keys_by_target
            .get(&target_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether any allocated target currently references `key`.
    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.state
            .lock()
            .unwrap()
            .targets_by_key
            .get(key)
            .map(|targets| !targets.is_empty())
            .unwrap_or(false)
    }

    pub fn update_document_sequence_number(
        &self,
        _txn: &PersistenceTransaction,
        key: DocumentKey,
        sequence_number: i64,
    ) {
        self.state
            .lock()
            .unwrap()
            .document_sequence_numbers
            .insert(key, sequence_number);
    }

    pub fn document_sequence_number(&self, key: &DocumentKey) -> i64 {
        self.state
            .lock()
            .unwrap()
            .document_sequence_numbers
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    pub fn remove_document_sequence_number(&self, _txn: &PersistenceTransaction, key: &DocumentKey) {
        self.state
            .lock()
            .unwrap()
            .document_sequence_numbers
            .remove(key);
    }

    pub fn for_each_target(&self, mut f: impl FnMut(&TargetData)) {
        let state = self.state.lock().unwrap();
        for data in state.targets.values() {
            f(data);
        }
    }

    /// Removes every target whose sequence number is at or below
    /// `upper_bound` and that is not actively listened to. Returns how many
    /// were removed.
    pub fn remove_targets_up_through_sequence_number(
        &self,
        txn: &PersistenceTransaction,
        upper_bound: i64,
        active_target_ids: &BTreeSet<i32>,
    ) -> usize {
        let doomed: Vec<i32> = {
            let state = self.state.lock().unwrap();
            state
                .targets
                .values()
                .filter(|data| {
                    data.sequence_number <= upper_bound
                        && !active_target_ids.contains(&data.target_id)
                })
                .map(|data| data.target_id)
                .collect()
        };
        for target_id in &doomed {
            self.remove_target_data(txn, *target_id);
        }
        doomed.len()
    }
}

impl Default for MemoryTargetCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::persistence::MemoryPersistence;
    use crate::model::ResourcePath;
    use crate::query::Query;

    fn target(path: &str) -> Target {
        Query::collection(ResourcePath::from_string(path).unwrap()).to_target()
    }

    #[tokio::test]
    async fn allocation_is_monotonic_and_survives_removal() {
        let persistence = MemoryPersistence::new();
        let cache = MemoryTargetCache::new();
        let (first, second) = persistence
            .run_transaction("allocate", |txn| {
                let first = cache.allocate_target_id(txn);
                cache.add_target_data(
                    txn,
                    TargetData::new(target("cities"), first, 1, TargetPurpose::Listen),
                );
                cache.remove_target_data(txn, first);
                let second = cache.allocate_target_id(txn);
                Ok((first, second))
            })
            .await
            .unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn lookup_by_target_equality() {
        let persistence = MemoryPersistence::new();
        let cache = MemoryTargetCache::new();
        persistence
            .run_transaction("add", |txn| {
                let id = cache.allocate_target_id(txn);
                cache.add_target_data(
                    txn,
                    TargetData::new(target("cities"), id, 1, TargetPurpose::Listen),
                );
                Ok(())
            })
            .await
            .unwrap();
        assert!(cache.get_target_data(&target("cities")).is_some());
        assert!(cache.get_target_data(&target("towns")).is_none());
    }

    #[tokio::test]
    async fn membership_tracks_both_directions() {
        let persistence = MemoryPersistence::new();
        let cache = MemoryTargetCache::new();
        let key = DocumentKey::from_string("cities/sf").unwrap();
        persistence
            .run_transaction("keys", |txn| {
                cache.add_matching_keys(txn, [key.clone()], 2);
                cache.add_matching_keys(txn, [key.clone()], 4);
                assert!(cache.contains_key(&key));
                cache.remove_matching_keys(txn, [key.clone()], 2);
                assert!(cache.contains_key(&key));
                cache.remove_matching_keys(txn, [key.clone()], 4);
                assert!(!cache.contains_key(&key));
                Ok(())
            })
            .await
            .unwrap();
    }
}
