use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{internal_error, EngineResult};
use crate::local::TargetData;
use crate::model::{DocumentKey, MutableDocument, SnapshotVersion};
use crate::remote::existence_filter::BloomFilter;
use crate::remote::remote_event::{RemoteEvent, TargetChange};
use crate::remote::watch_change::{
    DocumentChange, DocumentDelete, DocumentRemove, ExistenceFilterChange, TargetChangeState,
    WatchChange, WatchDocument, WatchTargetChange,
};

/// Lets the aggregator consult the local view of active targets: which
/// targets exist and which documents the server previously confirmed for
/// them.
pub trait TargetMetadataProvider: Send + Sync {
    fn get_remote_keys(&self, target_id: i32) -> BTreeSet<DocumentKey>;
    fn get_target_data(&self, target_id: i32) -> Option<TargetData>;
}

/// Accumulates watch stream changes between snapshot boundaries and
/// materializes them into [`RemoteEvent`]s.
///
/// Changes for targets the provider does not know about are dropped: they
/// belong to targets that were unlistened while the response was in flight.
pub struct WatchChangeAggregator<P>
where
    P: TargetMetadataProvider,
{
    metadata: Arc<P>,
    target_states: BTreeMap<i32, TargetState>,
    target_documents: BTreeMap<i32, BTreeSet<DocumentKey>>,
    pending_document_updates: BTreeMap<DocumentKey, Option<WatchDocument>>,
    pending_target_mismatches: BTreeSet<i32>,
}

impl<P> WatchChangeAggregator<P>
where
    P: TargetMetadataProvider + 'static,
{
    pub fn new(metadata: Arc<P>) -> Self {
        Self {
            metadata,
            target_states: BTreeMap::new(),
            target_documents: BTreeMap::new(),
            pending_document_updates: BTreeMap::new(),
            pending_target_mismatches: BTreeSet::new(),
        }
    }

    /// Call when an `AddTarget` request goes out so that `current` is only
    /// believed once the server has acknowledged this particular listen.
    pub fn record_pending_target_request(&mut self, target_id: i32) {
        self.target_states
            .entry(target_id)
            .or_insert_with(TargetState::new)
            .pending_responses += 1;
    }

    /// Forgets everything about a target that was unlistened.
    pub fn remove_target(&mut self, target_id: i32) {
        self.target_states.remove(&target_id);
        self.target_documents.remove(&target_id);
        self.pending_target_mismatches.remove(&target_id);
    }

    pub fn handle_watch_change(&mut self, change: WatchChange) -> EngineResult<()> {
        match change {
            WatchChange::TargetChange(target_change) => self.handle_target_change(target_change),
            WatchChange::DocumentChange(doc_change) => {
                self.handle_document_change(doc_change);
                Ok(())
            }
            WatchChange::DocumentDelete(delete) => self.handle_document_delete(delete),
            WatchChange::DocumentRemove(remove) => self.handle_document_remove(remove),
            WatchChange::ExistenceFilter(filter) => self.handle_existence_filter(filter),
        }
    }

    fn handle_target_change(&mut self, change: WatchTargetChange) -> EngineResult<()> {
        if let Some(status) = change.cause.as_ref() {
            return Err(internal_error(format!(
                "watch target error (code {}): {}",
                status.code, status.message
            )));
        }

        let affected: Vec<i32> = if change.target_ids.is_empty() {
            self.target_states.keys().copied().collect()
        } else {
            change.target_ids.clone()
        };

        for target_id in affected {
            if !self.is_active_target(target_id) {
                continue;
            }
            self.ensure_target_documents(target_id);
            let state = self
                .target_states
                .entry(target_id)
                .or_insert_with(TargetState::new);

            match change.state {
                TargetChangeState::NoChange => {
                    state.update_resume_token(&change.resume_token);
                }
                TargetChangeState::Add => {
                    state.pending_responses = state.pending_responses.saturating_sub(1);
                    state.update_resume_token(&change.resume_token);
                }
                TargetChangeState::Remove => {
                    state.pending_responses = state.pending_responses.saturating_sub(1);
                    self.target_states.remove(&target_id);
                    self.target_documents.remove(&target_id);
                }
                TargetChangeState::Current => {
                    state.current = true;
                    state.update_resume_token(&change.resume_token);
                    state.mark_dirty();
                }
                TargetChangeState::Reset => {
                    self.reset_target(target_id);
                    let state = self
                        .target_states
                        .entry(target_id)
                        .or_insert_with(TargetState::new);
                    state.update_resume_token(&change.resume_token);
                }
            }
        }

        Ok(())
    }

    fn handle_document_change(&mut self, change: DocumentChange) {
        let key = change.key.clone();

        if let Some(document) = change.document.clone() {
            for target_id in &change.updated_target_ids {
                self.apply_doc_update(*target_id, key.clone(), true);
            }
            self.pending_document_updates.insert(key.clone(), Some(document));
        }

        for target_id in &change.removed_target_ids {
            self.apply_doc_update(*target_id, key.clone(), false);
        }

        if change.document.is_none() {
            self.pending_document_updates.insert(key, None);
        }
    }

    fn handle_document_delete(&mut self, delete: DocumentDelete) -> EngineResult<()> {
        let key = delete.key.clone();
        for target_id in delete.removed_target_ids {
            self.apply_doc_update(target_id, key.clone(), false);
        }
        self.pending_document_updates.insert(key, None);
        Ok(())
    }

    fn handle_document_remove(&mut self, remove: DocumentRemove) -> EngineResult<()> {
        // A remove only detaches the document from its targets; it says
        // nothing about the document itself.
        let key = remove.key;
        for target_id in remove.removed_target_ids {
            self.apply_doc_update(target_id, key.clone(), false);
        }
        Ok(())
    }

    fn handle_existence_filter(&mut self, change: ExistenceFilterChange) -> EngineResult<()> {
        let target_id = change.target_id;
        let target_data = match self.metadata.get_target_data(target_id) {
            Some(data) => data,
            None => return Ok(()),
        };
        self.ensure_target_documents(target_id);

        if target_data.target.is_document_target() {
            if change.count == 0 {
                // The only document of a limbo style target no longer exists.
                let key = match DocumentKey::from_path(target_data.target.query().path().clone()) {
                    Ok(key) => key,
                    Err(err) => return Err(err),
                };
                self.apply_doc_update(target_id, key.clone(), false);
                self.pending_document_updates.insert(key, None);
            }
            return Ok(());
        }

        let current_size = self
            .target_documents
            .get(&target_id)
            .map(|docs| docs.len())
            .unwrap_or(0);
        if current_size as i64 == i64::from(change.count) {
            return Ok(());
        }

        match change
            .unchanged_names
            .as_ref()
            .map(BloomFilter::from_payload)
        {
            Some(Ok(filter)) => {
                let removed = self.evict_absent_keys(target_id, &filter);
                let remaining = current_size - removed;
                if remaining as i64 == i64::from(change.count) {
                    log::debug!(
                        "existence filter for target {target_id} reconciled by bloom filter \
                         ({removed} evicted)"
                    );
                    return Ok(());
                }
                log::debug!("bloom filter for target {target_id} did not reconcile, resetting");
            }
            Some(Err(err)) => {
                log::warn!("ignoring unusable bloom filter for target {target_id}: {err}");
            }
            None => {}
        }

        self.reset_target(target_id);
        self.pending_target_mismatches.insert(target_id);
        Ok(())
    }

    fn evict_absent_keys(&mut self, target_id: i32, filter: &BloomFilter) -> usize {
        let state = self
            .target_states
            .entry(target_id)
            .or_insert_with(TargetState::new);
        let docs = self
            .target_documents
            .entry(target_id)
            .or_default();

        let absent: Vec<DocumentKey> = docs
            .iter()
            .filter(|key| !filter.might_contain(&key.to_string()))
            .cloned()
            .collect();
        for key in &absent {
            docs.remove(key);
            state.removed.insert(key.clone());
            state.mark_dirty();
        }
        absent.len()
    }

    fn apply_doc_update(&mut self, target_id: i32, key: DocumentKey, present: bool) {
        if !self.is_active_target(target_id) {
            return;
        }
        self.ensure_target_documents(target_id);
        let state = self
            .target_states
            .entry(target_id)
            .or_insert_with(TargetState::new);
        let docs = self
            .target_documents
            .entry(target_id)
            .or_default();

        if present {
            let existed = docs.contains(&key);
            docs.insert(key.clone());
            if existed {
                state.modified.insert(key);
            } else {
                state.added.insert(key);
            }
            state.mark_dirty();
        } else if docs.remove(&key) {
            state.removed.insert(key);
            state.mark_dirty();
        }
    }

    fn reset_target(&mut self, target_id: i32) {
        let previous = self
            .target_documents
            .insert(target_id, BTreeSet::new())
            .unwrap_or_default();
        let state = self
            .target_states
            .entry(target_id)
            .or_insert_with(TargetState::new);
        state.reset();
        // Everything the server previously confirmed must be re-added before
        // it counts again.
        for key in previous {
            state.removed.insert(key);
        }
    }

    /// Materializes everything accumulated so far into a consistent snapshot
    /// at `snapshot_version` and clears the per-snapshot state.
    pub fn create_remote_event(&mut self, snapshot_version: SnapshotVersion) -> RemoteEvent {
        let mut event = RemoteEvent {
            snapshot_version,
            ..RemoteEvent::default()
        };

        let mut document_updates: BTreeMap<DocumentKey, MutableDocument> = BTreeMap::new();
        for (key, update) in std::mem::take(&mut self.pending_document_updates) {
            let doc = match update {
                Some(watch_doc) => MutableDocument::found_document(
                    watch_doc.key,
                    watch_doc.version,
                    watch_doc.data,
                ),
                None => MutableDocument::no_document(key.clone(), snapshot_version),
            };
            document_updates.insert(key, doc);
        }

        for (target_id, state) in self.target_states.iter_mut() {
            if state.pending_responses > 0 {
                // The server is still answering an older listen request for
                // this target; suppress `current` until it settles.
                state.current = false;
            }
            if let Some(change) = state.take_changes() {
                event.target_changes.insert(*target_id, change);
            }
        }

        // Document targets that are current but hold no document resolve to a
        // deletion at this snapshot.
        let current_document_targets: Vec<(i32, DocumentKey)> = self
            .target_states
            .iter()
            .filter(|(_, state)| state.current)
            .filter_map(|(target_id, _)| {
                let data = self.metadata.get_target_data(*target_id)?;
                if !data.target.is_document_target() {
                    return None;
                }
                let empty = self
                    .target_documents
                    .get(target_id)
                    .map(|docs| docs.is_empty())
                    .unwrap_or(true);
                if !empty {
                    return None;
                }
                DocumentKey::from_path(data.target.query().path().clone())
                    .ok()
                    .map(|key| (*target_id, key))
            })
            .collect();
        for (_, key) in &current_document_targets {
            if !document_updates.contains_key(key) {
                document_updates
                    .insert(key.clone(), MutableDocument::no_document(key.clone(), snapshot_version));
                event.resolved_limbo_documents.insert(key.clone());
            }
        }

        event.document_updates = document_updates;
        event.target_mismatches = std::mem::take(&mut self.pending_target_mismatches);
        event
    }

    fn is_active_target(&self, target_id: i32) -> bool {
        self.metadata.get_target_data(target_id).is_some()
    }

    fn ensure_target_documents(&mut self, target_id: i32) {
        if !self.target_documents.contains_key(&target_id) {
            let keys = self.metadata.get_remote_keys(target_id);
            self.target_documents.insert(target_id, keys);
        }
    }
}

struct TargetState {
    pending_responses: usize,
    resume_token: Bytes,
    current: bool,
    added: BTreeSet<DocumentKey>,
    modified: BTreeSet<DocumentKey>,
    removed: BTreeSet<DocumentKey>,
    dirty: bool,
}

impl TargetState {
    fn new() -> Self {
        Self {
            pending_responses: 0,
            resume_token: Bytes::new(),
            current: false,
            added: BTreeSet::new(),
            modified: BTreeSet::new(),
            removed: BTreeSet::new(),
            dirty: false,
        }
    }

    fn reset(&mut self) {
        self.added.clear();
        self.modified.clear();
        self.removed.clear();
        self.current = false;
        self.dirty = true;
    }

    fn update_resume_token(&mut self, token: &[u8]) {
        if !token.is_empty() {
            self.resume_token = Bytes::copy_from_slice(token);
            self.dirty = true;
        }
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    fn take_changes(&mut self) -> Option<TargetChange> {
        if !self.dirty {
            return None;
        }
        let change = TargetChange {
            resume_token: self.resume_token.clone(),
            current: self.current,
            added_documents: std::mem::take(&mut self.added),
            modified_documents: std::mem::take(&mut self.modified),
            removed_documents: std::mem::take(&mut self.removed),
        };
        self.dirty = false;
        Some(change)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::TargetPurpose;
    use crate::model::{ResourcePath, Timestamp};
    use crate::query::Query;
    use crate::remote::existence_filter::BloomFilterBuilder;
    use crate::value::ObjectValue;

    struct TestMetadata {
        targets: BTreeMap<i32, TargetData>,
        remote_keys: BTreeMap<i32, BTreeSet<DocumentKey>>,
    }

    impl TestMetadata {
        fn with_query_target(target_id: i32) -> Self {
            let query = Query::collection(ResourcePath::from_string("cities").unwrap());
            let data = TargetData::new(query.to_target(), target_id, 1, TargetPurpose::Listen);
            let mut targets = BTreeMap::new();
            targets.insert(target_id, data);
            Self {
                targets,
                remote_keys: BTreeMap::new(),
            }
        }

        fn with_remote_keys(mut self, target_id: i32, keys: BTreeSet<DocumentKey>) -> Self {
            self.remote_keys.insert(target_id, keys);
            self
        }
    }

    impl TargetMetadataProvider for TestMetadata {
        fn get_remote_keys(&self, target_id: i32) -> BTreeSet<DocumentKey> {
            self.remote_keys.get(&target_id).cloned().unwrap_or_default()
        }

        fn get_target_data(&self, target_id: i32) -> Option<TargetData> {
            self.targets.get(&target_id).cloned()
        }
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn watch_doc(path: &str, seconds: i64) -> WatchDocument {
        WatchDocument {
            key: key(path),
            version: SnapshotVersion::new(Timestamp::new(seconds, 0)),
            data: ObjectValue::empty(),
        }
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    #[test]
    fn aggregates_document_changes_into_target_deltas() {
        let metadata = Arc::new(TestMetadata::with_query_target(2));
        let mut aggregator = WatchChangeAggregator::new(metadata);

        aggregator
            .handle_watch_change(WatchChange::TargetChange(WatchTargetChange::new(
                TargetChangeState::Add,
                vec![2],
            )))
            .unwrap();
        aggregator
            .handle_watch_change(WatchChange::DocumentChange(DocumentChange {
                updated_target_ids: vec![2],
                removed_target_ids: vec![],
                key: key("cities/sf"),
                document: Some(watch_doc("cities/sf", 5)),
            }))
            .unwrap();

        let event = aggregator.create_remote_event(version(6));
        let change = event.target_changes.get(&2).unwrap();
        assert!(change.added_documents.contains(&key("cities/sf")));
        assert!(event.document_updates.contains_key(&key("cities/sf")));
    }

    #[test]
    fn changes_for_unknown_targets_are_dropped() {
        let metadata = Arc::new(TestMetadata::with_query_target(2));
        let mut aggregator = WatchChangeAggregator::new(metadata);

        aggregator
            .handle_watch_change(WatchChange::DocumentChange(DocumentChange {
                updated_target_ids: vec![4],
                removed_target_ids: vec![],
                key: key("cities/sf"),
                document: Some(watch_doc("cities/sf", 5)),
            }))
            .unwrap();

        let event = aggregator.create_remote_event(version(6));
        assert!(!event.target_changes.contains_key(&4));
    }

    #[test]
    fn matching_existence_filter_is_a_no_op() {
        let keys: BTreeSet<DocumentKey> = [key("cities/sf")].into_iter().collect();
        let metadata =
            Arc::new(TestMetadata::with_query_target(2).with_remote_keys(2, keys));
        let mut aggregator = WatchChangeAggregator::new(metadata);

        aggregator
            .handle_watch_change(WatchChange::ExistenceFilter(ExistenceFilterChange {
                target_id: 2,
                count: 1,
                unchanged_names: None,
            }))
            .unwrap();

        let event = aggregator.create_remote_event(version(6));
        assert!(event.target_mismatches.is_empty());
    }

    #[test]
    fn mismatched_filter_without_bloom_resets_the_target() {
        let keys: BTreeSet<DocumentKey> =
            [key("cities/sf"), key("cities/nyc")].into_iter().collect();
        let metadata =
            Arc::new(TestMetadata::with_query_target(2).with_remote_keys(2, keys));
        let mut aggregator = WatchChangeAggregator::new(metadata);

        aggregator
            .handle_watch_change(WatchChange::ExistenceFilter(ExistenceFilterChange {
                target_id: 2,
                count: 1,
                unchanged_names: None,
            }))
            .unwrap();

        let event = aggregator.create_remote_event(version(6));
        assert!(event.target_mismatches.contains(&2));
    }

    #[test]
    fn bloom_filter_evicts_exactly_the_absent_keys() {
        let keys: BTreeSet<DocumentKey> =
            [key("cities/sf"), key("cities/nyc")].into_iter().collect();
        let metadata =
            Arc::new(TestMetadata::with_query_target(2).with_remote_keys(2, keys));
        let mut aggregator = WatchChangeAggregator::new(metadata);

        let mut builder = BloomFilterBuilder::new(1024, 7);
        builder.insert(&key("cities/sf").to_string());
        aggregator
            .handle_watch_change(WatchChange::ExistenceFilter(ExistenceFilterChange {
                target_id: 2,
                count: 1,
                unchanged_names: Some(builder.build()),
            }))
            .unwrap();

        let event = aggregator.create_remote_event(version(6));
        assert!(event.target_mismatches.is_empty());
        let change = event.target_changes.get(&2).unwrap();
        assert!(change.removed_documents.contains(&key("cities/nyc")));
    }

    #[test]
    fn pending_listen_response_suppresses_current() {
        let metadata = Arc::new(TestMetadata::with_query_target(2));
        let mut aggregator = WatchChangeAggregator::new(metadata);

        aggregator.record_pending_target_request(2);
        aggregator
            .handle_watch_change(WatchChange::TargetChange(WatchTargetChange::new(
                TargetChangeState::Current,
                vec![2],
            )))
            .unwrap();

        let event = aggregator.create_remote_event(version(6));
        let change = event.target_changes.get(&2).unwrap();
        assert!(!change.current);
    }
}
