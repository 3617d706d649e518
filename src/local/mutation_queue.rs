use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use bytes::Bytes;

use crate::error::{invalid_argument, EngineResult};
use crate::local::persistence::PersistenceTransaction;
use crate::model::{DocumentKey, Timestamp};
use crate::mutation::{Mutation, MutationBatch};
use crate::query::Query;

const INITIAL_BATCH_ID: i32 = 1;

#[derive(Default)]
struct QueueState {
    next_batch_id: i32,
    batches: BTreeMap<i32, MutationBatch>,
    // (key, batch id) rows so collection scans are a range over key prefix.
    batches_by_key: BTreeSet<(DocumentKey, i32)>,
    last_stream_token: Bytes,
}

/// Per-user FIFO of pending write batches.
pub struct MemoryMutationQueue {
    state: Mutex<QueueState>,
}

impl MemoryMutationQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                next_batch_id: INITIAL_BATCH_ID,
                ..QueueState::default()
            }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().batches.is_empty()
    }

    pub fn add_mutation_batch(
        &self,
        _txn: &PersistenceTransaction,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> EngineResult<MutationBatch> {
        if mutations.is_empty() {
            return Err(invalid_argument("mutation batches must not be empty"));
        }
        let mut state = self.state.lock().unwrap();
        let batch_id = state.next_batch_id;
        state.next_batch_id += 1;
        let batch = MutationBatch::new(batch_id, local_write_time, base_mutations, mutations);
        for key in batch.keys() {
            state.batches_by_key.insert((key, batch_id));
        }
        state.batches.insert(batch_id, batch.clone());
        Ok(batch)
    }

    pub fn lookup_mutation_batch(&self, batch_id: i32) -> Option<MutationBatch> {
        self.state.lock().unwrap().batches.get(&batch_id).cloned()
    }

    /// The first batch with an id strictly greater than `batch_id`.
    pub fn next_mutation_batch_after_batch_id(&self, batch_id: i32) -> Option<MutationBatch> {
        let state = self.state.lock().unwrap();
        state
            .batches
            .range(batch_id + 1..)
            .next()
            .map(|(_, batch)| batch.clone())
    }

    /// -1 when the queue is empty.
    pub fn highest_unacknowledged_batch_id(&self) -> i32 {
        let state = self.state.lock().unwrap();
        state
            .batches
            .keys()
            .next_back()
            .copied()
            .unwrap_or(-1)
    }

    pub fn all_mutation_batches(&self) -> Vec<MutationBatch> {
        self.state.lock().unwrap().batches.values().cloned().collect()
    }

    pub fn all_mutation_batches_affecting_document_key(
        &self,
        key: &DocumentKey,
    ) -> Vec<MutationBatch> {
        let state = self.state.lock().unwrap();
        let start = (key.clone(), i32::MIN);
        state
            .batches_by_key
            .range(start..)
            .take_while(|(row_key, _)| row_key == key)
            .filter_map(|(_, batch_id)| state.batches.get(batch_id).cloned())
            .collect()
    }

    pub fn all_mutation_batches_affecting_document_keys<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a DocumentKey>,
    ) -> Vec<MutationBatch> {
        let state = self.state.lock().unwrap();
        let mut ids = BTreeSet::new();
        for key in keys {
            let start = (key.clone(), i32::MIN);
            for (row_key, batch_id) in state.batches_by_key.range(start..) {
                if row_key != key {
                    break;
                }
                ids.insert(*batch_id);
            }
        }
        ids.into_iter()
            .filter_map(|batch_id| state.batches.get(&batch_id).cloned())
            .collect()
    }

    /// Batches writing immediate children of the query's collection path.
    pub fn all_mutation_batches_affecting_query(&self, query: &Query) -> Vec<MutationBatch> {
        let prefix = query.path();
        let state = self.state.lock().unwrap();
        let mut ids = BTreeSet::new();
        for (key, batch_id) in state.batches_by_key.iter() {
            if !prefix.is_prefix_of(key.path()) {
                continue;
            }
            if key.path().len() == prefix.len() + 1 {
                ids.insert(*batch_id);
            }
        }
        ids.into_iter()
            .filter_map(|batch_id| state.batches.get(&batch_id).cloned())
            .collect()
    }

    pub fn remove_mutation_batch(
        &self,
        _txn: &PersistenceTransaction,
        batch: &MutationBatch,
    ) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.batches.remove(&batch.batch_id).is_none() {
            return Err(invalid_argument(format!(
                "cannot remove unknown batch {}",
                batch.batch_id
            )));
        }
        for key in batch.keys() {
            state.batches_by_key.remove(&(key, batch.batch_id));
        }
        Ok(())
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        let state = self.state.lock().unwrap();
        let start = (key.clone(), i32::MIN);
        state
            .batches_by_key
            .range(start..)
            .next()
            .map(|(row_key, _)| row_key == key)
            .unwrap_or(false)
    }

    pub fn set_last_stream_token(&self, token: Bytes) {
        self.state.lock().unwrap().last_stream_token = token;
    }

    pub fn last_stream_token(&self) -> Bytes {
        self.state.lock().unwrap().last_stream_token.clone()
    }
}

impl Default for MemoryMutationQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::persistence::MemoryPersistence;
    use crate::value::{object_from_pairs, FieldValue};

    fn set(path: &str) -> Mutation {
        Mutation::set(
            DocumentKey::from_string(path).unwrap(),
            object_from_pairs([("x", FieldValue::Integer(1))]),
        )
    }

    #[tokio::test]
    async fn batch_ids_are_monotonic_and_indexed_by_key() {
        let persistence = MemoryPersistence::new();
        let queue = MemoryMutationQueue::new();
        persistence
            .run_transaction("add", |txn| {
                let first = queue.add_mutation_batch(
                    txn,
                    Timestamp::now(),
                    Vec::new(),
                    vec![set("cities/sf")],
                )?;
                let second = queue.add_mutation_batch(
                    txn,
                    Timestamp::now(),
                    Vec::new(),
                    vec![set("cities/la"), set("cities/sf")],
                )?;
                assert!(second.batch_id > first.batch_id);
                Ok(())
            })
            .await
            .unwrap();

        let key = DocumentKey::from_string("cities/sf").unwrap();
        let affecting = queue.all_mutation_batches_affecting_document_key(&key);
        assert_eq!(affecting.len(), 2);
        assert_eq!(queue.highest_unacknowledged_batch_id(), 2);
    }

    #[tokio::test]
    async fn removal_drops_index_rows() {
        let persistence = MemoryPersistence::new();
        let queue = MemoryMutationQueue::new();
        let batch = persistence
            .run_transaction("add", |txn| {
                queue.add_mutation_batch(txn, Timestamp::now(), Vec::new(), vec![set("cities/sf")])
            })
            .await
            .unwrap();
        persistence
            .run_transaction("remove", |txn| queue.remove_mutation_batch(txn, &batch))
            .await
            .unwrap();
        assert!(queue.is_empty());
        assert!(!queue.contains_key(&DocumentKey::from_string("cities/sf").unwrap()));
        assert_eq!(queue.highest_unacknowledged_batch_id(), -1);
    }

    #[tokio::test]
    async fn query_scan_matches_immediate_children_only() {
        let persistence = MemoryPersistence::new();
        let queue = MemoryMutationQueue::new();
        persistence
            .run_transaction("add", |txn| {
                queue.add_mutation_batch(
                    txn,
                    Timestamp::now(),
                    Vec::new(),
                    vec![set("cities/sf"), set("cities/sf/districts/mission")],
                )?;
                Ok(())
            })
            .await
            .unwrap();
        let query = Query::collection(
            crate::model::ResourcePath::from_string("cities").unwrap(),
        );
        let batches = queue.all_mutation_batches_affecting_query(&query);
        assert_eq!(batches.len(), 1);
    }
}
