use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::local::persistence::PersistenceTransaction;
use crate::model::{DocumentKey, ResourcePath};
use crate::mutation::{Mutation, Overlay};

/// Caches the squashed net effect of all pending batches per document so
/// reads do not replay the whole mutation queue.
pub struct MemoryOverlayCache {
    overlays: Mutex<BTreeMap<DocumentKey, Overlay>>,
}

impl MemoryOverlayCache {
    pub fn new() -> Self {
        Self {
            overlays: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn overlay(&self, key: &DocumentKey) -> Option<Overlay> {
        self.overlays.lock().unwrap().get(key).cloned()
    }

    pub fn overlays(
        &self,
        keys: impl IntoIterator<Item = DocumentKey>,
    ) -> BTreeMap<DocumentKey, Overlay> {
        let overlays = self.overlays.lock().unwrap();
        keys.into_iter()
            .filter_map(|key| overlays.get(&key).cloned().map(|overlay| (key, overlay)))
            .collect()
    }

    /// Stores the overlays produced by replaying batches up to
    /// `largest_batch_id`. A `None` mutation clears the entry.
    pub fn save_overlays(
        &self,
        _txn: &PersistenceTransaction,
        largest_batch_id: i32,
        mutations: BTreeMap<DocumentKey, Option<Mutation>>,
    ) {
        let mut overlays = self.overlays.lock().unwrap();
        for (key, mutation) in mutations {
            match mutation {
                Some(mutation) => {
                    overlays.insert(key, Overlay::new(largest_batch_id, mutation));
                }
                None => {
                    overlays.remove(&key);
                }
            }
        }
    }

    /// Drops overlays for `keys` still attributed to `batch_id`. Entries
    /// already rewritten by a later batch stay put.
    pub fn remove_overlays_for_batch_id(
        &self,
        _txn: &PersistenceTransaction,
        keys: impl IntoIterator<Item = DocumentKey>,
        batch_id: i32,
    ) {
        let mut overlays = self.overlays.lock().unwrap();
        for key in keys {
            if overlays
                .get(&key)
                .map(|overlay| overlay.largest_batch_id == batch_id)
                .unwrap_or(false)
            {
                overlays.remove(&key);
            }
        }
    }

    /// Overlays for immediate children of `collection` whose batch id is
    /// greater than `since_batch_id`.
    pub fn overlays_for_collection(
        &self,
        collection: &ResourcePath,
        since_batch_id: i32,
    ) -> BTreeMap<DocumentKey, Overlay> {
        let overlays = self.overlays.lock().unwrap();
        overlays
            .iter()
            .filter(|(key, overlay)| {
                collection.is_prefix_of(key.path())
                    && key.path().len() == collection.len() + 1
                    && overlay.largest_batch_id > since_batch_id
            })
            .map(|(key, overlay)| (key.clone(), overlay.clone()))
            .collect()
    }
}

impl Default for MemoryOverlayCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::persistence::MemoryPersistence;
    use crate::value::{object_from_pairs, FieldValue};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn set_mutation(path: &str) -> Mutation {
        Mutation::set(key(path), object_from_pairs([("x", FieldValue::Integer(1))]))
    }

    #[tokio::test]
    async fn save_and_collection_scan() {
        let persistence = MemoryPersistence::new();
        let cache = MemoryOverlayCache::new();
        persistence
            .run_transaction("save", |txn| {
                let mut mutations = BTreeMap::new();
                mutations.insert(key("cities/sf"), Some(set_mutation("cities/sf")));
                mutations.insert(
                    key("cities/sf/districts/soma"),
                    Some(set_mutation("cities/sf/districts/soma")),
                );
                cache.save_overlays(txn, 3, mutations);
                Ok(())
            })
            .await
            .unwrap();

        let collection = ResourcePath::from_string("cities").unwrap();
        let in_collection = cache.overlays_for_collection(&collection, -1);
        assert_eq!(in_collection.len(), 1);
        assert!(in_collection.contains_key(&key("cities/sf")));
        assert!(cache.overlays_for_collection(&collection, 3).is_empty());
    }

    #[tokio::test]
    async fn removal_skips_rewritten_overlays() {
        let persistence = MemoryPersistence::new();
        let cache = MemoryOverlayCache::new();
        persistence
            .run_transaction("save", |txn| {
                let mut first = BTreeMap::new();
                first.insert(key("cities/sf"), Some(set_mutation("cities/sf")));
                cache.save_overlays(txn, 1, first);
                let mut second = BTreeMap::new();
                second.insert(key("cities/la"), Some(set_mutation("cities/la")));
                cache.save_overlays(txn, 2, second);
                cache.remove_overlays_for_batch_id(
                    txn,
                    [key("cities/sf"), key("cities/la")],
                    1,
                );
                Ok(())
            })
            .await
            .unwrap();
        assert!(cache.overlay(&key("cities/sf")).is_none());
        assert!(cache.overlay(&key("cities/la")).is_some());
    }
}
