use std::collections::BTreeSet;
use std::sync::Arc;

use log::debug;

use crate::local::mutation_queue::MemoryMutationQueue;
use crate::local::overlay_cache::MemoryOverlayCache;
use crate::local::persistence::PersistenceTransaction;
use crate::local::remote_document_cache::MemoryRemoteDocumentCache;
use crate::local::target_cache::MemoryTargetCache;

#[derive(Clone, Debug)]
pub struct LruParams {
    /// GC is skipped entirely while the cache stays under this size.
    pub cache_size_threshold_bytes: usize,
    /// Fraction of sequence numbers to expire per run.
    pub percentile_to_collect: f64,
    /// Hard cap on sequence numbers expired per run.
    pub maximum_sequence_numbers_to_collect: usize,
}

impl Default for LruParams {
    fn default() -> Self {
        Self {
            cache_size_threshold_bytes: 1024 * 1024,
            percentile_to_collect: 0.1,
            maximum_sequence_numbers_to_collect: 1000,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LruResults {
    pub did_run: bool,
    pub sequence_numbers_collected: usize,
    pub targets_removed: usize,
    pub documents_removed: usize,
}

/// Sequence-number LRU collection over targets and orphaned documents.
///
/// Safety: a document is never removed while any target references it, a
/// pending batch writes it, or an overlay is outstanding for it.
pub struct LruGarbageCollector {
    params: LruParams,
    target_cache: Arc<MemoryTargetCache>,
    remote_documents: Arc<MemoryRemoteDocumentCache>,
    mutation_queue: Arc<MemoryMutationQueue>,
    overlay_cache: Arc<MemoryOverlayCache>,
}

impl LruGarbageCollector {
    pub fn new(
        params: LruParams,
        target_cache: Arc<MemoryTargetCache>,
        remote_documents: Arc<MemoryRemoteDocumentCache>,
        mutation_queue: Arc<MemoryMutationQueue>,
        overlay_cache: Arc<MemoryOverlayCache>,
    ) -> Self {
        Self {
            params,
            target_cache,
            remote_documents,
            mutation_queue,
            overlay_cache,
        }
    }

    /// Runs one collection pass. Only the primary instance should call
    /// this; secondaries share the same persisted cache.
    pub fn collect(
        &self,
        txn: &PersistenceTransaction,
        active_target_ids: &BTreeSet<i32>,
    ) -> LruResults {
        let cache_size = self.remote_documents.approximate_byte_size();
        if cache_size < self.params.cache_size_threshold_bytes {
            debug!(
                "garbage collection skipped; cache size {cache_size} is under threshold {}",
                self.params.cache_size_threshold_bytes
            );
            return LruResults::default();
        }

        let mut sequence_numbers: Vec<i64> = Vec::new();
        self.target_cache
            .for_each_target(|data| sequence_numbers.push(data.sequence_number));
        for key in self.remote_documents.keys() {
            if !self.target_cache.contains_key(&key) && !self.mutation_queue.contains_key(&key) {
                sequence_numbers.push(self.target_cache.document_sequence_number(&key));
            }
        }
        sequence_numbers.sort_unstable();

        let to_collect = ((sequence_numbers.len() as f64 * self.params.percentile_to_collect)
            as usize)
            .min(self.params.maximum_sequence_numbers_to_collect);
        if to_collect == 0 {
            return LruResults {
                did_run: true,
                ..LruResults::default()
            };
        }
        let upper_bound = sequence_numbers[to_collect - 1];

        let targets_removed = self.target_cache.remove_targets_up_through_sequence_number(
            txn,
            upper_bound,
            active_target_ids,
        );

        let mut documents_removed = 0;
        for key in self.remote_documents.keys() {
            if self.target_cache.contains_key(&key)
                || self.mutation_queue.contains_key(&key)
                || self.overlay_cache.overlay(&key).is_some()
            {
                continue;
            }
            if self.target_cache.document_sequence_number(&key) <= upper_bound {
                self.remote_documents.remove(txn, &key);
                self.target_cache.remove_document_sequence_number(txn, &key);
                documents_removed += 1;
            }
        }

        debug!(
            "garbage collection removed {targets_removed} targets and {documents_removed} documents \
             at sequence bound {upper_bound}"
        );
        LruResults {
            did_run: true,
            sequence_numbers_collected: to_collect,
            targets_removed,
            documents_removed,
        }
    }
}
