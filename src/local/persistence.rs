use std::cell::Cell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_lock::Mutex as AsyncMutex;
use log::debug;

use crate::error::{failed_precondition, primary_lease_lost, EngineResult};
use crate::local::index_manager::MemoryIndexManager;
use crate::local::mutation_queue::MemoryMutationQueue;
use crate::local::overlay_cache::MemoryOverlayCache;
use crate::local::remote_document_cache::MemoryRemoteDocumentCache;
use crate::local::target_cache::MemoryTargetCache;
use crate::tabs::InMemoryLeaseStore;

/// Bumped whenever the persisted layout changes shape.
pub const SCHEMA_VERSION: u32 = 1;

/// The identity mutation queues and overlays are partitioned by.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct User(Option<String>);

impl User {
    pub fn unauthenticated() -> Self {
        User(None)
    }

    pub fn new(uid: impl Into<String>) -> Self {
        User(Some(uid.into()))
    }

    pub fn is_authenticated(&self) -> bool {
        self.0.is_some()
    }

    pub fn uid(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

#[derive(Debug)]
struct GlobalState {
    schema_version: u32,
    highest_sequence_number: i64,
}

/// One serialized unit of persisted work. The sequence number is assigned
/// lazily on first use and stays fixed for the transaction's lifetime.
pub struct PersistenceTransaction {
    label: &'static str,
    sequence: Cell<Option<i64>>,
    globals: Arc<Mutex<GlobalState>>,
}

impl PersistenceTransaction {
    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn sequence_number(&self) -> i64 {
        if let Some(assigned) = self.sequence.get() {
            return assigned;
        }
        let mut globals = self.globals.lock().unwrap();
        globals.highest_sequence_number += 1;
        let assigned = globals.highest_sequence_number;
        self.sequence.set(Some(assigned));
        assigned
    }
}

/// In-memory transactional store backing every local component.
///
/// A single async mutex serializes transactions (single writer); the
/// component caches use short `std::sync::Mutex` sections internally so
/// they can be shared by `Arc` and read outside transactions.
pub struct MemoryPersistence {
    txn_lock: AsyncMutex<()>,
    started: AtomicBool,
    globals: Arc<Mutex<GlobalState>>,
    mutation_queues: Mutex<BTreeMap<User, Arc<MemoryMutationQueue>>>,
    overlay_caches: Mutex<BTreeMap<User, Arc<MemoryOverlayCache>>>,
    remote_documents: Arc<MemoryRemoteDocumentCache>,
    target_cache: Arc<MemoryTargetCache>,
    index_manager: Arc<MemoryIndexManager>,
    lease_store: Arc<InMemoryLeaseStore>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::with_stored_schema(SCHEMA_VERSION).unwrap_or_else(|_| unreachable!())
    }

    /// Opens against a store previously written at `stored` schema version.
    /// A store written by a newer build is unreadable.
    pub fn with_stored_schema(stored: u32) -> EngineResult<Self> {
        if stored > SCHEMA_VERSION {
            return Err(failed_precondition(format!(
                "store was written by a newer client (schema {stored} > {SCHEMA_VERSION})"
            )));
        }
        Ok(Self {
            txn_lock: AsyncMutex::new(()),
            started: AtomicBool::new(true),
            globals: Arc::new(Mutex::new(GlobalState {
                schema_version: SCHEMA_VERSION,
                highest_sequence_number: 0,
            })),
            mutation_queues: Mutex::new(BTreeMap::new()),
            overlay_caches: Mutex::new(BTreeMap::new()),
            remote_documents: Arc::new(MemoryRemoteDocumentCache::new()),
            target_cache: Arc::new(MemoryTargetCache::new()),
            index_manager: Arc::new(MemoryIndexManager::new()),
            lease_store: InMemoryLeaseStore::new(),
        })
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn shutdown(&self) {
        self.started.store(false, Ordering::Release);
    }

    pub fn schema_version(&self) -> u32 {
        self.globals.lock().unwrap().schema_version
    }

    pub fn highest_sequence_number(&self) -> i64 {
        self.globals.lock().unwrap().highest_sequence_number
    }

    pub fn mutation_queue(&self, user: &User) -> Arc<MemoryMutationQueue> {
        let mut queues = self.mutation_queues.lock().unwrap();
        queues
            .entry(user.clone())
            .or_insert_with(|| Arc::new(MemoryMutationQueue::new()))
            .clone()
    }

    pub fn overlay_cache(&self, user: &User) -> Arc<MemoryOverlayCache> {
        let mut caches = self.overlay_caches.lock().unwrap();
        caches
            .entry(user.clone())
            .or_insert_with(|| Arc::new(MemoryOverlayCache::new()))
            .clone()
    }

    pub fn remote_document_cache(&self) -> Arc<MemoryRemoteDocumentCache> {
        self.remote_documents.clone()
    }

    pub fn target_cache(&self) -> Arc<MemoryTargetCache> {
        self.target_cache.clone()
    }

    pub fn index_manager(&self) -> Arc<MemoryIndexManager> {
        self.index_manager.clone()
    }

    /// The primary-lease record shared by every engine instance opened
    /// against this store.
    pub fn lease_store(&self) -> Arc<InMemoryLeaseStore> {
        self.lease_store.clone()
    }

    /// Runs `f` as one serialized transaction. A store shut down after a
    /// lease handoff refuses further transactions; callers treat the error
    /// as a retryable no-op.
    pub async fn run_transaction<T>(
        &self,
        label: &'static str,
        f: impl FnOnce(&PersistenceTransaction) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let _guard = self.txn_lock.lock().await;
        if !self.is_started() {
            return Err(primary_lease_lost());
        }
        debug!("starting transaction {label}");
        let txn = PersistenceTransaction {
            label,
            sequence: Cell::new(None),
            globals: self.globals.clone(),
        };
        f(&txn)
    }
}

impl Default for MemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transaction_sequence_number_is_stable_and_monotonic() {
        let persistence = MemoryPersistence::new();
        let first = persistence
            .run_transaction("first", |txn| {
                let a = txn.sequence_number();
                let b = txn.sequence_number();
                assert_eq!(a, b);
                Ok(a)
            })
            .await
            .unwrap();
        let second = persistence
            .run_transaction("second", |txn| Ok(txn.sequence_number()))
            .await
            .unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn transactions_fail_after_shutdown() {
        let persistence = MemoryPersistence::new();
        persistence.shutdown();
        let err = persistence
            .run_transaction("after shutdown", |_txn| Ok(()))
            .await
            .unwrap_err();
        assert!(crate::error::is_primary_lease_lost(&err));
    }

    #[test]
    fn newer_schema_is_rejected() {
        let result = MemoryPersistence::with_stored_schema(SCHEMA_VERSION + 1);
        assert!(result.is_err());
    }

    #[test]
    fn lease_store_is_shared_by_the_whole_store() {
        let persistence = MemoryPersistence::new();
        assert!(Arc::ptr_eq(
            &persistence.lease_store(),
            &persistence.lease_store()
        ));
    }

    #[test]
    fn mutation_queues_are_partitioned_by_user() {
        let persistence = MemoryPersistence::new();
        let a = persistence.mutation_queue(&User::new("a"));
        let b = persistence.mutation_queue(&User::new("b"));
        assert!(!Arc::ptr_eq(&a, &b));
        let a_again = persistence.mutation_queue(&User::new("a"));
        assert!(Arc::ptr_eq(&a, &a_again));
    }
}
