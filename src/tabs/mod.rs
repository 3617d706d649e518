//! Cross-instance coordination for a shared persisted store.
//!
//! Several client instances may open the same cache. Exactly one of them,
//! the primary, holds network streams and runs garbage collection; the
//! rest observe its progress over a broadcast bus and promote themselves
//! only after the primary's lease goes stale.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{unavailable, EngineError, EngineResult};
use crate::model::Timestamp;
use crate::util::runtime;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(4);
pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(10);

/// The persisted record naming the current primary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PrimaryLease {
    pub owner_id: String,
    pub lease_timestamp: Timestamp,
}

/// Storage for the lease record, shared by all instances of one cache.
pub trait PrimaryLeaseStore: Send + Sync + 'static {
    fn read(&self) -> EngineResult<Option<PrimaryLease>>;
    fn write(&self, lease: PrimaryLease) -> EngineResult<()>;
    fn clear_if_owned_by(&self, owner_id: &str) -> EngineResult<()>;
}

/// Lease store for instances sharing one process.
#[derive(Default)]
pub struct InMemoryLeaseStore {
    lease: Mutex<Option<PrimaryLease>>,
    failing: AtomicBool,
}

impl InMemoryLeaseStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes every operation fail, simulating a wedged persistence layer.
    pub fn fail_operations(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> EngineResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(unavailable("lease store unavailable"))
        } else {
            Ok(())
        }
    }
}

impl PrimaryLeaseStore for InMemoryLeaseStore {
    fn read(&self) -> EngineResult<Option<PrimaryLease>> {
        self.check()?;
        Ok(self.lease.lock().unwrap().clone())
    }

    fn write(&self, lease: PrimaryLease) -> EngineResult<()> {
        self.check()?;
        *self.lease.lock().unwrap() = Some(lease);
        Ok(())
    }

    fn clear_if_owned_by(&self, owner_id: &str) -> EngineResult<()> {
        self.check()?;
        let mut lease = self.lease.lock().unwrap();
        if lease.as_ref().map(|l| l.owner_id.as_str()) == Some(owner_id) {
            *lease = None;
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub enum MutationBatchState {
    Pending,
    Acknowledged,
    Rejected(EngineError),
}

#[derive(Clone, Debug)]
pub enum QueryTargetState {
    NotCurrent,
    Current,
    Rejected(EngineError),
}

/// Everything one instance tells the others.
#[derive(Clone, Debug)]
pub enum ClientStateMessage {
    Heartbeat {
        client_id: String,
        timestamp: Timestamp,
    },
    MutationBatch {
        client_id: String,
        batch_id: i32,
        state: MutationBatchState,
    },
    Target {
        client_id: String,
        target_id: i32,
        state: QueryTargetState,
    },
    PrimaryLeaseReleased {
        client_id: String,
    },
}

impl ClientStateMessage {
    pub fn client_id(&self) -> &str {
        match self {
            ClientStateMessage::Heartbeat { client_id, .. }
            | ClientStateMessage::MutationBatch { client_id, .. }
            | ClientStateMessage::Target { client_id, .. }
            | ClientStateMessage::PrimaryLeaseReleased { client_id } => client_id,
        }
    }
}

/// Eventually-delivered broadcast channel between instances. Delivery may
/// lag but messages from one sender are never reordered.
pub trait ClientStateBus: Send + Sync + 'static {
    fn publish(&self, message: ClientStateMessage);
    fn subscribe(&self) -> async_channel::Receiver<ClientStateMessage>;
}

#[derive(Default)]
pub struct InMemoryClientStateBus {
    subscribers: Mutex<Vec<async_channel::Sender<ClientStateMessage>>>,
}

impl InMemoryClientStateBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl ClientStateBus for InMemoryClientStateBus {
    fn publish(&self, message: ClientStateMessage) {
        self.subscribers
            .lock()
            .unwrap()
            .retain(|subscriber| subscriber.try_send(message.clone()).is_ok());
    }

    fn subscribe(&self) -> async_channel::Receiver<ClientStateMessage> {
        let (tx, rx) = async_channel::unbounded();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }
}

pub type PrimaryStateCallback = dyn Fn(bool) + Send + Sync;

struct InstanceState {
    is_primary: bool,
    /// Set once this instance failed to refresh shared state; a zombied
    /// instance never promotes itself because it cannot prove the lease is
    /// actually stale.
    zombied: bool,
    last_seen: BTreeMap<String, Timestamp>,
}

/// One instance's view of the shared client state, plus the lease protocol.
pub struct SharedClientState {
    client_id: String,
    bus: Arc<dyn ClientStateBus>,
    lease_store: Arc<dyn PrimaryLeaseStore>,
    heartbeat_interval: Duration,
    lease_timeout: Duration,
    state: Mutex<InstanceState>,
    primary_callback: Mutex<Option<Arc<PrimaryStateCallback>>>,
    generation: AtomicU64,
}

impl SharedClientState {
    pub fn new(bus: Arc<dyn ClientStateBus>, lease_store: Arc<dyn PrimaryLeaseStore>) -> Arc<Self> {
        Self::with_timing(
            bus,
            lease_store,
            DEFAULT_HEARTBEAT_INTERVAL,
            DEFAULT_LEASE_TIMEOUT,
        )
    }

    pub fn with_timing(
        bus: Arc<dyn ClientStateBus>,
        lease_store: Arc<dyn PrimaryLeaseStore>,
        heartbeat_interval: Duration,
        lease_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            client_id: generate_client_id(),
            bus,
            lease_store,
            heartbeat_interval,
            lease_timeout,
            state: Mutex::new(InstanceState {
                is_primary: false,
                zombied: false,
                last_seen: BTreeMap::new(),
            }),
            primary_callback: Mutex::new(None),
            generation: AtomicU64::new(0),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn is_primary(&self) -> bool {
        self.state.lock().unwrap().is_primary
    }

    pub fn is_zombied(&self) -> bool {
        self.state.lock().unwrap().zombied
    }

    /// Clients whose heartbeat arrived within one lease timeout.
    pub fn active_clients(&self) -> Vec<String> {
        let now = Timestamp::now();
        let state = self.state.lock().unwrap();
        state
            .last_seen
            .iter()
            .filter(|(_, seen)| elapsed(**seen, now) <= self.lease_timeout)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn set_primary_state_callback(&self, callback: Arc<PrimaryStateCallback>) {
        *self.primary_callback.lock().unwrap() = Some(callback);
    }

    /// Messages from other instances. Heartbeats are tracked internally and
    /// also forwarded here.
    pub fn messages(&self) -> async_channel::Receiver<ClientStateMessage> {
        self.bus.subscribe()
    }

    /// Runs one immediate lease attempt, then heartbeats on the configured
    /// interval until [`SharedClientState::shutdown`].
    pub fn start(self: &Arc<Self>) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.tick();

        let heartbeats = Arc::clone(self);
        runtime::spawn_detached(async move {
            loop {
                runtime::sleep(heartbeats.heartbeat_interval).await;
                if heartbeats.generation.load(Ordering::SeqCst) != generation {
                    break;
                }
                heartbeats.tick();
            }
        });

        let tracker = Arc::clone(self);
        let inbox = self.bus.subscribe();
        runtime::spawn_detached(async move {
            while let Ok(message) = inbox.recv().await {
                if tracker.generation.load(Ordering::SeqCst) != generation {
                    break;
                }
                tracker.observe(message);
            }
        });
    }

    /// Stops heartbeating and, when primary, releases the lease so another
    /// instance can take over without waiting out the timeout.
    pub fn shutdown(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let was_primary = self.set_primary(false);
        if was_primary {
            if let Err(error) = self.lease_store.clear_if_owned_by(&self.client_id) {
                warn!("failed to release primary lease: {error}");
            }
            self.bus.publish(ClientStateMessage::PrimaryLeaseReleased {
                client_id: self.client_id.clone(),
            });
        }
    }

    /// One heartbeat: publish liveness, then renew or try to take the lease.
    /// Public so tests can drive the protocol without timers.
    pub fn tick(&self) {
        let now = Timestamp::now();
        self.bus.publish(ClientStateMessage::Heartbeat {
            client_id: self.client_id.clone(),
            timestamp: now,
        });

        let (is_primary, zombied) = {
            let state = self.state.lock().unwrap();
            (state.is_primary, state.zombied)
        };
        if zombied {
            return;
        }
        if is_primary {
            self.renew_lease(now);
        } else {
            self.try_become_primary(now);
        }
    }

    pub fn notify_mutation_batch(&self, batch_id: i32, state: MutationBatchState) {
        self.bus.publish(ClientStateMessage::MutationBatch {
            client_id: self.client_id.clone(),
            batch_id,
            state,
        });
    }

    pub fn notify_target_state(&self, target_id: i32, state: QueryTargetState) {
        self.bus.publish(ClientStateMessage::Target {
            client_id: self.client_id.clone(),
            target_id,
            state,
        });
    }

    fn observe(&self, message: ClientStateMessage) {
        if let ClientStateMessage::Heartbeat {
            client_id,
            timestamp,
        } = message
        {
            self.state
                .lock()
                .unwrap()
                .last_seen
                .insert(client_id, timestamp);
        }
    }

    fn renew_lease(&self, now: Timestamp) {
        match self.lease_store.read() {
            Ok(Some(lease)) if lease.owner_id != self.client_id => {
                // Someone else holds the record. Demote rather than fight.
                warn!(
                    "client {} lost the primary lease to {}",
                    self.client_id, lease.owner_id
                );
                self.set_primary(false);
            }
            Ok(_) => {
                let renewed = self.lease_store.write(PrimaryLease {
                    owner_id: self.client_id.clone(),
                    lease_timestamp: now,
                });
                if let Err(error) = renewed {
                    warn!("client {} failed to renew lease: {error}", self.client_id);
                    self.mark_zombied();
                }
            }
            Err(error) => {
                warn!("client {} cannot read lease: {error}", self.client_id);
                self.mark_zombied();
            }
        }
    }

    fn try_become_primary(&self, now: Timestamp) {
        let lease = match self.lease_store.read() {
            Ok(lease) => lease,
            Err(error) => {
                warn!("client {} cannot read lease: {error}", self.client_id);
                self.mark_zombied();
                return;
            }
        };
        let available = match &lease {
            None => true,
            Some(lease) => {
                lease.owner_id == self.client_id || elapsed(lease.lease_timestamp, now) > self.lease_timeout
            }
        };
        if !available {
            return;
        }
        let acquired = self.lease_store.write(PrimaryLease {
            owner_id: self.client_id.clone(),
            lease_timestamp: now,
        });
        match acquired {
            Ok(()) => {
                info!("client {} acquired the primary lease", self.client_id);
                self.set_primary(true);
            }
            Err(error) => {
                // Failed acquisition is not fatal; stay secondary.
                debug!(
                    "client {} failed to acquire the lease: {error}",
                    self.client_id
                );
            }
        }
    }

    fn mark_zombied(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.zombied = true;
        }
        self.set_primary(false);
    }

    /// Returns whether the instance was primary before the change.
    fn set_primary(&self, is_primary: bool) -> bool {
        let was_primary = {
            let mut state = self.state.lock().unwrap();
            let was = state.is_primary;
            state.is_primary = is_primary;
            was
        };
        if was_primary != is_primary {
            if let Some(callback) = self.primary_callback.lock().unwrap().clone() {
                callback(is_primary);
            }
        }
        was_primary
    }
}

fn elapsed(from: Timestamp, to: Timestamp) -> Duration {
    let seconds = to.seconds - from.seconds;
    let nanos = i64::from(to.nanos) - i64::from(from.nanos);
    let total_nanos = seconds * 1_000_000_000 + nanos;
    if total_nanos <= 0 {
        Duration::ZERO
    } else {
        Duration::from_nanos(total_nanos as u64)
    }
}

fn generate_client_id() -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..20)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(
        bus: &Arc<InMemoryClientStateBus>,
        store: &Arc<InMemoryLeaseStore>,
    ) -> Arc<SharedClientState> {
        SharedClientState::with_timing(
            bus.clone() as Arc<dyn ClientStateBus>,
            store.clone() as Arc<dyn PrimaryLeaseStore>,
            Duration::from_millis(10),
            Duration::from_secs(10),
        )
    }

    #[tokio::test]
    async fn first_instance_acquires_the_lease() {
        let bus = InMemoryClientStateBus::new();
        let store = InMemoryLeaseStore::new();
        let a = instance(&bus, &store);
        a.tick();
        assert!(a.is_primary());
    }

    #[tokio::test]
    async fn second_instance_stays_secondary_while_the_lease_is_fresh() {
        let bus = InMemoryClientStateBus::new();
        let store = InMemoryLeaseStore::new();
        let a = instance(&bus, &store);
        let b = instance(&bus, &store);
        a.tick();
        b.tick();
        assert!(a.is_primary());
        assert!(!b.is_primary());

        // Repeated rounds never produce two primaries.
        for _ in 0..5 {
            a.tick();
            b.tick();
            assert!(!(a.is_primary() && b.is_primary()));
        }
    }

    #[tokio::test]
    async fn secondary_promotes_after_the_lease_goes_stale() {
        let bus = InMemoryClientStateBus::new();
        let store = InMemoryLeaseStore::new();
        store
            .write(PrimaryLease {
                owner_id: "departed".into(),
                lease_timestamp: Timestamp::new(1, 0),
            })
            .unwrap();

        let b = instance(&bus, &store);
        b.tick();
        assert!(b.is_primary());
        assert_eq!(
            store.read().unwrap().unwrap().owner_id,
            b.client_id().to_string()
        );
    }

    #[tokio::test]
    async fn failed_renewal_zombies_the_primary() {
        let bus = InMemoryClientStateBus::new();
        let store = InMemoryLeaseStore::new();
        let a = instance(&bus, &store);
        a.tick();
        assert!(a.is_primary());

        store.fail_operations(true);
        a.tick();
        assert!(!a.is_primary());
        assert!(a.is_zombied());

        // A zombied instance must not promote itself even after the store
        // recovers.
        store.fail_operations(false);
        a.tick();
        assert!(!a.is_primary());
    }

    #[tokio::test]
    async fn shutdown_releases_the_lease_immediately() {
        let bus = InMemoryClientStateBus::new();
        let store = InMemoryLeaseStore::new();
        let a = instance(&bus, &store);
        let b = instance(&bus, &store);
        a.tick();
        assert!(a.is_primary());

        a.shutdown();
        b.tick();
        assert!(b.is_primary());
    }

    #[tokio::test]
    async fn mutation_state_broadcasts_reach_other_instances() {
        let bus = InMemoryClientStateBus::new();
        let store = InMemoryLeaseStore::new();
        let a = instance(&bus, &store);
        let b = instance(&bus, &store);
        let inbox = b.messages();

        a.notify_mutation_batch(7, MutationBatchState::Acknowledged);
        let message = inbox.recv().await.unwrap();
        match message {
            ClientStateMessage::MutationBatch {
                client_id,
                batch_id,
                state: MutationBatchState::Acknowledged,
            } => {
                assert_eq!(client_id, a.client_id());
                assert_eq!(batch_id, 7);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn primary_state_callback_fires_on_transitions() {
        let bus = InMemoryClientStateBus::new();
        let store = InMemoryLeaseStore::new();
        let a = instance(&bus, &store);
        let transitions = Arc::new(Mutex::new(Vec::new()));
        let sink = transitions.clone();
        a.set_primary_state_callback(Arc::new(move |is_primary| {
            sink.lock().unwrap().push(is_primary);
        }));

        a.tick();
        a.shutdown();
        assert_eq!(*transitions.lock().unwrap(), vec![true, false]);
    }
}
