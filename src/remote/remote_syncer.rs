use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::error::{EngineError, EngineResult};
use crate::local::TargetData;
use crate::model::DocumentKey;
use crate::mutation::{MutationBatch, MutationBatchResult};
use crate::remote::online_state::OnlineState;
use crate::remote::remote_event::RemoteEvent;

/// Bridge between the remote store and the synchronization engine.
///
/// The sync engine implements this; the remote store calls it for every
/// consequence of stream traffic. The two synchronous accessors exist
/// because the watch change aggregator consults them in the middle of
/// processing a message.
#[async_trait]
pub trait RemoteSyncer: Send + Sync + 'static {
    /// Applies a consistent snapshot produced by the watch stream.
    async fn apply_remote_event(&self, event: RemoteEvent) -> EngineResult<()>;

    /// The backend rejected a listen; only that target's listeners hear
    /// about it.
    async fn reject_listen(&self, target_id: i32, error: EngineError) -> EngineResult<()>;

    /// A mutation batch was committed.
    async fn apply_successful_write(&self, result: MutationBatchResult) -> EngineResult<()>;

    /// A mutation batch was permanently rejected.
    async fn reject_failed_write(&self, batch_id: i32, error: EngineError) -> EngineResult<()>;

    /// Documents the server has confirmed for a target, per the local cache.
    fn get_remote_keys_for_target(&self, target_id: i32) -> BTreeSet<DocumentKey>;

    /// Metadata for an allocated target, `None` once it is released.
    fn get_target_data(&self, target_id: i32) -> Option<TargetData>;

    /// Next batch to send, strictly after `after_batch_id`.
    async fn next_mutation_batch(&self, after_batch_id: i32)
        -> EngineResult<Option<MutationBatch>>;

    /// Watch stream health changed.
    async fn handle_online_state_change(&self, _state: OnlineState) {}

    /// Auth credentials changed; streams are about to restart.
    async fn handle_credential_change(&self) -> EngineResult<()> {
        Ok(())
    }
}
