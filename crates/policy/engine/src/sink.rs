//! Outbound notification surface
//!
//! The engine pushes two kinds of notifications to the embedding process:
//! coalesced block-update sets (one per user per debounce window) and
//! block error reports. Embedders implement [`UpdateSink`] to forward
//! them to their transport of choice.

use async_trait::async_trait;
use policy_types::{BlockId, PolicyId, PolicyUser};

/// Receiver for engine-originated notifications
#[async_trait]
pub trait UpdateSink: Send + Sync {
    /// A coalesced, ancestor-reduced set of blocks whose data changed
    /// for one user
    async fn block_update(&self, policy_id: &PolicyId, user: &PolicyUser, blocks: Vec<BlockId>);

    /// A block action failed for one user
    async fn block_error(
        &self,
        policy_id: &PolicyId,
        user: &PolicyUser,
        block_type: &str,
        message: &str,
    );
}

/// Sink that drops everything; useful for validation-only engines
#[derive(Clone, Copy, Debug, Default)]
pub struct NullUpdateSink;

#[async_trait]
impl UpdateSink for NullUpdateSink {
    async fn block_update(&self, _policy_id: &PolicyId, _user: &PolicyUser, _blocks: Vec<BlockId>) {}

    async fn block_error(
        &self,
        policy_id: &PolicyId,
        user: &PolicyUser,
        block_type: &str,
        message: &str,
    ) {
        tracing::warn!(
            policy_id = %policy_id,
            user = %user.id(),
            block_type,
            message,
            "block error dropped (null sink)"
        );
    }
}
