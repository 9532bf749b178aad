//! Error types for the policy engine

use crate::definition::{BlockId, PolicyId};
use thiserror::Error;

/// Result alias used across the policy crates
pub type PolicyResult<T> = Result<T, PolicyError>;

/// Errors produced while building, wiring or running a policy
#[derive(Debug, Error)]
pub enum PolicyError {
    /// No factory registered for the definition's block type
    #[error("unknown block type '{0}'")]
    UnknownBlockType(String),

    /// Two blocks in one policy declared the same tag.
    /// Hard error: the build is aborted.
    #[error("block with tag '{0}' already exists")]
    DuplicateTag(String),

    /// The policy id is not registered
    #[error("policy '{0}' does not exist")]
    PolicyNotFound(PolicyId),

    /// No block registered under the given uuid
    #[error("block '{0}' not found")]
    BlockNotFound(BlockId),

    /// No block registered under the given tag
    #[error("no block with tag '{0}'")]
    TagNotFound(String),

    /// A block action failed. Recoverable: surfaced to the caller,
    /// never crashes the engine.
    #[error("block action failed in {block_type} ({block}): {message}")]
    BlockAction {
        message: String,
        block_type: String,
        block: BlockId,
    },

    /// A second set-data arrived for the same user while the first is
    /// still in flight on an exclusive block
    #[error("block {block_type} ({block}) is already processing a request for this user")]
    Busy { block_type: String, block: BlockId },

    /// The serialized definition is structurally unusable
    #[error("invalid policy definition: {0}")]
    BadDefinition(String),

    /// State/document store failure
    #[error("store error: {0}")]
    Store(String),
}

impl PolicyError {
    /// Recoverable block action failure with full attribution
    pub fn action(
        message: impl Into<String>,
        block_type: impl Into<String>,
        block: BlockId,
    ) -> Self {
        Self::BlockAction {
            message: message.into(),
            block_type: block_type.into(),
            block,
        }
    }

    /// True for failures the caller is expected to handle and retry
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::BlockAction { .. } | Self::Busy { .. })
    }
}
