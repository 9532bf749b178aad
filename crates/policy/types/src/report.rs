//! Validation report: accumulated diagnostics, never thrown
//!
//! Validation walks the definition tree collecting problems instead of
//! failing on the first one. A structurally unusable definition (not an
//! object at all) short-circuits to `is_bad_policy` without any records.

use crate::definition::BlockId;
use serde::{Deserialize, Serialize};

/// Diagnostics for one block in the tree
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BlockValidationRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<BlockId>,
    #[serde(rename = "blockType")]
    pub block_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// The accumulated result of validating one policy definition
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Set when the definition is not even a tree; no other fields are
    /// populated in that case
    #[serde(rename = "isBadPolicy", default, skip_serializing_if = "std::ops::Not::not")]
    pub is_bad_policy: bool,
    /// Policy-level problems (build failures, permission diagnostics)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    /// Per-block self-check results
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<BlockValidationRecord>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report for a definition that is not an object at all
    pub fn bad_policy() -> Self {
        Self {
            is_bad_policy: true,
            ..Self::default()
        }
    }

    /// Record a policy-level error
    pub fn add_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    /// Record an error against a specific block, creating its record on
    /// first use
    pub fn add_block_error(
        &mut self,
        id: Option<BlockId>,
        block_type: &str,
        tag: Option<&str>,
        message: impl Into<String>,
    ) {
        let index = match self
            .blocks
            .iter()
            .position(|r| r.id == id && r.block_type == block_type)
        {
            Some(index) => index,
            None => {
                self.blocks.push(BlockValidationRecord {
                    id,
                    block_type: block_type.to_string(),
                    tag: tag.map(String::from),
                    errors: Vec::new(),
                });
                self.blocks.len() - 1
            }
        };
        self.blocks[index].errors.push(message.into());
    }

    /// True when nothing was recorded
    pub fn is_valid(&self) -> bool {
        !self.is_bad_policy
            && self.errors.is_empty()
            && self.blocks.iter().all(|b| b.errors.is_empty())
    }
}
