//! Request: accepts a document from a user and pushes it downstream
//!
//! The only built-in block with a write path. Submissions are exclusive
//! per user: a second submit while the first is in flight fails fast
//! instead of queueing. Accepted documents are persisted and emitted over
//! the Run output with owner attribution, so downstream actor rules can
//! re-address the event.

use crate::behavior::{BlockBehavior, BlockRef, SetDataConcurrency};
use crate::block::BlockRuntime;
use async_trait::async_trait;
use chrono::Utc;
use policy_types::{
    PolicyError, PolicyOutputEvent, PolicyResult, PolicyUser, ValidationReport,
};
use serde_json::{json, Value};

/// Data intake block
pub struct RequestBehavior;

#[async_trait]
impl BlockBehavior for RequestBehavior {
    fn kind(&self) -> &'static str {
        "request"
    }

    fn concurrency(&self) -> SetDataConcurrency {
        SetDataConcurrency::Exclusive
    }

    async fn get_data(&self, block: BlockRef<'_>, user: &PolicyUser) -> PolicyResult<Value> {
        let mut data = block.base_data();
        if let Some(schema) = block.options().get("schema") {
            data["schema"] = schema.clone();
        }
        if let Some(preset) = block.options().get("preset") {
            data["preset"] = preset.clone();
        }
        let documents = block
            .store()
            .documents(block.policy_id(), block.uuid())
            .await?;
        let own: Vec<Value> = documents
            .into_iter()
            .filter(|doc| doc.get("owner").and_then(Value::as_str) == Some(user.did.as_str()))
            .collect();
        data["documents"] = Value::Array(own);
        Ok(data)
    }

    async fn set_data(
        &self,
        block: BlockRef<'_>,
        user: &PolicyUser,
        data: Value,
    ) -> PolicyResult<Value> {
        if !data.is_object() {
            return Err(PolicyError::action(
                "submitted data must be an object",
                self.kind(),
                block.uuid().clone(),
            ));
        }

        let mut document = json!({
            "owner": user.did,
            "document": data,
            "submitted": Utc::now().to_rfc3339(),
        });
        if let Some(group) = &user.group {
            document["group"] = json!(group);
            // Owner of the active group, for group-owner actor rules
            let groups = block
                .store()
                .groups_for_user(block.policy_id(), &user.did)
                .await?;
            if let Some(active) = groups.iter().find(|g| g.uuid == *group) {
                document["group_owner"] = json!(active.owner);
            }
        }

        block
            .store()
            .save_document(block.policy_id(), block.uuid(), document.clone())
            .await?;
        block.update(user).await?;
        block
            .trigger(PolicyOutputEvent::Run, user, document.clone())
            .await;
        Ok(document)
    }

    fn validate(&self, block: &BlockRuntime, report: &mut ValidationReport) {
        if block
            .options
            .get("schema")
            .and_then(Value::as_str)
            .map(str::is_empty)
            .unwrap_or(true)
        {
            report.add_block_error(
                Some(block.uuid.clone()),
                &block.block_type,
                block.tag.as_deref(),
                "option \"schema\" is required",
            );
        }
    }
}
