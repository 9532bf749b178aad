//! Module: a reusable sub-tree with its own variable scope
//!
//! Wiring from outside a module never reaches its internals directly:
//! links targeting a module are rewritten to its catch-all input, and the
//! module fans the event out over its own declared wiring. Variables the
//! module declares are substituted into descendant options at build time.

use crate::behavior::{BlockBehavior, BlockRef};
use async_trait::async_trait;
use policy_types::{BlockEvent, PolicyInputEvent, PolicyOutputEvent, PolicyResult, PolicyUser};
use serde_json::{json, Value};

/// Composition boundary: receives outer events on its catch-all input
/// and re-emits them over its inner wiring
pub struct ModuleBehavior;

#[async_trait]
impl BlockBehavior for ModuleBehavior {
    fn kind(&self) -> &'static str {
        "module"
    }

    fn is_container(&self) -> bool {
        true
    }

    fn accepted_inputs(&self) -> Vec<PolicyInputEvent> {
        vec![
            PolicyInputEvent::Run,
            PolicyInputEvent::Refresh,
            PolicyInputEvent::Module,
        ]
    }

    async fn get_data(&self, block: BlockRef<'_>, user: &PolicyUser) -> PolicyResult<Value> {
        let mut data = block.base_data();
        let children: Vec<Value> = block
            .children()
            .iter()
            .filter(|child| child.is_available(block.components, user))
            .map(|child| json!({ "id": child.uuid, "blockType": child.block_type }))
            .collect();
        data["blocks"] = Value::Array(children);
        Ok(data)
    }

    async fn handle(&self, block: BlockRef<'_>, event: &BlockEvent) -> PolicyResult<()> {
        match event.input {
            PolicyInputEvent::Module => {
                block
                    .trigger(PolicyOutputEvent::Module, &event.user, event.data.clone())
                    .await;
                Ok(())
            }
            PolicyInputEvent::Refresh => block.update(&event.user).await,
            _ => Ok(()),
        }
    }
}
