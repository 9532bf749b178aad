//! Container: groups children and renders the ones the user may see

use crate::behavior::{BlockBehavior, BlockRef};
use async_trait::async_trait;
use policy_types::{PolicyResult, PolicyUser};
use serde_json::{json, Value};

/// Plain grouping block. Children render in declaration order, filtered
/// to what the acting user may reach.
pub struct ContainerBehavior;

#[async_trait]
impl BlockBehavior for ContainerBehavior {
    fn kind(&self) -> &'static str {
        "container"
    }

    fn is_container(&self) -> bool {
        true
    }

    async fn get_data(&self, block: BlockRef<'_>, user: &PolicyUser) -> PolicyResult<Value> {
        let mut data = block.base_data();
        let children: Vec<Value> = block
            .children()
            .iter()
            .filter(|child| child.is_available(block.components, user))
            .map(|child| {
                json!({
                    "id": child.uuid,
                    "blockType": child.block_type,
                    "tag": child.tag,
                })
            })
            .collect();
        data["blocks"] = Value::Array(children);
        Ok(data)
    }
}
