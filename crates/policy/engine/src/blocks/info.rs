//! Info: static display content, no actions

use crate::behavior::{BlockBehavior, BlockRef};
use async_trait::async_trait;
use policy_types::{PolicyResult, PolicyUser};
use serde_json::Value;

/// Read-only display block; its rendered data is just the options bag
pub struct InfoBehavior;

#[async_trait]
impl BlockBehavior for InfoBehavior {
    fn kind(&self) -> &'static str {
        "info"
    }

    async fn get_data(&self, block: BlockRef<'_>, _user: &PolicyUser) -> PolicyResult<Value> {
        let mut data = block.base_data();
        for key in ["title", "description", "type"] {
            if let Some(value) = block.options().get(key) {
                data[key] = value.clone();
            }
        }
        Ok(data)
    }
}
