//! Step: a wizard that exposes one active child per user at a time
//!
//! Each user has their own position. Running a child completes it and
//! advances the position; a Release event from the active child does the
//! same. Positions persist across engine restarts through the block state
//! store.

use crate::behavior::{BlockBehavior, BlockRef};
use crate::block::BlockRuntime;
use async_trait::async_trait;
use policy_types::{BlockEvent, BlockId, PolicyInputEvent, PolicyResult, PolicyUser};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Mutex;

/// Sequencing container: per-user cursor over its children
pub struct StepBehavior {
    /// Wrap to the first child after the last instead of stopping
    cyclic: bool,
    /// Composite user id → active child index
    positions: Mutex<HashMap<String, usize>>,
}

impl StepBehavior {
    pub fn from_options(options: &Value) -> Self {
        Self {
            cyclic: options
                .get("cyclic")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            positions: Mutex::new(HashMap::new()),
        }
    }

    fn position(&self, user: &PolicyUser) -> usize {
        self.positions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&user.id())
            .copied()
            .unwrap_or(0)
    }

    /// Move the user's cursor one past `from`, clamping at the last child
    /// unless the step is cyclic
    fn advance(&self, user: &PolicyUser, from: usize, child_count: usize) {
        if child_count == 0 {
            return;
        }
        let next = if from + 1 >= child_count {
            if self.cyclic {
                0
            } else {
                child_count - 1
            }
        } else {
            from + 1
        };
        self.positions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(user.id(), next);
    }
}

#[async_trait]
impl BlockBehavior for StepBehavior {
    fn kind(&self) -> &'static str {
        "step"
    }

    fn is_container(&self) -> bool {
        true
    }

    fn accepted_inputs(&self) -> Vec<PolicyInputEvent> {
        vec![
            PolicyInputEvent::Run,
            PolicyInputEvent::Refresh,
            PolicyInputEvent::Release,
        ]
    }

    fn is_child_active(&self, block: &BlockRuntime, child: &BlockRuntime, user: &PolicyUser) -> bool {
        match block.children.iter().position(|id| *id == child.uuid) {
            Some(index) => index == self.position(user),
            None => false,
        }
    }

    async fn get_data(&self, block: BlockRef<'_>, user: &PolicyUser) -> PolicyResult<Value> {
        let mut data = block.base_data();
        let index = self.position(user);
        data["index"] = json!(index);
        if let Some(active) = block.block.children.get(index) {
            data["activeBlock"] = json!(active);
        }
        Ok(data)
    }

    async fn handle(&self, block: BlockRef<'_>, event: &BlockEvent) -> PolicyResult<()> {
        match event.input {
            PolicyInputEvent::Release => {
                let from = self.position(&event.user);
                self.advance(&event.user, from, block.block.children.len());
                block.update(&event.user).await
            }
            PolicyInputEvent::Refresh => block.update(&event.user).await,
            _ => Ok(()),
        }
    }

    async fn child_ran(
        &self,
        block: BlockRef<'_>,
        user: &PolicyUser,
        child: &BlockId,
    ) -> PolicyResult<()> {
        if let Some(index) = block.block.children.iter().position(|id| id == child) {
            self.advance(user, index, block.block.children.len());
            block.update(user).await?;
        }
        Ok(())
    }

    fn state_fields(&self) -> Option<Value> {
        let positions = self.positions.lock().unwrap_or_else(|e| e.into_inner());
        Some(json!({ "positions": *positions }))
    }

    fn load_state(&self, state: &Value) {
        let Some(saved) = state.get("positions").and_then(Value::as_object) else {
            return;
        };
        let mut positions = self.positions.lock().unwrap_or_else(|e| e.into_inner());
        for (user, index) in saved {
            if let Some(index) = index.as_u64() {
                positions.insert(user.clone(), index as usize);
            }
        }
    }
}
