//! The behavior seam: what makes one block type different from another
//!
//! A [`BlockRuntime`] owns the structural machinery every block shares
//! (permissions, links, state persistence, broadcasts). Everything
//! type-specific lives behind [`BlockBehavior`]. Behaviors are created by
//! factories looked up in the [`BlockKindRegistry`] by the definition's
//! `blockType` string, so embedders can add their own kinds next to the
//! built-in structural ones.

use crate::block::BlockRuntime;
use crate::components::{PolicyComponents, PolicyInstance};
use crate::store::PolicyStore;
use async_trait::async_trait;
use policy_types::{
    BlockEvent, BlockId, PolicyError, PolicyId, PolicyInputEvent, PolicyOutputEvent, PolicyResult,
    PolicyUser, ValidationReport,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

// ── Block Reference ──────────────────────────────────────────────────

/// Borrowed view of a block inside its engine, handed to behavior hooks.
/// Cheap to copy; gives behaviors access to the runtime's shared
/// machinery without owning any of it.
#[derive(Clone, Copy)]
pub struct BlockRef<'a> {
    pub components: &'a Arc<PolicyComponents>,
    pub block: &'a BlockRuntime,
}

impl<'a> BlockRef<'a> {
    pub fn uuid(&self) -> &BlockId {
        &self.block.uuid
    }

    pub fn policy_id(&self) -> &PolicyId {
        &self.block.policy_id
    }

    pub fn options(&self) -> &Value {
        &self.block.options
    }

    pub fn store(&self) -> &Arc<dyn PolicyStore> {
        self.components.store()
    }

    pub fn policy(&self) -> Option<PolicyInstance> {
        self.components.policy(&self.block.policy_id)
    }

    /// Resolve this block's children to live instances, in declaration
    /// order. Children missing from the registry are skipped.
    pub fn children(&self) -> Vec<Arc<BlockRuntime>> {
        self.block
            .children
            .iter()
            .filter_map(|id| self.components.get_block(id))
            .collect()
    }

    pub fn is_available(&self, user: &PolicyUser) -> bool {
        self.block.is_available(self.components, user)
    }

    /// Persist state fields and mark this block dirty for everyone who
    /// can see it
    pub async fn update(&self, user: &PolicyUser) -> PolicyResult<()> {
        self.block.update_block(self.components, user).await
    }

    /// Emit an output event over this block's wired links
    pub async fn trigger(&self, output: PolicyOutputEvent, user: &PolicyUser, data: Value) {
        self.block
            .trigger_events(self.components, output, user, data)
            .await;
    }

    /// The data every block exposes regardless of type
    pub fn base_data(&self) -> Value {
        json!({
            "id": self.block.uuid,
            "blockType": self.block.block_type,
            "uiMetaData": self.block.options.get("uiMetaData").cloned().unwrap_or(Value::Null),
        })
    }
}

// ── Behavior Trait ───────────────────────────────────────────────────

/// How concurrent set-data calls from the same user are handled
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetDataConcurrency {
    /// Calls run concurrently; the behavior handles its own races
    Concurrent,
    /// One call per user at a time; overlapping calls fail fast with
    /// [`PolicyError::Busy`]
    Exclusive,
}

/// Type-specific logic of one block kind.
///
/// Implementations hold their own interior-mutable state (step positions,
/// caches); the runtime persists it through `state_fields`/`load_state`.
#[async_trait]
pub trait BlockBehavior: Send + Sync {
    /// The `blockType` string this behavior implements
    fn kind(&self) -> &'static str;

    /// Input event types this block registers handlers for. Links are
    /// only created toward inputs listed here.
    fn accepted_inputs(&self) -> Vec<PolicyInputEvent> {
        vec![PolicyInputEvent::Run, PolicyInputEvent::Refresh]
    }

    fn concurrency(&self) -> SetDataConcurrency {
        SetDataConcurrency::Concurrent
    }

    /// Container-class blocks receive default Refresh wiring from their
    /// children
    fn is_container(&self) -> bool {
        false
    }

    /// Phase-one init: runs after every block of the tree is registered,
    /// before any wiring exists
    async fn before_init(&self, block: BlockRef<'_>) -> PolicyResult<()> {
        let _ = block;
        Ok(())
    }

    /// Phase-two init: runs after persisted state was restored
    async fn after_init(&self, block: BlockRef<'_>) -> PolicyResult<()> {
        let _ = block;
        Ok(())
    }

    /// Render this block's data for one user
    async fn get_data(&self, block: BlockRef<'_>, user: &PolicyUser) -> PolicyResult<Value> {
        let _ = user;
        Ok(block.base_data())
    }

    /// Accept data from one user. The default rejects: most structural
    /// blocks are read-only.
    async fn set_data(
        &self,
        block: BlockRef<'_>,
        user: &PolicyUser,
        data: Value,
    ) -> PolicyResult<Value> {
        let _ = (user, data);
        Err(PolicyError::action(
            "block does not accept data",
            self.kind(),
            block.uuid().clone(),
        ))
    }

    /// React to an incoming wired event. The default re-renders on
    /// Refresh and ignores everything else.
    async fn handle(&self, block: BlockRef<'_>, event: &BlockEvent) -> PolicyResult<()> {
        if event.input == PolicyInputEvent::Refresh {
            block.update(&event.user).await?;
        }
        Ok(())
    }

    /// Self-check the block's options during validation. Runs on
    /// throwaway instances, so only the runtime's own fields are safe to
    /// read.
    fn validate(&self, block: &BlockRuntime, report: &mut ValidationReport) {
        let _ = (block, report);
    }

    /// Whether a direct child is active for the given user. Containers
    /// default to all-active; step blocks narrow this to one child.
    fn is_child_active(&self, block: &BlockRuntime, child: &BlockRuntime, user: &PolicyUser) -> bool {
        let _ = (block, child, user);
        true
    }

    /// State to persist after each update, if any
    fn state_fields(&self) -> Option<Value> {
        None
    }

    /// Restore state persisted by `state_fields`
    fn load_state(&self, state: &Value) {
        let _ = state;
    }

    /// Notification that a direct child ran its primary action; step
    /// blocks use this to track the active position
    async fn child_ran(
        &self,
        block: BlockRef<'_>,
        user: &PolicyUser,
        child: &BlockId,
    ) -> PolicyResult<()> {
        let _ = (block, user, child);
        Ok(())
    }
}

impl std::fmt::Debug for dyn BlockBehavior {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockBehavior")
            .field("kind", &self.kind())
            .finish()
    }
}

// ── Kind Registry ────────────────────────────────────────────────────

/// Factory producing one behavior instance from the block's resolved
/// options bag
pub type BehaviorFactory = Arc<dyn Fn(&Value) -> PolicyResult<Box<dyn BlockBehavior>> + Send + Sync>;

/// Maps `blockType` strings to behavior factories
pub struct BlockKindRegistry {
    factories: RwLock<HashMap<String, BehaviorFactory>>,
}

impl BlockKindRegistry {
    /// Empty registry with no kinds at all
    pub fn empty() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// Registry pre-loaded with the built-in structural kinds
    pub fn with_builtins() -> Self {
        let registry = Self::empty();
        crate::blocks::register_builtins(&registry);
        registry
    }

    /// Register (or replace) a kind
    pub fn register(&self, kind: impl Into<String>, factory: BehaviorFactory) {
        self.factories
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(kind.into(), factory);
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(kind)
    }

    /// Instantiate a behavior for a definition node
    pub fn create(&self, kind: &str, options: &Value) -> PolicyResult<Box<dyn BlockBehavior>> {
        let factory = {
            let factories = self.factories.read().unwrap_or_else(|e| e.into_inner());
            factories.get(kind).cloned()
        };
        match factory {
            Some(factory) => factory(options),
            None => Err(PolicyError::UnknownBlockType(kind.to_string())),
        }
    }
}

impl Default for BlockKindRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_kinds_are_registered() {
        let registry = BlockKindRegistry::with_builtins();
        for kind in ["container", "step", "module", "info", "request"] {
            assert!(registry.contains(kind), "missing builtin '{kind}'");
        }
        assert!(!registry.contains("no-such-kind"));
    }

    #[test]
    fn test_unknown_kind_errors() {
        let registry = BlockKindRegistry::empty();
        let err = registry.create("container", &Value::Null).unwrap_err();
        assert!(matches!(err, PolicyError::UnknownBlockType(_)));
    }

    #[test]
    fn test_custom_kind_registration() {
        struct Probe;
        #[async_trait]
        impl BlockBehavior for Probe {
            fn kind(&self) -> &'static str {
                "probe"
            }
        }

        let registry = BlockKindRegistry::empty();
        registry.register(
            "probe",
            Arc::new(|_| Ok(Box::new(Probe) as Box<dyn BlockBehavior>)),
        );
        let behavior = registry.create("probe", &Value::Null).unwrap();
        assert_eq!(behavior.kind(), "probe");
    }
}
