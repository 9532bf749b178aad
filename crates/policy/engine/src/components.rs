//! The component registry: every live block of every running policy
//!
//! [`PolicyComponents`] turns serialized definitions into wired graphs and
//! holds the maps that make blocks addressable afterwards: by uuid, by
//! tag, by policy. Registration is two-phase so wiring only ever sees a
//! fully-populated tree, and teardown is a cascade that leaves no map
//! entry, link or pending timer behind.

use crate::behavior::{BlockKindRegistry, BlockRef};
use crate::block::{BlockParts, BlockRuntime};
use crate::bus::InternalBus;
use crate::config::EngineConfig;
use crate::scheduler::UpdateScheduler;
use crate::sink::UpdateSink;
use crate::store::PolicyStore;
use policy_types::{
    BlockDefinition, BlockEvent, BlockId, EventActor, GroupTemplate, PolicyDocument, PolicyError,
    PolicyId, PolicyInputEvent, PolicyLink, PolicyOutputEvent, PolicyResult, PolicyStatus,
    VariableRef,
};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock, Weak};

// ── Path Utilities ───────────────────────────────────────────────────

/// Read a value at a dot-separated path into a JSON object
pub fn get_object_value<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

/// Replace the value at a dot-separated path. A missing intermediate
/// segment makes this a no-op.
pub fn replace_object_value(value: &mut Value, path: &str, new_value: Value) {
    let mut parts = path.split('.').peekable();
    let mut current = value;
    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            if let Value::Object(map) = current {
                map.insert(part.to_string(), new_value);
            }
            return;
        }
        match current.get_mut(part) {
            Some(next) => current = next,
            None => return,
        }
    }
}

/// Merge a nested `options` object into its parent bag, nested keys
/// winning
fn flatten_options(mut options: Value) -> Value {
    if let Value::Object(map) = &mut options {
        if let Some(Value::Object(nested)) = map.remove("options") {
            for (key, value) in nested {
                map.insert(key, value);
            }
        }
    }
    match options {
        Value::Null => Value::Object(serde_json::Map::new()),
        other => other,
    }
}

/// Look up a module-declared variable by name and kind
fn module_variable(module: &BlockDefinition, name: &str, kind: &str) -> Option<Value> {
    let variables = module
        .options
        .get("variables")
        .or_else(|| module.options.get("options").and_then(|o| o.get("variables")))
        .and_then(Value::as_array)?;
    variables
        .iter()
        .find(|var| {
            var.get("name").and_then(Value::as_str) == Some(name)
                && var.get("type").and_then(Value::as_str) == Some(kind)
        })
        .and_then(|var| var.get("value").cloned())
}

/// Resolve module-scoped variable references in a node's options and
/// permission list against the nearest enclosing module
fn resolve_variables(
    options: &mut Value,
    permissions: &mut [String],
    variables: &[VariableRef],
    modules: &[&BlockDefinition],
) {
    let Some(module) = modules.last() else { return };
    for var in variables {
        let Some(name) = get_object_value(options, &var.path)
            .and_then(Value::as_str)
            .map(String::from)
        else {
            continue;
        };
        if let Some(value) = module_variable(module, &name, &var.kind) {
            replace_object_value(options, &var.path, value);
        }
    }
    for entry in permissions.iter_mut() {
        if let Some(Value::String(role)) = module_variable(module, entry, "Role") {
            *entry = role;
        }
    }
}

// ── Policy Instance ──────────────────────────────────────────────────

/// Metadata of one registered, running policy
#[derive(Clone, Debug)]
pub struct PolicyInstance {
    pub policy_id: PolicyId,
    pub name: String,
    pub owner: String,
    pub status: PolicyStatus,
    pub dry_run: bool,
    pub multi_group: bool,
    pub topic_id: Option<String>,
    pub root: BlockId,
    pub groups: Vec<GroupTemplate>,
}

// ── Component Registry ───────────────────────────────────────────────

/// Shared registry of every live block across all running policies
pub struct PolicyComponents {
    config: EngineConfig,
    store: Arc<dyn PolicyStore>,
    sink: Arc<dyn UpdateSink>,
    kinds: BlockKindRegistry,
    scheduler: UpdateScheduler,
    bus: InternalBus,

    /// Every live block, by globally unique uuid
    blocks: RwLock<HashMap<BlockId, Arc<BlockRuntime>>>,
    /// Block uuids per policy, in pre-order
    policy_blocks: RwLock<HashMap<PolicyId, Vec<BlockId>>>,
    /// Tag → uuid, per policy
    tags: RwLock<HashMap<PolicyId, HashMap<String, BlockId>>>,
    /// Input types each block registered handlers for
    actions: RwLock<HashMap<BlockId, HashSet<PolicyInputEvent>>>,
    policies: RwLock<HashMap<PolicyId, PolicyInstance>>,
    /// Serializes build/destroy per policy
    locks: Mutex<HashMap<PolicyId, Arc<tokio::sync::Mutex<()>>>>,
    /// Self-handle for spawned timers and behavior hooks
    this: Weak<PolicyComponents>,
}

impl PolicyComponents {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn PolicyStore>,
        sink: Arc<dyn UpdateSink>,
    ) -> Arc<Self> {
        let scheduler = UpdateScheduler::new(config.debounce_window);
        Arc::new_cyclic(|this| Self {
            config,
            store,
            sink,
            kinds: BlockKindRegistry::with_builtins(),
            scheduler,
            bus: InternalBus::new(),
            blocks: RwLock::new(HashMap::new()),
            policy_blocks: RwLock::new(HashMap::new()),
            tags: RwLock::new(HashMap::new()),
            actions: RwLock::new(HashMap::new()),
            policies: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            this: this.clone(),
        })
    }

    /// The owning `Arc`. The registry is only ever constructed through
    /// [`Self::new`], so the upgrade cannot fail while `&self` exists.
    fn arc(&self) -> Arc<Self> {
        self.this.upgrade().expect("registry handle outlived its Arc")
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn PolicyStore> {
        &self.store
    }

    pub fn sink(&self) -> &Arc<dyn UpdateSink> {
        &self.sink
    }

    pub fn scheduler(&self) -> &UpdateScheduler {
        &self.scheduler
    }

    pub fn bus(&self) -> &InternalBus {
        &self.bus
    }

    pub fn kinds(&self) -> &BlockKindRegistry {
        &self.kinds
    }

    pub fn get_block(&self, id: &BlockId) -> Option<Arc<BlockRuntime>> {
        self.blocks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    pub fn get_block_by_tag(&self, policy_id: &PolicyId, tag: &str) -> Option<Arc<BlockRuntime>> {
        let id = {
            let tags = self.tags.read().unwrap_or_else(|e| e.into_inner());
            tags.get(policy_id)?.get(tag).cloned()
        };
        id.and_then(|id| self.get_block(&id))
    }

    /// Tag → uuid map for one policy
    pub fn tag_map(&self, policy_id: &PolicyId) -> HashMap<String, BlockId> {
        self.tags
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(policy_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn policy(&self, policy_id: &PolicyId) -> Option<PolicyInstance> {
        self.policies
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(policy_id)
            .cloned()
    }

    /// Block uuids of one policy, in pre-order
    pub fn policy_block_ids(&self, policy_id: &PolicyId) -> Vec<BlockId> {
        self.policy_blocks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(policy_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Per-policy mutex serializing build and destroy
    pub fn policy_lock(&self, policy_id: &PolicyId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(policy_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drop the lock entry for a policy that is no longer registered.
    /// Holders of an already-cloned `Arc` keep working; the next
    /// `policy_lock` call gets a fresh one.
    pub(crate) fn release_policy_lock(&self, policy_id: &PolicyId) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.remove(policy_id);
    }

    /// Number of per-policy lock entries currently held (test hook)
    pub fn policy_lock_count(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// A uuid free in the global map and in the build-local reservation
    /// set
    pub fn generate_unique_uuid(&self, taken: &HashSet<BlockId>) -> BlockId {
        loop {
            let id = BlockId::generate();
            if !taken.contains(&id) && self.get_block(&id).is_none() {
                return id;
            }
        }
    }

    // ── Build ────────────────────────────────────────────────────────

    /// Instantiate a definition tree into live, unwired blocks.
    /// Returns the root and every instance in pre-order.
    pub fn build_block_tree(
        &self,
        policy: &PolicyDocument,
    ) -> PolicyResult<(Arc<BlockRuntime>, Vec<Arc<BlockRuntime>>)> {
        let mut modules = Vec::new();
        let mut taken = HashSet::new();
        let (_, instances) =
            self.build_instance(policy, &policy.config, None, &mut modules, &mut taken)?;
        let root = instances
            .first()
            .cloned()
            .ok_or_else(|| PolicyError::BadDefinition("empty block tree".into()))?;
        Ok((root, instances))
    }

    fn build_instance<'d>(
        &self,
        policy: &PolicyDocument,
        def: &'d BlockDefinition,
        parent: Option<BlockId>,
        modules: &mut Vec<&'d BlockDefinition>,
        taken: &mut HashSet<BlockId>,
    ) -> PolicyResult<(BlockId, Vec<Arc<BlockRuntime>>)> {
        // Reuse the declared uuid unless something already holds it
        let uuid = match &def.id {
            Some(id) if !taken.contains(id) && self.get_block(id).is_none() => id.clone(),
            _ => self.generate_unique_uuid(taken),
        };
        taken.insert(uuid.clone());

        let mut options = flatten_options(def.options.clone());
        let mut permissions = def.permissions.clone();
        resolve_variables(&mut options, &mut permissions, &def.variables, modules);

        let behavior = self.kinds.create(&def.block_type, &options)?;

        let is_module = def.block_type == "module";
        if is_module {
            modules.push(def);
        }
        let mut child_ids = Vec::new();
        let mut subtree = Vec::new();
        for child in &def.children {
            let (child_id, mut built) =
                self.build_instance(policy, child, Some(uuid.clone()), modules, taken)?;
            child_ids.push(child_id);
            subtree.append(&mut built);
        }
        if is_module {
            modules.pop();
        }

        let mut events = def.events.clone();
        events.extend(def.inner_events.iter().cloned());

        let stop_propagation = options
            .get("stopPropagation")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let follow_user = options
            .get("followUser")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let block = Arc::new(BlockRuntime::new(
            uuid.clone(),
            policy.id.clone(),
            policy.owner.clone(),
            policy.is_dry_run(),
            BlockParts {
                block_type: def.block_type.clone(),
                tag: def.tag.clone().filter(|tag| !tag.is_empty()),
                default_active: def.default_active,
                permissions,
                stop_propagation,
                follow_user,
                options,
                events,
                parent,
                children: child_ids,
            },
            behavior,
        ));

        let mut instances = vec![block];
        instances.extend(subtree);
        Ok((uuid, instances))
    }

    // ── Registration ─────────────────────────────────────────────────

    /// Record the policy's metadata and root. Must precede
    /// [`Self::register_block_tree`] so event handling can resolve status.
    pub fn register_policy_instance(&self, policy: &PolicyDocument, root: BlockId) {
        let instance = PolicyInstance {
            policy_id: policy.id.clone(),
            name: policy.name.clone(),
            owner: policy.owner.clone(),
            status: policy.status,
            dry_run: policy.is_dry_run(),
            multi_group: policy.is_multiple_group(),
            topic_id: policy.topic_id.clone(),
            root,
            groups: policy.policy_groups.clone(),
        };
        self.policies
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(policy.id.clone(), instance);
    }

    /// Two-phase registration of a built tree.
    ///
    /// Phase one puts every block into the maps and runs `before_init`,
    /// so phase two (state restore, `after_init` and all wiring) sees the
    /// complete tree. Returns soft wiring warnings; hard failures roll
    /// the partial registration back.
    pub async fn register_block_tree(
        &self,
        instances: &[Arc<BlockRuntime>],
    ) -> PolicyResult<Vec<String>> {
        let mut warnings = Vec::new();
        match self.register_block_tree_inner(instances, &mut warnings).await {
            Ok(()) => Ok(warnings),
            Err(err) => {
                if let Some(block) = instances.first() {
                    self.unregister_blocks(&block.policy_id);
                }
                Err(err)
            }
        }
    }

    async fn register_block_tree_inner(
        &self,
        instances: &[Arc<BlockRuntime>],
        warnings: &mut Vec<String>,
    ) -> PolicyResult<()> {
        let this = self.arc();
        for block in instances {
            self.register_component(block)?;
        }
        for block in instances {
            block
                .behavior
                .before_init(BlockRef {
                    components: &this,
                    block: block.as_ref(),
                })
                .await?;
        }
        for block in instances {
            block.restore_state(&this).await?;
            block
                .behavior
                .after_init(BlockRef {
                    components: &this,
                    block: block.as_ref(),
                })
                .await?;
            self.register_default_events(block, warnings);
            self.register_custom_events(block, warnings);
        }
        tracing::info!(
            policy_id = %instances.first().map(|b| b.policy_id.to_string()).unwrap_or_default(),
            blocks = instances.len(),
            warnings = warnings.len(),
            "block tree registered"
        );
        Ok(())
    }

    fn register_component(&self, block: &Arc<BlockRuntime>) -> PolicyResult<()> {
        if let Some(tag) = &block.tag {
            let mut tags = self.tags.write().unwrap_or_else(|e| e.into_inner());
            let map = tags.entry(block.policy_id.clone()).or_default();
            if map.contains_key(tag) {
                return Err(PolicyError::DuplicateTag(tag.clone()));
            }
            map.insert(tag.clone(), block.uuid.clone());
        }
        self.blocks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(block.uuid.clone(), Arc::clone(block));
        self.policy_blocks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(block.policy_id.clone())
            .or_default()
            .push(block.uuid.clone());
        self.actions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                block.uuid.clone(),
                block.behavior.accepted_inputs().into_iter().collect(),
            );
        Ok(())
    }

    // ── Wiring ───────────────────────────────────────────────────────

    /// Structural wiring every tree gets for free: Run flows to the next
    /// sibling, Refresh bubbles to container-class parents, Release
    /// notifies an enclosing step
    fn register_default_events(&self, block: &Arc<BlockRuntime>, warnings: &mut Vec<String>) {
        let Some(parent) = block.parent.as_ref().and_then(|id| self.get_block(id)) else {
            return;
        };
        if !block.stop_propagation {
            let position = parent.children.iter().position(|id| *id == block.uuid);
            if let Some(next) = position
                .and_then(|idx| parent.children.get(idx + 1))
                .and_then(|id| self.get_block(id))
            {
                self.create_link(
                    block,
                    PolicyOutputEvent::Run,
                    &next,
                    PolicyInputEvent::Run,
                    EventActor::EventInitiator,
                    warnings,
                );
            }
        }
        if parent.behavior.is_container() {
            self.create_link(
                block,
                PolicyOutputEvent::Refresh,
                &parent,
                PolicyInputEvent::Refresh,
                EventActor::EventInitiator,
                warnings,
            );
        }
        if parent.kind() == "step" {
            self.create_link(
                block,
                PolicyOutputEvent::Release,
                &parent,
                PolicyInputEvent::Release,
                EventActor::EventInitiator,
                warnings,
            );
        }
    }

    /// Declarative wiring from the block's event list. Source or target
    /// may be the declaring block itself (by its own tag) or any two
    /// other tagged blocks (cross-wiring declared on a module).
    fn register_custom_events(&self, block: &Arc<BlockRuntime>, warnings: &mut Vec<String>) {
        for event in &block.events {
            if event.disabled {
                continue;
            }
            let source = if block.tag.as_deref() == Some(event.source.as_str()) {
                Some(Arc::clone(block))
            } else {
                self.get_block_by_tag(&block.policy_id, &event.source)
            };
            let target = if block.tag.as_deref() == Some(event.target.as_str()) {
                Some(Arc::clone(block))
            } else {
                self.get_block_by_tag(&block.policy_id, &event.target)
            };
            match (source, target) {
                (Some(source), Some(target)) => {
                    self.create_link(&source, event.output, &target, event.input, event.actor, warnings);
                }
                _ => {
                    let message = format!(
                        "wiring '{}' -> '{}' skipped: unknown tag",
                        event.source, event.target
                    );
                    tracing::warn!(policy_id = %block.policy_id, "{message}");
                    warnings.push(message);
                }
            }
        }
    }

    /// Wire one link. Module targets take the event on their catch-all
    /// input. A target without a matching handler downgrades the link to
    /// a warning.
    fn create_link(
        &self,
        source: &Arc<BlockRuntime>,
        output: PolicyOutputEvent,
        target: &Arc<BlockRuntime>,
        mut input: PolicyInputEvent,
        actor: EventActor,
        warnings: &mut Vec<String>,
    ) {
        if target.kind() == "module" {
            input = PolicyInputEvent::Module;
        }
        let accepts = self
            .actions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&target.uuid)
            .map(|inputs| inputs.contains(&input))
            .unwrap_or(false);
        if !accepts {
            let message = format!(
                "link {} -> {} skipped: target has no {:?} handler",
                source.uuid, target.uuid, input
            );
            tracing::warn!(policy_id = %source.policy_id, "{message}");
            warnings.push(message);
            return;
        }
        let link = PolicyLink::new(
            source.uuid.clone(),
            output,
            target.uuid.clone(),
            input,
            actor,
        );
        source.add_source_link(link.clone());
        target.add_target_link(link);
    }

    // ── Dispatch ─────────────────────────────────────────────────────

    /// Deliver one event to its target. Handler failures are reported
    /// through the sink and never propagate: one bad block must not stop
    /// the chain that triggered it.
    pub async fn dispatch_event(&self, target: &BlockId, event: BlockEvent) {
        let Some(block) = self.get_block(target) else {
            tracing::warn!(block = %target, "event target not registered");
            return;
        };
        let policy_id = event.policy_id.clone();
        let user = event.user.clone();
        if let Err(err) = block.handle_event(&self.arc(), event).await {
            tracing::warn!(
                policy_id = %policy_id,
                block = %block.uuid,
                block_type = %block.block_type,
                error = %err,
                "block event handler failed"
            );
            self.sink
                .block_error(&policy_id, &user, &block.block_type, &err.to_string())
                .await;
        }
    }

    /// Emit a payload on the policy's internal bus
    pub fn trigger_internal_event(&self, policy_id: &PolicyId, topic: &str, payload: Value) {
        let delivered = self.bus.emit(policy_id, topic, payload);
        tracing::debug!(policy_id = %policy_id, topic, delivered, "internal event");
    }

    // ── Update Reduction ─────────────────────────────────────────────

    /// Ancestor-reduce a dirty set: walk from the root, keep a block when
    /// it is dirty and stop descending there, otherwise descend. Dirty
    /// blocks under another dirty block never survive.
    pub fn reduce_update_set(&self, policy_id: &PolicyId, dirty: &HashSet<BlockId>) -> Vec<BlockId> {
        let Some(instance) = self.policy(policy_id) else {
            return Vec::new();
        };
        let mut result = Vec::new();
        let mut stack = vec![instance.root];
        while let Some(id) = stack.pop() {
            if dirty.contains(&id) {
                result.push(id);
            } else if let Some(block) = self.get_block(&id) {
                for child in block.children.iter().rev() {
                    stack.push(child.clone());
                }
            }
        }
        result
    }

    // ── Teardown ─────────────────────────────────────────────────────

    /// Remove every block of a policy from all maps, root first, and
    /// release their links
    pub fn unregister_blocks(&self, policy_id: &PolicyId) {
        let ids = self
            .policy_blocks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(policy_id)
            .unwrap_or_default();
        for id in &ids {
            let removed = self
                .blocks
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .remove(id);
            if let Some(block) = removed {
                block.clear_links();
            }
            self.actions
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .remove(id);
        }
        self.tags
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(policy_id);
        tracing::info!(policy_id = %policy_id, blocks = ids.len(), "blocks unregistered");
    }

    /// Full teardown: blocks, metadata, bus subscriptions and pending
    /// update timers
    pub fn unregister_policy(&self, policy_id: &PolicyId) {
        self.unregister_blocks(policy_id);
        self.policies
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(policy_id);
        self.bus.remove_policy(policy_id);
        self.scheduler.cancel_policy(policy_id);
    }
}
