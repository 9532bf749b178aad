//! The live block: shared machinery wrapped around one behavior
//!
//! A [`BlockRuntime`] is one node of a wired policy graph. It owns the
//! concerns every block shares: permission gating, activity and
//! availability checks up the ancestor chain, link propagation, state
//! persistence, per-user broadcast scheduling and the single-flight guard
//! for exclusive blocks. Type-specific logic is delegated to the boxed
//! [`BlockBehavior`] it carries.

use crate::behavior::{BlockBehavior, BlockRef, SetDataConcurrency};
use crate::components::PolicyComponents;
use chrono::{DateTime, Utc};
use policy_types::{
    permission, BlockDefinition, BlockEvent, BlockId, EventConfig, PolicyError, PolicyId,
    PolicyInputEvent, PolicyLink, PolicyOutputEvent, PolicyResult, PolicyStatus, PolicyUser,
};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

/// Structural fields extracted from a definition node during build
pub(crate) struct BlockParts {
    pub block_type: String,
    pub tag: Option<String>,
    pub default_active: bool,
    pub permissions: Vec<String>,
    pub stop_propagation: bool,
    pub follow_user: bool,
    pub options: Value,
    pub events: Vec<EventConfig>,
    pub parent: Option<BlockId>,
    pub children: Vec<BlockId>,
}

/// When a user's data last changed through this block
#[derive(Clone, Debug)]
struct DataState {
    previous: Option<DateTime<Utc>>,
    current: DateTime<Utc>,
}

/// One live block instance
pub struct BlockRuntime {
    pub uuid: BlockId,
    pub policy_id: PolicyId,
    pub policy_owner: String,
    pub dry_run: bool,
    pub block_type: String,
    pub tag: Option<String>,
    pub default_active: bool,
    pub permissions: Vec<String>,
    /// Suppresses the default Run link to the next sibling
    pub stop_propagation: bool,
    /// Narrow update broadcasts to the acting user only
    pub follow_user: bool,
    /// Resolved, flattened options bag
    pub options: Value,
    /// Custom wiring rules (declared events plus module-injected ones)
    pub events: Vec<EventConfig>,
    pub parent: Option<BlockId>,
    pub children: Vec<BlockId>,

    pub(crate) behavior: Box<dyn BlockBehavior>,
    source_links: RwLock<Vec<PolicyLink>>,
    target_links: RwLock<Vec<PolicyLink>>,
    in_flight: Mutex<HashSet<String>>,
    data_state: Mutex<HashMap<String, DataState>>,
}

impl BlockRuntime {
    pub(crate) fn new(
        uuid: BlockId,
        policy_id: PolicyId,
        policy_owner: String,
        dry_run: bool,
        parts: BlockParts,
        behavior: Box<dyn BlockBehavior>,
    ) -> Self {
        Self {
            uuid,
            policy_id,
            policy_owner,
            dry_run,
            block_type: parts.block_type,
            tag: parts.tag,
            default_active: parts.default_active,
            permissions: parts.permissions,
            stop_propagation: parts.stop_propagation,
            follow_user: parts.follow_user,
            options: parts.options,
            events: parts.events,
            parent: parts.parent,
            children: parts.children,
            behavior,
            source_links: RwLock::new(Vec::new()),
            target_links: RwLock::new(Vec::new()),
            in_flight: Mutex::new(HashSet::new()),
            data_state: Mutex::new(HashMap::new()),
        }
    }

    pub fn kind(&self) -> &str {
        self.behavior.kind()
    }

    // ── Permissions and Availability ─────────────────────────────────

    /// Whether the user's role clears this block's permission set.
    /// An empty set admits nobody.
    pub fn has_permission(&self, user: &PolicyUser) -> bool {
        let is_owner = user.did == self.policy_owner;
        for entry in &self.permissions {
            match entry.as_str() {
                permission::ANY_ROLE => return true,
                permission::OWNER => {
                    if is_owner {
                        return true;
                    }
                }
                permission::NO_ROLE => {
                    if user.role.is_none() && !is_owner {
                        return true;
                    }
                }
                role => {
                    if user.role.as_deref() == Some(role) {
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Whether this block is active for the user: the parent decides
    /// (step blocks expose one active child at a time). Roots are always
    /// active.
    pub fn is_active(&self, components: &Arc<PolicyComponents>, user: &PolicyUser) -> bool {
        match self.parent.as_ref().and_then(|id| components.get_block(id)) {
            Some(parent) => parent.behavior.is_child_active(&parent, self, user),
            None => true,
        }
    }

    /// Whether the user may read or act on this block: permission and
    /// activity must hold here and on every ancestor
    pub fn is_available(&self, components: &Arc<PolicyComponents>, user: &PolicyUser) -> bool {
        if !self.has_permission(user) {
            return false;
        }
        match &self.parent {
            None => true,
            Some(parent_id) => match components.get_block(parent_id) {
                Some(parent) => {
                    parent.behavior.is_child_active(&parent, self, user)
                        && parent.is_available(components, user)
                }
                // Unregistered parent (throwaway tree): nothing to gate on
                None => true,
            },
        }
    }

    // ── Data Access ──────────────────────────────────────────────────

    pub async fn get_block_data(
        &self,
        components: &Arc<PolicyComponents>,
        user: &PolicyUser,
    ) -> PolicyResult<Value> {
        self.behavior
            .get_data(BlockRef { components, block: self }, user)
            .await
    }

    /// Accept data from a user, honoring the behavior's concurrency mode
    pub async fn set_block_data(
        &self,
        components: &Arc<PolicyComponents>,
        user: &PolicyUser,
        data: Value,
    ) -> PolicyResult<Value> {
        let _guard = match self.behavior.concurrency() {
            SetDataConcurrency::Exclusive => Some(self.enter_flight(user)?),
            SetDataConcurrency::Concurrent => None,
        };
        let result = self
            .behavior
            .set_data(BlockRef { components, block: self }, user, data)
            .await;
        if result.is_ok() {
            self.mark_data_state(user);
        }
        result
    }

    fn enter_flight(&self, user: &PolicyUser) -> PolicyResult<FlightGuard<'_>> {
        let key = user.id();
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !in_flight.insert(key.clone()) {
            return Err(PolicyError::Busy {
                block_type: self.block_type.clone(),
                block: self.uuid.clone(),
            });
        }
        Ok(FlightGuard {
            slots: &self.in_flight,
            key,
        })
    }

    /// Record that the user's data changed through this block
    fn mark_data_state(&self, user: &PolicyUser) {
        let mut states = self.data_state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();
        states
            .entry(user.id())
            .and_modify(|state| {
                state.previous = Some(state.current);
                state.current = now;
            })
            .or_insert(DataState {
                previous: None,
                current: now,
            });
    }

    /// Whether the user's view changed since the last render. Always
    /// answers true: every successful action re-renders, and the
    /// timestamps are kept for diagnostics only.
    pub fn check_data_state_differ(&self, user: &PolicyUser) -> bool {
        let _ = user;
        true
    }

    // ── State Persistence ────────────────────────────────────────────

    pub(crate) async fn save_state(&self, components: &Arc<PolicyComponents>) -> PolicyResult<()> {
        if let Some(state) = self.behavior.state_fields() {
            components
                .store()
                .save_block_state(&self.policy_id, &self.uuid, state)
                .await?;
        }
        Ok(())
    }

    /// Load persisted state into the behavior. A missing record is the
    /// normal first-run case.
    pub(crate) async fn restore_state(
        &self,
        components: &Arc<PolicyComponents>,
    ) -> PolicyResult<()> {
        if let Some(state) = components
            .store()
            .load_block_state(&self.policy_id, &self.uuid)
            .await?
        {
            self.behavior.load_state(&state);
        }
        Ok(())
    }

    // ── Broadcasts ───────────────────────────────────────────────────

    /// Persist state fields and mark this block dirty for every user who
    /// can see it
    pub async fn update_block(
        &self,
        components: &Arc<PolicyComponents>,
        user: &PolicyUser,
    ) -> PolicyResult<()> {
        self.save_state(components).await?;
        for member in self.audience(components, user).await? {
            components
                .scheduler()
                .schedule(components, &self.policy_id, &member, &self.uuid);
        }
        Ok(())
    }

    /// Who gets notified when this block's data changes
    async fn audience(
        &self,
        components: &Arc<PolicyComponents>,
        user: &PolicyUser,
    ) -> PolicyResult<Vec<PolicyUser>> {
        if self.follow_user {
            return Ok(vec![user.clone()]);
        }
        if self.dry_run {
            let active = components
                .store()
                .active_virtual_user(&self.policy_id)
                .await?;
            return Ok(vec![active.unwrap_or_else(|| user.clone())]);
        }
        let mut candidates: Vec<PolicyUser> = components
            .store()
            .members(&self.policy_id)
            .await?
            .iter()
            .map(|member| member.to_user())
            .collect();
        candidates.push(user.clone());
        candidates.push(PolicyUser::new(self.policy_owner.clone()));

        let mut seen = HashSet::new();
        Ok(candidates
            .into_iter()
            .filter(|candidate| self.has_permission(candidate) && seen.insert(candidate.id()))
            .collect())
    }

    // ── Event Propagation ────────────────────────────────────────────

    /// Emit an output over every matching wired link, in wiring order.
    /// Target failures are reported through the sink and do not stop
    /// propagation.
    pub async fn trigger_events(
        &self,
        components: &Arc<PolicyComponents>,
        output: PolicyOutputEvent,
        user: &PolicyUser,
        data: Value,
    ) {
        let links = self.source_links();
        for link in links.into_iter().filter(|l| l.output == output) {
            let actor = BlockEvent::resolve_actor(link.actor, user, &data);
            let event = BlockEvent {
                policy_id: self.policy_id.clone(),
                source: self.uuid.clone(),
                input: link.input,
                user: actor,
                data: data.clone(),
            };
            components.dispatch_event(&link.target, event).await;
        }
    }

    /// React to an incoming wired event
    pub(crate) async fn handle_event(
        &self,
        components: &Arc<PolicyComponents>,
        event: BlockEvent,
    ) -> PolicyResult<()> {
        if let Some(policy) = components.policy(&self.policy_id) {
            if policy.status == PolicyStatus::Discontinued {
                tracing::debug!(
                    policy_id = %self.policy_id,
                    block = %self.uuid,
                    "dropping event for discontinued policy"
                );
                return Ok(());
            }
        }
        // A primary action moves the enclosing step forward
        if event.input == PolicyInputEvent::Run {
            if let Some(parent) = self.parent.as_ref().and_then(|id| components.get_block(id)) {
                parent
                    .behavior
                    .child_ran(
                        BlockRef {
                            components,
                            block: parent.as_ref(),
                        },
                        &event.user,
                        &self.uuid,
                    )
                    .await?;
            }
        }
        self.behavior
            .handle(BlockRef { components, block: self }, &event)
            .await
    }

    // ── Links ────────────────────────────────────────────────────────

    pub(crate) fn add_source_link(&self, link: PolicyLink) {
        self.source_links
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(link);
    }

    pub(crate) fn add_target_link(&self, link: PolicyLink) {
        self.target_links
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(link);
    }

    pub fn source_links(&self) -> Vec<PolicyLink> {
        self.source_links
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn target_links(&self) -> Vec<PolicyLink> {
        self.target_links
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn clear_links(&self) {
        self.source_links
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.target_links
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    // ── Serialization ────────────────────────────────────────────────

    /// Reconstruct the definition node this block was built from,
    /// including assigned uuids
    pub fn serialize(&self, components: &Arc<PolicyComponents>) -> BlockDefinition {
        BlockDefinition {
            block_type: self.block_type.clone(),
            id: Some(self.uuid.clone()),
            tag: self.tag.clone(),
            permissions: self.permissions.clone(),
            default_active: self.default_active,
            options: self.options.clone(),
            events: self.events.clone(),
            inner_events: Vec::new(),
            variables: Vec::new(),
            children: self
                .children
                .iter()
                .filter_map(|id| components.get_block(id))
                .map(|child| child.serialize(components))
                .collect(),
        }
    }
}

/// Releases the single-flight slot when the action finishes, on every
/// exit path
struct FlightGuard<'a> {
    slots: &'a Mutex<HashSet<String>>,
    key: String,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}
