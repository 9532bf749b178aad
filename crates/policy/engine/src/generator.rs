//! The engine façade: generate, validate, destroy and the request surface
//!
//! [`BlockTreeGenerator`] is what embedders talk to. It owns one
//! [`PolicyComponents`] registry and exposes the whole lifecycle of a
//! policy plus the per-user request operations. Reads against blocks the
//! user may not see answer `None` rather than erroring, so callers cannot
//! probe the tree shape through error messages.

use crate::block::BlockRuntime;
use crate::components::PolicyComponents;
use crate::config::EngineConfig;
use crate::sink::UpdateSink;
use crate::store::PolicyStore;
use policy_types::{
    permission, BlockDefinition, BlockId, PolicyDocument, PolicyError, PolicyId, PolicyResult,
    PolicyUser, ValidationReport,
};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;

/// Façade over one component registry
pub struct BlockTreeGenerator {
    components: Arc<PolicyComponents>,
}

impl BlockTreeGenerator {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn PolicyStore>,
        sink: Arc<dyn UpdateSink>,
    ) -> Self {
        Self {
            components: PolicyComponents::new(config, store, sink),
        }
    }

    pub fn with_components(components: Arc<PolicyComponents>) -> Self {
        Self { components }
    }

    pub fn components(&self) -> &Arc<PolicyComponents> {
        &self.components
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Build a policy into a live, wired tree.
    ///
    /// With `skip_registration` the tree is built but left out of every
    /// map; used for validation. Failures land in the report (when given)
    /// and answer `None` instead of propagating.
    pub async fn generate(
        &self,
        policy: &PolicyDocument,
        skip_registration: bool,
        report: Option<&mut ValidationReport>,
    ) -> Option<Arc<BlockRuntime>> {
        let lock = self.components.policy_lock(&policy.id);
        let result = {
            let _guard = lock.lock().await;
            self.generate_inner(policy, skip_registration).await
        };
        // Throwaway and failed builds leave no registered policy behind,
        // so their lock entry has nothing left to serialize
        if self.components.policy(&policy.id).is_none() {
            self.components.release_policy_lock(&policy.id);
        }
        match result {
            Ok((root, warnings)) => {
                if let Some(report) = report {
                    if self.components.config().strict_wiring {
                        for warning in warnings {
                            report.add_error(warning);
                        }
                    }
                }
                Some(root)
            }
            Err(err) => {
                tracing::error!(policy_id = %policy.id, error = %err, "policy generation failed");
                if let Some(report) = report {
                    report.add_error(err.to_string());
                }
                None
            }
        }
    }

    async fn generate_inner(
        &self,
        policy: &PolicyDocument,
        skip_registration: bool,
    ) -> PolicyResult<(Arc<BlockRuntime>, Vec<String>)> {
        let (root, instances) = self.components.build_block_tree(policy)?;
        if skip_registration {
            return Ok((root, Vec::new()));
        }
        self.components
            .register_policy_instance(policy, root.uuid.clone());
        match self.components.register_block_tree(&instances).await {
            Ok(warnings) => {
                tracing::info!(
                    policy_id = %policy.id,
                    name = %policy.name,
                    blocks = instances.len(),
                    "policy generated"
                );
                Ok((root, warnings))
            }
            Err(err) => {
                self.components.unregister_policy(&policy.id);
                Err(err)
            }
        }
    }

    /// Validate a serialized policy document without registering anything
    pub async fn validate(&self, definition: &Value) -> ValidationReport {
        if !definition.is_object() {
            return ValidationReport::bad_policy();
        }
        let policy: PolicyDocument = match serde_json::from_value(definition.clone()) {
            Ok(policy) => policy,
            Err(err) => {
                let mut report = ValidationReport::new();
                report.add_error(format!("invalid policy document: {err}"));
                return report;
            }
        };
        self.validate_policy(&policy).await
    }

    /// Validate a parsed policy: duplicate tags, buildability, permission
    /// references, per-block self-checks and (in strict mode) wiring
    /// targets
    pub async fn validate_policy(&self, policy: &PolicyDocument) -> ValidationReport {
        let mut report = ValidationReport::new();

        let mut seen = HashSet::new();
        for tag in policy.config.declared_tags() {
            if !seen.insert(tag) {
                report.add_error(format!("tag '{tag}' declared more than once"));
            }
        }

        let instances = match self.components.build_block_tree(policy) {
            Ok((_, instances)) => instances,
            Err(err) => {
                report.add_error(err.to_string());
                return report;
            }
        };

        let known_roles: HashSet<&str> = policy
            .policy_groups
            .iter()
            .map(|group| group.role.as_str())
            .collect();
        let markers = [permission::ANY_ROLE, permission::OWNER, permission::NO_ROLE];

        for block in &instances {
            // Role references are only checkable when the policy declares
            // its roles through group templates
            if !known_roles.is_empty() {
                for entry in &block.permissions {
                    if !markers.contains(&entry.as_str()) && !known_roles.contains(entry.as_str()) {
                        report.add_block_error(
                            Some(block.uuid.clone()),
                            &block.block_type,
                            block.tag.as_deref(),
                            format!("permission '{entry}' does not match any declared role"),
                        );
                    }
                }
            }
            block.behavior.validate(block, &mut report);

            if self.components.config().strict_wiring {
                for event in &block.events {
                    if event.disabled {
                        continue;
                    }
                    for tag in [&event.source, &event.target] {
                        if !seen.contains(tag.as_str()) {
                            report.add_block_error(
                                Some(block.uuid.clone()),
                                &block.block_type,
                                block.tag.as_deref(),
                                format!("wiring references unknown tag '{tag}'"),
                            );
                        }
                    }
                }
            }
        }
        report
    }

    /// Tear the policy down: every map entry, link, bus subscription and
    /// pending timer. Persisted state stays so a later generate restores
    /// it.
    pub async fn destroy(&self, policy_id: &PolicyId) {
        let lock = self.components.policy_lock(policy_id);
        {
            let _guard = lock.lock().await;
            self.components.unregister_policy(policy_id);
        }
        self.components.release_policy_lock(policy_id);
        tracing::info!(policy_id = %policy_id, "policy destroyed");
    }

    // ── Request Surface ──────────────────────────────────────────────

    /// Render the root block for one user; `None` when the root is not
    /// reachable for them
    pub async fn get_root_block_data(
        &self,
        policy_id: &PolicyId,
        user: &PolicyUser,
    ) -> PolicyResult<Option<Value>> {
        let instance = self
            .components
            .policy(policy_id)
            .ok_or_else(|| PolicyError::PolicyNotFound(policy_id.clone()))?;
        let root = self
            .components
            .get_block(&instance.root)
            .ok_or_else(|| PolicyError::BlockNotFound(instance.root.clone()))?;
        self.read_block(&root, user).await
    }

    /// Render one block for one user; `None` when they may not see it
    pub async fn get_block_data(
        &self,
        policy_id: &PolicyId,
        user: &PolicyUser,
        block_id: &BlockId,
    ) -> PolicyResult<Option<Value>> {
        let block = self.resolve_block(policy_id, block_id)?;
        self.read_block(&block, user).await
    }

    pub async fn get_block_data_by_tag(
        &self,
        policy_id: &PolicyId,
        user: &PolicyUser,
        tag: &str,
    ) -> PolicyResult<Option<Value>> {
        let block = self
            .components
            .get_block_by_tag(policy_id, tag)
            .ok_or_else(|| PolicyError::TagNotFound(tag.to_string()))?;
        self.read_block(&block, user).await
    }

    /// Submit data to a block as one user; `None` when the block is not
    /// available to them
    pub async fn set_block_data(
        &self,
        policy_id: &PolicyId,
        user: &PolicyUser,
        block_id: &BlockId,
        data: Value,
    ) -> PolicyResult<Option<Value>> {
        let block = self.resolve_block(policy_id, block_id)?;
        self.write_block(&block, user, data).await
    }

    pub async fn set_block_data_by_tag(
        &self,
        policy_id: &PolicyId,
        user: &PolicyUser,
        tag: &str,
        data: Value,
    ) -> PolicyResult<Option<Value>> {
        let block = self
            .components
            .get_block_by_tag(policy_id, tag)
            .ok_or_else(|| PolicyError::TagNotFound(tag.to_string()))?;
        self.write_block(&block, user, data).await
    }

    /// Resolve a tag to its block id
    pub fn block_by_tag(&self, policy_id: &PolicyId, tag: &str) -> PolicyResult<Value> {
        let block = self
            .components
            .get_block_by_tag(policy_id, tag)
            .ok_or_else(|| PolicyError::TagNotFound(tag.to_string()))?;
        Ok(json!({ "id": block.uuid }))
    }

    /// Ancestor chain of a block: self first, then each parent up to the
    /// root
    pub fn get_block_parents(
        &self,
        policy_id: &PolicyId,
        block_id: &BlockId,
    ) -> PolicyResult<Vec<BlockId>> {
        let mut block = self.resolve_block(policy_id, block_id)?;
        let mut chain = vec![block.uuid.clone()];
        while let Some(parent) = block.parent.as_ref().and_then(|id| self.components.get_block(id))
        {
            chain.push(parent.uuid.clone());
            block = parent;
        }
        Ok(chain)
    }

    /// Groups the user can act in; empty for single-group policies
    pub async fn get_policy_groups(
        &self,
        policy_id: &PolicyId,
        user: &PolicyUser,
    ) -> PolicyResult<Vec<Value>> {
        let instance = self
            .components
            .policy(policy_id)
            .ok_or_else(|| PolicyError::PolicyNotFound(policy_id.clone()))?;
        if !instance.multi_group {
            return Ok(Vec::new());
        }
        let groups = self
            .components
            .store()
            .groups_for_user(policy_id, &user.did)
            .await?;
        Ok(groups
            .into_iter()
            .map(|group| {
                json!({
                    "uuid": group.uuid,
                    "groupName": group.name,
                    "role": group.role,
                    "active": group.active,
                })
            })
            .collect())
    }

    /// Switch the group the user acts in; `None` leaves every group
    pub async fn select_policy_group(
        &self,
        policy_id: &PolicyId,
        user: &PolicyUser,
        group_uuid: Option<&str>,
    ) -> PolicyResult<()> {
        let instance = self
            .components
            .policy(policy_id)
            .ok_or_else(|| PolicyError::PolicyNotFound(policy_id.clone()))?;
        if !instance.multi_group {
            return Err(PolicyError::BadDefinition(
                "policy does not contain user groups".into(),
            ));
        }
        if let Some(uuid) = group_uuid {
            let groups = self
                .components
                .store()
                .groups_for_user(policy_id, &user.did)
                .await?;
            if !groups.iter().any(|group| group.uuid == uuid) {
                return Err(PolicyError::BadDefinition(format!(
                    "user does not belong to group '{uuid}'"
                )));
            }
        }
        self.components
            .store()
            .set_active_group(policy_id, &user.did, group_uuid)
            .await
    }

    /// Serialize the running tree back into a definition, assigned uuids
    /// included
    pub fn serialize_policy(&self, policy_id: &PolicyId) -> PolicyResult<BlockDefinition> {
        let instance = self
            .components
            .policy(policy_id)
            .ok_or_else(|| PolicyError::PolicyNotFound(policy_id.clone()))?;
        let root = self
            .components
            .get_block(&instance.root)
            .ok_or_else(|| PolicyError::BlockNotFound(instance.root.clone()))?;
        Ok(root.serialize(&self.components))
    }

    /// Deliver one user's pending update set now instead of waiting out
    /// the debounce window
    pub async fn flush_updates(&self, policy_id: &PolicyId, user: &PolicyUser) {
        self.components
            .scheduler()
            .flush_user(&self.components, policy_id, user)
            .await;
    }

    // ── Helpers ──────────────────────────────────────────────────────

    fn resolve_block(
        &self,
        policy_id: &PolicyId,
        block_id: &BlockId,
    ) -> PolicyResult<Arc<BlockRuntime>> {
        let block = self
            .components
            .get_block(block_id)
            .ok_or_else(|| PolicyError::BlockNotFound(block_id.clone()))?;
        if block.policy_id != *policy_id {
            return Err(PolicyError::BlockNotFound(block_id.clone()));
        }
        Ok(block)
    }

    async fn read_block(
        &self,
        block: &Arc<BlockRuntime>,
        user: &PolicyUser,
    ) -> PolicyResult<Option<Value>> {
        if !block.is_available(&self.components, user) {
            return Ok(None);
        }
        Ok(Some(block.get_block_data(&self.components, user).await?))
    }

    async fn write_block(
        &self,
        block: &Arc<BlockRuntime>,
        user: &PolicyUser,
        data: Value,
    ) -> PolicyResult<Option<Value>> {
        if !block.is_available(&self.components, user) {
            return Ok(None);
        }
        block
            .set_block_data(&self.components, user, data)
            .await
            .map(Some)
    }
}
