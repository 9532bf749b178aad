//! Persistence seam for block state, documents and policy membership
//!
//! The engine itself is storage-agnostic: everything it needs to read or
//! write crosses the [`PolicyStore`] trait. [`InMemoryPolicyStore`] is the
//! reference implementation, suitable for dry-run execution and tests.

use async_trait::async_trait;
use dashmap::DashMap;
use policy_types::{BlockId, PolicyId, PolicyResult, PolicyUser};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Records ──────────────────────────────────────────────────────────

/// One registered member of a policy
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemberRecord {
    pub did: String,
    pub username: Option<String>,
    /// Role granted inside the policy
    pub role: Option<String>,
    /// Group the member currently acts in
    pub group: Option<String>,
}

impl MemberRecord {
    pub fn new(did: impl Into<String>) -> Self {
        Self {
            did: did.into(),
            username: None,
            role: None,
            group: None,
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// View this member as an acting policy user
    pub fn to_user(&self) -> PolicyUser {
        PolicyUser {
            did: self.did.clone(),
            username: self.username.clone(),
            role: self.role.clone(),
            group: self.group.clone(),
            virtual_user: false,
        }
    }
}

/// One group a user belongs to
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupRecord {
    /// Group instance uuid
    pub uuid: String,
    /// Template name the group was created from
    pub name: String,
    /// Role the group grants its members
    pub role: String,
    /// DID of the user that owns (created) the group
    pub owner: String,
    /// Whether this is the group the user currently acts in
    pub active: bool,
}

// ── Store Trait ──────────────────────────────────────────────────────

/// Storage backend for one engine instance.
///
/// All methods are keyed by policy so a single store can back many
/// policies at once.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Persist a block's state fields for later restore
    async fn save_block_state(
        &self,
        policy_id: &PolicyId,
        block_id: &BlockId,
        state: Value,
    ) -> PolicyResult<()>;

    /// Load a block's persisted state. A missing record is normal for
    /// blocks that have never run and returns `None`.
    async fn load_block_state(
        &self,
        policy_id: &PolicyId,
        block_id: &BlockId,
    ) -> PolicyResult<Option<Value>>;

    /// Persist a document produced by a block
    async fn save_document(
        &self,
        policy_id: &PolicyId,
        block_id: &BlockId,
        document: Value,
    ) -> PolicyResult<()>;

    /// All documents a block has produced, in insertion order
    async fn documents(&self, policy_id: &PolicyId, block_id: &BlockId)
        -> PolicyResult<Vec<Value>>;

    /// Every registered member of the policy
    async fn members(&self, policy_id: &PolicyId) -> PolicyResult<Vec<MemberRecord>>;

    /// Groups the given user belongs to inside the policy
    async fn groups_for_user(
        &self,
        policy_id: &PolicyId,
        did: &str,
    ) -> PolicyResult<Vec<GroupRecord>>;

    /// Mark one of the user's groups active (or clear with `None`)
    async fn set_active_group(
        &self,
        policy_id: &PolicyId,
        did: &str,
        group_uuid: Option<&str>,
    ) -> PolicyResult<()>;

    /// The synthetic user dry-run execution currently acts as
    async fn active_virtual_user(&self, policy_id: &PolicyId) -> PolicyResult<Option<PolicyUser>>;

    /// Drop every record held for the policy
    async fn drop_policy(&self, policy_id: &PolicyId) -> PolicyResult<()>;
}

// ── In-Memory Implementation ─────────────────────────────────────────

/// Concurrent in-memory store backed by sharded maps
#[derive(Default)]
pub struct InMemoryPolicyStore {
    block_states: DashMap<(String, String), Value>,
    documents: DashMap<(String, String), Vec<Value>>,
    members: DashMap<String, Vec<MemberRecord>>,
    groups: DashMap<(String, String), Vec<GroupRecord>>,
    virtual_users: DashMap<String, PolicyUser>,
}

impl InMemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a member; test and dry-run setup helper
    pub fn add_member(&self, policy_id: &PolicyId, member: MemberRecord) {
        self.members
            .entry(policy_id.to_string())
            .or_default()
            .push(member);
    }

    /// Register a group for a user; test and dry-run setup helper
    pub fn add_group(&self, policy_id: &PolicyId, did: &str, group: GroupRecord) {
        self.groups
            .entry((policy_id.to_string(), did.to_string()))
            .or_default()
            .push(group);
    }

    /// Set the synthetic identity dry-run execution acts as
    pub fn set_virtual_user(&self, policy_id: &PolicyId, user: PolicyUser) {
        self.virtual_users.insert(policy_id.to_string(), user);
    }
}

#[async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn save_block_state(
        &self,
        policy_id: &PolicyId,
        block_id: &BlockId,
        state: Value,
    ) -> PolicyResult<()> {
        self.block_states
            .insert((policy_id.to_string(), block_id.to_string()), state);
        Ok(())
    }

    async fn load_block_state(
        &self,
        policy_id: &PolicyId,
        block_id: &BlockId,
    ) -> PolicyResult<Option<Value>> {
        Ok(self
            .block_states
            .get(&(policy_id.to_string(), block_id.to_string()))
            .map(|entry| entry.value().clone()))
    }

    async fn save_document(
        &self,
        policy_id: &PolicyId,
        block_id: &BlockId,
        document: Value,
    ) -> PolicyResult<()> {
        self.documents
            .entry((policy_id.to_string(), block_id.to_string()))
            .or_default()
            .push(document);
        Ok(())
    }

    async fn documents(
        &self,
        policy_id: &PolicyId,
        block_id: &BlockId,
    ) -> PolicyResult<Vec<Value>> {
        Ok(self
            .documents
            .get(&(policy_id.to_string(), block_id.to_string()))
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }

    async fn members(&self, policy_id: &PolicyId) -> PolicyResult<Vec<MemberRecord>> {
        Ok(self
            .members
            .get(&policy_id.to_string())
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }

    async fn groups_for_user(
        &self,
        policy_id: &PolicyId,
        did: &str,
    ) -> PolicyResult<Vec<GroupRecord>> {
        Ok(self
            .groups
            .get(&(policy_id.to_string(), did.to_string()))
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }

    async fn set_active_group(
        &self,
        policy_id: &PolicyId,
        did: &str,
        group_uuid: Option<&str>,
    ) -> PolicyResult<()> {
        if let Some(mut groups) = self
            .groups
            .get_mut(&(policy_id.to_string(), did.to_string()))
        {
            for group in groups.value_mut().iter_mut() {
                group.active = Some(group.uuid.as_str()) == group_uuid;
            }
        }
        // Keep the member row in sync so audiences pick up the switch
        if let Some(mut members) = self.members.get_mut(&policy_id.to_string()) {
            if let Some(member) = members.value_mut().iter_mut().find(|m| m.did == did) {
                member.group = group_uuid.map(String::from);
            }
        }
        Ok(())
    }

    async fn active_virtual_user(&self, policy_id: &PolicyId) -> PolicyResult<Option<PolicyUser>> {
        Ok(self
            .virtual_users
            .get(&policy_id.to_string())
            .map(|entry| entry.value().clone()))
    }

    async fn drop_policy(&self, policy_id: &PolicyId) -> PolicyResult<()> {
        let key = policy_id.to_string();
        self.block_states.retain(|(p, _), _| *p != key);
        self.documents.retain(|(p, _), _| *p != key);
        self.groups.retain(|(p, _), _| *p != key);
        self.members.remove(&key);
        self.virtual_users.remove(&key);
        Ok(())
    }
}
