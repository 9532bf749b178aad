//! Serialized policy definitions: the blueprint the engine instantiates
//!
//! A policy document carries one [`BlockDefinition`] tree. Each node names
//! a block type (resolved to a behavior factory at build time), an optional
//! unique tag, a permission set, an opaque options bag and nested children.

use crate::event::EventConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

// ── Identifiers ──────────────────────────────────────────────────────

/// Unique identifier for a policy
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PolicyId(pub String);

impl PolicyId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for PolicyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a block instance (globally unique across policies)
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockId(pub String);

impl BlockId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Block Definition ─────────────────────────────────────────────────

/// One node of the serialized policy tree
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockDefinition {
    /// Block type, resolved to a registered behavior factory
    #[serde(rename = "blockType")]
    pub block_type: String,
    /// Instance uuid to reuse; the registry generates a fresh one when
    /// absent or already taken
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<BlockId>,
    /// Unique-per-policy name used for wiring and external addressing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Roles allowed to reach this block (see [`crate::permission`])
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Whether the block is active by default
    #[serde(default, rename = "defaultActive")]
    pub default_active: bool,
    /// Opaque type-specific options. A nested `options` object inside this
    /// bag is flattened into it at build time.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub options: Value,
    /// Declarative custom wiring rules
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<EventConfig>,
    /// Wiring rules injected by an enclosing module
    #[serde(default, rename = "innerEvents", skip_serializing_if = "Vec::is_empty")]
    pub inner_events: Vec<EventConfig>,
    /// Module-scoped variable references to resolve during build
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<VariableRef>,
    /// Nested child definitions, in declaration order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<BlockDefinition>,
}

impl BlockDefinition {
    /// Create a definition of the given type with empty options
    pub fn new(block_type: impl Into<String>) -> Self {
        Self {
            block_type: block_type.into(),
            id: None,
            tag: None,
            permissions: Vec::new(),
            default_active: false,
            options: Value::Null,
            events: Vec::new(),
            inner_events: Vec::new(),
            variables: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_permissions(mut self, permissions: Vec<&str>) -> Self {
        self.permissions = permissions.into_iter().map(String::from).collect();
        self
    }

    pub fn with_options(mut self, options: Value) -> Self {
        self.options = options;
        self
    }

    pub fn with_child(mut self, child: BlockDefinition) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_event(mut self, event: EventConfig) -> Self {
        self.events.push(event);
        self
    }

    pub fn active(mut self) -> Self {
        self.default_active = true;
        self
    }

    /// Total number of nodes in this subtree, self included
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(Self::node_count).sum::<usize>()
    }

    /// Visit every node in pre-order
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a BlockDefinition)) {
        visit(self);
        for child in &self.children {
            child.walk(visit);
        }
    }

    /// Collect every non-empty tag declared in this subtree
    pub fn declared_tags(&self) -> Vec<&str> {
        let mut tags = Vec::new();
        self.walk(&mut |node| {
            if let Some(tag) = node.tag.as_deref() {
                if !tag.is_empty() {
                    tags.push(tag);
                }
            }
        });
        tags
    }
}

/// A reference to a module-scoped variable, resolved at build time by
/// walking to the nearest `module` ancestor
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VariableRef {
    /// Dot-path into the options bag whose value is the variable name
    pub path: String,
    /// Variable kind (e.g. `Role`, `Schema`, `Token`)
    #[serde(rename = "type")]
    pub kind: String,
}

// ── Policy Document ──────────────────────────────────────────────────

/// Lifecycle status of a policy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyStatus {
    Draft,
    DryRun,
    Published,
    Discontinued,
}

impl Default for PolicyStatus {
    fn default() -> Self {
        Self::Draft
    }
}

/// A group template declared by the policy (multi-group policies let a
/// user pick which group they act in)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupTemplate {
    pub name: String,
    /// Role granted to members of this group
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// The stored policy: metadata plus the definition tree
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicyDocument {
    pub id: PolicyId,
    pub name: String,
    /// DID of the policy owner
    pub owner: String,
    #[serde(default)]
    pub status: PolicyStatus,
    /// Ledger topic this policy publishes to
    #[serde(default, rename = "topicId", skip_serializing_if = "Option::is_none")]
    pub topic_id: Option<String>,
    /// The definition tree
    pub config: BlockDefinition,
    /// Group templates; non-empty means the policy is multi-group
    #[serde(default, rename = "policyGroups", skip_serializing_if = "Vec::is_empty")]
    pub policy_groups: Vec<GroupTemplate>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl PolicyDocument {
    pub fn new(name: impl Into<String>, owner: impl Into<String>, config: BlockDefinition) -> Self {
        Self {
            id: PolicyId::generate(),
            name: name.into(),
            owner: owner.into(),
            status: PolicyStatus::Draft,
            topic_id: None,
            config,
            policy_groups: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_status(mut self, status: PolicyStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_group(mut self, group: GroupTemplate) -> Self {
        self.policy_groups.push(group);
        self
    }

    /// Dry-run policies execute against synthetic identities
    pub fn is_dry_run(&self) -> bool {
        self.status == PolicyStatus::DryRun
    }

    pub fn is_multiple_group(&self) -> bool {
        !self.policy_groups.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_tree() -> BlockDefinition {
        BlockDefinition::new("container")
            .with_tag("root")
            .with_child(BlockDefinition::new("info").with_tag("welcome"))
            .with_child(
                BlockDefinition::new("step")
                    .with_tag("wizard")
                    .with_child(BlockDefinition::new("request").with_tag("apply")),
            )
    }

    #[test]
    fn test_node_count_and_walk_order() {
        let tree = make_tree();
        assert_eq!(tree.node_count(), 4);

        let mut order = Vec::new();
        tree.walk(&mut |node| order.push(node.tag.clone().unwrap_or_default()));
        assert_eq!(order, vec!["root", "welcome", "wizard", "apply"]);
    }

    #[test]
    fn test_declared_tags() {
        let tree = make_tree();
        assert_eq!(tree.declared_tags(), vec!["root", "welcome", "wizard", "apply"]);
    }

    #[test]
    fn test_definition_serde_round_trip() {
        let raw = json!({
            "blockType": "container",
            "tag": "root",
            "defaultActive": true,
            "permissions": ["ANY_ROLE"],
            "options": { "title": "Main" },
            "children": [
                { "blockType": "info", "tag": "welcome" }
            ]
        });
        let def: BlockDefinition = serde_json::from_value(raw).unwrap();
        assert_eq!(def.block_type, "container");
        assert!(def.default_active);
        assert_eq!(def.children.len(), 1);
        assert_eq!(def.options["title"], "Main");

        let back = serde_json::to_value(&def).unwrap();
        assert_eq!(back["blockType"], "container");
        assert_eq!(back["children"][0]["tag"], "welcome");
    }

    #[test]
    fn test_policy_document_flags() {
        let doc = PolicyDocument::new("Test", "did:example:owner", make_tree());
        assert!(!doc.is_dry_run());
        assert!(!doc.is_multiple_group());

        let doc = doc.with_status(PolicyStatus::DryRun).with_group(GroupTemplate {
            name: "Verifiers".into(),
            role: "VERIFIER".into(),
            label: None,
        });
        assert!(doc.is_dry_run());
        assert!(doc.is_multiple_group());
    }
}
