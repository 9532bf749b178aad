//! The acting identity inside a policy
//!
//! A policy user is identified by a DID, optionally scoped to a group.
//! The composite id (`group:did` when grouped, plain `did` otherwise) is
//! the key for per-user engine state such as debounce timers and step
//! positions. Virtual users are synthetic identities used in dry-run mode.

use serde::{Deserialize, Serialize};

/// A user acting inside one policy
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyUser {
    /// Base identity
    pub did: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Role granted inside this policy, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Group the user currently acts in, if the policy is multi-group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Synthetic dry-run identity
    #[serde(default, rename = "virtual")]
    pub virtual_user: bool,
}

impl PolicyUser {
    pub fn new(did: impl Into<String>) -> Self {
        Self {
            did: did.into(),
            username: None,
            role: None,
            group: None,
            virtual_user: false,
        }
    }

    /// Create a synthetic identity for dry-run execution
    pub fn virtual_user(did: impl Into<String>) -> Self {
        Self {
            virtual_user: true,
            ..Self::new(did)
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Switch the active group (and the role it grants)
    pub fn set_group(&mut self, group: Option<String>, role: Option<String>) {
        self.group = group;
        self.role = role;
    }

    /// Composite id: `group:did` when grouped, otherwise the DID
    pub fn id(&self) -> String {
        match &self.group {
            Some(group) => format!("{}:{}", group, self.did),
            None => self.did.clone(),
        }
    }

    /// Two users are the same actor when did and group both match;
    /// ungrouped comparison falls back to the DID alone
    pub fn same_actor(&self, did: &str, group: Option<&str>) -> bool {
        if self.group.is_some() || group.is_some() {
            self.did == did && self.group.as_deref() == group
        } else {
            self.did == did
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_composite_id() {
        let user = PolicyUser::new("did:example:alice");
        assert_eq!(user.id(), "did:example:alice");

        let grouped = user.clone().with_group("g-1");
        assert_eq!(grouped.id(), "g-1:did:example:alice");
    }

    #[test]
    fn test_set_group_updates_role() {
        let mut user = PolicyUser::new("did:example:alice").with_role("INSTALLER");
        user.set_group(Some("g-2".into()), Some("VERIFIER".into()));
        assert_eq!(user.group.as_deref(), Some("g-2"));
        assert_eq!(user.role.as_deref(), Some("VERIFIER"));
        user.set_group(None, None);
        assert_eq!(user.id(), "did:example:alice");
    }

    #[test]
    fn test_same_actor() {
        let user = PolicyUser::new("did:example:alice").with_group("g-1");
        assert!(user.same_actor("did:example:alice", Some("g-1")));
        assert!(!user.same_actor("did:example:alice", Some("g-2")));
        assert!(!user.same_actor("did:example:alice", None));

        let plain = PolicyUser::new("did:example:bob");
        assert!(plain.same_actor("did:example:bob", None));
    }

    #[test]
    fn test_virtual_user_flag() {
        let user = PolicyUser::virtual_user("did:virtual:1");
        assert!(user.virtual_user);
        let json = serde_json::to_value(&user).unwrap();
        assert_eq!(json["virtual"], true);
    }
}
