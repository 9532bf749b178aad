//! Permission set vocabulary
//!
//! A block's `permissions` list mixes these markers with policy-defined
//! role names. Semantics (see `BlockRuntime::has_permission`):
//!
//! - `ANY_ROLE` — every user passes
//! - `OWNER` — the policy owner passes
//! - `NO_ROLE` — users with neither a role nor owner status pass
//! - anything else — matched literally against the user's role

/// Every user, regardless of role
pub const ANY_ROLE: &str = "ANY_ROLE";

/// The policy owner
pub const OWNER: &str = "OWNER";

/// Users that have not been assigned a role yet
pub const NO_ROLE: &str = "NO_ROLE";
