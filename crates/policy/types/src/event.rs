//! Event wiring vocabulary: typed output→input links between blocks
//!
//! Blocks communicate through directed links. A link carries one output
//! event type from a source block to one input event handler on a target
//! block, with an actor rule deciding which user the target acts as.

use crate::definition::{BlockId, PolicyId};
use crate::user::PolicyUser;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Event Types ──────────────────────────────────────────────────────

/// Input event types a block can register a handler for.
/// Closed enumeration: wiring is only valid between these.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PolicyInputEvent {
    /// Run the block's primary action
    #[serde(rename = "RunEvent")]
    Run,
    /// Re-render / recompute derived data
    #[serde(rename = "RefreshEvent")]
    Refresh,
    /// A child released control (step sequencing)
    #[serde(rename = "ReleaseEvent")]
    Release,
    /// A linked block failed
    #[serde(rename = "ErrorEvent")]
    Error,
    /// Explicit confirmation from a user-facing block
    #[serde(rename = "ConfirmEvent")]
    Confirm,
    /// Catch-all entry point of a module block; module targets are wired
    /// to this instead of the literal requested type
    #[serde(rename = "ModuleEvent")]
    Module,
    /// Persisted state was restored from the store
    #[serde(rename = "RestoreEvent")]
    Restore,
    /// Timer tick
    #[serde(rename = "TimerEvent")]
    Timer,
}

/// Output event types a block can emit
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PolicyOutputEvent {
    #[serde(rename = "RunEvent")]
    Run,
    #[serde(rename = "RefreshEvent")]
    Refresh,
    #[serde(rename = "ReleaseEvent")]
    Release,
    #[serde(rename = "ErrorEvent")]
    Error,
    #[serde(rename = "ConfirmEvent")]
    Confirm,
    #[serde(rename = "ModuleEvent")]
    Module,
    #[serde(rename = "TimerEvent")]
    Timer,
}

/// Which user the target block acts as when a link fires
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventActor {
    /// The user who triggered the source block (default)
    #[serde(rename = "")]
    EventInitiator,
    /// The owner of the document carried in the event payload
    #[serde(rename = "owner")]
    DocumentOwner,
    /// The owner of the group the initiator acts in
    #[serde(rename = "group_owner")]
    GroupOwner,
}

impl Default for EventActor {
    fn default() -> Self {
        Self::EventInitiator
    }
}

// ── Declarative Wiring ───────────────────────────────────────────────

/// One declarative wiring rule from a definition's `events` list.
/// Source and target are tags; either endpoint may be the declaring
/// block itself or two other named blocks (cross-wiring from a module).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventConfig {
    pub source: String,
    pub target: String,
    pub output: PolicyOutputEvent,
    pub input: PolicyInputEvent,
    #[serde(default)]
    pub actor: EventActor,
    #[serde(default)]
    pub disabled: bool,
}

impl EventConfig {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        output: PolicyOutputEvent,
        input: PolicyInputEvent,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            output,
            input,
            actor: EventActor::default(),
            disabled: false,
        }
    }

    pub fn with_actor(mut self, actor: EventActor) -> Self {
        self.actor = actor;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }
}

// ── Links and Runtime Events ─────────────────────────────────────────

/// A wired edge: source output → target input, with actor attribution.
/// Links only exist when the target registered a handler for the input
/// type; they are destroyed when either endpoint is destroyed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicyLink {
    pub source: BlockId,
    pub output: PolicyOutputEvent,
    pub target: BlockId,
    pub input: PolicyInputEvent,
    pub actor: EventActor,
}

impl PolicyLink {
    pub fn new(
        source: BlockId,
        output: PolicyOutputEvent,
        target: BlockId,
        input: PolicyInputEvent,
        actor: EventActor,
    ) -> Self {
        Self {
            source,
            output,
            target,
            input,
            actor,
        }
    }
}

/// A runtime event travelling over a link
#[derive(Clone, Debug)]
pub struct BlockEvent {
    pub policy_id: PolicyId,
    /// Block that emitted the event
    pub source: BlockId,
    /// Input type the target handler was registered for
    pub input: PolicyInputEvent,
    /// The acting user after actor resolution
    pub user: PolicyUser,
    /// Opaque payload
    pub data: Value,
}

impl BlockEvent {
    /// Resolve the acting user for a link per its actor rule.
    ///
    /// Document/group owner resolution reads `owner` / `group_owner`
    /// fields from the payload and falls back to the initiator when the
    /// payload does not carry them.
    pub fn resolve_actor(actor: EventActor, initiator: &PolicyUser, data: &Value) -> PolicyUser {
        match actor {
            EventActor::EventInitiator => initiator.clone(),
            EventActor::DocumentOwner => match data.get("owner").and_then(Value::as_str) {
                Some(did) => PolicyUser::new(did),
                None => initiator.clone(),
            },
            EventActor::GroupOwner => match data.get("group_owner").and_then(Value::as_str) {
                Some(did) => PolicyUser::new(did),
                None => initiator.clone(),
            },
        }
    }
}
