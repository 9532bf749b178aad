//! Policy domain types for the block execution engine
//!
//! A policy is a declarative tree of block definitions. The engine turns
//! that tree into a live graph of stateful blocks, wired together with
//! typed event links, and executes it per acting user.
//!
//! This crate holds the pure data layer:
//!
//! - [`BlockDefinition`] / [`PolicyDocument`] — the serialized tree
//! - [`PolicyUser`] — the acting identity (did, role, group)
//! - [`PolicyInputEvent`] / [`PolicyOutputEvent`] / [`PolicyLink`] — the
//!   event wiring vocabulary
//! - [`PolicyError`] / [`ValidationReport`] — error and diagnostics types

#![deny(unsafe_code)]

pub mod definition;
pub mod error;
pub mod event;
pub mod permission;
pub mod report;
pub mod user;

pub use definition::{
    BlockDefinition, BlockId, GroupTemplate, PolicyDocument, PolicyId, PolicyStatus, VariableRef,
};
pub use error::{PolicyError, PolicyResult};
pub use event::{
    BlockEvent, EventActor, EventConfig, PolicyInputEvent, PolicyLink, PolicyOutputEvent,
};
pub use report::{BlockValidationRecord, ValidationReport};
pub use user::PolicyUser;
