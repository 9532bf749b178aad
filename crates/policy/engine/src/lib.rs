//! Policy block execution engine
//!
//! Turns serialized policy definitions into live, wired graphs of
//! stateful blocks and runs them per acting user. The moving parts:
//!
//! - [`BlockTreeGenerator`] — the façade: generate, validate, destroy and
//!   the per-user request surface
//! - [`PolicyComponents`] — the registry of every live block, its wiring
//!   machinery and teardown cascade
//! - [`BlockRuntime`] / [`BlockBehavior`] — shared block machinery around
//!   a pluggable, type-specific behavior
//! - [`UpdateScheduler`] — debounced, ancestor-reduced per-user update
//!   broadcasts
//! - [`PolicyStore`] / [`UpdateSink`] — the persistence and notification
//!   seams toward the embedding process

#![deny(unsafe_code)]

pub mod behavior;
pub mod block;
pub mod blocks;
pub mod bus;
pub mod components;
pub mod config;
pub mod generator;
pub mod scheduler;
pub mod sink;
pub mod store;

pub use behavior::{BehaviorFactory, BlockBehavior, BlockKindRegistry, BlockRef, SetDataConcurrency};
pub use block::BlockRuntime;
pub use bus::InternalBus;
pub use components::{PolicyComponents, PolicyInstance};
pub use config::EngineConfig;
pub use generator::BlockTreeGenerator;
pub use scheduler::UpdateScheduler;
pub use sink::{NullUpdateSink, UpdateSink};
pub use store::{GroupRecord, InMemoryPolicyStore, MemberRecord, PolicyStore};
