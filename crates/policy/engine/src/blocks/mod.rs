//! Built-in structural block kinds
//!
//! These cover the structure every policy needs: grouping (`container`),
//! sequencing (`step`), composition (`module`), display (`info`) and data
//! intake (`request`). Domain-specific kinds are added by embedders
//! through [`BlockKindRegistry::register`].

use crate::behavior::BlockKindRegistry;
use std::sync::Arc;

pub mod container;
pub mod info;
pub mod module;
pub mod request;
pub mod step;

pub use container::ContainerBehavior;
pub use info::InfoBehavior;
pub use module::ModuleBehavior;
pub use request::RequestBehavior;
pub use step::StepBehavior;

use crate::behavior::BlockBehavior;

pub(crate) fn register_builtins(registry: &BlockKindRegistry) {
    registry.register(
        "container",
        Arc::new(|_| Ok(Box::new(ContainerBehavior) as Box<dyn BlockBehavior>)),
    );
    registry.register(
        "step",
        Arc::new(|options| Ok(Box::new(StepBehavior::from_options(options)) as Box<dyn BlockBehavior>)),
    );
    registry.register(
        "module",
        Arc::new(|_| Ok(Box::new(ModuleBehavior) as Box<dyn BlockBehavior>)),
    );
    registry.register(
        "info",
        Arc::new(|_| Ok(Box::new(InfoBehavior) as Box<dyn BlockBehavior>)),
    );
    registry.register(
        "request",
        Arc::new(|_| Ok(Box::new(RequestBehavior) as Box<dyn BlockBehavior>)),
    );
}
