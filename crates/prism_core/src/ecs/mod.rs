// ecs/mod.rs - Two-instance ECS with permission-locked transactions
//
// The staging instance is the authoring world; the live instance is the
// simulated world produced by flattening stagings. All component access goes
// through a transaction Lock carrying declared read/write permissions.

pub mod components;
mod entity;
mod instance;
pub mod lock;
mod observer;

pub use components::{Component, ComponentKind, COMPONENT_KIND_COUNT};
pub use entity::{Entity, InstanceKind};
pub use instance::{Ecs, Instance};
pub use lock::{Lock, Permissions};
pub use observer::{ComponentEvent, ComponentEventType, Observer};

use crate::refs::Name;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EcsError {
    #[error("lock upgrade forbidden: requested {requested} while holding {held} on instance {instance}")]
    LockUpgradeForbidden {
        instance: u32,
        held: String,
        requested: String,
    },

    #[error("nested transaction on instance {instance} would deadlock (write lock already held)")]
    NestedTransaction { instance: u32 },

    #[error("access denied: {kind:?} is not in this transaction's permissions (write: {write})")]
    AccessDenied { kind: ComponentKind, write: bool },

    #[error("entity {0} does not exist in this instance")]
    InvalidEntity(Entity),

    #[error("entity {entity} belongs to a different instance than this lock")]
    InstanceMismatch { entity: Entity },

    #[error("duplicate entity name: {0}")]
    DuplicateName(Name),

    #[error("invalid entity name: {0}")]
    InvalidName(String),

    #[error("component '{0}' cannot be written directly")]
    ReservedComponent(&'static str),

    #[error("failed to parse component '{component}': {message}")]
    ComponentParse {
        component: &'static str,
        message: String,
    },
}
