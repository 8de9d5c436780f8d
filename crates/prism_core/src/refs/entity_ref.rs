// entity_ref.rs - Shared name-keyed entity handles
//
// An EntityRef survives entity destruction and silently resolves to the null
// id. Interned refs (one per name, held by the ReferenceManager) compare
// equal by pointer; refs deserialized from scene JSON float unattached until
// their component's scope is resolved.

use crate::ecs::{Entity, InstanceKind};
use crate::refs::{EntityScope, Name, ReferenceManager};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug)]
pub(crate) struct EntityRefData {
    pub(crate) name: Name,
    pub(crate) live: AtomicU64,
    pub(crate) staging: AtomicU64,
}

impl EntityRefData {
    pub(crate) fn new(name: Name) -> Self {
        Self {
            name,
            live: AtomicU64::new(0),
            staging: AtomicU64::new(0),
        }
    }
}

/// A shared handle resolving a name to the current live/staging entity ids.
#[derive(Clone, Debug, Default)]
pub struct EntityRef {
    pub(crate) inner: Option<Arc<EntityRefData>>,
}

impl EntityRef {
    /// An unattached ref carrying only a name. Interned on scope resolution.
    pub(crate) fn floating(name: Name) -> Self {
        Self {
            inner: Some(Arc::new(EntityRefData::new(name))),
        }
    }

    pub(crate) fn from_data(data: Arc<EntityRefData>) -> Self {
        Self { inner: Some(data) }
    }

    pub fn is_valid(&self) -> bool {
        self.inner.is_some()
    }

    pub fn name(&self) -> Name {
        self.inner
            .as_ref()
            .map(|r| r.name.clone())
            .unwrap_or_default()
    }

    pub fn get_live(&self) -> Entity {
        self.inner
            .as_ref()
            .map(|r| Entity::from_bits(r.live.load(Ordering::Acquire)))
            .unwrap_or(Entity::NULL)
    }

    pub fn get_staging(&self) -> Entity {
        self.inner
            .as_ref()
            .map(|r| Entity::from_bits(r.staging.load(Ordering::Acquire)))
            .unwrap_or(Entity::NULL)
    }

    /// Resolve to the id matching the given instance.
    pub fn get(&self, instance: InstanceKind) -> Entity {
        match instance {
            InstanceKind::Live => self.get_live(),
            InstanceKind::Staging => self.get_staging(),
        }
    }

    pub(crate) fn set_id(&self, entity: Entity) {
        let Some(inner) = self.inner.as_ref() else {
            return;
        };
        match entity.instance {
            InstanceKind::Live => inner.live.store(entity.to_bits(), Ordering::Release),
            InstanceKind::Staging => inner.staging.store(entity.to_bits(), Ordering::Release),
        }
    }

    pub(crate) fn clear_id(&self, instance: InstanceKind) {
        let Some(inner) = self.inner.as_ref() else {
            return;
        };
        match instance {
            InstanceKind::Live => inner.live.store(0, Ordering::Release),
            InstanceKind::Staging => inner.staging.store(0, Ordering::Release),
        }
    }

    /// Re-resolve this ref's name under a new scope and intern it.
    pub fn set_scope(&mut self, scope: &EntityScope, refs: &ReferenceManager) {
        let Some(inner) = self.inner.as_ref() else {
            return;
        };
        let full = if inner.name.scene.is_empty() {
            Name::parse(&inner.name.local, scope)
        } else {
            Some(inner.name.clone())
        };
        match full {
            Some(name) => *self = refs.get_entity(&name),
            None => self.inner = None,
        }
    }

    pub fn clear(&mut self) {
        self.inner = None;
    }

    pub(crate) fn ptr_eq(&self, other: &EntityRef) -> bool {
        match (&self.inner, &other.inner) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl PartialEq for EntityRef {
    fn eq(&self, other: &Self) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        match (&self.inner, &other.inner) {
            (Some(a), Some(b)) => a.name == b.name,
            _ => false,
        }
    }
}

impl Eq for EntityRef {}

impl std::hash::Hash for EntityRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name().hash(state);
    }
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            Some(data) => write!(f, "{}", data.name),
            None => write!(f, "<null>"),
        }
    }
}

impl Serialize for EntityRef {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match &self.inner {
            Some(data) if !data.name.scene.is_empty() => {
                serializer.serialize_str(&data.name.to_string())
            }
            Some(data) => serializer.serialize_str(&data.name.local),
            None => serializer.serialize_str(""),
        }
    }
}

impl<'de> Deserialize<'de> for EntityRef {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s.is_empty() {
            return Ok(EntityRef::default());
        }
        // Bare names keep an empty scene until the owning component's scope
        // is applied.
        let name = match s.split_once(':') {
            Some((scene, local)) => Name::new(scene, local),
            None => Name::new("", s),
        };
        Ok(EntityRef::floating(name))
    }
}
