//! Reference manager - interned entity names and signal keys
//!
//! Refs are created on demand and preserved while anything outside the
//! manager holds them. [`ReferenceManager::tick`] sweeps refs that have had
//! no external users for a grace period, keeping the intern tables bounded.

mod entity_ref;
mod name;
mod signal_ref;

pub use entity_ref::EntityRef;
pub use name::{EntityScope, Name, INVALID_NAME_CHARS};
pub use signal_ref::{SignalKey, SignalRef};

pub(crate) use entity_ref::EntityRefData;
pub(crate) use signal_ref::{SignalRefData, NULL_SIGNAL_INDEX};

use crate::ecs::{Entity, InstanceKind};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Map that retains entries until they have been externally unused for a
/// grace period. "Unused" means the map holds the only strong reference.
struct PreservingMap<K, V> {
    entries: HashMap<K, PreservedEntry<V>>,
}

struct PreservedEntry<V> {
    value: Arc<V>,
    idle: Duration,
}

impl<K: std::hash::Hash + Eq + Clone, V> PreservingMap<K, V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    fn load(&self, key: &K) -> Option<Arc<V>> {
        self.entries.get(key).map(|e| e.value.clone())
    }

    fn register(&mut self, key: K, value: Arc<V>) {
        self.entries.insert(
            key,
            PreservedEntry {
                value,
                idle: Duration::ZERO,
            },
        );
    }

    fn for_each(&self, mut f: impl FnMut(&K, &Arc<V>)) {
        for (key, entry) in &self.entries {
            f(key, &entry.value);
        }
    }

    /// Age idle entries by `elapsed`, dropping those idle past `max_idle`.
    fn tick(&mut self, elapsed: Duration, max_idle: Duration, mut on_drop: impl FnMut(Arc<V>)) {
        let mut expired = Vec::new();
        for (key, entry) in self.entries.iter_mut() {
            if Arc::strong_count(&entry.value) > 1 {
                entry.idle = Duration::ZERO;
            } else {
                entry.idle += elapsed;
                if entry.idle >= max_idle {
                    expired.push(key.clone());
                }
            }
        }
        for key in expired {
            if let Some(entry) = self.entries.remove(&key) {
                on_drop(entry.value);
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Process-wide intern tables for entity names and signal keys, with reverse
/// maps from live/staging entity ids back to their refs.
pub struct ReferenceManager {
    entity_refs: RwLock<PreservingMap<Name, EntityRefData>>,
    signal_refs: RwLock<PreservingMap<(Name, String), SignalRefData>>,
    live_refs: RwLock<HashMap<Entity, Weak<EntityRefData>>>,
    staging_refs: RwLock<HashMap<Entity, Weak<EntityRefData>>>,
    last_tick: parking_lot::Mutex<Instant>,
}

impl Default for ReferenceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceManager {
    pub fn new() -> Self {
        Self {
            entity_refs: RwLock::new(PreservingMap::new()),
            signal_refs: RwLock::new(PreservingMap::new()),
            live_refs: RwLock::new(HashMap::new()),
            staging_refs: RwLock::new(HashMap::new()),
            last_tick: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Look up or intern the ref for `name`.
    pub fn get_entity(&self, name: &Name) -> EntityRef {
        if !name.is_valid() {
            return EntityRef::default();
        }
        if let Some(data) = self.entity_refs.read().load(name) {
            return EntityRef::from_data(data);
        }
        let mut refs = self.entity_refs.write();
        // Double-check under the write lock
        if let Some(data) = refs.load(name) {
            return EntityRef::from_data(data);
        }
        let data = Arc::new(EntityRefData::new(name.clone()));
        refs.register(name.clone(), data.clone());
        EntityRef::from_data(data)
    }

    /// Reverse lookup: the interned ref currently mapped to `entity`, or a
    /// null ref if no name is associated.
    pub fn get_entity_by_id(&self, entity: Entity) -> EntityRef {
        if entity.is_null() {
            return EntityRef::default();
        }
        let map = match entity.instance {
            InstanceKind::Live => self.live_refs.read(),
            InstanceKind::Staging => self.staging_refs.read(),
        };
        map.get(&entity)
            .and_then(Weak::upgrade)
            .map(EntityRef::from_data)
            .unwrap_or_default()
    }

    /// Associate `entity` with `name`, updating the matching reverse map.
    pub fn set_entity(&self, name: &Name, entity: Entity) -> EntityRef {
        debug_assert!(entity.exists(), "set_entity called with null entity");
        let entity_ref = self.get_entity(name);
        if let Some(data) = entity_ref.inner.as_ref() {
            entity_ref.set_id(entity);
            let mut map = match entity.instance {
                InstanceKind::Live => self.live_refs.write(),
                InstanceKind::Staging => self.staging_refs.write(),
            };
            map.insert(entity, Arc::downgrade(data));
        }
        entity_ref
    }

    /// Drop the id association when an entity is destroyed.
    pub fn clear_entity(&self, entity: Entity) {
        if entity.is_null() {
            return;
        }
        let removed = {
            let mut map = match entity.instance {
                InstanceKind::Live => self.live_refs.write(),
                InstanceKind::Staging => self.staging_refs.write(),
            };
            map.remove(&entity)
        };
        if let Some(weak) = removed {
            if let Some(data) = weak.upgrade() {
                EntityRef::from_data(data).clear_id(entity.instance);
            }
        }
    }

    /// All interned names containing `search` (empty matches everything).
    pub fn get_entity_names(&self, search: &str) -> BTreeSet<Name> {
        let mut results = BTreeSet::new();
        self.entity_refs.read().for_each(|name, _| {
            if search.is_empty() || name.to_string().contains(search) {
                results.insert(name.clone());
            }
        });
        results
    }

    /// Look up or intern the ref for a signal key.
    pub fn get_signal(&self, key: &SignalKey) -> SignalRef {
        if !key.is_valid() {
            return SignalRef::default();
        }
        let map_key = (key.entity.name(), key.signal_name.clone());
        if let Some(data) = self.signal_refs.read().load(&map_key) {
            return SignalRef::from_data(data);
        }
        let mut refs = self.signal_refs.write();
        if let Some(data) = refs.load(&map_key) {
            return SignalRef::from_data(data);
        }
        // Re-intern the entity ref so the signal key always points at the
        // canonical ref for its name.
        let key = SignalKey {
            entity: self.get_entity(&key.entity.name()),
            signal_name: key.signal_name.clone(),
        };
        let data = Arc::new(SignalRefData {
            key,
            index: std::sync::atomic::AtomicUsize::new(NULL_SIGNAL_INDEX),
        });
        refs.register(map_key, data.clone());
        SignalRef::from_data(data)
    }

    /// Parse and intern `entity/signal` under a scope.
    pub fn get_signal_by_path(&self, path: &str, scope: &EntityScope) -> SignalRef {
        match SignalKey::parse(path, scope, self) {
            Some(key) => self.get_signal(&key),
            None => SignalRef::default(),
        }
    }

    /// All interned signal keys containing `search`.
    pub fn get_signals(&self, search: &str) -> Vec<SignalKey> {
        let mut results = Vec::new();
        self.signal_refs.read().for_each(|_, data| {
            if search.is_empty() || data.key.to_string().contains(search) {
                results.push(data.key.clone());
            }
        });
        results.sort_by_key(|k| k.to_string());
        results
    }

    /// Sweep refs with no external strong users for at least `max_idle`.
    pub fn tick(&self, max_idle: Duration) {
        let elapsed = {
            let mut last = self.last_tick.lock();
            let now = Instant::now();
            let elapsed = now - *last;
            *last = now;
            elapsed
        };

        let mut dropped_entities = Vec::new();
        self.entity_refs
            .write()
            .tick(elapsed, max_idle, |data| dropped_entities.push(data));
        for data in dropped_entities {
            let entity_ref = EntityRef::from_data(data);
            let live = entity_ref.get_live();
            let staging = entity_ref.get_staging();
            if live.exists() {
                self.live_refs.write().remove(&live);
            }
            if staging.exists() {
                self.staging_refs.write().remove(&staging);
            }
        }

        self.signal_refs.write().tick(elapsed, max_idle, |_| {});
    }

    pub fn entity_ref_count(&self) -> usize {
        self.entity_refs.read().len()
    }

    pub fn signal_ref_count(&self) -> usize {
        self.signal_refs.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refs_are_interned_per_name() {
        let refs = ReferenceManager::new();
        let a = refs.get_entity(&Name::new("scene", "door"));
        let b = refs.get_entity(&Name::new("scene", "door"));
        let c = refs.get_entity(&Name::new("scene", "valve"));
        assert!(a.ptr_eq(&b));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(refs.entity_ref_count(), 2);
    }

    #[test]
    fn set_entity_updates_reverse_map() {
        let refs = ReferenceManager::new();
        let name = Name::new("scene", "door");
        let entity = Entity::new(3, 1, InstanceKind::Live);
        let r = refs.set_entity(&name, entity);
        assert_eq!(r.get_live(), entity);
        assert_eq!(refs.get_entity_by_id(entity), r);

        refs.clear_entity(entity);
        assert!(refs.get_entity_by_id(entity).inner.is_none());
        assert!(r.get_live().is_null());
    }

    #[test]
    fn tick_sweeps_unused_refs() {
        let refs = ReferenceManager::new();
        let name = Name::new("scene", "temp");
        let held = refs.get_entity(&name);
        refs.get_entity(&Name::new("scene", "dropped"));

        // First tick observes both; only the unheld ref ages out.
        refs.tick(Duration::ZERO);
        assert_eq!(refs.entity_ref_count(), 1);
        assert!(held.is_valid());

        drop(held);
        refs.tick(Duration::ZERO);
        assert_eq!(refs.entity_ref_count(), 0);
    }

    #[test]
    fn signal_refs_intern_by_key() {
        let refs = ReferenceManager::new();
        let scope = Name::new("scene", "");
        let a = refs.get_signal_by_path("door/open", &scope);
        let b = refs.get_signal_by_path("door/open", &scope);
        assert!(a.ptr_eq(&b));
        assert_eq!(a.signal_name(), "open");
        assert_eq!(a.entity().name(), Name::new("scene", "door"));

        assert!(!refs.get_signal_by_path("no_separator", &scope).is_valid());
        assert!(!refs.get_signal_by_path("door/bad name", &scope).is_valid());
    }
}
