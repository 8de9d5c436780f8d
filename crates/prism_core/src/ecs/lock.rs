// lock.rs - Permission-checked ECS transactions
//
// A Lock is a transaction over one instance. Its Permissions declare which
// component kinds may be read or written; violations fail at the call site
// with a descriptive error rather than silently touching undeclared state.
//
// Writers are exclusive per instance. All mutations made under one write
// lock become visible together when the lock drops, and the deferred queue
// drains only after the outermost lock on this thread releases.

use crate::ecs::components::{Component, ComponentKind};
use crate::ecs::instance::{DeferredEntry, Instance, InstanceData};
use crate::ecs::observer::{ComponentEventType, Observer};
use crate::ecs::{EcsError, Entity, InstanceKind};
use crate::focus::FocusState;
use crate::refs::{Name, ReferenceManager};
use crate::signals::Signals;
use parking_lot::{RwLockReadGuard, RwLockWriteGuard};
use std::cell::RefCell;
use std::sync::Arc;

/// The capability set of a transaction: a read mask, a write mask, and the
/// add/remove flag. AddRemove implies read and write access to everything.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Permissions {
    read: u64,
    write: u64,
    add_remove: bool,
}

impl Permissions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full access, including entity creation/destruction and component
    /// add/remove.
    pub fn add_remove() -> Self {
        Self {
            read: ComponentKind::all_mask(),
            write: ComponentKind::all_mask(),
            add_remove: true,
        }
    }

    /// Read access to every component kind.
    pub fn read_all() -> Self {
        Self {
            read: ComponentKind::all_mask(),
            write: 0,
            add_remove: false,
        }
    }

    pub fn read<T: Component>(self) -> Self {
        self.read_kind(T::KIND)
    }

    pub fn write<T: Component>(self) -> Self {
        self.write_kind(T::KIND)
    }

    pub fn read_kind(mut self, kind: ComponentKind) -> Self {
        self.read |= kind.mask();
        self
    }

    pub fn write_kind(mut self, kind: ComponentKind) -> Self {
        self.write |= kind.mask();
        self
    }

    pub fn read_kinds(mut self, kinds: &[ComponentKind]) -> Self {
        for kind in kinds {
            self.read |= kind.mask();
        }
        self
    }

    pub fn write_kinds(mut self, kinds: &[ComponentKind]) -> Self {
        for kind in kinds {
            self.write |= kind.mask();
        }
        self
    }

    fn read_mask(&self) -> u64 {
        if self.add_remove {
            ComponentKind::all_mask()
        } else {
            // Write access implies read access to the same kind
            self.read | self.write
        }
    }

    fn write_mask(&self) -> u64 {
        if self.add_remove {
            ComponentKind::all_mask()
        } else {
            self.write
        }
    }

    pub fn can_read(&self, kind: ComponentKind) -> bool {
        self.read_mask() & kind.mask() != 0
    }

    pub fn can_write(&self, kind: ComponentKind) -> bool {
        self.write_mask() & kind.mask() != 0
    }

    pub fn can_add_remove(&self) -> bool {
        self.add_remove
    }

    pub(crate) fn requires_write_guard(&self) -> bool {
        self.write != 0 || self.add_remove
    }

    pub fn is_superset(&self, other: &Permissions) -> bool {
        (other.read_mask() & !self.read_mask()) == 0
            && (other.write_mask() & !self.write_mask()) == 0
            && (self.add_remove || !other.add_remove)
    }
}

impl std::fmt::Display for Permissions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Permissions(read: {:#x}, write: {:#x}, add_remove: {})",
            self.read, self.write, self.add_remove
        )
    }
}

thread_local! {
    /// (instance id, permissions) for every lock this thread holds.
    static HELD: RefCell<Vec<(u32, Permissions)>> = const { RefCell::new(Vec::new()) };
    /// Instances whose deferred queues are currently draining on this thread.
    static DRAINING: RefCell<Vec<u32>> = const { RefCell::new(Vec::new()) };
}

enum Guard<'a> {
    Read(RwLockReadGuard<'a, InstanceData>),
    Write(RwLockWriteGuard<'a, InstanceData>),
}

impl<'a> Guard<'a> {
    fn data(&self) -> &InstanceData {
        match self {
            Guard::Read(guard) => guard,
            Guard::Write(guard) => guard,
        }
    }

    fn data_mut(&mut self) -> Option<&mut InstanceData> {
        match self {
            Guard::Read(_) => None,
            Guard::Write(guard) => Some(guard),
        }
    }
}

/// An active transaction on one ECS instance.
pub struct Lock<'a> {
    instance: &'a Instance,
    refs: &'a Arc<ReferenceManager>,
    perms: Permissions,
    guard: Option<Guard<'a>>,
}

/// Acquire a transaction lock, enforcing the permission algebra against
/// locks already held by this thread.
pub(crate) fn acquire<'a>(
    instance: &'a Instance,
    refs: &'a Arc<ReferenceManager>,
    perms: Permissions,
) -> Result<Lock<'a>, EcsError> {
    let mut nested_read = false;
    HELD.with(|held| -> Result<(), EcsError> {
        for (id, held_perms) in held.borrow().iter() {
            if *id != instance.id {
                continue;
            }
            if held_perms.requires_write_guard() {
                // Re-acquiring under our own writer lock always deadlocks
                return Err(EcsError::NestedTransaction {
                    instance: instance.id,
                });
            }
            if perms.requires_write_guard() || !held_perms.is_superset(&perms) {
                return Err(EcsError::LockUpgradeForbidden {
                    instance: instance.id,
                    held: held_perms.to_string(),
                    requested: perms.to_string(),
                });
            }
            nested_read = true;
        }
        Ok(())
    })?;

    let guard = if perms.requires_write_guard() {
        Guard::Write(instance.data.write())
    } else if nested_read {
        Guard::Read(instance.data.read_recursive())
    } else {
        Guard::Read(instance.data.read())
    };

    HELD.with(|held| held.borrow_mut().push((instance.id, perms)));

    Ok(Lock {
        instance,
        refs,
        perms,
        guard: Some(guard),
    })
}

impl<'a> Lock<'a> {
    pub fn instance_kind(&self) -> InstanceKind {
        self.instance.kind
    }

    pub fn instance_id(&self) -> u32 {
        self.instance.id
    }

    pub fn permissions(&self) -> Permissions {
        self.perms
    }

    pub fn refs(&self) -> &Arc<ReferenceManager> {
        self.refs
    }

    fn data(&self) -> &InstanceData {
        self.guard.as_ref().expect("lock already released").data()
    }

    fn data_mut(&mut self) -> &mut InstanceData {
        self.guard
            .as_mut()
            .expect("lock already released")
            .data_mut()
            .expect("write access without a write guard")
    }

    fn check_read(&self, kind: ComponentKind) -> Result<(), EcsError> {
        if self.perms.can_read(kind) {
            Ok(())
        } else {
            Err(EcsError::AccessDenied { kind, write: false })
        }
    }

    fn check_write(&self, kind: ComponentKind) -> Result<(), EcsError> {
        if self.perms.can_write(kind) {
            Ok(())
        } else {
            Err(EcsError::AccessDenied { kind, write: true })
        }
    }

    fn check_add_remove(&self, kind: ComponentKind) -> Result<(), EcsError> {
        if self.perms.can_add_remove() {
            Ok(())
        } else {
            Err(EcsError::AccessDenied { kind, write: true })
        }
    }

    // ------------------------------------------------------------------
    // Entities
    // ------------------------------------------------------------------

    /// Create a new (component-less) entity. Requires AddRemove.
    pub fn new_entity(&mut self) -> Result<Entity, EcsError> {
        self.check_add_remove(ComponentKind::Name)?;
        Ok(self.data_mut().alloc_entity())
    }

    /// Destroy an entity, dropping its components, name, and signals.
    pub fn destroy(&mut self, entity: Entity) -> Result<(), EcsError> {
        self.check_add_remove(ComponentKind::Name)?;
        let refs = self.refs.clone();
        let data = self.data_mut();
        data.validate(entity)?;

        let name = data.stores.name.get(entity.index).cloned();
        let mask = data.slots[entity.index as usize].mask;
        let removed = data.stores.clear_entity(entity.index, mask);
        for kind in removed {
            data.observers
                .notify(entity, kind, ComponentEventType::Removed);
        }
        if let Some(name) = name {
            data.names.remove(&name);
        }
        if data.kind == InstanceKind::Live {
            data.signals.free_entity_signals(entity);
        }

        let slot = &mut data.slots[entity.index as usize];
        slot.alive = false;
        slot.mask = 0;
        slot.generation = slot.generation.wrapping_add(1).max(1);
        data.free.push(entity.index);

        refs.clear_entity(entity);
        Ok(())
    }

    /// Whether the entity id is current in this instance. No permissions
    /// required.
    pub fn is_valid(&self, entity: Entity) -> bool {
        self.data().is_valid(entity)
    }

    /// Component existence is queryable without any declared access.
    pub fn has_kind(&self, entity: Entity, kind: ComponentKind) -> bool {
        let data = self.data();
        if !data.is_valid(entity) {
            return false;
        }
        data.slots[entity.index as usize].mask & kind.mask() != 0
    }

    pub fn has<T: Component>(&self, entity: Entity) -> bool {
        self.has_kind(entity, T::KIND)
    }

    /// All entities carrying every listed kind. Iteration requires read
    /// permission on each kind in the filter.
    pub fn entities_with(&self, kinds: &[ComponentKind]) -> Result<Vec<Entity>, EcsError> {
        let mut mask = 0u64;
        for kind in kinds {
            self.check_read(*kind)?;
            mask |= kind.mask();
        }
        let data = self.data();
        let mut result = Vec::new();
        for (index, slot) in data.slots.iter().enumerate() {
            if slot.alive && slot.mask & mask == mask {
                result.push(Entity::new(index as u32, slot.generation, data.kind));
            }
        }
        Ok(result)
    }

    // ------------------------------------------------------------------
    // Components
    // ------------------------------------------------------------------

    pub fn get<T: Component>(&self, entity: Entity) -> Result<Option<&T>, EcsError> {
        self.check_read(T::KIND)?;
        let data = self.data();
        if !data.is_valid(entity) {
            return Ok(None);
        }
        Ok(T::store(&data.stores).get(entity.index))
    }

    pub fn get_mut<T: Component>(&mut self, entity: Entity) -> Result<Option<&mut T>, EcsError> {
        self.check_write(T::KIND)?;
        let data = self.data_mut();
        if !data.is_valid(entity) {
            return Ok(None);
        }
        Ok(T::store_mut(&mut data.stores).get_mut(entity.index))
    }

    /// Set a component, returning the previous value. Adding a component
    /// the entity lacks requires AddRemove; overwriting requires Write.
    pub fn set<T: Component>(&mut self, entity: Entity, value: T) -> Result<Option<T>, EcsError> {
        if T::KIND == ComponentKind::Name {
            return Err(EcsError::ReservedComponent(T::NAME));
        }
        let exists = self.has_kind(entity, T::KIND);
        if exists {
            self.check_write(T::KIND)?;
        } else {
            self.check_add_remove(T::KIND)?;
        }
        let data = self.data_mut();
        data.validate(entity)?;
        let previous = T::store_mut(&mut data.stores).insert(entity.index, value);
        if !exists {
            data.slots[entity.index as usize].mask |= T::KIND.mask();
            data.observers
                .notify(entity, T::KIND, ComponentEventType::Added);
        }
        Ok(previous)
    }

    /// Remove a component. Requires AddRemove.
    pub fn unset<T: Component>(&mut self, entity: Entity) -> Result<Option<T>, EcsError> {
        if T::KIND == ComponentKind::Name {
            return Err(EcsError::ReservedComponent(T::NAME));
        }
        self.check_add_remove(T::KIND)?;
        let data = self.data_mut();
        data.validate(entity)?;
        let previous = T::store_mut(&mut data.stores).remove(entity.index);
        if previous.is_some() {
            data.slots[entity.index as usize].mask &= !T::KIND.mask();
            data.observers
                .notify(entity, T::KIND, ComponentEventType::Removed);
        }
        Ok(previous)
    }

    // ------------------------------------------------------------------
    // Names
    // ------------------------------------------------------------------

    /// Assign an entity's unique name, updating the reference manager.
    pub fn set_name(&mut self, entity: Entity, name: Name) -> Result<(), EcsError> {
        self.check_add_remove(ComponentKind::Name)?;
        if !name.is_valid() {
            return Err(EcsError::InvalidName(name.to_string()));
        }
        let refs = self.refs.clone();
        let data = self.data_mut();
        data.validate(entity)?;
        if let Some(existing) = data.names.get(&name) {
            if *existing != entity {
                return Err(EcsError::DuplicateName(name));
            }
            return Ok(());
        }
        data.stores.name.insert(entity.index, name.clone());
        data.slots[entity.index as usize].mask |= ComponentKind::Name.mask();
        data.names.insert(name.clone(), entity);
        refs.set_entity(&name, entity);
        Ok(())
    }

    pub fn entity_by_name(&self, name: &Name) -> Result<Option<Entity>, EcsError> {
        self.check_read(ComponentKind::Name)?;
        Ok(self.data().names.get(name).copied())
    }

    // ------------------------------------------------------------------
    // Globals
    // ------------------------------------------------------------------

    pub fn signals(&self) -> Result<&Signals, EcsError> {
        self.check_read(ComponentKind::Signals)?;
        Ok(&self.data().signals)
    }

    pub fn signals_mut(&mut self) -> Result<&mut Signals, EcsError> {
        self.check_write(ComponentKind::Signals)?;
        Ok(&mut self.data_mut().signals)
    }

    pub fn focus(&self) -> Result<&FocusState, EcsError> {
        self.check_read(ComponentKind::Focus)?;
        Ok(&self.data().focus)
    }

    pub fn focus_mut(&mut self) -> Result<&mut FocusState, EcsError> {
        self.check_write(ComponentKind::Focus)?;
        Ok(&mut self.data_mut().focus)
    }

    // ------------------------------------------------------------------
    // Observers and deferred transactions
    // ------------------------------------------------------------------

    /// Register an add/remove observer for a component kind.
    pub fn watch(&mut self, kind: ComponentKind) -> Result<Observer, EcsError> {
        self.check_add_remove(kind)?;
        Ok(self.data_mut().observers.watch(kind))
    }

    pub fn unwatch(&mut self, observer: &Observer) -> Result<(), EcsError> {
        self.check_add_remove(observer.kind())?;
        self.data_mut().observers.unwatch(observer);
        Ok(())
    }

    /// Queue a closure to run under a fresh lock of `perms` once the
    /// outermost lock on this thread releases. This is how code running
    /// under a read lock performs nested logical mutations without
    /// re-entrancy deadlock.
    pub fn defer(
        &self,
        perms: Permissions,
        func: impl FnOnce(&mut Lock) + Send + 'static,
    ) -> Result<(), EcsError> {
        self.instance.deferred.lock().push_back(DeferredEntry {
            perms,
            func: Box::new(func),
        });
        Ok(())
    }
}

impl<'a> Drop for Lock<'a> {
    fn drop(&mut self) {
        // Unregister from the held-lock stack, then release the guard
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|(id, _)| *id == self.instance.id) {
                held.remove(pos);
            }
        });
        self.guard = None;

        let still_held =
            HELD.with(|held| held.borrow().iter().any(|(id, _)| *id == self.instance.id));
        let already_draining =
            DRAINING.with(|draining| draining.borrow().contains(&self.instance.id));
        if still_held || already_draining {
            return;
        }

        // Drain deferred transactions outside any critical section. Each
        // entry gets an independently acquired lock of its requested
        // permissions; entries may enqueue more work while running.
        DRAINING.with(|draining| draining.borrow_mut().push(self.instance.id));
        loop {
            let entry = self.instance.deferred.lock().pop_front();
            let Some(entry) = entry else {
                break;
            };
            match acquire(self.instance, self.refs, entry.perms) {
                Ok(mut lock) => (entry.func)(&mut lock),
                Err(err) => {
                    tracing::error!(error = %err, "failed to run deferred transaction");
                }
            }
        }
        DRAINING.with(|draining| {
            draining.borrow_mut().retain(|id| *id != self.instance.id);
        });
    }
}
