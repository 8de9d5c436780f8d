// instance.rs - Per-instance entity and component storage
//
// Each instance owns generation-checked entity slots, a dense store per
// component kind, the name uniqueness map, and (on the live instance) the
// global signal arena and focus state. All of it sits behind one
// reader-writer lock; the transaction layer decides which guard to take.

use crate::ecs::components::Stores;
use crate::ecs::lock::{self, Lock, Permissions};
use crate::ecs::observer::ObserverRegistry;
use crate::ecs::{EcsError, Entity, InstanceKind};
use crate::focus::FocusState;
use crate::refs::{Name, ReferenceManager};
use crate::signals::Signals;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

static INSTANCE_IDS: AtomicU32 = AtomicU32::new(1);

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct EntitySlot {
    pub generation: u32,
    pub alive: bool,
    pub mask: u64,
}

pub(crate) struct InstanceData {
    pub kind: InstanceKind,
    pub slots: Vec<EntitySlot>,
    pub free: Vec<u32>,
    pub stores: Stores,
    pub names: HashMap<Name, Entity>,
    pub signals: Signals,
    pub focus: FocusState,
    pub observers: ObserverRegistry,
}

impl InstanceData {
    fn new(kind: InstanceKind) -> Self {
        Self {
            kind,
            slots: Vec::new(),
            free: Vec::new(),
            stores: Stores::default(),
            names: HashMap::new(),
            signals: Signals::default(),
            focus: FocusState::default(),
            observers: ObserverRegistry::default(),
        }
    }

    pub(crate) fn validate(&self, entity: Entity) -> Result<(), EcsError> {
        if entity.is_null() {
            return Err(EcsError::InvalidEntity(entity));
        }
        if entity.instance != self.kind {
            return Err(EcsError::InstanceMismatch { entity });
        }
        match self.slots.get(entity.index as usize) {
            Some(slot) if slot.alive && slot.generation == entity.generation => Ok(()),
            _ => Err(EcsError::InvalidEntity(entity)),
        }
    }

    pub(crate) fn is_valid(&self, entity: Entity) -> bool {
        self.validate(entity).is_ok()
    }

    pub(crate) fn alloc_entity(&mut self) -> Entity {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.alive = true;
                slot.mask = 0;
                Entity::new(index, slot.generation, self.kind)
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(EntitySlot {
                    generation: 1,
                    alive: true,
                    mask: 0,
                });
                Entity::new(index, 1, self.kind)
            }
        }
    }
}

pub(crate) struct DeferredEntry {
    pub perms: Permissions,
    pub func: Box<dyn FnOnce(&mut Lock) + Send>,
}

/// One ECS world (staging or live).
pub struct Instance {
    pub(crate) id: u32,
    pub(crate) kind: InstanceKind,
    pub(crate) data: RwLock<InstanceData>,
    pub(crate) deferred: Mutex<VecDeque<DeferredEntry>>,
}

impl Instance {
    fn new(kind: InstanceKind) -> Self {
        Self {
            id: INSTANCE_IDS.fetch_add(1, Ordering::Relaxed),
            kind,
            data: RwLock::new(InstanceData::new(kind)),
            deferred: Mutex::new(VecDeque::new()),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn kind(&self) -> InstanceKind {
        self.kind
    }
}

/// The engine's ECS context: both instances plus the reference manager they
/// share. Owned by the Engine and handed to threads by reference.
pub struct Ecs {
    staging: Arc<Instance>,
    live: Arc<Instance>,
    refs: Arc<ReferenceManager>,
}

impl Default for Ecs {
    fn default() -> Self {
        Self::new()
    }
}

impl Ecs {
    pub fn new() -> Self {
        Self {
            staging: Arc::new(Instance::new(InstanceKind::Staging)),
            live: Arc::new(Instance::new(InstanceKind::Live)),
            refs: Arc::new(ReferenceManager::new()),
        }
    }

    pub fn refs(&self) -> &Arc<ReferenceManager> {
        &self.refs
    }

    pub fn instance(&self, kind: InstanceKind) -> &Arc<Instance> {
        match kind {
            InstanceKind::Staging => &self.staging,
            InstanceKind::Live => &self.live,
        }
    }

    /// Begin a transaction on one instance with the given permissions.
    ///
    /// Write or AddRemove permissions take the instance's writer lock;
    /// read-only permissions share it. Fails if this thread already holds a
    /// conflicting lock on the same instance.
    pub fn start_transaction(
        &self,
        kind: InstanceKind,
        perms: Permissions,
    ) -> Result<Lock<'_>, EcsError> {
        lock::acquire(self.instance(kind), &self.refs, perms)
    }
}
