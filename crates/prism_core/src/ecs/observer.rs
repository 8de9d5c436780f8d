// observer.rs - Component add/remove event queues
//
// Observers are registered under an AddRemove lock and polled under any
// lock. Queues are FIFO per observer; every observer of a kind sees every
// event for that kind.

use crate::ecs::lock::Lock;
use crate::ecs::{ComponentKind, Entity};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ComponentEventType {
    Added,
    Removed,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ComponentEvent {
    pub entity: Entity,
    pub kind: ComponentKind,
    pub event: ComponentEventType,
}

type EventQueue = Arc<Mutex<VecDeque<ComponentEvent>>>;

/// Handle for polling one observer's queue.
pub struct Observer {
    pub(crate) id: u64,
    pub(crate) kind: ComponentKind,
    queue: EventQueue,
}

impl Observer {
    pub fn kind(&self) -> ComponentKind {
        self.kind
    }

    /// Pop the next event. The lock parameter pins polling to a transaction
    /// so events interleave consistently with component access.
    pub fn poll(&self, _lock: &Lock) -> Option<ComponentEvent> {
        self.queue.lock().pop_front()
    }
}

#[derive(Default)]
pub(crate) struct ObserverRegistry {
    next_id: u64,
    subscribers: HashMap<ComponentKind, Vec<u64>>,
    queues: HashMap<u64, EventQueue>,
}

impl ObserverRegistry {
    pub(crate) fn watch(&mut self, kind: ComponentKind) -> Observer {
        let id = self.next_id;
        self.next_id += 1;
        let queue: EventQueue = Arc::new(Mutex::new(VecDeque::new()));
        self.subscribers.entry(kind).or_default().push(id);
        self.queues.insert(id, queue.clone());
        Observer { id, kind, queue }
    }

    pub(crate) fn unwatch(&mut self, observer: &Observer) {
        if let Some(ids) = self.subscribers.get_mut(&observer.kind) {
            ids.retain(|id| *id != observer.id);
        }
        self.queues.remove(&observer.id);
    }

    pub(crate) fn notify(&self, entity: Entity, kind: ComponentKind, event: ComponentEventType) {
        let Some(ids) = self.subscribers.get(&kind) else {
            return;
        };
        for id in ids {
            if let Some(queue) = self.queues.get(id) {
                queue.lock().push_back(ComponentEvent {
                    entity,
                    kind,
                    event,
                });
            }
        }
    }
}
