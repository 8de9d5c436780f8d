//! Event plumbing between the window, scripts, and entities
//!
//! Events are discrete, timestamped-by-frame payloads, unlike signals which
//! are continuous values. Each subscriber owns a FIFO queue on its
//! EventInput component; EventBindings forward events from a source queue
//! name to other entities' queues.

use crate::ecs::Entity;
use crate::refs::{EntityRef, EntityScope, ReferenceManager};
use glam::{Vec2, Vec3};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

pub const MAX_QUEUED_EVENTS: usize = 1000;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventData {
    Bool(bool),
    Int(i64),
    Float(f64),
    Vec2(Vec2),
    Vec3(Vec3),
    String(String),
    Entity(Entity),
}

impl Default for EventData {
    fn default() -> Self {
        EventData::Bool(true)
    }
}

impl EventData {
    /// Numeric projection used by expression event inputs.
    pub fn as_f64(&self) -> f64 {
        match self {
            EventData::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            EventData::Int(i) => *i as f64,
            EventData::Float(f) => *f,
            EventData::Vec2(v) => v.x as f64,
            EventData::Vec3(v) => v.x as f64,
            EventData::String(_) | EventData::Entity(_) => 0.0,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    #[serde(default)]
    pub source: EntityRef,
    #[serde(default)]
    pub data: EventData,
}

impl Event {
    pub fn new(name: impl Into<String>, source: EntityRef, data: EventData) -> Self {
        Self {
            name: name.into(),
            source,
            data,
        }
    }
}

/// Per-entity FIFO event queues, keyed by queue name.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EventInput {
    /// Queue names registered by systems/scripts at setup time.
    #[serde(default)]
    pub registered: Vec<String>,
    #[serde(default, skip)]
    pub queues: BTreeMap<String, VecDeque<Event>>,
}

impl EventInput {
    pub fn register(&mut self, queue: impl Into<String>) {
        let queue = queue.into();
        if !self.registered.contains(&queue) {
            self.registered.push(queue.clone());
        }
        self.queues.entry(queue).or_default();
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.registered.iter().any(|q| q == queue)
    }

    /// Append an event, dropping it (with a warning) when the queue is full.
    pub fn add(&mut self, queue: &str, event: Event) -> bool {
        if !self.has_queue(queue) {
            return false;
        }
        let q = self.queues.entry(queue.to_string()).or_default();
        if q.len() >= MAX_QUEUED_EVENTS {
            tracing::warn!(queue, event = %event.name, "event queue full, dropping event");
            return false;
        }
        q.push_back(event);
        true
    }

    pub fn poll(&mut self, queue: &str) -> Option<Event> {
        self.queues.get_mut(queue).and_then(|q| q.pop_front())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EventTarget {
    pub target: EntityRef,
    pub queue: String,
}

/// Forwarding table: source event name -> destination queues.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventBindings {
    pub bindings: BTreeMap<String, Vec<EventTarget>>,
}

impl EventBindings {
    pub(crate) fn set_scope(&mut self, scope: &EntityScope, refs: &ReferenceManager) {
        for targets in self.bindings.values_mut() {
            for target in targets {
                target.target.set_scope(scope, refs);
            }
        }
    }
}

/// Cloneable producer half of the window input queue.
pub type EventSender = crossbeam_channel::Sender<Event>;

/// Lock-free MPSC queue carrying OS/window events to the physics thread.
///
/// Senders are cheap to clone and never block; the physics thread drains the
/// receiver at the top of each frame.
pub struct InputEventQueue {
    sender: crossbeam_channel::Sender<Event>,
    receiver: crossbeam_channel::Receiver<Event>,
}

impl Default for InputEventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InputEventQueue {
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self { sender, receiver }
    }

    pub fn sender(&self) -> EventSender {
        self.sender.clone()
    }

    pub fn push(&self, event: Event) {
        // Send only fails when the queue is closed, which never happens
        // while both halves are alive.
        let _ = self.sender.send(event);
    }

    pub fn try_pop(&self) -> Option<Event> {
        self.receiver.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queues_are_fifo_and_bounded() {
        let mut input = EventInput::default();
        input.register("/test/in");

        assert!(input.add("/test/in", Event::new("a", EntityRef::default(), EventData::Int(1))));
        assert!(input.add("/test/in", Event::new("b", EntityRef::default(), EventData::Int(2))));
        assert!(!input.add("/missing", Event::default()));

        assert_eq!(input.poll("/test/in").unwrap().name, "a");
        assert_eq!(input.poll("/test/in").unwrap().name, "b");
        assert!(input.poll("/test/in").is_none());
    }

    #[test]
    fn input_queue_drains_in_order() {
        let queue = InputEventQueue::new();
        let sender = queue.sender();
        sender
            .send(Event::new("first", EntityRef::default(), EventData::default()))
            .unwrap();
        queue.push(Event::new("second", EntityRef::default(), EventData::default()));

        assert_eq!(queue.try_pop().unwrap().name, "first");
        assert_eq!(queue.try_pop().unwrap().name, "second");
        assert!(queue.try_pop().is_none());
    }
}
