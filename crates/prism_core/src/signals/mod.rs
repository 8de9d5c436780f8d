//! Signal graph - named scalar values with expression bindings
//!
//! Signals live in a dense arena on the live instance (a global component
//! guarded by the Signals permission kind). Each slot stores a direct value,
//! an optional compiled expression, and the dependency/subscriber edges the
//! expression implies. Values are read through [`crate::refs::SignalRef`],
//! which caches its slot index.
//!
//! Caching: slots whose expressions reference only other signals are
//! cacheable. Cached values and dirty bits are atomics so a read lock can
//! refresh them; concurrent readers race benignly toward the same value
//! because the arena itself is immutable under a read lock.

pub mod expression;

pub use expression::{ExprError, SignalExpression};

use crate::ecs::lock::Lock;
use crate::ecs::{ComponentKind, EcsError, Entity};
use crate::refs::{EntityScope, SignalRef};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Expression recursion and dirty-propagation bound. Cycles terminate here.
pub const MAX_SIGNAL_BINDING_DEPTH: usize = 10;

const UNSET: f64 = f64::NEG_INFINITY;

/// One signal slot. An invalid owner ref marks a vacant slot.
pub struct Signal {
    pub value: f64,
    pub expr: Option<SignalExpression>,
    owner: SignalRef,
    subscribers: Vec<SignalRef>,
    dependencies: Vec<SignalRef>,
    cached_value: AtomicU64,
    cached_dirty: AtomicBool,
    cacheable: bool,
}

impl Default for Signal {
    fn default() -> Self {
        Self {
            value: UNSET,
            expr: None,
            owner: SignalRef::default(),
            subscribers: Vec::new(),
            dependencies: Vec::new(),
            cached_value: AtomicU64::new(0f64.to_bits()),
            cached_dirty: AtomicBool::new(true),
            cacheable: false,
        }
    }
}

impl Signal {
    fn new(owner: SignalRef) -> Self {
        Self {
            owner,
            ..Default::default()
        }
    }

    pub fn has_value(&self) -> bool {
        self.value != UNSET
    }

    pub fn cached_value(&self) -> f64 {
        f64::from_bits(self.cached_value.load(Ordering::Acquire))
    }

    pub fn cached_dirty(&self) -> bool {
        self.cached_dirty.load(Ordering::Acquire)
    }

    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    pub fn owner(&self) -> &SignalRef {
        &self.owner
    }

    pub fn subscribers(&self) -> &[SignalRef] {
        &self.subscribers
    }

    pub fn dependencies(&self) -> &[SignalRef] {
        &self.dependencies
    }
}

/// The live instance's signal arena.
#[derive(Default)]
pub struct Signals {
    slots: Vec<Signal>,
    free_indexes: BinaryHeap<Reverse<usize>>,
    entity_mapping: HashMap<Entity, Vec<usize>>,
}

impl Signals {
    pub fn get(&self, index: usize) -> Option<&Signal> {
        self.slots.get(index).filter(|s| s.owner.is_valid())
    }

    fn get_mut(&mut self, index: usize) -> Option<&mut Signal> {
        self.slots.get_mut(index).filter(|s| s.owner.is_valid())
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.owner.is_valid()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocate a slot for `owner`, reusing the smallest free index.
    fn new_signal(&mut self, owner: SignalRef) -> usize {
        let index = match self.free_indexes.pop() {
            Some(Reverse(index)) => {
                self.slots[index] = Signal::new(owner.clone());
                index
            }
            None => {
                self.slots.push(Signal::new(owner.clone()));
                self.slots.len() - 1
            }
        };
        owner.set_cached_index(index);
        let entity = owner.entity().get_live();
        if entity.exists() {
            self.entity_mapping.entry(entity).or_default().push(index);
        }
        index
    }

    /// Vacate a slot, detaching its graph edges.
    fn free_signal(&mut self, index: usize) {
        if index >= self.slots.len() || !self.slots[index].owner.is_valid() {
            return;
        }
        let slot = std::mem::take(&mut self.slots[index]);
        slot.owner
            .set_cached_index(crate::refs::NULL_SIGNAL_INDEX);

        // Drop this signal out of its dependencies' subscriber lists
        for dep in &slot.dependencies {
            if let Some(dep_slot) = dep
                .resolve_index(self)
                .and_then(|i| self.slots.get_mut(i))
            {
                dep_slot.subscribers.retain(|s| !s.ptr_eq(&slot.owner));
            }
        }
        // Readers of dependent signals now fall back to 0.0
        for sub in slot.subscribers.clone() {
            self.mark_dirty_from(&sub, 1);
        }

        let entity = slot.owner.entity().get_live();
        if let Some(indexes) = self.entity_mapping.get_mut(&entity) {
            indexes.retain(|i| *i != index);
            if indexes.is_empty() {
                self.entity_mapping.remove(&entity);
            }
        }
        self.free_indexes.push(Reverse(index));
    }

    /// Free every signal owned by a destroyed entity.
    pub(crate) fn free_entity_signals(&mut self, entity: Entity) {
        let indexes = self.entity_mapping.remove(&entity).unwrap_or_default();
        for index in indexes {
            self.free_signal(index);
        }
    }

    /// Breadth-first dirty propagation, bounded by the binding depth.
    /// Cycles terminate via the visited set and the depth bound.
    fn mark_dirty_from(&mut self, start: &SignalRef, start_depth: usize) {
        let mut visited = std::collections::HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back((start.clone(), start_depth));
        while let Some((signal, depth)) = queue.pop_front() {
            if depth > MAX_SIGNAL_BINDING_DEPTH {
                continue;
            }
            let Some(index) = signal.resolve_index(self) else {
                continue;
            };
            if !visited.insert(index) {
                continue;
            }
            let slot = &self.slots[index];
            slot.cached_dirty.store(true, Ordering::Release);
            for sub in &slot.subscribers {
                queue.push_back((sub.clone(), depth + 1));
            }
        }
    }

    /// Recompute the cacheable bit for a signal and its transitive
    /// subscribers after an edge change.
    fn refresh_cacheable(&mut self, start: &SignalRef) {
        let mut queue = VecDeque::new();
        queue.push_back((start.clone(), 0usize));
        while let Some((signal, depth)) = queue.pop_front() {
            if depth > MAX_SIGNAL_BINDING_DEPTH {
                continue;
            }
            let Some(index) = signal.resolve_index(self) else {
                continue;
            };
            let cacheable = self.compute_cacheable(index, 0);
            let slot = &mut self.slots[index];
            slot.cacheable = cacheable;
            for sub in slot.subscribers.clone() {
                queue.push_back((sub, depth + 1));
            }
        }
    }

    fn compute_cacheable(&self, index: usize, depth: usize) -> bool {
        if depth > MAX_SIGNAL_BINDING_DEPTH {
            return true;
        }
        let Some(slot) = self.get(index) else {
            return true;
        };
        let Some(expr) = slot.expr.as_ref() else {
            return true;
        };
        if !expr.references_signals_only() {
            return false;
        }
        slot.dependencies.iter().all(|dep| {
            dep.resolve_index(self)
                .map(|i| self.compute_cacheable(i, depth + 1))
                .unwrap_or(true)
        })
    }
}

impl SignalRef {
    pub(crate) fn resolve_index(&self, signals: &Signals) -> Option<usize> {
        let index = self.cached_index();
        if index == crate::refs::NULL_SIGNAL_INDEX {
            return None;
        }
        match signals.slots.get(index) {
            Some(slot) if slot.owner.ptr_eq(self) => Some(index),
            _ => None,
        }
    }

    fn get_or_create_index(&self, signals: &mut Signals) -> usize {
        match self.resolve_index(signals) {
            Some(index) => index,
            None => signals.new_signal(self.clone()),
        }
    }

    /// Overwrite the stored value. Signals are created lazily on first
    /// write. Non-finite values are rejected with a warning.
    pub fn set_value(&self, lock: &mut Lock, value: f64) -> Result<(), EcsError> {
        if !self.is_valid() {
            return Ok(());
        }
        if !value.is_finite() {
            tracing::warn!(signal = %self, value, "ignoring non-finite signal value");
            return Ok(());
        }
        let signals = lock.signals_mut()?;
        let index = self.get_or_create_index(signals);
        signals.slots[index].value = value;
        signals.mark_dirty_from(self, 0);
        Ok(())
    }

    /// Reset to "unset"; reads fall back to the binding or 0.0.
    pub fn clear_value(&self, lock: &mut Lock) -> Result<(), EcsError> {
        let signals = lock.signals_mut()?;
        if let Some(index) = self.resolve_index(signals) {
            signals.slots[index].value = UNSET;
            signals.mark_dirty_from(self, 0);
        }
        Ok(())
    }

    pub fn has_value(&self, lock: &Lock) -> Result<bool, EcsError> {
        let signals = lock.signals()?;
        Ok(self
            .resolve_index(signals)
            .map(|i| signals.slots[i].has_value())
            .unwrap_or(false))
    }

    /// The raw stored value, ignoring any binding.
    pub fn get_value(&self, lock: &Lock) -> Result<Option<f64>, EcsError> {
        let signals = lock.signals()?;
        Ok(self
            .resolve_index(signals)
            .map(|i| signals.slots[i].value)
            .filter(|v| *v != UNSET))
    }

    /// Bind an expression, rebuilding dependency edges.
    ///
    /// Uncompiled expressions are compiled first; a parse failure leaves the
    /// signal with a null binding.
    pub fn set_binding(&self, lock: &mut Lock, mut expr: SignalExpression) -> Result<(), EcsError> {
        if !self.is_valid() {
            return Ok(());
        }
        if !expr.is_compiled() {
            if let Err(err) = expr.compile(lock.refs()) {
                tracing::warn!(signal = %self, error = %err, "failed to parse signal binding");
                return self.clear_binding(lock);
            }
        }
        let new_deps = expr.references();
        let signals = lock.signals_mut()?;
        let index = self.get_or_create_index(signals);

        self.unsubscribe_dependencies(signals, index);

        // Install the new edges. Dependency slots are created on demand so
        // their subscriber lists have somewhere to live; unresolvable refs
        // install no edge but are permitted.
        let mut installed = Vec::with_capacity(new_deps.len());
        for dep in new_deps {
            if !dep.is_valid() || dep.ptr_eq(self) {
                continue;
            }
            let dep_index = dep.get_or_create_index(signals);
            let dep_slot = &mut signals.slots[dep_index];
            if !dep_slot.subscribers.iter().any(|s| s.ptr_eq(self)) {
                dep_slot.subscribers.push(self.clone());
            }
            installed.push(dep);
        }
        let slot = &mut signals.slots[index];
        slot.expr = Some(expr);
        slot.dependencies = installed;

        signals.refresh_cacheable(self);
        signals.mark_dirty_from(self, 0);
        Ok(())
    }

    /// Parse `expr` under `scope` and bind it.
    pub fn set_binding_str(
        &self,
        lock: &mut Lock,
        expr: &str,
        scope: &EntityScope,
    ) -> Result<(), EcsError> {
        self.set_binding(lock, SignalExpression::new(expr, scope.clone()))
    }

    pub fn clear_binding(&self, lock: &mut Lock) -> Result<(), EcsError> {
        let signals = lock.signals_mut()?;
        if let Some(index) = self.resolve_index(signals) {
            self.unsubscribe_dependencies(signals, index);
            let slot = &mut signals.slots[index];
            slot.expr = None;
            slot.dependencies.clear();
            signals.refresh_cacheable(self);
            signals.mark_dirty_from(self, 0);
        }
        Ok(())
    }

    pub fn has_binding(&self, lock: &Lock) -> Result<bool, EcsError> {
        let signals = lock.signals()?;
        Ok(self
            .resolve_index(signals)
            .map(|i| signals.slots[i].expr.is_some())
            .unwrap_or(false))
    }

    pub fn get_binding(&self, lock: &Lock) -> Result<Option<SignalExpression>, EcsError> {
        let signals = lock.signals()?;
        Ok(self
            .resolve_index(signals)
            .and_then(|i| signals.slots[i].expr.clone()))
    }

    /// Free this signal's slot entirely.
    pub fn free(&self, lock: &mut Lock) -> Result<(), EcsError> {
        let signals = lock.signals_mut()?;
        if let Some(index) = self.resolve_index(signals) {
            signals.free_signal(index);
        }
        Ok(())
    }

    /// Evaluate this signal:
    /// 1. `0.0` past the depth bound,
    /// 2. the stored value when set,
    /// 3. the binding's result (cached when possible),
    /// 4. `0.0` otherwise.
    pub fn get_signal(&self, lock: &Lock, depth: usize) -> f64 {
        if depth > MAX_SIGNAL_BINDING_DEPTH {
            expression::flag_depth_exceeded();
            return 0.0;
        }
        let Ok(signals) = lock.signals() else {
            return 0.0;
        };
        let Some(index) = self.resolve_index(signals) else {
            return 0.0;
        };
        let slot = &signals.slots[index];
        if slot.has_value() {
            return slot.value;
        }
        let Some(expr) = slot.expr.as_ref() else {
            return 0.0;
        };
        if slot.cacheable && !slot.cached_dirty() {
            return slot.cached_value();
        }
        // Top-level reads poison to 0.0 if anything below hits the depth
        // bound. A poisoned evaluation is never cached, at any level, so
        // cyclic bindings stay dirty instead of memoizing partial values.
        let (value, poisoned) = if depth == 0 {
            expression::reset_depth_exceeded();
            let value = expr.evaluate(lock, depth + 1);
            if expression::take_depth_exceeded() {
                tracing::warn!(signal = %self, "signal exceeded max binding depth");
                (0.0, true)
            } else {
                (value, false)
            }
        } else {
            let value = expr.evaluate(lock, depth + 1);
            (value, expression::take_depth_exceeded())
        };
        if slot.cacheable && !poisoned {
            slot.cached_value.store(value.to_bits(), Ordering::Release);
            slot.cached_dirty.store(false, Ordering::Release);
        }
        value
    }

    pub fn dependencies(&self, lock: &Lock) -> Result<Vec<SignalRef>, EcsError> {
        let signals = lock.signals()?;
        Ok(self
            .resolve_index(signals)
            .map(|i| signals.slots[i].dependencies.clone())
            .unwrap_or_default())
    }

    pub fn subscribers(&self, lock: &Lock) -> Result<Vec<SignalRef>, EcsError> {
        let signals = lock.signals()?;
        Ok(self
            .resolve_index(signals)
            .map(|i| signals.slots[i].subscribers.clone())
            .unwrap_or_default())
    }

    pub fn is_cacheable(&self, lock: &Lock) -> Result<bool, EcsError> {
        let signals = lock.signals()?;
        Ok(self
            .resolve_index(signals)
            .map(|i| signals.slots[i].cacheable)
            .unwrap_or(true))
    }

    pub fn is_cache_dirty(&self, lock: &Lock) -> Result<bool, EcsError> {
        let signals = lock.signals()?;
        Ok(self
            .resolve_index(signals)
            .map(|i| signals.slots[i].cached_dirty())
            .unwrap_or(true))
    }

    fn unsubscribe_dependencies(&self, signals: &mut Signals, index: usize) {
        let old_deps = std::mem::take(&mut signals.slots[index].dependencies);
        for dep in old_deps {
            if let Some(dep_slot) = dep
                .resolve_index(signals)
                .and_then(|i| signals.get_mut(i))
            {
                dep_slot.subscribers.retain(|s| !s.ptr_eq(self));
            }
        }
    }
}

/// Signal permission kinds, grouped for transaction declarations.
pub fn read_signals_kinds() -> Vec<ComponentKind> {
    vec![
        ComponentKind::Name,
        ComponentKind::Signals,
        ComponentKind::SignalOutput,
        ComponentKind::SignalBindings,
        ComponentKind::Focus,
        ComponentKind::EventInput,
    ]
}
