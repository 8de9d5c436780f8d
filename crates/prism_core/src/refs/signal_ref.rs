// signal_ref.rs - Interned (entity, signal name) keys
//
// A SignalRef caches the signal's slot index in the live Signals arena. The
// cache is written when the signal is created and reset when it is freed, so
// resolving a ref under a lock is a single atomic load plus validation.

use crate::refs::{EntityRef, EntityScope, Name, ReferenceManager, INVALID_NAME_CHARS};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Sentinel for "no slot allocated".
pub(crate) const NULL_SIGNAL_INDEX: usize = usize::MAX;

/// A `(entity, signal_name)` pair addressing one scalar signal.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct SignalKey {
    pub entity: EntityRef,
    pub signal_name: String,
}

impl SignalKey {
    pub fn new(entity: EntityRef, signal_name: impl Into<String>) -> Option<Self> {
        let signal_name = signal_name.into();
        if signal_name.is_empty() || signal_name.contains(INVALID_NAME_CHARS) {
            return None;
        }
        Some(Self {
            entity,
            signal_name,
        })
    }

    /// Parse `entity/signal` under a scope, interning the entity ref.
    pub fn parse(input: &str, scope: &EntityScope, refs: &ReferenceManager) -> Option<Self> {
        let (entity_part, signal_part) = input.split_once('/')?;
        let name = Name::parse(entity_part, scope)?;
        SignalKey::new(refs.get_entity(&name), signal_part)
    }

    pub fn is_valid(&self) -> bool {
        self.entity.is_valid() && !self.signal_name.is_empty()
    }
}

impl std::fmt::Display for SignalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.entity, self.signal_name)
    }
}

#[derive(Debug)]
pub(crate) struct SignalRefData {
    pub(crate) key: SignalKey,
    pub(crate) index: AtomicUsize,
}

/// Interned handle to one signal. Equality is by interned identity.
#[derive(Clone, Debug, Default)]
pub struct SignalRef {
    pub(crate) inner: Option<Arc<SignalRefData>>,
}

impl SignalRef {
    pub(crate) fn from_data(data: Arc<SignalRefData>) -> Self {
        Self { inner: Some(data) }
    }

    pub fn is_valid(&self) -> bool {
        self.inner.is_some()
    }

    pub fn key(&self) -> SignalKey {
        self.inner
            .as_ref()
            .map(|d| d.key.clone())
            .unwrap_or_default()
    }

    pub fn entity(&self) -> EntityRef {
        self.inner
            .as_ref()
            .map(|d| d.key.entity.clone())
            .unwrap_or_default()
    }

    pub fn signal_name(&self) -> &str {
        self.inner
            .as_ref()
            .map(|d| d.key.signal_name.as_str())
            .unwrap_or("")
    }

    pub(crate) fn cached_index(&self) -> usize {
        self.inner
            .as_ref()
            .map(|d| d.index.load(Ordering::Acquire))
            .unwrap_or(NULL_SIGNAL_INDEX)
    }

    pub(crate) fn set_cached_index(&self, index: usize) {
        if let Some(d) = self.inner.as_ref() {
            d.index.store(index, Ordering::Release);
        }
    }

    pub fn ptr_eq(&self, other: &SignalRef) -> bool {
        match (&self.inner, &other.inner) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl PartialEq for SignalRef {
    fn eq(&self, other: &Self) -> bool {
        // Interned identity; key comparison covers refs from other managers
        self.ptr_eq(other)
            || match (&self.inner, &other.inner) {
                (Some(a), Some(b)) => a.key == b.key,
                _ => false,
            }
    }
}

impl Eq for SignalRef {}

impl std::hash::Hash for SignalRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl std::fmt::Display for SignalRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            Some(d) => write!(f, "{}", d.key),
            None => write!(f, "<null>"),
        }
    }
}
