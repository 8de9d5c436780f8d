//! Script hook registry
//!
//! The scripting sandbox itself lives outside the core; game systems
//! register plain closures by name, and entities reference them through the
//! Scripts component. The physics thread runs the on-physics-update hooks
//! once per frame under its write transaction.

use crate::ecs::components::Scripts;
use crate::ecs::{ComponentKind, Entity, Lock};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub type PhysicsUpdateFn = dyn Fn(&mut Lock, Entity, Duration) + Send + Sync;

#[derive(Default)]
pub struct ScriptManager {
    physics_hooks: RwLock<HashMap<String, Arc<PhysicsUpdateFn>>>,
}

impl ScriptManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_physics_update(
        &self,
        name: impl Into<String>,
        hook: impl Fn(&mut Lock, Entity, Duration) + Send + Sync + 'static,
    ) {
        self.physics_hooks.write().insert(name.into(), Arc::new(hook));
    }

    /// Run every registered hook attached to an entity via Scripts.
    pub fn run_on_physics_update(&self, lock: &mut Lock, interval: Duration) {
        let Ok(entities) = lock.entities_with(&[ComponentKind::Scripts]) else {
            return;
        };
        for entity in entities {
            let Ok(Some(scripts)) = lock.get::<Scripts>(entity) else {
                continue;
            };
            let names = scripts.on_physics_update.clone();
            for name in names {
                let hook = self.physics_hooks.read().get(&name).cloned();
                match hook {
                    Some(hook) => hook(lock, entity, interval),
                    None => {
                        tracing::warn!(script = %name, "unregistered physics script");
                    }
                }
            }
        }
    }
}
