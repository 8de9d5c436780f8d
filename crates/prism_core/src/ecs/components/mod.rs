// components/mod.rs - Statically enumerated component types
//
// Component kinds are a closed enum plus a small vtable registered at
// startup. Scene loading, staging flattening, and expression field access
// all dispatch through the vtable instead of generic type plumbing, so the
// set of component types is visible in one place.

mod animation;
mod optics;
mod physics;
mod scene;
mod signal_io;
mod transform;

pub use animation::{Animation, AnimationState, CurrNextState, InterpolationMode};
pub use optics::{
    LaserEmitter, LaserLine, LaserSegment, LaserSensor, LightSensor, OpticalElement,
};
pub use physics::{
    CharacterController, Physics, PhysicsActorType, PhysicsGroup, PhysicsJoint, PhysicsJointType,
    PhysicsJoints, PhysicsMaterial, PhysicsQuery, PhysicsQueryEntry, PhysicsShape,
    PhysicsShapeKind, RaycastResult, TriggerArea, TriggerGroup, TriggerShape,
};
pub use scene::{SceneInfo, SceneProperties, Scripts};
pub use signal_io::{SignalBindings, SignalOutput};
pub use transform::{TransformSnapshot, TransformTree};

use crate::ecs::lock::Lock;
use crate::ecs::{EcsError, Entity};
use crate::events::{EventBindings, EventInput};
use crate::refs::{EntityScope, Name, ReferenceManager, SignalKey};
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Every component kind the engine knows about, including the two global
/// (entity-less) kinds at the end.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum ComponentKind {
    Name = 0,
    SceneInfo,
    TransformTree,
    TransformSnapshot,
    Animation,
    Physics,
    PhysicsJoints,
    PhysicsQuery,
    CharacterController,
    TriggerArea,
    TriggerGroup,
    LaserEmitter,
    LaserLine,
    LaserSensor,
    LightSensor,
    OpticalElement,
    SceneProperties,
    EventInput,
    EventBindings,
    Scripts,
    SignalOutput,
    SignalBindings,
    /// Global signal arena (live instance).
    Signals,
    /// Global focus layer stack (live instance).
    Focus,
}

pub const COMPONENT_KIND_COUNT: usize = ComponentKind::Focus as usize + 1;

impl ComponentKind {
    pub fn mask(self) -> u64 {
        1u64 << (self as u32)
    }

    /// Mask covering every kind, used by AddRemove permissions.
    pub fn all_mask() -> u64 {
        (1u64 << COMPONENT_KIND_COUNT) - 1
    }
}

/// Dense per-kind storage indexed by entity slot.
pub struct SparseStore<T> {
    slots: Vec<Option<T>>,
}

impl<T> Default for SparseStore<T> {
    fn default() -> Self {
        Self { slots: Vec::new() }
    }
}

impl<T> SparseStore<T> {
    pub fn get(&self, index: u32) -> Option<&T> {
        self.slots.get(index as usize).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, index: u32) -> Option<&mut T> {
        self.slots.get_mut(index as usize).and_then(|s| s.as_mut())
    }

    pub fn insert(&mut self, index: u32, value: T) -> Option<T> {
        let index = index as usize;
        if self.slots.len() <= index {
            self.slots.resize_with(index + 1, || None);
        }
        self.slots[index].replace(value)
    }

    pub fn remove(&mut self, index: u32) -> Option<T> {
        self.slots.get_mut(index as usize).and_then(|s| s.take())
    }
}

/// A statically registered component type.
pub trait Component:
    Clone + Send + Sync + Serialize + DeserializeOwned + PartialEq + 'static
{
    const KIND: ComponentKind;
    const NAME: &'static str;

    #[doc(hidden)]
    fn store(stores: &Stores) -> &SparseStore<Self>;
    #[doc(hidden)]
    fn store_mut(stores: &mut Stores) -> &mut SparseStore<Self>;
}

/// Per-type hooks for scene loading and flattening. Most components only
/// need the defaults.
pub trait ComponentBehavior: Component {
    /// Re-resolve any entity refs / expressions under the owning scope.
    fn resolve_scope(&mut self, _scope: &EntityScope, _refs: &ReferenceManager) {}

    /// Numeric field projection for `entity#component.field` expressions.
    fn numeric_field(&self, _field: &str) -> Option<f64> {
        None
    }

    /// Merge this staging component into a live entity during flattening.
    /// Defaults to whole-component first-wins.
    fn flatten_apply(&self, lock: &mut Lock, live_entity: Entity) -> Result<(), EcsError> {
        if !lock.has_kind(live_entity, Self::KIND) {
            lock.set(live_entity, self.clone())?;
        }
        Ok(())
    }
}

macro_rules! components {
    ($(($ty:ty, $kind:ident, $json:literal, $field:ident)),+ $(,)?) => {
        /// Per-instance component storage, one dense store per kind.
        #[doc(hidden)]
        #[derive(Default)]
        pub struct Stores {
            $(pub $field: SparseStore<$ty>,)+
        }

        impl Stores {
            /// Drop every component of an entity, reporting removed kinds.
            pub(crate) fn clear_entity(&mut self, index: u32, mask: u64) -> Vec<ComponentKind> {
                let mut removed = Vec::new();
                $(
                    if mask & ComponentKind::$kind.mask() != 0 && self.$field.remove(index).is_some() {
                        removed.push(ComponentKind::$kind);
                    }
                )+
                removed
            }
        }

        $(
            impl Component for $ty {
                const KIND: ComponentKind = ComponentKind::$kind;
                const NAME: &'static str = $json;

                fn store(stores: &Stores) -> &SparseStore<Self> {
                    &stores.$field
                }

                fn store_mut(stores: &mut Stores) -> &mut SparseStore<Self> {
                    &mut stores.$field
                }
            }
        )+
    };
}

components! {
    (Name, Name, "name", name),
    (SceneInfo, SceneInfo, "scene_info", scene_info),
    (TransformTree, TransformTree, "transform", transform_tree),
    (TransformSnapshot, TransformSnapshot, "transform_snapshot", transform_snapshot),
    (Animation, Animation, "animation", animation),
    (Physics, Physics, "physics", physics),
    (PhysicsJoints, PhysicsJoints, "physics_joints", physics_joints),
    (PhysicsQuery, PhysicsQuery, "physics_query", physics_query),
    (CharacterController, CharacterController, "character_controller", character_controller),
    (TriggerArea, TriggerArea, "trigger_area", trigger_area),
    (TriggerGroup, TriggerGroup, "trigger_group", trigger_group),
    (LaserEmitter, LaserEmitter, "laser_emitter", laser_emitter),
    (LaserLine, LaserLine, "laser_line", laser_line),
    (LaserSensor, LaserSensor, "laser_sensor", laser_sensor),
    (LightSensor, LightSensor, "light_sensor", light_sensor),
    (OpticalElement, OpticalElement, "optic", optical_element),
    (SceneProperties, SceneProperties, "scene_properties", scene_properties),
    (EventInput, EventInput, "event_input", event_input),
    (EventBindings, EventBindings, "event_bindings", event_bindings),
    (Scripts, Scripts, "script", scripts),
    (SignalOutput, SignalOutput, "signal_output", signal_output),
    (SignalBindings, SignalBindings, "signal_bindings", signal_bindings),
}

impl ComponentBehavior for Name {}
impl ComponentBehavior for SceneInfo {}
impl ComponentBehavior for TransformSnapshot {
    fn numeric_field(&self, field: &str) -> Option<f64> {
        TransformSnapshot::numeric_field(self, field)
    }
}
impl ComponentBehavior for TransformTree {
    fn resolve_scope(&mut self, scope: &EntityScope, refs: &ReferenceManager) {
        self.set_scope(scope, refs);
    }
}
impl ComponentBehavior for Animation {}
impl ComponentBehavior for Physics {
    fn resolve_scope(&mut self, scope: &EntityScope, refs: &ReferenceManager) {
        self.set_scope(scope, refs);
    }

    fn numeric_field(&self, field: &str) -> Option<f64> {
        Physics::numeric_field(self, field)
    }
}
impl ComponentBehavior for PhysicsJoints {
    fn resolve_scope(&mut self, scope: &EntityScope, refs: &ReferenceManager) {
        self.set_scope(scope, refs);
    }
}
impl ComponentBehavior for PhysicsQuery {}
impl ComponentBehavior for CharacterController {
    fn resolve_scope(&mut self, scope: &EntityScope, refs: &ReferenceManager) {
        self.set_scope(scope, refs);
    }

    fn numeric_field(&self, field: &str) -> Option<f64> {
        CharacterController::numeric_field(self, field)
    }
}
impl ComponentBehavior for TriggerArea {}
impl ComponentBehavior for TriggerGroup {}
impl ComponentBehavior for LaserEmitter {}
impl ComponentBehavior for LaserLine {}
impl ComponentBehavior for LaserSensor {
    fn numeric_field(&self, field: &str) -> Option<f64> {
        LaserSensor::numeric_field(self, field)
    }
}
impl ComponentBehavior for LightSensor {
    fn numeric_field(&self, field: &str) -> Option<f64> {
        LightSensor::numeric_field(self, field)
    }
}
impl ComponentBehavior for OpticalElement {}
impl ComponentBehavior for SceneProperties {}
impl ComponentBehavior for EventInput {}
impl ComponentBehavior for EventBindings {
    fn resolve_scope(&mut self, scope: &EntityScope, refs: &ReferenceManager) {
        self.set_scope(scope, refs);
    }
}
impl ComponentBehavior for Scripts {}

impl ComponentBehavior for SignalOutput {
    fn flatten_apply(&self, lock: &mut Lock, live_entity: Entity) -> Result<(), EcsError> {
        let entity_ref = lock.refs().get_entity_by_id(live_entity);
        if !entity_ref.is_valid() {
            return Ok(());
        }
        for (signal_name, value) in &self.signals {
            let Some(key) = SignalKey::new(entity_ref.clone(), signal_name.clone()) else {
                tracing::warn!(signal = %signal_name, "invalid signal name in signal_output");
                continue;
            };
            let signal = lock.refs().get_signal(&key);
            // Higher-priority stagings applied earlier win per key
            if !signal.has_value(lock)? {
                signal.set_value(lock, *value)?;
            }
        }
        Ok(())
    }
}

impl ComponentBehavior for SignalBindings {
    fn resolve_scope(&mut self, scope: &EntityScope, refs: &ReferenceManager) {
        self.set_scope(scope, refs);
    }

    fn flatten_apply(&self, lock: &mut Lock, live_entity: Entity) -> Result<(), EcsError> {
        let entity_ref = lock.refs().get_entity_by_id(live_entity);
        if !entity_ref.is_valid() {
            return Ok(());
        }
        for (signal_name, expr) in &self.bindings {
            let Some(key) = SignalKey::new(entity_ref.clone(), signal_name.clone()) else {
                tracing::warn!(signal = %signal_name, "invalid signal name in signal_bindings");
                continue;
            };
            let signal = lock.refs().get_signal(&key);
            if !signal.has_binding(lock)? {
                signal.set_binding(lock, expr.clone())?;
            }
        }
        Ok(())
    }
}

/// Vtable entry for one component kind.
pub struct ComponentOps {
    pub kind: ComponentKind,
    pub name: &'static str,
    pub load_json: fn(&mut Lock, Entity, &serde_json::Value, &EntityScope) -> Result<(), EcsError>,
    pub save_json: fn(&Lock, Entity) -> Result<Option<serde_json::Value>, EcsError>,
    pub apply: fn(&Lock, Entity, &mut Lock, Entity) -> Result<(), EcsError>,
    pub read_field: fn(&Lock, Entity, &str) -> Option<f64>,
}

fn ops_for<T: ComponentBehavior>() -> ComponentOps {
    ComponentOps {
        kind: T::KIND,
        name: T::NAME,
        load_json: |lock, entity, value, scope| {
            let mut component: T = serde_json::from_value(value.clone()).map_err(|err| {
                EcsError::ComponentParse {
                    component: T::NAME,
                    message: err.to_string(),
                }
            })?;
            component.resolve_scope(scope, lock.refs());
            lock.set(entity, component)?;
            Ok(())
        },
        save_json: |lock, entity| {
            let Some(component) = lock.get::<T>(entity)? else {
                return Ok(None);
            };
            let value = serde_json::to_value(component).map_err(|err| EcsError::ComponentParse {
                component: T::NAME,
                message: err.to_string(),
            })?;
            Ok(Some(value))
        },
        apply: |staging, staging_entity, live, live_entity| {
            if let Some(component) = staging.get::<T>(staging_entity)? {
                component.clone().flatten_apply(live, live_entity)?;
            }
            Ok(())
        },
        read_field: |lock, entity, field| {
            lock.get::<T>(entity)
                .ok()
                .flatten()
                .and_then(|c| c.numeric_field(field))
        },
    }
}

/// The full vtable, in kind order. `Name` is reserved (scene loading handles
/// it directly) and the global kinds have no per-entity ops.
pub static COMPONENT_OPS: Lazy<Vec<ComponentOps>> = Lazy::new(|| {
    vec![
        ops_for::<SceneInfo>(),
        ops_for::<TransformTree>(),
        ops_for::<TransformSnapshot>(),
        ops_for::<Animation>(),
        ops_for::<Physics>(),
        ops_for::<PhysicsJoints>(),
        ops_for::<PhysicsQuery>(),
        ops_for::<CharacterController>(),
        ops_for::<TriggerArea>(),
        ops_for::<TriggerGroup>(),
        ops_for::<LaserEmitter>(),
        ops_for::<LaserLine>(),
        ops_for::<LaserSensor>(),
        ops_for::<LightSensor>(),
        ops_for::<OpticalElement>(),
        ops_for::<SceneProperties>(),
        ops_for::<EventInput>(),
        ops_for::<EventBindings>(),
        ops_for::<Scripts>(),
        ops_for::<SignalOutput>(),
        ops_for::<SignalBindings>(),
    ]
});

pub fn ops_by_name(name: &str) -> Option<&'static ComponentOps> {
    COMPONENT_OPS.iter().find(|ops| ops.name == name)
}

pub fn ops_by_kind(kind: ComponentKind) -> Option<&'static ComponentOps> {
    COMPONENT_OPS.iter().find(|ops| ops.kind == kind)
}
