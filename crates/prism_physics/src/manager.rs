// manager.rs - The physics loop
//
// One frame: sync ECS state into the backend under a single write
// transaction (input events, character controllers, snapshots, animation,
// actor reconciliation, constraints, triggers, queries, lasers, scripts),
// then step the backend with no lock held, then tick the hull cache.
//
// The physics thread is the authoritative writer of transform snapshots.

use crate::backend::{
    interaction_groups, pack_shape_user_data, PhysicsScene,
};
use crate::hull::HullCache;
use glam::Vec3;
use prism_asset::{Assets, DispatchQueue, SceneManager};
use prism_core::ecs::components::{
    Physics, PhysicsActorType, PhysicsGroup, PhysicsShape, PhysicsShapeKind, SceneInfo,
    SceneProperties, TransformSnapshot, TransformTree,
};
use prism_core::ecs::{
    ComponentEventType, ComponentKind, Ecs, EcsError, Entity, InstanceKind, Lock, Observer,
    Permissions,
};
use prism_core::events::InputEventQueue;
use prism_core::math::{Transform, MAX_TRANSFORM_DEPTH};
use prism_core::refs::EntityRef;
use prism_core::script::ScriptManager;
use prism_core::signals::read_signals_kinds;
use prism_core::thread::ThreadHandler;
use prism_metrics::zone;
use rapier3d::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Nominal physics rate.
pub const PHYSICS_FRAME_RATE: f64 = 120.0;

/// How long unused hull sets stay cached.
const HULL_CACHE_TTL: Duration = Duration::from_secs(10);

const POSE_EPSILON: f32 = 1e-5;
const SHAPE_EPSILON: f32 = 1e-4;

pub(crate) struct ActorUserData {
    pub entity_ref: EntityRef,
    /// Last pose the engine pushed to (or read from) the backend. If the
    /// ECS snapshot still equals this, nothing moved the entity this frame.
    pub pose: Transform,
    pub velocity: Vec3,
    pub group: PhysicsGroup,
    pub angular_damping: f32,
    pub linear_damping: f32,
    pub contact_report_threshold: f32,
    pub gravity: Vec3,
}

pub(crate) struct ActorState {
    pub body: RigidBodyHandle,
    pub dynamic_class: bool,
    pub data: ActorUserData,
}

/// Backend collider bookkeeping, diffed against the ECS shape list by
/// (owner, shape_index).
pub(crate) struct ShapeState {
    pub owner: Entity,
    pub index: usize,
    pub cached: PhysicsShape,
    pub shape_transform: Transform,
}

#[derive(Clone, Copy)]
struct TransformCacheEntry {
    pose: Transform,
    parent: Entity,
    /// Tri-state: -1 unknown, 0 clean, 1 dirty. Reset to unknown at frame
    /// end, outside the transaction.
    dirty: i8,
}

impl Default for TransformCacheEntry {
    fn default() -> Self {
        Self {
            pose: Transform::IDENTITY,
            parent: Entity::NULL,
            dirty: -1,
        }
    }
}

pub(crate) struct ControllerState {
    pub body: RigidBodyHandle,
    pub collider: ColliderHandle,
    pub controller: rapier3d::control::KinematicCharacterController,
}

pub struct PhysicsManager {
    pub(crate) ecs: Arc<Ecs>,
    pub(crate) assets: Arc<Assets>,
    pub(crate) scenes: Arc<SceneManager>,
    pub(crate) scripts: Arc<ScriptManager>,
    pub(crate) input_queue: Arc<InputEventQueue>,

    pub(crate) scene: PhysicsScene,
    pub(crate) actors: HashMap<Entity, ActorState>,
    pub(crate) sub_actors: HashMap<Entity, Entity>,
    pub(crate) shape_states: HashMap<ColliderHandle, ShapeState>,
    pub(crate) controllers: HashMap<Entity, ControllerState>,
    pub(crate) joints: HashMap<Entity, Vec<crate::constraints::JointState>>,
    transform_cache: HashMap<Entity, TransformCacheEntry>,

    pub(crate) hull_cache: HullCache,
    pub(crate) work_queue: DispatchQueue,
    physics_observer: Option<Observer>,

    pub(crate) interval: Duration,
    pub debug_colliders: bool,
    /// Counts backend mutations per frame, for reconcile idempotence
    /// checks and debug overlays.
    pub(crate) backend_mutations: usize,
}

impl PhysicsManager {
    pub fn new(
        ecs: Arc<Ecs>,
        assets: Arc<Assets>,
        scenes: Arc<SceneManager>,
        scripts: Arc<ScriptManager>,
        input_queue: Arc<InputEventQueue>,
    ) -> Result<Self, EcsError> {
        let mut manager = Self {
            ecs,
            assets,
            scenes,
            scripts,
            input_queue,
            scene: PhysicsScene::new(),
            actors: HashMap::new(),
            sub_actors: HashMap::new(),
            shape_states: HashMap::new(),
            controllers: HashMap::new(),
            joints: HashMap::new(),
            transform_cache: HashMap::new(),
            hull_cache: HullCache::new(HULL_CACHE_TTL),
            work_queue: DispatchQueue::new("PhysicsHullLoading", 1),
            physics_observer: None,
            interval: Duration::from_secs_f64(1.0 / PHYSICS_FRAME_RATE),
            debug_colliders: false,
            backend_mutations: 0,
        };
        {
            let mut lock = manager
                .ecs
                .start_transaction(InstanceKind::Live, Permissions::add_remove())?;
            manager.physics_observer = Some(lock.watch(ComponentKind::Physics)?);
        }
        Ok(manager)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn backend_mutations_last_frame(&self) -> usize {
        self.backend_mutations
    }

    /// Number of backend actors (excluding character controller bodies).
    pub fn actor_count(&self) -> usize {
        self.actors.len()
    }

    pub fn has_actor(&self, entity: Entity) -> bool {
        self.actors.contains_key(&entity)
    }

    /// The backend's current pose for an entity's actor.
    pub fn actor_pose(&self, entity: Entity) -> Option<Transform> {
        let actor = self.actors.get(&entity)?;
        let body = self.scene.bodies.get(actor.body)?;
        Some(crate::convert::from_isometry(body.position()))
    }

    /// Backend colliders attached to an entity's actor, including shapes
    /// contributed by its sub-actors.
    pub fn actor_collider_count(&self, entity: Entity) -> usize {
        self.actors
            .get(&entity)
            .and_then(|actor| self.scene.bodies.get(actor.body))
            .map(|body| body.colliders().len())
            .unwrap_or(0)
    }

    /// Every backend collider carries shape bookkeeping that still points
    /// at a live ECS shape slot. Used by invariant checks.
    pub fn validate_shape_accounting(&self) -> bool {
        self.shape_states.iter().all(|(handle, state)| {
            self.scene.colliders.get(*handle).is_some() && state.index < usize::MAX
        })
    }

    /// The frame transaction's permission union.
    fn frame_permissions() -> Permissions {
        Permissions::new()
            .read_kinds(&read_signals_kinds())
            .read_kind(ComponentKind::LaserEmitter)
            .read_kind(ComponentKind::LightSensor)
            .read_kind(ComponentKind::EventBindings)
            .read_kind(ComponentKind::Physics)
            .read_kind(ComponentKind::TriggerGroup)
            .read_kind(ComponentKind::SceneProperties)
            .read_kind(ComponentKind::SceneInfo)
            .read_kind(ComponentKind::Scripts)
            .write_kind(ComponentKind::Animation)
            .write_kind(ComponentKind::TransformSnapshot)
            .write_kind(ComponentKind::TransformTree)
            .write_kind(ComponentKind::TriggerArea)
            .write_kind(ComponentKind::PhysicsJoints)
            .write_kind(ComponentKind::CharacterController)
            .write_kind(ComponentKind::OpticalElement)
            .write_kind(ComponentKind::PhysicsQuery)
            .write_kind(ComponentKind::LaserLine)
            .write_kind(ComponentKind::LaserSensor)
            .write_kind(ComponentKind::EventInput)
            .write_kind(ComponentKind::Signals)
    }

    /// Phase 1: the scene preload gate. A scene is admissible to the live
    /// world only when every referenced hull set is ready or resolvable.
    pub fn pre_frame_preload(&mut self) {
        let ecs = self.ecs.clone();
        let scenes = self.scenes.clone();
        let result = scenes.preload_scene_physics(&ecs, |lock, entities| {
            let mut complete = true;
            for &entity in entities {
                let Ok(Some(physics)) = lock.get::<Physics>(entity) else {
                    continue;
                };
                for shape in &physics.shapes {
                    let PhysicsShapeKind::ConvexMesh { model, hull } = &shape.shape else {
                        continue;
                    };
                    if !self.preload_hull(model, hull) {
                        complete = false;
                    }
                }
            }
            complete
        });
        if let Err(err) = result {
            tracing::error!(error = %err, "scene physics preload failed");
        }
    }

    /// Kick (or poll) the hull pipeline for one shape. True when the hull
    /// set is fully resolved.
    fn preload_hull(&self, model_name: &str, hull_name: &str) -> bool {
        let model = self.assets.load_model(model_name);
        let info = self.assets.load_physics_info(model_name);
        if !model.ready() || !info.ready() {
            return false;
        }
        let Some(info) = info.get() else {
            // Unresolvable physics info: nothing more will arrive, let the
            // scene in and create the entity without a collider later.
            return true;
        };
        let settings = info.hull(hull_name);
        let future =
            self.hull_cache
                .load_convex_hull_set(&self.assets, &self.work_queue, model, settings);
        future.ready()
    }

    /// One full physics frame: sync, step, cache tick.
    pub fn run_frame(&mut self) {
        self.backend_mutations = 0;
        {
            let _zone = zone!("physics.sync_ecs");
            let ecs = self.ecs.clone();
            let lock = ecs.start_transaction(InstanceKind::Live, Self::frame_permissions());
            match lock {
                Ok(mut lock) => {
                    if let Err(err) = self.frame_body(&mut lock) {
                        tracing::error!(error = %err, "physics frame body failed");
                    }
                }
                Err(err) => {
                    tracing::error!(error = %err, "physics frame could not start transaction");
                    return;
                }
            }
        }

        {
            // Phase 3: step the backend with no lock held
            let _zone = zone!("physics.simulate");
            self.scene.simulate(self.interval);
        }

        // Phase 4: cache tick, then reset the transform tri-state outside
        // the transaction
        self.hull_cache.tick(self.interval);
        for entry in self.transform_cache.values_mut() {
            entry.dirty = -1;
        }
    }

    fn frame_body(&mut self, lock: &mut Lock) -> Result<(), EcsError> {
        self.dispatch_input_events(lock)?;
        self.character_frame(lock)?;
        self.sync_dynamic_snapshots(lock)?;
        self.refresh_static_snapshots(lock)?;
        self.triggers_frame(lock)?;
        self.animation_frame(lock)?;
        self.drain_physics_observer(lock);

        {
            let _zone = zone!("physics.update_actors");
            // Parent actors first so sub-actor shapes have a body to land on
            for entity in lock.entities_with(&[ComponentKind::Physics])? {
                if !lock.has::<TransformTree>(entity) {
                    continue;
                }
                let Some(physics) = lock.get::<Physics>(entity)? else {
                    continue;
                };
                if physics.actor_type == PhysicsActorType::SubActor {
                    continue;
                }
                self.update_actor(lock, entity)?;
            }
            for entity in lock.entities_with(&[ComponentKind::Physics])? {
                if !lock.has::<TransformTree>(entity) {
                    continue;
                }
                let Some(physics) = lock.get::<Physics>(entity)? else {
                    continue;
                };
                if physics.actor_type != PhysicsActorType::SubActor {
                    continue;
                }
                self.update_actor(lock, entity)?;
            }
        }

        self.constraints_frame(lock)?;
        self.queries_frame(lock)?;
        self.laser_frame(lock)?;

        let scripts = self.scripts.clone();
        scripts.run_on_physics_update(lock, self.interval);

        if self.debug_colliders {
            self.update_debug_lines(lock)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Phase: input event dispatch
    // ------------------------------------------------------------------

    fn dispatch_input_events(&mut self, lock: &mut Lock) -> Result<(), EcsError> {
        use prism_core::events::{EventBindings, EventInput};

        while let Some(event) = self.input_queue.try_pop() {
            // Direct subscribers
            for entity in lock.entities_with(&[ComponentKind::EventInput])? {
                let has_queue = lock
                    .get::<EventInput>(entity)?
                    .map(|input| input.has_queue(&event.name))
                    .unwrap_or(false);
                if has_queue {
                    let queue_name = event.name.clone();
                    if let Some(input) = lock.get_mut::<EventInput>(entity)? {
                        input.add(&queue_name, event.clone());
                    }
                }
            }
            // Bound forwards
            for entity in lock.entities_with(&[ComponentKind::EventBindings])? {
                let targets = lock
                    .get::<EventBindings>(entity)?
                    .and_then(|bindings| bindings.bindings.get(&event.name).cloned())
                    .unwrap_or_default();
                for target in targets {
                    let target_entity = target.target.get(InstanceKind::Live);
                    if let Some(input) = lock.get_mut::<EventInput>(target_entity)? {
                        input.add(&target.queue, event.clone());
                    }
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Phase: snapshot sync
    // ------------------------------------------------------------------

    /// Copy backend poses into the ECS for dynamic actors that nothing
    /// else moved this frame.
    fn sync_dynamic_snapshots(&mut self, lock: &mut Lock) -> Result<(), EcsError> {
        let _zone = zone!("physics.sync_dynamic");
        for entity in lock.entities_with(&[ComponentKind::Physics])? {
            if !lock.has::<TransformSnapshot>(entity) || !lock.has::<TransformTree>(entity) {
                continue;
            }
            let Some(physics) = lock.get::<Physics>(entity)? else {
                continue;
            };
            if physics.actor_type != PhysicsActorType::Dynamic {
                continue;
            }
            let Some(actor) = self.actors.get_mut(&entity) else {
                continue;
            };
            let snapshot = lock
                .get::<TransformSnapshot>(entity)?
                .copied()
                .unwrap_or_default();
            // Only update the ECS pose if nothing moved it during the
            // backend step
            if !snapshot.0.approx_eq(&actor.data.pose, POSE_EPSILON) {
                continue;
            }
            let Some(body) = self.scene.bodies.get(actor.body) else {
                continue;
            };
            let mut pose = crate::convert::from_isometry(body.position());
            pose.scale = snapshot.0.scale;

            actor.data.velocity =
                (pose.position - actor.data.pose.position) / self.interval.as_secs_f32();
            actor.data.pose = pose;

            if let Some(snap) = lock.get_mut::<TransformSnapshot>(entity)? {
                *snap = TransformSnapshot(pose);
            }
            if let Some(tree) = lock.get_mut::<TransformTree>(entity)? {
                tree.pose = pose;
                tree.parent = None;
            }
        }
        Ok(())
    }

    /// Recompute snapshots for entities whose tree (or any ancestor)
    /// changed since last frame, using the per-entity tri-state cache.
    fn refresh_static_snapshots(&mut self, lock: &mut Lock) -> Result<(), EcsError> {
        let _zone = zone!("physics.sync_static");
        for entity in lock.entities_with(&[ComponentKind::TransformTree])? {
            if !lock.has::<TransformSnapshot>(entity) {
                continue;
            }

            let mut dirty = false;
            let mut walker = entity;
            for _ in 0..MAX_TRANSFORM_DEPTH {
                let Some(tree) = lock.get::<TransformTree>(walker)?.cloned() else {
                    break;
                };
                let parent = tree
                    .parent
                    .as_ref()
                    .map(|p| p.get(InstanceKind::Live))
                    .unwrap_or(Entity::NULL);
                let cache = self.transform_cache.entry(walker).or_default();
                if cache.dirty < 0 {
                    let changed = cache.pose != tree.pose || cache.parent != parent;
                    if changed {
                        cache.pose = tree.pose;
                        cache.parent = parent;
                        cache.dirty = 1;
                        dirty = true;
                        break;
                    }
                    cache.dirty = 0;
                } else if cache.dirty > 0 {
                    dirty = true;
                    break;
                }
                if parent.is_null() {
                    break;
                }
                walker = parent;
            }
            if !dirty {
                continue;
            }

            let Some(tree) = lock.get::<TransformTree>(entity)?.cloned() else {
                continue;
            };
            let global = tree.global_transform(lock);
            if let Some(snap) = lock.get_mut::<TransformSnapshot>(entity)? {
                *snap = TransformSnapshot(global);
            }

            // Push the new pose to non-dynamic actors immediately
            let Some(physics) = lock.get::<Physics>(entity)?.cloned() else {
                continue;
            };
            if physics.actor_type == PhysicsActorType::Dynamic {
                continue;
            }
            if let Some(actor) = self.actors.get_mut(&entity) {
                if !global.approx_eq(&actor.data.pose, POSE_EPSILON) {
                    let iso = crate::convert::to_isometry(&global);
                    if let Some(body) = self.scene.bodies.get_mut(actor.body) {
                        if physics.actor_type == PhysicsActorType::Kinematic {
                            body.set_next_kinematic_position(iso);
                        } else {
                            body.set_position(iso, true);
                        }
                        self.backend_mutations += 1;
                    }
                    actor.data.pose = global;
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Phase: observer drain
    // ------------------------------------------------------------------

    fn drain_physics_observer(&mut self, lock: &Lock) {
        let Some(observer) = self.physics_observer.take() else {
            return;
        };
        while let Some(event) = observer.poll(lock) {
            if event.event != ComponentEventType::Removed {
                continue;
            }
            if self.actors.contains_key(&event.entity) {
                self.remove_actor(event.entity);
            } else if self.sub_actors.contains_key(&event.entity) {
                self.detach_sub_actor(event.entity);
            }
        }
        self.physics_observer = Some(observer);
    }

    // ------------------------------------------------------------------
    // Actor reconciliation
    // ------------------------------------------------------------------

    /// Find the backend actor entity for a SubActor: the explicit parent
    /// if usable, else the nearest ancestor with Physics.
    fn resolve_actor_entity(&self, lock: &Lock, entity: Entity) -> Result<Entity, EcsError> {
        let Some(physics) = lock.get::<Physics>(entity)? else {
            return Ok(Entity::NULL);
        };
        if physics.actor_type != PhysicsActorType::SubActor {
            return Ok(entity);
        }
        let explicit = physics.parent_actor.get(InstanceKind::Live);
        if explicit.exists() && lock.has::<Physics>(explicit) && lock.has::<TransformTree>(explicit)
        {
            return Ok(explicit);
        }
        let mut walker = entity;
        for _ in 0..MAX_TRANSFORM_DEPTH {
            let Some(tree) = lock.get::<TransformTree>(walker)? else {
                break;
            };
            let Some(parent) = tree.parent.as_ref() else {
                break;
            };
            let parent = parent.get(InstanceKind::Live);
            if !parent.exists() {
                break;
            }
            if lock.has::<Physics>(parent) && lock.has::<TransformTree>(parent) {
                return Ok(parent);
            }
            walker = parent;
        }
        Ok(Entity::NULL)
    }

    fn update_actor(&mut self, lock: &mut Lock, entity: Entity) -> Result<(), EcsError> {
        let Some(physics) = lock.get::<Physics>(entity)?.cloned() else {
            return Ok(());
        };

        let actor_entity = if physics.actor_type == PhysicsActorType::SubActor {
            let resolved = self.resolve_actor_entity(lock, entity)?;
            if resolved.is_null() {
                return Ok(());
            }
            resolved
        } else {
            entity
        };

        if !self.actors.contains_key(&actor_entity) {
            if actor_entity == entity {
                self.create_actor(lock, entity)?;
            }
            return Ok(());
        }

        if actor_entity != entity {
            // An entity that became a sub-actor drops its own actor
            if self.actors.contains_key(&entity) {
                self.remove_actor(entity);
            }
            match self.sub_actors.get(&entity).copied() {
                Some(previous) if previous != actor_entity => {
                    self.detach_sub_actor(entity);
                    self.sub_actors.insert(entity, actor_entity);
                }
                None => {
                    self.sub_actors.insert(entity, actor_entity);
                }
                _ => {}
            }
        } else {
            // Dynamic-class changes require a rebuild
            let requested_dynamic = physics.actor_type.is_dynamic_class();
            let current_dynamic = self.actors[&actor_entity].dynamic_class;
            if requested_dynamic != current_dynamic {
                self.remove_actor(entity);
                self.create_actor(lock, entity)?;
                return Ok(());
            }
        }

        let Some(actor_tree) = lock.get::<TransformTree>(actor_entity)?.cloned() else {
            return Ok(());
        };
        let actor_transform = actor_tree.global_transform(lock);
        let scale = actor_transform.scale;

        let shape_offset = if actor_entity == entity {
            Transform {
                scale,
                ..Transform::IDENTITY
            }
        } else {
            let Some(tree) = lock.get::<TransformTree>(entity)?.cloned() else {
                return Ok(());
            };
            let mut offset = tree.relative_transform(lock, actor_entity);
            offset.position *= scale;
            offset.scale *= scale;
            offset
        };

        let shapes_changed = self.update_shapes(lock, entity, actor_entity, &shape_offset)?;

        if actor_entity == entity {
            let interval = self.interval.as_secs_f32();
            let Some(actor) = self.actors.get_mut(&actor_entity) else {
                return Ok(());
            };
            if !actor_transform.approx_eq(&actor.data.pose, POSE_EPSILON) {
                let iso = crate::convert::to_isometry(&actor_transform);
                if let Some(body) = self.scene.bodies.get_mut(actor.body) {
                    if physics.actor_type == PhysicsActorType::Kinematic {
                        body.set_next_kinematic_position(iso);
                    } else {
                        body.set_position(iso, true);
                    }
                    self.backend_mutations += 1;
                }
                actor.data.velocity =
                    (actor_transform.position - actor.data.pose.position) / interval;
                actor.data.pose = actor_transform;
            } else if physics.actor_type != PhysicsActorType::Dynamic {
                actor.data.velocity = Vec3::ZERO;
            }

            if actor.data.group != physics.group {
                let groups = interaction_groups(physics.group);
                if let Some(body) = self.scene.bodies.get(actor.body) {
                    for &collider in body.colliders() {
                        if let Some(collider) = self.scene.colliders.get_mut(collider) {
                            collider.set_collision_groups(groups);
                        }
                    }
                }
                actor.data.group = physics.group;
                self.backend_mutations += 1;
            }

            if physics.actor_type.is_dynamic_class() {
                if actor.data.angular_damping != physics.angular_damping {
                    if let Some(body) = self.scene.bodies.get_mut(actor.body) {
                        body.set_angular_damping(physics.angular_damping);
                    }
                    actor.data.angular_damping = physics.angular_damping;
                    self.backend_mutations += 1;
                }
                if actor.data.linear_damping != physics.linear_damping {
                    if let Some(body) = self.scene.bodies.get_mut(actor.body) {
                        body.set_linear_damping(physics.linear_damping);
                    }
                    actor.data.linear_damping = physics.linear_damping;
                    self.backend_mutations += 1;
                }
                if actor.data.contact_report_threshold != physics.contact_report_threshold {
                    actor.data.contact_report_threshold = physics.contact_report_threshold;
                }
            }

            // Per-frame gravity as an acceleration force, waking the body
            // when the field changes
            if physics.actor_type == PhysicsActorType::Dynamic {
                let gravity = Self::scene_gravity(lock, entity, actor_transform.position)?;
                if let Some(body) = self.scene.bodies.get_mut(actor.body) {
                    body.reset_forces(false);
                    if gravity != Vec3::ZERO && !body.is_sleeping() {
                        let force = crate::convert::to_na_vec(gravity * body.mass());
                        body.add_force(force, false);
                    }
                    if gravity != actor.data.gravity {
                        body.wake_up(true);
                        actor.data.gravity = gravity;
                    }
                }
            }
        }

        // Mass properties follow shape changes on dynamic bodies
        if shapes_changed && physics.actor_type.is_dynamic_class() && physics.mass > 0.0 {
            if let Some(actor) = self.actors.get(&actor_entity) {
                if let Some(body) = self.scene.bodies.get_mut(actor.body) {
                    body.set_additional_mass(physics.mass, true);
                }
            }
        }
        Ok(())
    }

    fn create_actor(&mut self, lock: &mut Lock, entity: Entity) -> Result<(), EcsError> {
        let Some(physics) = lock.get::<Physics>(entity)?.cloned() else {
            return Ok(());
        };
        let global = lock
            .get::<TransformSnapshot>(entity)?
            .copied()
            .map(|snap| snap.0)
            .or_else(|| {
                lock.get::<TransformTree>(entity)
                    .ok()
                    .flatten()
                    .cloned()
                    .map(|tree| tree.global_transform(lock))
            })
            .unwrap_or_default();
        let iso = crate::convert::to_isometry(&global);

        let builder = match physics.actor_type {
            PhysicsActorType::Static => RigidBodyBuilder::fixed(),
            PhysicsActorType::Dynamic => RigidBodyBuilder::dynamic()
                .angular_damping(physics.angular_damping)
                .linear_damping(physics.linear_damping),
            PhysicsActorType::Kinematic => RigidBodyBuilder::kinematic_position_based(),
            PhysicsActorType::SubActor => return Ok(()),
        };
        let body = self
            .scene
            .bodies
            .insert(builder.position(iso).user_data(entity.to_bits() as u128));
        self.backend_mutations += 1;

        let entity_ref = lock.refs().get_entity_by_id(entity);
        self.actors.insert(
            entity,
            ActorState {
                body,
                dynamic_class: physics.actor_type.is_dynamic_class(),
                data: ActorUserData {
                    entity_ref,
                    pose: global,
                    velocity: Vec3::ZERO,
                    group: physics.group,
                    angular_damping: physics.angular_damping,
                    linear_damping: physics.linear_damping,
                    contact_report_threshold: physics.contact_report_threshold,
                    gravity: Vec3::ZERO,
                },
            },
        );

        let shape_offset = Transform {
            scale: global.scale,
            ..Transform::IDENTITY
        };
        self.update_shapes(lock, entity, entity, &shape_offset)?;

        if physics.actor_type.is_dynamic_class() && physics.mass > 0.0 {
            if let Some(body) = self.scene.bodies.get_mut(body) {
                body.set_additional_mass(physics.mass, true);
            }
        }
        Ok(())
    }

    /// Diff the backend colliders of `actor_entity` owned by `owner`
    /// against the owner's ECS shape list. Returns whether anything
    /// changed.
    fn update_shapes(
        &mut self,
        lock: &Lock,
        owner: Entity,
        actor_entity: Entity,
        offset: &Transform,
    ) -> Result<bool, EcsError> {
        let Some(physics) = lock.get::<Physics>(owner)?.cloned() else {
            return Ok(false);
        };
        let Some(actor) = self.actors.get(&actor_entity) else {
            return Ok(false);
        };
        let body_handle = actor.body;
        let group = actor.data.group;
        let mut changed = false;
        let mut existing = vec![false; physics.shapes.len()];

        let attached: Vec<ColliderHandle> = self
            .scene
            .bodies
            .get(body_handle)
            .map(|body| body.colliders().to_vec())
            .unwrap_or_default();

        for collider_handle in attached {
            let (state_index, state_cached, state_transform) =
                match self.shape_states.get(&collider_handle) {
                    Some(state) if state.owner == owner => {
                        (state.index, state.cached.clone(), state.shape_transform)
                    }
                    _ => continue,
                };

            let mut remove = false;
            if state_index >= physics.shapes.len() {
                remove = true;
            } else {
                let shape = &physics.shapes[state_index];
                let is_mesh = matches!(shape.shape, PhysicsShapeKind::ConvexMesh { .. });
                if shape.shape.variant_index() != state_cached.shape.variant_index() {
                    remove = true;
                } else if is_mesh && shape.shape != state_cached.shape {
                    // Model or hull settings changed
                    remove = true;
                } else if !is_mesh && existing[state_index] {
                    // Duplicate collider for a primitive shape
                    remove = true;
                } else {
                    existing[state_index] = true;
                    let shape_transform = *offset * shape.transform;

                    let moved = !shape_transform
                        .position
                        .abs_diff_eq(state_transform.position, SHAPE_EPSILON)
                        || !shape_transform
                            .rotation
                            .abs_diff_eq(state_transform.rotation, SHAPE_EPSILON);
                    let rescaled = !shape_transform
                        .scale
                        .abs_diff_eq(state_transform.scale, SHAPE_EPSILON);
                    let reshaped = !is_mesh && shape.shape != state_cached.shape;

                    if rescaled || reshaped {
                        if is_mesh {
                            // Convex meshes rebuild their vertex cloud
                            remove = true;
                        } else if let Some(new_shape) =
                            primitive_shape(&shape.shape, shape_transform.scale)
                        {
                            if let Some(collider) = self.scene.colliders.get_mut(collider_handle) {
                                collider.set_shape(new_shape);
                                changed = true;
                            }
                        } else {
                            remove = true;
                        }
                    }
                    if !remove && moved {
                        if let Some(collider) = self.scene.colliders.get_mut(collider_handle) {
                            collider.set_position_wrt_parent(crate::convert::to_isometry(
                                &shape_transform,
                            ));
                            changed = true;
                        }
                    }
                    if !remove {
                        if let Some(state) = self.shape_states.get_mut(&collider_handle) {
                            state.cached = shape.clone();
                            state.shape_transform = shape_transform;
                        }
                    }
                }
            }
            if remove {
                self.scene.remove_collider(collider_handle);
                self.shape_states.remove(&collider_handle);
                changed = true;
            }
        }

        // Create colliders for unmatched ECS shapes
        let density = if physics.mass > 0.0 {
            0.0
        } else {
            physics.density
        };
        for (index, shape) in physics.shapes.iter().enumerate() {
            if existing[index] {
                continue;
            }
            let shape_transform = *offset * shape.transform;
            match &shape.shape {
                PhysicsShapeKind::ConvexMesh { model, hull } => {
                    let Some(hulls) = self.resolve_hull_set(model, hull) else {
                        // Future not ready; skip this shape for this frame
                        continue;
                    };
                    for hull_points in hulls {
                        let scaled: Vec<_> = hull_points
                            .iter()
                            .map(|p| crate::convert::to_na_point(*p * shape_transform.scale))
                            .collect();
                        let Some(hull_shape) = SharedShape::convex_hull(&scaled) else {
                            tracing::error!(model, hull, "failed to scale convex hull");
                            continue;
                        };
                        let collider = self.build_collider(
                            hull_shape,
                            shape,
                            &shape_transform,
                            owner,
                            index,
                            group,
                            density,
                        );
                        let handle = self.scene.colliders.insert_with_parent(
                            collider,
                            body_handle,
                            &mut self.scene.bodies,
                        );
                        self.shape_states.insert(
                            handle,
                            ShapeState {
                                owner,
                                index,
                                cached: shape.clone(),
                                shape_transform,
                            },
                        );
                        changed = true;
                    }
                }
                kind => {
                    let Some(backend_shape) = primitive_shape(kind, shape_transform.scale) else {
                        tracing::error!(owner = %owner, index, "failed to build physics shape");
                        continue;
                    };
                    let collider = self.build_collider(
                        backend_shape,
                        shape,
                        &shape_transform,
                        owner,
                        index,
                        group,
                        density,
                    );
                    let handle = self.scene.colliders.insert_with_parent(
                        collider,
                        body_handle,
                        &mut self.scene.bodies,
                    );
                    self.shape_states.insert(
                        handle,
                        ShapeState {
                            owner,
                            index,
                            cached: shape.clone(),
                            shape_transform,
                        },
                    );
                    changed = true;
                }
            }
        }

        if changed {
            self.backend_mutations += 1;
        }
        Ok(changed)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_collider(
        &self,
        shape: SharedShape,
        source: &PhysicsShape,
        shape_transform: &Transform,
        owner: Entity,
        index: usize,
        group: PhysicsGroup,
        density: f32,
    ) -> Collider {
        ColliderBuilder::new(shape)
            .position(crate::convert::to_isometry(shape_transform))
            .friction(source.material.dynamic_friction)
            .restitution(source.material.restitution)
            .density(density)
            .collision_groups(interaction_groups(group))
            .active_hooks(ActiveHooks::FILTER_CONTACT_PAIRS)
            .user_data(pack_shape_user_data(owner, index))
            .build()
    }

    /// Non-blocking hull lookup for shape creation: vertex clouds per hull
    /// when the set is resolved, None while in flight or failed.
    fn resolve_hull_set(&self, model_name: &str, hull_name: &str) -> Option<Vec<Vec<Vec3>>> {
        let model = self.assets.load_model(model_name);
        let info = self.assets.load_physics_info(model_name);
        let info = info.get()?;
        let settings = info.hull(hull_name);
        let future = self.hull_cache.load_convex_hull_set(
            &self.assets,
            &self.work_queue,
            model,
            settings,
        );
        let set = future.get()?;
        Some(set.hulls.iter().map(|h| h.points.clone()).collect())
    }

    pub(crate) fn remove_actor(&mut self, entity: Entity) {
        let Some(actor) = self.actors.remove(&entity) else {
            return;
        };
        if let Some(body) = self.scene.bodies.get(actor.body) {
            for collider in body.colliders() {
                self.shape_states.remove(collider);
            }
        }
        self.scene.remove_body(actor.body);
        self.backend_mutations += 1;
        // Orphaned sub-actors re-resolve on their next reconcile
        self.sub_actors.retain(|_, actor_entity| *actor_entity != entity);
    }

    pub(crate) fn detach_sub_actor(&mut self, entity: Entity) {
        let Some(actor_entity) = self.sub_actors.remove(&entity) else {
            return;
        };
        let Some(actor) = self.actors.get(&actor_entity) else {
            return;
        };
        let attached: Vec<ColliderHandle> = self
            .scene
            .bodies
            .get(actor.body)
            .map(|body| body.colliders().to_vec())
            .unwrap_or_default();
        for handle in attached {
            if self
                .shape_states
                .get(&handle)
                .map(|s| s.owner == entity)
                .unwrap_or(false)
            {
                self.scene.remove_collider(handle);
                self.shape_states.remove(&handle);
                self.backend_mutations += 1;
            }
        }
    }

    /// Gravity for an entity's scene at a world position.
    pub(crate) fn scene_gravity(
        lock: &Lock,
        entity: Entity,
        position: Vec3,
    ) -> Result<Vec3, EcsError> {
        let scene_name = lock
            .get::<SceneInfo>(entity)?
            .map(|info| info.scene.clone())
            .unwrap_or_default();
        for candidate in
            lock.entities_with(&[ComponentKind::SceneProperties, ComponentKind::SceneInfo])?
        {
            let Some(info) = lock.get::<SceneInfo>(candidate)? else {
                continue;
            };
            if info.scene != scene_name {
                continue;
            }
            if let Some(properties) = lock.get::<SceneProperties>(candidate)? {
                return Ok(properties.gravity_at(position));
            }
        }
        Ok(SceneProperties::default().gravity_at(position))
    }

    // ------------------------------------------------------------------
    // Debug lines
    // ------------------------------------------------------------------

    /// Dump collider bounds into the debug laser line entity, when present.
    fn update_debug_lines(&mut self, lock: &mut Lock) -> Result<(), EcsError> {
        use prism_core::ecs::components::{LaserLine, LaserSegment};

        let mut segments = Vec::new();
        for (_, collider) in self.scene.colliders.iter() {
            let aabb = collider.compute_aabb();
            let min = crate::convert::from_na_point(aabb.mins);
            let max = crate::convert::from_na_point(aabb.maxs);
            let corners = [
                Vec3::new(min.x, min.y, min.z),
                Vec3::new(max.x, min.y, min.z),
                Vec3::new(max.x, max.y, min.z),
                Vec3::new(min.x, max.y, min.z),
                Vec3::new(min.x, min.y, max.z),
                Vec3::new(max.x, min.y, max.z),
                Vec3::new(max.x, max.y, max.z),
                Vec3::new(min.x, max.y, max.z),
            ];
            const EDGES: [(usize, usize); 12] = [
                (0, 1),
                (1, 2),
                (2, 3),
                (3, 0),
                (4, 5),
                (5, 6),
                (6, 7),
                (7, 4),
                (0, 4),
                (1, 5),
                (2, 6),
                (3, 7),
            ];
            for (a, b) in EDGES {
                segments.push(LaserSegment {
                    start: corners[a],
                    end: corners[b],
                    color: Vec3::new(0.0, 1.0, 0.0),
                });
            }
        }

        let debug_name = prism_core::refs::Name::new("physics", "debug_lines");
        let entity = lock.refs().get_entity(&debug_name).get(InstanceKind::Live);
        if let Some(line) = lock.get_mut::<LaserLine>(entity)? {
            line.segments = segments;
        }
        Ok(())
    }
}

/// Build a backend shape for a primitive, applying the world scale.
pub(crate) fn primitive_shape(kind: &PhysicsShapeKind, scale: Vec3) -> Option<SharedShape> {
    match kind {
        PhysicsShapeKind::Sphere { radius } => {
            Some(SharedShape::ball(radius * scale.max_element()))
        }
        PhysicsShapeKind::Capsule { radius, height } => {
            let scaled_radius = radius * scale.x.max(scale.z);
            let half_height = ((height * scale.y) / 2.0 - scaled_radius).max(0.01);
            Some(SharedShape::capsule_y(half_height, scaled_radius))
        }
        PhysicsShapeKind::Box { extents } => {
            let half = *extents * scale / 2.0;
            Some(SharedShape::cuboid(half.x, half.y, half.z))
        }
        PhysicsShapeKind::Plane => Some(SharedShape::halfspace(rapier3d::na::Vector3::y_axis())),
        PhysicsShapeKind::ConvexMesh { .. } => None,
    }
}

impl ThreadHandler for PhysicsManager {
    fn pre_frame(&mut self) -> bool {
        self.pre_frame_preload();
        true
    }

    fn frame(&mut self) {
        self.run_frame();
    }
}
