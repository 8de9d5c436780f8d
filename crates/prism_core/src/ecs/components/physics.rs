// physics.rs - Physics simulation components
//
// These are the authored inputs to the physics reconciliation loop. Backend
// handles (rigid bodies, colliders, joints) never appear here; the physics
// thread owns those and diffs them against this data every frame.

use crate::math::Transform;
use crate::refs::{EntityRef, EntityScope, ReferenceManager};
use glam::Vec3;
use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhysicsActorType {
    #[default]
    Static,
    Dynamic,
    Kinematic,
    /// Shapes attach to the nearest ancestor actor instead of creating one.
    SubActor,
}

impl PhysicsActorType {
    /// Dynamic and kinematic actors share a backend rigid-body class.
    pub fn is_dynamic_class(&self) -> bool {
        matches!(self, PhysicsActorType::Dynamic | PhysicsActorType::Kinematic)
    }
}

/// Collision group assignment. Group pair filtering lives in the backend
/// setup; the discriminant doubles as the group bit index.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhysicsGroup {
    #[default]
    World = 0,
    Interactive = 1,
    HeldObject = 2,
    Player = 3,
    PlayerLeftHand = 4,
    PlayerRightHand = 5,
    UserInterface = 6,
    NoClip = 7,
}

impl PhysicsGroup {
    pub const ALL: [PhysicsGroup; 8] = [
        PhysicsGroup::World,
        PhysicsGroup::Interactive,
        PhysicsGroup::HeldObject,
        PhysicsGroup::Player,
        PhysicsGroup::PlayerLeftHand,
        PhysicsGroup::PlayerRightHand,
        PhysicsGroup::UserInterface,
        PhysicsGroup::NoClip,
    ];

    pub fn bit(&self) -> u32 {
        1 << (*self as u32)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhysicsMaterial {
    #[serde(default = "default_static_friction")]
    pub static_friction: f32,
    #[serde(default = "default_dynamic_friction")]
    pub dynamic_friction: f32,
    #[serde(default)]
    pub restitution: f32,
}

fn default_static_friction() -> f32 {
    0.6
}
fn default_dynamic_friction() -> f32 {
    0.5
}

impl Default for PhysicsMaterial {
    fn default() -> Self {
        Self {
            static_friction: default_static_friction(),
            dynamic_friction: default_dynamic_friction(),
            restitution: 0.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhysicsShapeKind {
    Sphere {
        radius: f32,
    },
    Capsule {
        radius: f32,
        height: f32,
    },
    Box {
        extents: Vec3,
    },
    Plane,
    ConvexMesh {
        model: String,
        /// Hull settings name within the model's physics info, e.g. "hull"
        /// or "convex0".
        hull: String,
    },
}

impl PhysicsShapeKind {
    /// Discriminant index used for shape diffing.
    pub fn variant_index(&self) -> u32 {
        match self {
            PhysicsShapeKind::Sphere { .. } => 0,
            PhysicsShapeKind::Capsule { .. } => 1,
            PhysicsShapeKind::Box { .. } => 2,
            PhysicsShapeKind::Plane => 3,
            PhysicsShapeKind::ConvexMesh { .. } => 4,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhysicsShape {
    pub shape: PhysicsShapeKind,
    #[serde(default)]
    pub transform: Transform,
    #[serde(default)]
    pub material: PhysicsMaterial,
}

impl PhysicsShape {
    pub fn new(shape: PhysicsShapeKind) -> Self {
        Self {
            shape,
            transform: Transform::IDENTITY,
            material: PhysicsMaterial::default(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Physics {
    #[serde(default)]
    pub shapes: Vec<PhysicsShape>,
    #[serde(default, rename = "type")]
    pub actor_type: PhysicsActorType,
    #[serde(default)]
    pub group: PhysicsGroup,
    /// Explicit mass in kg; zero means "derive from density".
    #[serde(default)]
    pub mass: f32,
    #[serde(default = "default_density")]
    pub density: f32,
    #[serde(default = "default_angular_damping")]
    pub angular_damping: f32,
    #[serde(default)]
    pub linear_damping: f32,
    /// Contact force threshold for reports; negative disables reporting.
    #[serde(default = "default_contact_report_threshold")]
    pub contact_report_threshold: f32,
    /// Explicit parent actor for SubActor entities. When unset, the nearest
    /// ancestor with Physics is used.
    #[serde(default)]
    pub parent_actor: EntityRef,
}

fn default_density() -> f32 {
    1000.0
}
fn default_angular_damping() -> f32 {
    0.05
}
fn default_contact_report_threshold() -> f32 {
    -1.0
}

impl Physics {
    pub fn new(shapes: Vec<PhysicsShape>, actor_type: PhysicsActorType) -> Self {
        Self {
            shapes,
            actor_type,
            density: default_density(),
            angular_damping: default_angular_damping(),
            contact_report_threshold: default_contact_report_threshold(),
            ..Default::default()
        }
    }

    pub(crate) fn set_scope(&mut self, scope: &EntityScope, refs: &ReferenceManager) {
        self.parent_actor.set_scope(scope, refs);
    }

    pub fn numeric_field(&self, field: &str) -> Option<f64> {
        match field {
            "mass" => Some(self.mass as f64),
            "density" => Some(self.density as f64),
            "angular_damping" => Some(self.angular_damping as f64),
            "linear_damping" => Some(self.linear_damping as f64),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhysicsJointType {
    Fixed,
    Spherical,
    Hinge,
    Slider,
    /// Spring-like constraint driving toward the target pose with bounded
    /// force and torque.
    Force,
    /// Permanently ignore collisions with the target.
    NoClip,
    /// Ignore collisions with the target until the pair separates once.
    TemporaryNoClip,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhysicsJoint {
    pub target: EntityRef,
    #[serde(rename = "type")]
    pub joint_type: PhysicsJointType,
    #[serde(default)]
    pub local_offset: Transform,
    #[serde(default)]
    pub remote_offset: Transform,
    /// Force/torque limits for Force joints.
    #[serde(default = "default_force_limit")]
    pub force_limit: f32,
    #[serde(default = "default_force_limit")]
    pub torque_limit: f32,
}

fn default_force_limit() -> f32 {
    f32::MAX
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PhysicsJoints {
    #[serde(default)]
    pub joints: Vec<PhysicsJoint>,
}

impl PhysicsJoints {
    pub(crate) fn set_scope(&mut self, scope: &EntityScope, refs: &ReferenceManager) {
        for joint in &mut self.joints {
            joint.target.set_scope(scope, refs);
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RaycastResult {
    pub target: EntityRef,
    pub position: Vec3,
    pub distance: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhysicsQueryEntry {
    Raycast {
        direction: Vec3,
        max_distance: f32,
        #[serde(default = "default_filter_mask")]
        filter_mask: u32,
        #[serde(default, skip)]
        result: Option<RaycastResult>,
    },
    Sweep {
        shape: PhysicsShape,
        direction: Vec3,
        max_distance: f32,
        #[serde(default = "default_filter_mask")]
        filter_mask: u32,
        #[serde(default, skip)]
        result: Option<RaycastResult>,
    },
    Overlap {
        shape: PhysicsShape,
        #[serde(default = "default_filter_mask")]
        filter_mask: u32,
        #[serde(default, skip)]
        result: Vec<EntityRef>,
    },
}

fn default_filter_mask() -> u32 {
    u32::MAX
}

/// Pending scene queries, resolved against the backend once per frame.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PhysicsQuery {
    #[serde(default)]
    pub queries: Vec<PhysicsQueryEntry>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CharacterController {
    #[serde(default = "default_controller_height")]
    pub height: f32,
    #[serde(default = "default_controller_radius")]
    pub radius: f32,
    /// Rotation source for movement input (usually the player head).
    #[serde(default)]
    pub input_parent: EntityRef,
    #[serde(default, skip)]
    pub velocity: Vec3,
    #[serde(default, skip)]
    pub on_ground: bool,
}

fn default_controller_height() -> f32 {
    1.8
}
fn default_controller_radius() -> f32 {
    0.3
}

impl Default for CharacterController {
    fn default() -> Self {
        Self {
            height: default_controller_height(),
            radius: default_controller_radius(),
            input_parent: EntityRef::default(),
            velocity: Vec3::ZERO,
            on_ground: false,
        }
    }
}

impl CharacterController {
    pub(crate) fn set_scope(&mut self, scope: &EntityScope, refs: &ReferenceManager) {
        self.input_parent.set_scope(scope, refs);
    }

    pub fn numeric_field(&self, field: &str) -> Option<f64> {
        match field {
            "on_ground" => Some(if self.on_ground { 1.0 } else { 0.0 }),
            "velocity.x" => Some(self.velocity.x as f64),
            "velocity.y" => Some(self.velocity.y as f64),
            "velocity.z" => Some(self.velocity.z as f64),
            _ => None,
        }
    }
}

/// Membership tag for entities that trigger areas watch for.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerGroup {
    #[default]
    Player,
    Object,
    Magnetic,
}

impl TriggerGroup {
    pub const ALL: [TriggerGroup; 3] =
        [TriggerGroup::Player, TriggerGroup::Object, TriggerGroup::Magnetic];
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerShape {
    #[default]
    Box,
    Sphere,
}

/// A volume emitting enter/leave events as tagged entities overlap it.
///
/// The overlap sets from the previous frame live here so the trigger system
/// can diff them; they are runtime state, never serialized.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerArea {
    #[serde(default)]
    pub shape: TriggerShape,
    #[serde(default, skip)]
    pub contained: std::collections::BTreeMap<TriggerGroup, std::collections::BTreeSet<crate::ecs::Entity>>,
}
