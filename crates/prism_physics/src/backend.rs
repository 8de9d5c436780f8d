// backend.rs - Rapier scene wrapper
//
// Owns every rapier set plus the group collision matrix and the NoClip pair
// filter. The reconciliation code treats this as "the backend": create and
// mutate bodies/colliders/joints here, then step once per physics frame.

use parking_lot::RwLock;
use prism_core::ecs::components::PhysicsGroup;
use prism_core::ecs::Entity;
use rapier3d::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Collider user data: owner entity bits in the low half, shape index in
/// the high half. Sub-actor shapes carry the owning (shape) entity, not the
/// actor entity.
pub fn pack_shape_user_data(owner: Entity, shape_index: usize) -> u128 {
    (owner.to_bits() as u128) | ((shape_index as u128) << 64)
}

pub fn unpack_shape_user_data(data: u128) -> (Entity, usize) {
    (
        Entity::from_bits((data & u128::from(u64::MAX)) as u64),
        (data >> 64) as usize,
    )
}

/// Group pairs that never collide, mirroring the engine's interaction
/// policy: the player ignores itself, UI ignores the world, and NoClip
/// ignores everything.
fn group_pair_allowed(a: PhysicsGroup, b: PhysicsGroup) -> bool {
    use PhysicsGroup::*;
    let pair = |x: PhysicsGroup, y: PhysicsGroup| {
        (a == x && b == y) || (a == y && b == x)
    };
    if a == NoClip || b == NoClip {
        return false;
    }
    if pair(Player, Player) || pair(Player, PlayerLeftHand) || pair(Player, PlayerRightHand) {
        return false;
    }
    if pair(PlayerLeftHand, PlayerLeftHand) || pair(PlayerRightHand, PlayerRightHand) {
        return false;
    }
    if a == UserInterface || b == UserInterface {
        // UI elements only collide with each other's group explicitly
        return false;
    }
    true
}

/// Membership/filter bits for a collision group.
pub fn interaction_groups(group: PhysicsGroup) -> InteractionGroups {
    let mut filter = 0u32;
    for other in PhysicsGroup::ALL {
        if group_pair_allowed(group, other) {
            filter |= other.bit();
        }
    }
    InteractionGroups::new(
        Group::from_bits_truncate(group.bit()),
        Group::from_bits_truncate(filter),
    )
}

/// Entity pairs excluded from contact generation (NoClip joints).
#[derive(Default)]
pub struct ContactExclusions {
    pairs: RwLock<HashSet<(u64, u64)>>,
}

impl ContactExclusions {
    fn key(a: Entity, b: Entity) -> (u64, u64) {
        let (a, b) = (a.to_bits(), b.to_bits());
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }

    pub fn insert(&self, a: Entity, b: Entity) {
        self.pairs.write().insert(Self::key(a, b));
    }

    pub fn remove(&self, a: Entity, b: Entity) {
        self.pairs.write().remove(&Self::key(a, b));
    }

    pub fn contains(&self, a: Entity, b: Entity) -> bool {
        self.pairs.read().contains(&Self::key(a, b))
    }
}

struct ExclusionHooks {
    exclusions: Arc<ContactExclusions>,
}

impl PhysicsHooks for ExclusionHooks {
    fn filter_contact_pair(&self, context: &PairFilterContext) -> Option<SolverFlags> {
        let c1 = &context.colliders[context.collider1];
        let c2 = &context.colliders[context.collider2];
        let (e1, _) = unpack_shape_user_data(c1.user_data);
        let (e2, _) = unpack_shape_user_data(c2.user_data);
        if self.exclusions.contains(e1, e2) {
            None
        } else {
            Some(SolverFlags::COMPUTE_IMPULSES)
        }
    }
}

/// The backend scene: rapier's sets plus the stepping pipeline.
pub struct PhysicsScene {
    pub bodies: RigidBodySet,
    pub colliders: ColliderSet,
    pub impulse_joints: ImpulseJointSet,
    pub multibody_joints: MultibodyJointSet,
    pub islands: IslandManager,
    pub query_pipeline: QueryPipeline,
    pub exclusions: Arc<ContactExclusions>,
    broad_phase: DefaultBroadPhase,
    narrow_phase: NarrowPhase,
    ccd_solver: CCDSolver,
    pipeline: PhysicsPipeline,
    integration_parameters: IntegrationParameters,
    hooks: ExclusionHooks,
}

impl Default for PhysicsScene {
    fn default() -> Self {
        Self::new()
    }
}

impl PhysicsScene {
    pub fn new() -> Self {
        let exclusions = Arc::new(ContactExclusions::default());
        Self {
            bodies: RigidBodySet::new(),
            colliders: ColliderSet::new(),
            impulse_joints: ImpulseJointSet::new(),
            multibody_joints: MultibodyJointSet::new(),
            islands: IslandManager::new(),
            query_pipeline: QueryPipeline::new(),
            exclusions: exclusions.clone(),
            broad_phase: DefaultBroadPhase::new(),
            narrow_phase: NarrowPhase::new(),
            ccd_solver: CCDSolver::new(),
            pipeline: PhysicsPipeline::new(),
            integration_parameters: IntegrationParameters::default(),
            hooks: ExclusionHooks { exclusions },
        }
    }

    /// Advance the simulation one step. Rapier's step is synchronous, so
    /// results are fetched by the time this returns.
    pub fn simulate(&mut self, dt: Duration) {
        self.integration_parameters.dt = dt.as_secs_f32();
        // Per-scene gravity is zero: gravity comes from SceneProperties and
        // is applied per actor as a force.
        let gravity = rapier3d::na::Vector3::zeros();
        self.pipeline.step(
            &gravity,
            &self.integration_parameters,
            &mut self.islands,
            &mut self.broad_phase,
            &mut self.narrow_phase,
            &mut self.bodies,
            &mut self.colliders,
            &mut self.impulse_joints,
            &mut self.multibody_joints,
            &mut self.ccd_solver,
            Some(&mut self.query_pipeline),
            &self.hooks,
            &(),
        );
    }

    /// Refresh the query pipeline against current collider poses without
    /// stepping, so queries made before the first step see the scene.
    pub fn update_queries(&mut self) {
        self.query_pipeline.update(&self.colliders);
    }

    pub fn remove_body(&mut self, handle: RigidBodyHandle) {
        self.bodies.remove(
            handle,
            &mut self.islands,
            &mut self.colliders,
            &mut self.impulse_joints,
            &mut self.multibody_joints,
            true,
        );
    }

    pub fn remove_collider(&mut self, handle: ColliderHandle) {
        self.colliders
            .remove(handle, &mut self.islands, &mut self.bodies, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_core::ecs::InstanceKind;

    #[test]
    fn shape_user_data_round_trip() {
        let entity = Entity {
            index: 12,
            generation: 3,
            instance: InstanceKind::Live,
        };
        let packed = pack_shape_user_data(entity, 5);
        let (e, index) = unpack_shape_user_data(packed);
        assert_eq!(e, entity);
        assert_eq!(index, 5);
    }

    #[test]
    fn group_matrix_blocks_noclip_and_player_self() {
        use PhysicsGroup::*;
        let world = interaction_groups(World);
        assert!(world.filter.bits() & World.bit() != 0);
        assert!(world.filter.bits() & NoClip.bit() == 0);

        let player = interaction_groups(Player);
        assert!(player.filter.bits() & Player.bit() == 0);
        // Hands may collide with each other
        let left = interaction_groups(PlayerLeftHand);
        assert!(left.filter.bits() & PlayerRightHand.bit() != 0);
    }

    #[test]
    fn exclusion_pairs_are_symmetric() {
        let exclusions = ContactExclusions::default();
        let a = Entity {
            index: 1,
            generation: 1,
            instance: InstanceKind::Live,
        };
        let b = Entity {
            index: 2,
            generation: 1,
            instance: InstanceKind::Live,
        };
        exclusions.insert(a, b);
        assert!(exclusions.contains(b, a));
        exclusions.remove(b, a);
        assert!(!exclusions.contains(a, b));
    }
}
