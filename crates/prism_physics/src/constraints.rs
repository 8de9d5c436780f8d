// constraints.rs - Joint reconciliation
//
// PhysicsJoints components are diffed against backend joint state every
// frame. Rigid joints map to impulse joints; Force joints apply a bounded
// spring toward the target pose; NoClip joints maintain contact-exclusion
// pairs, temporarily for TemporaryNoClip (until the pair first separates).

use crate::manager::PhysicsManager;
use prism_core::ecs::components::{PhysicsJoint, PhysicsJointType, PhysicsJoints};
use prism_core::ecs::{ComponentKind, EcsError, Entity, InstanceKind, Lock};
use rapier3d::prelude::*;

const FORCE_STIFFNESS: f32 = 100.0;
const FORCE_DAMPING: f32 = 20.0;
const TORQUE_STIFFNESS: f32 = 50.0;
const TORQUE_DAMPING: f32 = 10.0;

pub(crate) struct JointState {
    def: PhysicsJoint,
    target_entity: Entity,
    handle: Option<ImpulseJointHandle>,
    noclip_installed: bool,
    temporary_released: bool,
}

impl PhysicsManager {
    pub(crate) fn constraints_frame(&mut self, lock: &mut Lock) -> Result<(), EcsError> {
        let entities = lock.entities_with(&[ComponentKind::PhysicsJoints])?;
        let entity_set: std::collections::HashSet<Entity> = entities.iter().copied().collect();

        // Entities that dropped their joints release everything
        let removed: Vec<Entity> = self
            .joints
            .keys()
            .filter(|entity| !entity_set.contains(entity))
            .copied()
            .collect();
        for entity in removed {
            if let Some(states) = self.joints.remove(&entity) {
                for state in states {
                    self.release_joint(entity, &state);
                }
            }
        }

        for entity in entities {
            let desired = lock
                .get::<PhysicsJoints>(entity)?
                .map(|joints| joints.joints.clone())
                .unwrap_or_default();

            // Trim joints beyond the desired list
            let mut states = self.joints.remove(&entity).unwrap_or_default();
            while states.len() > desired.len() {
                if let Some(state) = states.pop() {
                    self.release_joint(entity, &state);
                }
            }

            for (index, def) in desired.iter().enumerate() {
                let target_entity = def.target.get(InstanceKind::Live);
                if index < states.len() {
                    let stale = states[index].def != *def
                        || states[index].target_entity != target_entity;
                    if stale {
                        let old = std::mem::replace(
                            &mut states[index],
                            JointState {
                                def: def.clone(),
                                target_entity,
                                handle: None,
                                noclip_installed: false,
                                temporary_released: false,
                            },
                        );
                        self.release_joint(entity, &old);
                    }
                } else {
                    states.push(JointState {
                        def: def.clone(),
                        target_entity,
                        handle: None,
                        noclip_installed: false,
                        temporary_released: false,
                    });
                }
                self.realize_joint(entity, &mut states[index]);
            }
            self.joints.insert(entity, states);
        }
        Ok(())
    }

    fn release_joint(&mut self, entity: Entity, state: &JointState) {
        if let Some(handle) = state.handle {
            self.scene.impulse_joints.remove(handle, true);
            self.backend_mutations += 1;
        }
        if state.noclip_installed && !state.temporary_released {
            self.scene.exclusions.remove(entity, state.target_entity);
        }
    }

    fn realize_joint(&mut self, entity: Entity, state: &mut JointState) {
        let target_entity = state.target_entity;
        match state.def.joint_type {
            PhysicsJointType::NoClip => {
                if !state.noclip_installed {
                    self.scene.exclusions.insert(entity, target_entity);
                    state.noclip_installed = true;
                }
            }
            PhysicsJointType::TemporaryNoClip => {
                if !state.noclip_installed {
                    self.scene.exclusions.insert(entity, target_entity);
                    state.noclip_installed = true;
                } else if !state.temporary_released
                    && !self.actors_overlap(entity, target_entity)
                {
                    // The pair separated once; collisions resume
                    self.scene.exclusions.remove(entity, target_entity);
                    state.temporary_released = true;
                }
            }
            PhysicsJointType::Force => self.apply_force_joint(entity, state),
            PhysicsJointType::Fixed
            | PhysicsJointType::Spherical
            | PhysicsJointType::Hinge
            | PhysicsJointType::Slider => {
                if state.handle.is_some() {
                    return;
                }
                let (Some(actor), Some(target)) = (
                    self.actors.get(&entity),
                    self.actors.get(&target_entity),
                ) else {
                    return;
                };
                let local = crate::convert::to_isometry(&state.def.local_offset);
                let remote = crate::convert::to_isometry(&state.def.remote_offset);
                let joint: GenericJoint = match state.def.joint_type {
                    PhysicsJointType::Fixed => FixedJointBuilder::new()
                        .local_frame1(local)
                        .local_frame2(remote)
                        .into(),
                    PhysicsJointType::Spherical => SphericalJointBuilder::new()
                        .local_anchor1(crate::convert::to_na_point(
                            state.def.local_offset.position,
                        ))
                        .local_anchor2(crate::convert::to_na_point(
                            state.def.remote_offset.position,
                        ))
                        .into(),
                    PhysicsJointType::Hinge => RevoluteJointBuilder::new(Vector::y_axis())
                        .local_anchor1(crate::convert::to_na_point(
                            state.def.local_offset.position,
                        ))
                        .local_anchor2(crate::convert::to_na_point(
                            state.def.remote_offset.position,
                        ))
                        .into(),
                    PhysicsJointType::Slider => PrismaticJointBuilder::new(Vector::x_axis())
                        .local_anchor1(crate::convert::to_na_point(
                            state.def.local_offset.position,
                        ))
                        .local_anchor2(crate::convert::to_na_point(
                            state.def.remote_offset.position,
                        ))
                        .into(),
                    _ => unreachable!(),
                };
                let handle =
                    self.scene
                        .impulse_joints
                        .insert(actor.body, target.body, joint, true);
                state.handle = Some(handle);
                self.backend_mutations += 1;
            }
        }
    }

    /// Bounded spring driving the actor toward the target pose.
    fn apply_force_joint(&mut self, entity: Entity, state: &JointState) {
        let (Some(actor), Some(target)) = (
            self.actors.get(&entity),
            self.actors.get(&state.target_entity),
        ) else {
            return;
        };
        let current = actor.data.pose * state.def.local_offset;
        let target_pose = target.data.pose * state.def.remote_offset;
        let body_handle = actor.body;
        let Some(body) = self.scene.bodies.get_mut(body_handle) else {
            return;
        };

        let delta = target_pose.position - current.position;
        let velocity = crate::convert::from_na_vec(*body.linvel());
        let accel = delta * FORCE_STIFFNESS - velocity * FORCE_DAMPING;
        let mut force = accel * body.mass();
        let force_limit = state.def.force_limit;
        if force.length() > force_limit {
            force = force.normalize_or_zero() * force_limit;
        }
        body.add_force(crate::convert::to_na_vec(force), true);

        let rotation_error = target_pose.rotation * current.rotation.inverse();
        let (axis, angle) = rotation_error.to_axis_angle();
        let ang_vel = crate::convert::from_na_vec(*body.angvel());
        let mut torque = axis * angle * TORQUE_STIFFNESS - ang_vel * TORQUE_DAMPING;
        let torque_limit = state.def.torque_limit;
        if torque.length() > torque_limit {
            torque = torque.normalize_or_zero() * torque_limit;
        }
        body.add_torque(crate::convert::to_na_vec(torque), true);
    }

    /// AABB intersection of the two entities' actor colliders.
    fn actors_overlap(&self, a: Entity, b: Entity) -> bool {
        let Some(a_aabb) = self.actor_aabb(a) else {
            return false;
        };
        let Some(b_aabb) = self.actor_aabb(b) else {
            return false;
        };
        a_aabb.intersects(&b_aabb)
    }

    fn actor_aabb(&self, entity: Entity) -> Option<rapier3d::parry::bounding_volume::Aabb> {
        use rapier3d::parry::bounding_volume::BoundingVolume;
        let actor = self.actors.get(&entity)?;
        let body = self.scene.bodies.get(actor.body)?;
        let mut merged: Option<rapier3d::parry::bounding_volume::Aabb> = None;
        for &collider in body.colliders() {
            let collider = self.scene.colliders.get(collider)?;
            let aabb = collider.compute_aabb();
            merged = Some(match merged {
                Some(existing) => existing.merged(&aabb),
                None => aabb,
            });
        }
        merged
    }
}

