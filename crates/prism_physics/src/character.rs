// character.rs - Capsule character controller
//
// Controllers are kinematic capsules moved by the backend's shape sweep.
// Movement intent comes from the move_* signals, rotated by the input
// parent (usually the player head) and flattened onto the ground plane.
// The transform origin sits at the capsule's feet.

use crate::manager::{ControllerState, PhysicsManager};
use glam::Vec3;
use prism_core::ecs::components::{
    CharacterController, PhysicsGroup, TransformSnapshot, TransformTree,
};
use prism_core::ecs::{ComponentKind, EcsError, Entity, InstanceKind, Lock};
use prism_core::refs::SignalKey;
use rapier3d::prelude::*;

const MOVEMENT_SPEED: f32 = 3.0;
const AIR_STRAFE: f32 = 0.8;
/// Constant downward bias while grounded, keeping ground detection stable.
const GROUND_STICK: f32 = 0.01;

impl PhysicsManager {
    pub(crate) fn character_frame(&mut self, lock: &mut Lock) -> Result<(), EcsError> {
        let dt = self.interval.as_secs_f32();
        let entities = lock.entities_with(&[ComponentKind::CharacterController])?;

        // Queries must see colliders created before the first step
        self.scene.update_queries();

        for entity in entities {
            if !lock.has::<TransformTree>(entity) {
                continue;
            }
            let Some(mut controller) = lock.get::<CharacterController>(entity)?.cloned() else {
                continue;
            };
            let Some(tree) = lock.get::<TransformTree>(entity)?.cloned() else {
                continue;
            };
            let foot = tree.global_transform(lock).position;
            let center = foot + Vec3::new(0.0, controller.height / 2.0, 0.0);

            self.ensure_controller(entity, &controller, center);

            // Movement intent from signals, through the input parent's frame
            let entity_ref = lock.refs().get_entity_by_id(entity);
            let read_signal = |name: &str| -> f32 {
                SignalKey::new(entity_ref.clone(), name)
                    .map(|key| lock.refs().get_signal(&key).get_signal(lock, 0) as f32)
                    .unwrap_or(0.0)
            };
            let mut input = Vec3::ZERO;
            input.z -= read_signal("move_forward");
            input.z += read_signal("move_back");
            input.x -= read_signal("move_left");
            input.x += read_signal("move_right");
            input.x = input.x.clamp(-1.0, 1.0);
            input.z = input.z.clamp(-1.0, 1.0);

            let mut movement = input;
            let input_parent = controller.input_parent.get(InstanceKind::Live);
            if let Ok(Some(parent_tree)) = lock.get::<TransformTree>(input_parent) {
                let parent_tree = parent_tree.clone();
                let rotation = parent_tree.global_transform(lock).rotation;
                movement = rotation * input;
                if movement.y.abs() > 0.999 {
                    movement = rotation * Vec3::new(0.0, -movement.y, 0.0);
                }
                movement.y = 0.0;
            }
            if movement != Vec3::ZERO {
                movement = movement.normalize() * MOVEMENT_SPEED;
            }

            let gravity = Self::scene_gravity(lock, entity, foot)?;
            if controller.on_ground {
                controller.velocity.x = movement.x;
                controller.velocity.y -= GROUND_STICK;
                controller.velocity.z = movement.z;
            } else {
                controller.velocity += movement * AIR_STRAFE * dt;
                controller.velocity += gravity * dt;
            }

            let desired = controller.velocity * dt;
            let Some(state) = self.controllers.get(&entity) else {
                continue;
            };
            let capsule_radius = controller.radius;
            let half_height = (controller.height / 2.0 - capsule_radius).max(0.01);
            let capsule = Capsule::new_y(half_height, capsule_radius);
            let position = crate::convert::to_isometry(&prism_core::math::Transform {
                position: center,
                ..Default::default()
            });
            let filter = QueryFilter::default().exclude_rigid_body(state.body);
            let moved = state.controller.move_shape(
                dt,
                &self.scene.bodies,
                &self.scene.colliders,
                &self.scene.query_pipeline,
                &capsule,
                &position,
                crate::convert::to_na_vec(desired),
                filter,
                |_collision| {},
            );

            let applied = crate::convert::from_na_vec(moved.translation);
            let new_center = center + applied;
            controller.on_ground = moved.grounded;
            // Never report more velocity than the sweep actually moved
            let limit = desired.abs();
            controller.velocity = applied.clamp(-limit, limit) / dt;

            // Follow with the backend body so other actors collide with us
            if let Some(body) = self.scene.bodies.get_mut(state.body) {
                body.set_next_kinematic_position(crate::convert::to_isometry(
                    &prism_core::math::Transform {
                        position: new_center,
                        ..Default::default()
                    },
                ));
            }

            let new_foot = new_center - Vec3::new(0.0, controller.height / 2.0, 0.0);
            if let Some(tree) = lock.get_mut::<TransformTree>(entity)? {
                tree.pose.position = new_foot;
            }
            if let Some(snapshot) = lock.get_mut::<TransformSnapshot>(entity)? {
                snapshot.0.position = new_foot;
            }
            if let Some(stored) = lock.get_mut::<CharacterController>(entity)? {
                *stored = controller;
            }
        }

        // Drop controller state for entities that lost the component
        let live: std::collections::HashSet<Entity> = lock
            .entities_with(&[ComponentKind::CharacterController])?
            .into_iter()
            .collect();
        let stale: Vec<Entity> = self
            .controllers
            .keys()
            .filter(|entity| !live.contains(entity))
            .copied()
            .collect();
        for entity in stale {
            if let Some(state) = self.controllers.remove(&entity) {
                self.scene.remove_body(state.body);
            }
        }
        Ok(())
    }

    fn ensure_controller(&mut self, entity: Entity, controller: &CharacterController, center: Vec3) {
        if self.controllers.contains_key(&entity) {
            return;
        }
        let position = crate::convert::to_isometry(&prism_core::math::Transform {
            position: center,
            ..Default::default()
        });
        let body = self.scene.bodies.insert(
            RigidBodyBuilder::kinematic_position_based()
                .position(position)
                .user_data(entity.to_bits() as u128),
        );
        let capsule_radius = controller.radius;
        let half_height = (controller.height / 2.0 - capsule_radius).max(0.01);
        let collider = ColliderBuilder::capsule_y(half_height, capsule_radius)
            .collision_groups(crate::backend::interaction_groups(PhysicsGroup::Player))
            .user_data(crate::backend::pack_shape_user_data(entity, 0))
            .build();
        let collider =
            self.scene
                .colliders
                .insert_with_parent(collider, body, &mut self.scene.bodies);
        self.controllers.insert(
            entity,
            ControllerState {
                body,
                collider,
                controller: rapier3d::control::KinematicCharacterController::default(),
            },
        );
    }
}
