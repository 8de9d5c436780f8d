// laser.rs - Laser propagation
//
// Each enabled emitter casts a ray along its forward axis, reflecting and
// splitting on optical elements up to a bounce budget. Path segments land
// in the emitter's LaserLine; intensity deposits onto LaserSensor hits,
// which publish their reading as signals.

use crate::backend::unpack_shape_user_data;
use crate::manager::PhysicsManager;
use glam::Vec3;
use prism_core::ecs::components::{
    LaserEmitter, LaserLine, LaserSegment, LaserSensor, OpticalElement, PhysicsGroup,
    TransformSnapshot,
};
use prism_core::ecs::{ComponentKind, EcsError, Entity, Lock};
use prism_core::refs::SignalKey;
use rapier3d::prelude::*;

const MAX_LASER_BOUNCES: usize = 10;
const MAX_LASER_SEGMENTS: usize = 64;
const MAX_LASER_RANGE: f32 = 1000.0;
/// Minimum per-channel intensity worth propagating.
const MIN_INTENSITY: f32 = 1e-3;
const SURFACE_EPSILON: f32 = 1e-3;

impl PhysicsManager {
    pub(crate) fn laser_frame(&mut self, lock: &mut Lock) -> Result<(), EcsError> {
        self.scene.update_queries();

        // Sensors accumulate from zero each frame
        let sensors = lock.entities_with(&[ComponentKind::LaserSensor])?;
        for entity in &sensors {
            if let Some(sensor) = lock.get_mut::<LaserSensor>(*entity)? {
                sensor.illuminance = Vec3::ZERO;
            }
        }

        let emitters =
            lock.entities_with(&[ComponentKind::LaserEmitter, ComponentKind::TransformSnapshot])?;
        for emitter_entity in emitters {
            let Some(emitter) = lock.get::<LaserEmitter>(emitter_entity)?.cloned() else {
                continue;
            };
            let Some(snapshot) = lock.get::<TransformSnapshot>(emitter_entity)? else {
                continue;
            };
            let transform = snapshot.0;

            // An emitter with a laser_on signal obeys it; otherwise it is on
            let entity_ref = lock.refs().get_entity_by_id(emitter_entity);
            let enabled = match SignalKey::new(entity_ref, "laser_on") {
                Some(key) => {
                    let signal = lock.refs().get_signal(&key);
                    if signal.has_value(lock)? || signal.has_binding(lock)? {
                        signal.get_signal(lock, 0) >= 0.5
                    } else {
                        true
                    }
                }
                None => true,
            };

            let mut segments = Vec::new();
            if enabled {
                let forward = transform.transform_direction(Vec3::NEG_Z).normalize();
                let start = transform.position + forward * emitter.start_distance;
                let color = emitter.color * emitter.intensity;
                self.trace_laser(lock, emitter_entity, start, forward, color, &mut segments)?;
            }

            if let Some(line) = lock.get_mut::<LaserLine>(emitter_entity)? {
                line.segments = segments;
            }
        }

        // Publish sensor readings as signals
        for entity in sensors {
            let Some(sensor) = lock.get::<LaserSensor>(entity)?.cloned() else {
                continue;
            };
            let entity_ref = lock.refs().get_entity_by_id(entity);
            if !entity_ref.is_valid() {
                continue;
            }
            let triggered = sensor.illuminance.x >= sensor.threshold.x
                && sensor.illuminance.y >= sensor.threshold.y
                && sensor.illuminance.z >= sensor.threshold.z;
            let outputs = [
                ("value", if triggered { 1.0 } else { 0.0 }),
                ("light_value_r", sensor.illuminance.x as f64),
                ("light_value_g", sensor.illuminance.y as f64),
                ("light_value_b", sensor.illuminance.z as f64),
            ];
            for (name, value) in outputs {
                if let Some(key) = SignalKey::new(entity_ref.clone(), name) {
                    lock.refs().get_signal(&key).set_value(lock, value)?;
                }
            }
        }
        Ok(())
    }

    /// Cast-and-reflect until the bounce budget or intensity floor.
    /// Splitters push a transmitted ray onto the work stack.
    fn trace_laser(
        &mut self,
        lock: &mut Lock,
        emitter_entity: Entity,
        start: Vec3,
        direction: Vec3,
        color: Vec3,
        segments: &mut Vec<LaserSegment>,
    ) -> Result<(), EcsError> {
        // Lasers interact with the world, not with players or UI
        let mask = PhysicsGroup::World.bit()
            | PhysicsGroup::Interactive.bit()
            | PhysicsGroup::HeldObject.bit();
        let filter = QueryFilter::default().groups(InteractionGroups::new(
            Group::all(),
            Group::from_bits_truncate(mask),
        ));

        let mut stack = vec![(start, direction, color, 0usize)];
        while let Some((start, direction, color, bounces)) = stack.pop() {
            if segments.len() >= MAX_LASER_SEGMENTS {
                break;
            }
            if bounces > MAX_LASER_BOUNCES || color.max_element() < MIN_INTENSITY {
                continue;
            }
            let ray = Ray::new(
                crate::convert::to_na_point(start),
                crate::convert::to_na_vec(direction),
            );
            let Some((handle, hit)) = self.scene.query_pipeline.cast_ray_and_get_normal(
                &self.scene.bodies,
                &self.scene.colliders,
                &ray,
                MAX_LASER_RANGE,
                true,
                filter,
            ) else {
                segments.push(LaserSegment {
                    start,
                    end: start + direction * MAX_LASER_RANGE,
                    color,
                });
                continue;
            };

            let hit_point = start + direction * hit.time_of_impact;
            segments.push(LaserSegment {
                start,
                end: hit_point,
                color,
            });

            let hit_entity = self
                .scene
                .colliders
                .get(handle)
                .map(|collider| unpack_shape_user_data(collider.user_data).0)
                .unwrap_or(Entity::NULL);
            if hit_entity.is_null() || hit_entity == emitter_entity {
                continue;
            }

            if let Some(sensor) = lock.get_mut::<LaserSensor>(hit_entity)? {
                sensor.illuminance += color;
            }

            let Some(optic) = lock.get::<OpticalElement>(hit_entity)?.cloned() else {
                continue;
            };
            let normal = crate::convert::from_na_vec(hit.normal).normalize_or_zero();
            if normal == Vec3::ZERO {
                continue;
            }

            let reflected_color = color * optic.reflect_tint;
            if reflected_color.max_element() >= MIN_INTENSITY {
                let reflected_dir = direction - 2.0 * direction.dot(normal) * normal;
                stack.push((
                    hit_point + reflected_dir * SURFACE_EPSILON,
                    reflected_dir,
                    reflected_color,
                    bounces + 1,
                ));
            }
            let passed_color = color * optic.pass_tint;
            if passed_color.max_element() >= MIN_INTENSITY {
                stack.push((
                    hit_point + direction * SURFACE_EPSILON,
                    direction,
                    passed_color,
                    bounces + 1,
                ));
            }
        }
        Ok(())
    }
}
