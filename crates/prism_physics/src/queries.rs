// queries.rs - Pending physics query resolution
//
// PhysicsQuery components hold raycast/sweep/overlap requests positioned at
// the owning entity's snapshot. Results are written back in place each
// frame, resolved against the backend's query pipeline.

use crate::backend::unpack_shape_user_data;
use crate::manager::PhysicsManager;
use prism_core::ecs::components::{
    PhysicsQuery, PhysicsQueryEntry, PhysicsShapeKind, RaycastResult, TransformSnapshot,
};
use prism_core::ecs::{ComponentKind, EcsError, Lock};
use rapier3d::parry::query::details::ShapeCastOptions;
use rapier3d::prelude::*;

impl PhysicsManager {
    pub(crate) fn queries_frame(&mut self, lock: &mut Lock) -> Result<(), EcsError> {
        self.scene.update_queries();

        for entity in
            lock.entities_with(&[ComponentKind::PhysicsQuery, ComponentKind::TransformSnapshot])?
        {
            let Some(snapshot) = lock.get::<TransformSnapshot>(entity)? else {
                continue;
            };
            let origin_transform = snapshot.0;
            let Some(mut query) = lock.get::<PhysicsQuery>(entity)?.cloned() else {
                continue;
            };
            let exclude_body = self.actors.get(&entity).map(|actor| actor.body);

            for entry in &mut query.queries {
                let filter_for = |mask: u32| {
                    let mut filter = QueryFilter::default().groups(InteractionGroups::new(
                        Group::all(),
                        Group::from_bits_truncate(mask),
                    ));
                    if let Some(body) = exclude_body {
                        filter = filter.exclude_rigid_body(body);
                    }
                    filter
                };
                match entry {
                    PhysicsQueryEntry::Raycast {
                        direction,
                        max_distance,
                        filter_mask,
                        result,
                    } => {
                        *result = None;
                        let world_dir = origin_transform.transform_direction(*direction);
                        if world_dir.length_squared() < 1e-12 {
                            continue;
                        }
                        let world_dir = world_dir.normalize();
                        let ray = Ray::new(
                            crate::convert::to_na_point(origin_transform.position),
                            crate::convert::to_na_vec(world_dir),
                        );
                        if let Some((handle, hit)) = self.scene.query_pipeline.cast_ray_and_get_normal(
                            &self.scene.bodies,
                            &self.scene.colliders,
                            &ray,
                            *max_distance,
                            true,
                            filter_for(*filter_mask),
                        ) {
                            let target = self.collider_owner(lock, handle);
                            *result = Some(RaycastResult {
                                target,
                                position: origin_transform.position
                                    + world_dir * hit.time_of_impact,
                                distance: hit.time_of_impact,
                            });
                        }
                    }
                    PhysicsQueryEntry::Sweep {
                        shape,
                        direction,
                        max_distance,
                        filter_mask,
                        result,
                    } => {
                        *result = None;
                        let world_dir = origin_transform.transform_direction(*direction);
                        if world_dir.length_squared() < 1e-12 {
                            continue;
                        }
                        let world_dir = world_dir.normalize();
                        let Some(backend_shape) =
                            query_shape(&shape.shape, origin_transform.scale)
                        else {
                            tracing::warn!(entity = %entity, "unsupported sweep shape");
                            continue;
                        };
                        let pose = crate::convert::to_isometry(&(origin_transform
                            * shape.transform));
                        let options = ShapeCastOptions {
                            max_time_of_impact: *max_distance,
                            target_distance: 0.0,
                            stop_at_penetration: true,
                            compute_impact_geometry_on_penetration: false,
                        };
                        if let Some((handle, hit)) = self.scene.query_pipeline.cast_shape(
                            &self.scene.bodies,
                            &self.scene.colliders,
                            &pose,
                            &crate::convert::to_na_vec(world_dir),
                            &*backend_shape,
                            options,
                            filter_for(*filter_mask),
                        ) {
                            let target = self.collider_owner(lock, handle);
                            *result = Some(RaycastResult {
                                target,
                                position: origin_transform.position
                                    + world_dir * hit.time_of_impact,
                                distance: hit.time_of_impact,
                            });
                        }
                    }
                    PhysicsQueryEntry::Overlap {
                        shape,
                        filter_mask,
                        result,
                    } => {
                        result.clear();
                        let Some(backend_shape) =
                            query_shape(&shape.shape, origin_transform.scale)
                        else {
                            tracing::warn!(entity = %entity, "unsupported overlap shape");
                            continue;
                        };
                        let pose = crate::convert::to_isometry(&(origin_transform
                            * shape.transform));
                        let mut hits = Vec::new();
                        self.scene.query_pipeline.intersections_with_shape(
                            &self.scene.bodies,
                            &self.scene.colliders,
                            &pose,
                            &*backend_shape,
                            filter_for(*filter_mask),
                            |handle| {
                                hits.push(handle);
                                true
                            },
                        );
                        for handle in hits {
                            let target = self.collider_owner(lock, handle);
                            if target.is_valid() && !result.contains(&target) {
                                result.push(target);
                            }
                        }
                    }
                }
            }

            if let Some(stored) = lock.get_mut::<PhysicsQuery>(entity)? {
                *stored = query;
            }
        }
        Ok(())
    }

    fn collider_owner(
        &self,
        lock: &Lock,
        handle: ColliderHandle,
    ) -> prism_core::refs::EntityRef {
        let Some(collider) = self.scene.colliders.get(handle) else {
            return Default::default();
        };
        let (entity, _) = unpack_shape_user_data(collider.user_data);
        lock.refs().get_entity_by_id(entity)
    }
}

/// Backend shape for query volumes (primitives only).
fn query_shape(kind: &PhysicsShapeKind, scale: glam::Vec3) -> Option<SharedShape> {
    match kind {
        PhysicsShapeKind::ConvexMesh { .. } | PhysicsShapeKind::Plane => None,
        other => crate::manager::primitive_shape(other, scale),
    }
}
