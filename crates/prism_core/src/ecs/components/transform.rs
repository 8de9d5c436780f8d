// transform.rs - Transform tree and flattened snapshots
//
// TransformTree is the authored pose plus an optional parent ref. The
// physics thread flattens trees into TransformSnapshot once per frame, so
// every other reader gets a consistent global pose without chasing parents.

use crate::ecs::lock::Lock;
use crate::ecs::Entity;
use crate::math::{Transform, MAX_TRANSFORM_DEPTH};
use crate::refs::{EntityRef, EntityScope, ReferenceManager};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformTree {
    #[serde(default)]
    pub pose: Transform,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<EntityRef>,
}

impl TransformTree {
    pub fn new(pose: Transform) -> Self {
        Self { pose, parent: None }
    }

    pub fn with_parent(pose: Transform, parent: EntityRef) -> Self {
        Self {
            pose,
            parent: Some(parent),
        }
    }

    pub(crate) fn set_scope(&mut self, scope: &EntityScope, refs: &ReferenceManager) {
        if let Some(parent) = self.parent.as_mut() {
            parent.set_scope(scope, refs);
        }
    }

    /// Flatten this pose through the parent chain.
    ///
    /// The walk stops at a missing parent or at the depth bound, so cyclic
    /// trees terminate with a partial (but finite) result.
    pub fn global_transform(&self, lock: &Lock) -> Transform {
        let mut result = self.pose;
        let mut parent = self.parent.clone();
        for _ in 0..MAX_TRANSFORM_DEPTH {
            let Some(parent_ref) = parent.take() else {
                break;
            };
            let parent_ent = parent_ref.get(lock.instance_kind());
            let Ok(Some(tree)) = lock.get::<TransformTree>(parent_ent) else {
                break;
            };
            result = tree.pose * result;
            parent = tree.parent.clone();
        }
        result
    }

    /// This entity's global pose expressed relative to `ancestor`'s global
    /// pose.
    pub fn relative_transform(&self, lock: &Lock, ancestor: Entity) -> Transform {
        let global = self.global_transform(lock);
        let Ok(Some(ancestor_tree)) = lock.get::<TransformTree>(ancestor) else {
            return global;
        };
        let ancestor_global = ancestor_tree.global_transform(lock);
        global.relative_to(&ancestor_global)
    }
}

/// The flattened global pose, recomputed by the physics thread each frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransformSnapshot(pub Transform);

impl TransformSnapshot {
    pub fn numeric_field(&self, field: &str) -> Option<f64> {
        match field {
            "position.x" => Some(self.0.position.x as f64),
            "position.y" => Some(self.0.position.y as f64),
            "position.z" => Some(self.0.position.z as f64),
            "scale.x" => Some(self.0.scale.x as f64),
            "scale.y" => Some(self.0.scale.y as f64),
            "scale.z" => Some(self.0.scale.z as f64),
            _ => None,
        }
    }
}
