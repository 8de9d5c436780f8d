// scene.rs - Scene bookkeeping components

use crate::ecs::Entity;
use glam::Vec3;
use serde::{Deserialize, Serialize};

/// Back-pointers from an entity to the scene machinery that produced it.
///
/// Live entities flattened from multiple stagings keep a linked list of the
/// overriding staging ids, highest priority first.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SceneInfo {
    /// Name of the owning scene.
    #[serde(default)]
    pub scene: String,

    /// Prefab script that expanded into this entity, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefab: Option<String>,

    /// Head of the staging override chain (live entities only).
    #[serde(default, skip)]
    pub root_staging: Entity,

    /// Next staging in the override chain (staging entities only).
    #[serde(default, skip)]
    pub next_staging: Entity,
}

impl SceneInfo {
    pub fn for_scene(scene: impl Into<String>) -> Self {
        Self {
            scene: scene.into(),
            ..Default::default()
        }
    }
}

/// Per-scene simulation properties, attached to the scene's root entity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SceneProperties {
    #[serde(default = "default_gravity")]
    pub gravity: Vec3,
}

fn default_gravity() -> Vec3 {
    Vec3::new(0.0, -9.81, 0.0)
}

impl Default for SceneProperties {
    fn default() -> Self {
        Self {
            gravity: default_gravity(),
        }
    }
}

impl SceneProperties {
    /// Gravity acceleration at a world position. Uniform today, but the
    /// lookup point keeps radial fields possible without touching callers.
    pub fn gravity_at(&self, _position: Vec3) -> Vec3 {
        self.gravity
    }
}

/// Script hooks attached to an entity, resolved by name in the script
/// registry at run time.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Scripts {
    #[serde(default)]
    pub on_physics_update: Vec<String>,
}
