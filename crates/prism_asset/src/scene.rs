// scene.rs - Scene loading, staging flattening, and the physics preload gate
//
// Scenes load into the staging instance. The live world is produced by
// flattening: each staged entity is applied onto the live entity with the
// same name, component by component, earlier (higher priority) stagings
// winning. Scenes carrying physics stay in the preload queue until the
// physics thread confirms their hull sets resolved.

use crate::{Assets, AssetError};
use parking_lot::Mutex;
use prism_core::ecs::components::{
    ops_by_name, ComponentKind, SceneInfo, COMPONENT_OPS,
};
use prism_core::ecs::{Ecs, Entity, InstanceKind, Lock, Permissions};
use prism_core::refs::Name;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Deserialize)]
struct SceneFile {
    #[serde(default)]
    entities: Vec<SceneEntityDef>,
}

#[derive(Deserialize)]
struct SceneEntityDef {
    #[serde(default)]
    name: Option<String>,
    #[serde(flatten)]
    components: serde_json::Map<String, serde_json::Value>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SceneStatus {
    /// Staged, waiting for physics assets before entering the live world.
    Loading,
    /// Flattened into the live instance.
    Active,
}

struct SceneState {
    status: SceneStatus,
    staging_entities: Vec<Entity>,
    live_entities: Vec<Entity>,
}

/// Tracks loaded scenes and drives staging -> live flattening.
#[derive(Default)]
pub struct SceneManager {
    states: Mutex<HashMap<String, SceneState>>,
}

impl SceneManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a scene file and populate the staging instance.
    pub fn load_scene(
        &self,
        ecs: &Ecs,
        assets: &Arc<Assets>,
        scene_name: &str,
    ) -> Result<(), AssetError> {
        let path = format!("scenes/{scene_name}.json");
        let asset = assets.read(&path)?;
        let file: SceneFile = serde_json::from_slice(&asset.bytes).map_err(|err| {
            AssetError::Parse {
                path,
                message: err.to_string(),
            }
        })?;

        let scope = Name::new(scene_name, "");
        let mut staging_entities = Vec::new();
        let mut lock = ecs.start_transaction(InstanceKind::Staging, Permissions::add_remove())?;
        for (index, def) in file.entities.iter().enumerate() {
            let local = def
                .name
                .clone()
                .unwrap_or_else(|| format!("entity{index}"));
            let Some(name) = Name::parse(&local, &scope) else {
                tracing::error!(scene = scene_name, name = %local, "invalid entity name, skipping");
                continue;
            };
            let entity = lock.new_entity()?;
            if let Err(err) = lock.set_name(entity, name.clone()) {
                tracing::error!(scene = scene_name, name = %name, error = %err, "failed to name entity");
                lock.destroy(entity)?;
                continue;
            }
            lock.set(entity, SceneInfo::for_scene(scene_name))?;

            for (component_name, blob) in &def.components {
                if component_name == "name" {
                    continue;
                }
                let Some(ops) = ops_by_name(component_name) else {
                    tracing::warn!(
                        scene = scene_name,
                        entity = %name,
                        component = %component_name,
                        "unknown component in scene file"
                    );
                    continue;
                };
                if let Err(err) = (ops.load_json)(&mut lock, entity, blob, &scope) {
                    tracing::error!(
                        scene = scene_name,
                        entity = %name,
                        component = %component_name,
                        error = %err,
                        "failed to load component, entity continues without it"
                    );
                }
            }
            staging_entities.push(entity);
        }
        drop(lock);

        tracing::info!(scene = scene_name, entities = staging_entities.len(), "scene staged");
        self.states.lock().insert(
            scene_name.to_string(),
            SceneState {
                status: SceneStatus::Loading,
                staging_entities,
                live_entities: Vec::new(),
            },
        );
        Ok(())
    }

    pub fn status(&self, scene_name: &str) -> Option<SceneStatus> {
        self.states.lock().get(scene_name).map(|s| s.status)
    }

    /// Scenes still gated on physics preload, with their staged entities.
    pub fn pending_scenes(&self) -> Vec<(String, Vec<Entity>)> {
        self.states
            .lock()
            .iter()
            .filter(|(_, state)| state.status == SceneStatus::Loading)
            .map(|(name, state)| (name.clone(), state.staging_entities.clone()))
            .collect()
    }

    /// Run the physics preload gate: `scene_ready` inspects a scene's
    /// staged entities under a staging read lock, and scenes it accepts are
    /// flattened into the live world.
    pub fn preload_scene_physics<F>(&self, ecs: &Ecs, mut scene_ready: F) -> Result<(), AssetError>
    where
        F: FnMut(&Lock, &[Entity]) -> bool,
    {
        for (scene_name, staging_entities) in self.pending_scenes() {
            let complete = {
                let lock = ecs.start_transaction(InstanceKind::Staging, Permissions::read_all())?;
                scene_ready(&lock, &staging_entities)
            };
            if complete {
                self.activate(ecs, &scene_name)?;
            }
        }
        Ok(())
    }

    /// Flatten a staged scene into the live instance.
    pub fn activate(&self, ecs: &Ecs, scene_name: &str) -> Result<(), AssetError> {
        let staging_entities = {
            let states = self.states.lock();
            let Some(state) = states.get(scene_name) else {
                return Ok(());
            };
            state.staging_entities.clone()
        };

        let mut live_entities = Vec::new();
        {
            let mut staging =
                ecs.start_transaction(InstanceKind::Staging, Permissions::add_remove())?;
            let mut live = ecs.start_transaction(InstanceKind::Live, Permissions::add_remove())?;

            for staging_entity in &staging_entities {
                let Some(name) = staging.get::<Name>(*staging_entity)?.cloned() else {
                    continue;
                };

                let live_entity = match live.entity_by_name(&name)? {
                    Some(existing) => {
                        // Append to the override chain, lowest priority last
                        let mut tail = live
                            .get::<SceneInfo>(existing)?
                            .map(|info| info.root_staging)
                            .unwrap_or(Entity::NULL);
                        if tail.is_null() {
                            if let Some(info) = live.get_mut::<SceneInfo>(existing)? {
                                info.root_staging = *staging_entity;
                            }
                        } else {
                            loop {
                                let next = staging
                                    .get::<SceneInfo>(tail)?
                                    .map(|info| info.next_staging)
                                    .unwrap_or(Entity::NULL);
                                if next.is_null() {
                                    break;
                                }
                                tail = next;
                            }
                            if let Some(info) = staging.get_mut::<SceneInfo>(tail)? {
                                info.next_staging = *staging_entity;
                            }
                        }
                        existing
                    }
                    None => {
                        let entity = live.new_entity()?;
                        live.set_name(entity, name.clone())?;
                        let mut info = SceneInfo::for_scene(scene_name);
                        info.root_staging = *staging_entity;
                        live.set(entity, info)?;
                        live_entities.push(entity);
                        entity
                    }
                };

                for ops in COMPONENT_OPS.iter() {
                    if ops.kind == ComponentKind::SceneInfo {
                        continue;
                    }
                    if let Err(err) = (ops.apply)(&staging, *staging_entity, &mut live, live_entity)
                    {
                        tracing::error!(
                            scene = scene_name,
                            entity = %name,
                            component = ops.name,
                            error = %err,
                            "failed to apply staged component"
                        );
                    }
                }
            }
        }

        let mut states = self.states.lock();
        if let Some(state) = states.get_mut(scene_name) {
            state.status = SceneStatus::Active;
            state.live_entities.extend(live_entities);
        }
        tracing::info!(scene = scene_name, "scene flattened into live world");
        Ok(())
    }

    /// Destroy a scene's entities in both instances and forget it.
    pub fn unload_scene(&self, ecs: &Ecs, scene_name: &str) -> Result<(), AssetError> {
        let Some(state) = self.states.lock().remove(scene_name) else {
            return Ok(());
        };
        {
            let mut staging =
                ecs.start_transaction(InstanceKind::Staging, Permissions::add_remove())?;
            for entity in state.staging_entities {
                if staging.is_valid(entity) {
                    staging.destroy(entity)?;
                }
            }
        }
        {
            let mut live = ecs.start_transaction(InstanceKind::Live, Permissions::add_remove())?;
            for entity in state.live_entities {
                if live.is_valid(entity) {
                    live.destroy(entity)?;
                }
            }
        }
        tracing::info!(scene = scene_name, "scene unloaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_core::ecs::components::{Physics, TransformTree};
    use prism_core::refs::SignalKey;

    fn write_scene(dir: &std::path::Path, name: &str, json: &str) {
        let scenes = dir.join("scenes");
        std::fs::create_dir_all(&scenes).unwrap();
        std::fs::write(scenes.join(format!("{name}.json")), json).unwrap();
    }

    #[test]
    fn scene_loads_stages_and_flattens() {
        let dir = tempfile::tempdir().unwrap();
        write_scene(
            dir.path(),
            "hall",
            r#"{
                "entities": [
                    {
                        "name": "door",
                        "transform": {"pose": {"position": [1.0, 2.0, 3.0]}},
                        "physics": {"type": "dynamic", "shapes": [{"shape": {"box": {"extents": [1, 1, 1]}}}]},
                        "signal_output": {"open": 1.0},
                        "signal_bindings": {"locked": "door/open == 0"}
                    },
                    {
                        "name": "lamp",
                        "bogus_component": {}
                    }
                ]
            }"#,
        );
        let assets = Arc::new(Assets::new(dir.path()));
        let ecs = Ecs::new();
        let scenes = SceneManager::new();

        scenes.load_scene(&ecs, &assets, "hall").unwrap();
        assert_eq!(scenes.status("hall"), Some(SceneStatus::Loading));

        // Staging holds the parsed entities
        {
            let lock = ecs
                .start_transaction(InstanceKind::Staging, Permissions::read_all())
                .unwrap();
            let door = lock
                .entity_by_name(&Name::new("hall", "door"))
                .unwrap()
                .unwrap();
            let tree = lock.get::<TransformTree>(door).unwrap().unwrap();
            assert_eq!(tree.pose.position, glam::Vec3::new(1.0, 2.0, 3.0));
            assert!(lock.has::<Physics>(door));
            assert!(lock
                .entity_by_name(&Name::new("hall", "lamp"))
                .unwrap()
                .is_some());
        }

        // The preload gate admits the scene and flattening populates live
        scenes
            .preload_scene_physics(&ecs, |_lock, entities| {
                assert_eq!(entities.len(), 2);
                true
            })
            .unwrap();
        assert_eq!(scenes.status("hall"), Some(SceneStatus::Active));

        let lock = ecs
            .start_transaction(InstanceKind::Live, Permissions::read_all())
            .unwrap();
        let door = lock
            .entity_by_name(&Name::new("hall", "door"))
            .unwrap()
            .unwrap();
        assert!(lock.has::<Physics>(door));

        // Staged signals landed in the live arena
        let door_ref = ecs.refs().get_entity(&Name::new("hall", "door"));
        let open = ecs
            .refs()
            .get_signal(&SignalKey::new(door_ref.clone(), "open").unwrap());
        assert_eq!(open.get_signal(&lock, 0), 1.0);
        let locked = ecs
            .refs()
            .get_signal(&SignalKey::new(door_ref, "locked").unwrap());
        assert!(locked.has_binding(&lock).unwrap());
        assert_eq!(locked.get_signal(&lock, 0), 0.0);
    }

    #[test]
    fn earlier_stagings_win_on_flatten() {
        let dir = tempfile::tempdir().unwrap();
        write_scene(
            dir.path(),
            "base",
            r#"{"entities": [{"name": "shared:marker", "transform": {"pose": {"position": [5.0, 0.0, 0.0]}}}]}"#,
        );
        write_scene(
            dir.path(),
            "patch",
            r#"{"entities": [{"name": "shared:marker", "transform": {"pose": {"position": [9.0, 0.0, 0.0]}}, "signal_output": {"extra": 2.0}}]}"#,
        );
        let assets = Arc::new(Assets::new(dir.path()));
        let ecs = Ecs::new();
        let scenes = SceneManager::new();

        scenes.load_scene(&ecs, &assets, "base").unwrap();
        scenes.load_scene(&ecs, &assets, "patch").unwrap();
        scenes.activate(&ecs, "base").unwrap();
        scenes.activate(&ecs, "patch").unwrap();

        let lock = ecs
            .start_transaction(InstanceKind::Live, Permissions::read_all())
            .unwrap();
        let marker = lock
            .entity_by_name(&Name::new("shared", "marker"))
            .unwrap()
            .unwrap();
        // First staging keeps the transform; the patch contributes only
        // what the base did not define
        let tree = lock.get::<TransformTree>(marker).unwrap().unwrap();
        assert_eq!(tree.pose.position.x, 5.0);

        let marker_ref = ecs.refs().get_entity(&Name::new("shared", "marker"));
        let extra = ecs
            .refs()
            .get_signal(&SignalKey::new(marker_ref, "extra").unwrap());
        assert_eq!(extra.get_signal(&lock, 0), 2.0);

        // The live entity records the staging override chain
        let info = lock.get::<SceneInfo>(marker).unwrap().unwrap();
        assert!(info.root_staging.exists());
    }

    #[test]
    fn unload_destroys_both_instances() {
        let dir = tempfile::tempdir().unwrap();
        write_scene(
            dir.path(),
            "temp",
            r#"{"entities": [{"name": "thing", "signal_output": {"v": 3.0}}]}"#,
        );
        let assets = Arc::new(Assets::new(dir.path()));
        let ecs = Ecs::new();
        let scenes = SceneManager::new();
        scenes.load_scene(&ecs, &assets, "temp").unwrap();
        scenes.activate(&ecs, "temp").unwrap();

        scenes.unload_scene(&ecs, "temp").unwrap();
        assert_eq!(scenes.status("temp"), None);

        let lock = ecs
            .start_transaction(InstanceKind::Live, Permissions::read_all())
            .unwrap();
        assert!(lock
            .entity_by_name(&Name::new("temp", "thing"))
            .unwrap()
            .is_none());
        assert_eq!(lock.signals().unwrap().len(), 0);
    }
}
