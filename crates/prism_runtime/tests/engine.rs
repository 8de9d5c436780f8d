// Engine lifecycle: stage a scene, run the physics thread, shut down.

use prism_core::ecs::components::TransformSnapshot;
use prism_core::ecs::{InstanceKind, Permissions};
use prism_core::refs::Name;
use prism_runtime::Engine;
use std::time::Duration;

fn write_scene(dir: &std::path::Path, name: &str, json: &str) {
    let scenes = dir.join("scenes");
    std::fs::create_dir_all(&scenes).unwrap();
    std::fs::write(scenes.join(format!("{name}.json")), json).unwrap();
}

#[test]
fn engine_boots_scene_and_simulates() {
    let dir = tempfile::tempdir().unwrap();
    write_scene(
        dir.path(),
        "start",
        r#"{
            "entities": [
                {
                    "name": "floor",
                    "transform": {"pose": {"position": [0.0, 0.0, 0.0]}},
                    "transform_snapshot": {"position": [0.0, 0.0, 0.0]},
                    "physics": {"type": "static", "shapes": [{"shape": {"box": {"extents": [10, 1, 10]}}}]}
                },
                {
                    "name": "crate",
                    "transform": {"pose": {"position": [0.0, 5.0, 0.0]}},
                    "transform_snapshot": {"position": [0.0, 5.0, 0.0]},
                    "physics": {"type": "dynamic", "shapes": [{"shape": {"box": {"extents": [1, 1, 1]}}}]}
                }
            ]
        }"#,
    );

    let mut engine = Engine::new(dir.path());
    engine.load_scene("start").unwrap();
    engine.start(false).unwrap();
    assert!(engine.is_running());

    // The preload gate has no convex hulls to wait on, so the scene
    // flattens and the crate starts falling
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    let crate_name = Name::new("start", "crate");
    loop {
        std::thread::sleep(Duration::from_millis(50));
        let lock = engine
            .ecs()
            .start_transaction(InstanceKind::Live, Permissions::read_all())
            .unwrap();
        if let Some(entity) = lock.entity_by_name(&crate_name).unwrap() {
            if let Some(snapshot) = lock.get::<TransformSnapshot>(entity).unwrap() {
                if snapshot.0.position.y < 4.9 {
                    break;
                }
            }
        }
        assert!(
            std::time::Instant::now() < deadline,
            "crate never started falling"
        );
    }

    engine.stop();
    assert!(!engine.is_running());
}
