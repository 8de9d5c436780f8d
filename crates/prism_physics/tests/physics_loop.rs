// End-to-end physics loop behavior against a live ECS world.

use glam::Vec3;
use prism_asset::{Assets, SceneManager};
use prism_core::ecs::components::{
    Animation, AnimationState, InterpolationMode, Physics, PhysicsActorType, PhysicsShape,
    PhysicsShapeKind, TransformSnapshot, TransformTree, TriggerArea, TriggerGroup,
};
use prism_core::ecs::{ComponentKind, Ecs, Entity, InstanceKind, Permissions};
use prism_core::events::InputEventQueue;
use prism_core::math::Transform;
use prism_core::refs::{EntityRef, Name, SignalKey};
use prism_core::script::ScriptManager;
use prism_physics::PhysicsManager;
use std::sync::Arc;

struct TestWorld {
    ecs: Arc<Ecs>,
    manager: PhysicsManager,
    _dir: tempfile::TempDir,
}

fn test_world() -> TestWorld {
    let dir = tempfile::tempdir().unwrap();
    let ecs = Arc::new(Ecs::new());
    let assets = Arc::new(Assets::new(dir.path()));
    let scenes = Arc::new(SceneManager::new());
    let scripts = Arc::new(ScriptManager::new());
    let input = Arc::new(InputEventQueue::new());
    let manager = PhysicsManager::new(
        ecs.clone(),
        assets,
        scenes,
        scripts,
        input,
    )
    .unwrap();
    TestWorld {
        ecs,
        manager,
        _dir: dir,
    }
}

fn box_shape() -> PhysicsShape {
    PhysicsShape::new(PhysicsShapeKind::Box {
        extents: Vec3::ONE,
    })
}

fn spawn_physics_entity(
    ecs: &Ecs,
    name: &str,
    actor_type: PhysicsActorType,
    pose: Transform,
) -> Entity {
    let mut lock = ecs
        .start_transaction(InstanceKind::Live, Permissions::add_remove())
        .unwrap();
    let entity = lock.new_entity().unwrap();
    lock.set_name(entity, Name::new("test", name)).unwrap();
    lock.set(entity, TransformTree::new(pose)).unwrap();
    lock.set(entity, TransformSnapshot(pose)).unwrap();
    lock.set(entity, Physics::new(vec![box_shape()], actor_type))
        .unwrap();
    entity
}

fn entity_ref(ecs: &Ecs, name: &str) -> EntityRef {
    ecs.refs().get_entity(&Name::new("test", name))
}

#[test]
fn kinematic_actor_follows_pose() {
    let mut world = test_world();
    let entity = spawn_physics_entity(
        &world.ecs,
        "mover",
        PhysicsActorType::Kinematic,
        Transform::IDENTITY,
    );

    world.manager.run_frame();
    assert!(world.manager.has_actor(entity));
    let pose = world.manager.actor_pose(entity).unwrap();
    assert!(pose.position.abs_diff_eq(Vec3::ZERO, 1e-5));

    // Move the entity from a script's point of view
    {
        let mut lock = world
            .ecs
            .start_transaction(
                InstanceKind::Live,
                Permissions::new().write::<TransformTree>(),
            )
            .unwrap();
        let tree = lock.get_mut::<TransformTree>(entity).unwrap().unwrap();
        tree.pose.position = Vec3::new(1.0, 0.0, 0.0);
    }

    world.manager.run_frame();
    let pose = world.manager.actor_pose(entity).unwrap();
    assert!(
        pose.position.abs_diff_eq(Vec3::new(1.0, 0.0, 0.0), 1e-4),
        "actor did not follow kinematic target: {:?}",
        pose.position
    );

    let lock = world
        .ecs
        .start_transaction(InstanceKind::Live, Permissions::read_all())
        .unwrap();
    let snapshot = lock.get::<TransformSnapshot>(entity).unwrap().unwrap();
    assert!(snapshot
        .0
        .position
        .abs_diff_eq(Vec3::new(1.0, 0.0, 0.0), 1e-5));
}

#[test]
fn reconcile_is_idempotent_without_changes() {
    let mut world = test_world();
    spawn_physics_entity(
        &world.ecs,
        "static_box",
        PhysicsActorType::Static,
        Transform::from_position(Vec3::new(0.0, 1.0, 0.0)),
    );
    spawn_physics_entity(
        &world.ecs,
        "dyn_box",
        PhysicsActorType::Kinematic,
        Transform::from_position(Vec3::new(3.0, 1.0, 0.0)),
    );

    world.manager.run_frame();
    assert!(world.manager.backend_mutations_last_frame() > 0);

    // No ECS changes: two further reconciles produce zero backend mutations
    world.manager.run_frame();
    assert_eq!(world.manager.backend_mutations_last_frame(), 0);
    world.manager.run_frame();
    assert_eq!(world.manager.backend_mutations_last_frame(), 0);
}

#[test]
fn actor_accounting_matches_entities() {
    let mut world = test_world();
    let a = spawn_physics_entity(
        &world.ecs,
        "a",
        PhysicsActorType::Static,
        Transform::IDENTITY,
    );
    spawn_physics_entity(
        &world.ecs,
        "b",
        PhysicsActorType::Dynamic,
        Transform::from_position(Vec3::new(5.0, 0.0, 0.0)),
    );

    // A sub-actor child attaches its shapes to its parent's actor
    {
        let mut lock = world
            .ecs
            .start_transaction(InstanceKind::Live, Permissions::add_remove())
            .unwrap();
        let child = lock.new_entity().unwrap();
        lock.set_name(child, Name::new("test", "a_child")).unwrap();
        lock.set(
            child,
            TransformTree::with_parent(
                Transform::from_position(Vec3::new(0.0, 2.0, 0.0)),
                entity_ref(&world.ecs, "a"),
            ),
        )
        .unwrap();
        lock.set(child, TransformSnapshot::default()).unwrap();
        let mut physics = Physics::new(vec![box_shape()], PhysicsActorType::SubActor);
        physics.parent_actor = entity_ref(&world.ecs, "a");
        lock.set(child, physics).unwrap();
    }

    world.manager.run_frame();
    world.manager.run_frame();

    // Two non-SubActor physics entities -> two actors
    assert_eq!(world.manager.actor_count(), 2);
    assert!(world.manager.validate_shape_accounting());
    // Parent actor carries its own shape plus the sub-actor's
    assert_eq!(world.manager.actor_collider_count(a), 2);

    // Removing the Physics component destroys the actor next frame
    {
        let mut lock = world
            .ecs
            .start_transaction(InstanceKind::Live, Permissions::add_remove())
            .unwrap();
        lock.unset::<Physics>(a).unwrap();
    }
    world.manager.run_frame();
    assert_eq!(world.manager.actor_count(), 1);
    assert!(!world.manager.has_actor(a));
}

#[test]
fn dynamic_actor_falls_under_gravity() {
    let mut world = test_world();
    let entity = spawn_physics_entity(
        &world.ecs,
        "faller",
        PhysicsActorType::Dynamic,
        Transform::from_position(Vec3::new(0.0, 10.0, 0.0)),
    );

    for _ in 0..30 {
        world.manager.run_frame();
    }

    let pose = world.manager.actor_pose(entity).unwrap();
    assert!(pose.position.y < 10.0, "body did not fall: {:?}", pose.position);

    // The snapshot write-back mirrors the backend pose
    let lock = world
        .ecs
        .start_transaction(InstanceKind::Live, Permissions::read_all())
        .unwrap();
    let snapshot = lock.get::<TransformSnapshot>(entity).unwrap().unwrap();
    assert!((snapshot.0.position.y - pose.position.y).abs() < 0.5);
}

#[test]
fn trigger_area_emits_enter_and_leave() {
    let mut world = test_world();

    let (area, visitor) = {
        let mut lock = world
            .ecs
            .start_transaction(InstanceKind::Live, Permissions::add_remove())
            .unwrap();
        let area = lock.new_entity().unwrap();
        lock.set_name(area, Name::new("test", "area")).unwrap();
        let area_pose = Transform {
            scale: Vec3::splat(4.0),
            ..Transform::IDENTITY
        };
        lock.set(area, TransformTree::new(area_pose)).unwrap();
        lock.set(area, TransformSnapshot(area_pose)).unwrap();
        lock.set(area, TriggerArea::default()).unwrap();
        lock.set(area, prism_core::events::EventInput::default())
            .unwrap();

        let visitor = lock.new_entity().unwrap();
        lock.set_name(visitor, Name::new("test", "visitor")).unwrap();
        let far = Transform::from_position(Vec3::new(100.0, 0.0, 0.0));
        lock.set(visitor, TransformTree::new(far)).unwrap();
        lock.set(visitor, TransformSnapshot(far)).unwrap();
        lock.set(visitor, TriggerGroup::Player).unwrap();
        (area, visitor)
    };

    world.manager.run_frame();

    // Move the visitor inside the area
    {
        let mut lock = world
            .ecs
            .start_transaction(
                InstanceKind::Live,
                Permissions::new().write::<TransformTree>(),
            )
            .unwrap();
        let tree = lock.get_mut::<TransformTree>(visitor).unwrap().unwrap();
        tree.pose.position = Vec3::ZERO;
    }
    world.manager.run_frame();

    {
        let mut lock = world
            .ecs
            .start_transaction(
                InstanceKind::Live,
                Permissions::new()
                    .write::<prism_core::events::EventInput>()
                    .read_kind(ComponentKind::TriggerArea),
            )
            .unwrap();
        let input = lock
            .get_mut::<prism_core::events::EventInput>(area)
            .unwrap()
            .unwrap();
        let event = input.poll("/trigger/player/enter").unwrap();
        assert_eq!(event.data, prism_core::events::EventData::Entity(visitor));
        assert!(input.poll("/trigger/player/enter").is_none());
    }

    // Move back out: a leave event fires
    {
        let mut lock = world
            .ecs
            .start_transaction(
                InstanceKind::Live,
                Permissions::new().write::<TransformTree>(),
            )
            .unwrap();
        let tree = lock.get_mut::<TransformTree>(visitor).unwrap().unwrap();
        tree.pose.position = Vec3::new(100.0, 0.0, 0.0);
    }
    world.manager.run_frame();

    let mut lock = world
        .ecs
        .start_transaction(
            InstanceKind::Live,
            Permissions::new()
                .write::<prism_core::events::EventInput>()
                .read_kind(ComponentKind::TriggerArea),
        )
        .unwrap();
    let input = lock
        .get_mut::<prism_core::events::EventInput>(area)
        .unwrap()
        .unwrap();
    assert!(input.poll("/trigger/player/leave").is_some());
}

#[test]
fn animation_interpolates_three_states() {
    let mut world = test_world();
    let entity = {
        let mut lock = world
            .ecs
            .start_transaction(InstanceKind::Live, Permissions::add_remove())
            .unwrap();
        let entity = lock.new_entity().unwrap();
        lock.set_name(entity, Name::new("test", "lift")).unwrap();
        lock.set(entity, TransformTree::default()).unwrap();
        lock.set(entity, TransformSnapshot::default()).unwrap();

        let mut animation = Animation {
            interpolation: InterpolationMode::Linear,
            ..Default::default()
        };
        for pos in [
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(0.0, 1.0, 0.0),
            Vec3::new(0.0, 0.0, 1.0),
        ] {
            animation.states.push(AnimationState {
                delay: 0.5,
                pos,
                ..Default::default()
            });
        }
        lock.set(entity, animation).unwrap();
        entity
    };

    // Target the final state
    {
        let mut lock = world
            .ecs
            .start_transaction(
                InstanceKind::Live,
                Permissions::new().write_kind(ComponentKind::Signals),
            )
            .unwrap();
        let target = world
            .ecs
            .refs()
            .get_signal(&SignalKey::new(entity_ref(&world.ecs, "lift"), "animation_target").unwrap());
        target.set_value(&mut lock, 2.0).unwrap();
    }

    let frames_per_quarter_second = (0.25 / world.manager.interval().as_secs_f64()).round() as usize;

    let position_at = |world: &TestWorld| -> Vec3 {
        let lock = world
            .ecs
            .start_transaction(InstanceKind::Live, Permissions::read_all())
            .unwrap();
        lock.get::<TransformTree>(entity).unwrap().unwrap().pose.position
    };

    for _ in 0..frames_per_quarter_second {
        world.manager.run_frame();
    }
    // 0.25s in: halfway to state 1
    assert!(
        position_at(&world).abs_diff_eq(Vec3::new(0.0, 0.5, 0.0), 1e-3),
        "at 0.25s: {:?}",
        position_at(&world)
    );

    for _ in 0..frames_per_quarter_second * 2 {
        world.manager.run_frame();
    }
    // 0.75s in: halfway between states 1 and 2
    assert!(
        position_at(&world).abs_diff_eq(Vec3::new(0.0, 0.5, 0.5), 1e-3),
        "at 0.75s: {:?}",
        position_at(&world)
    );

    for _ in 0..frames_per_quarter_second * 2 {
        world.manager.run_frame();
    }
    // Past 1.0s: settled on the final state
    assert!(
        position_at(&world).abs_diff_eq(Vec3::new(0.0, 0.0, 1.0), 1e-3),
        "at >= 1.0s: {:?}",
        position_at(&world)
    );
}

#[test]
fn scripts_run_each_frame() {
    let mut world = test_world();
    let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    {
        let mut lock = world
            .ecs
            .start_transaction(InstanceKind::Live, Permissions::add_remove())
            .unwrap();
        let entity = lock.new_entity().unwrap();
        lock.set_name(entity, Name::new("test", "scripted")).unwrap();
        lock.set(
            entity,
            prism_core::ecs::components::Scripts {
                on_physics_update: vec!["tick_counter".into()],
            },
        )
        .unwrap();
    }

    // Register through the manager's shared script registry
    let scripts = {
        let counter = counter.clone();
        let scripts = ScriptManager::new();
        scripts.register_physics_update("tick_counter", move |_lock, _entity, _dt| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        scripts
    };
    // Rebuild the world with the registered script manager
    let dir = tempfile::tempdir().unwrap();
    let assets = Arc::new(Assets::new(dir.path()));
    let mut manager = PhysicsManager::new(
        world.ecs.clone(),
        assets,
        Arc::new(SceneManager::new()),
        Arc::new(scripts),
        Arc::new(InputEventQueue::new()),
    )
    .unwrap();

    manager.run_frame();
    manager.run_frame();
    assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 2);
}

#[test]
fn laser_hits_sensor_and_sets_signals() {
    let mut world = test_world();

    // A wall with a sensor, 5m in front of the emitter
    let wall = spawn_physics_entity(
        &world.ecs,
        "wall",
        PhysicsActorType::Static,
        Transform::from_position(Vec3::new(0.0, 0.0, -5.0)),
    );
    {
        let mut lock = world
            .ecs
            .start_transaction(InstanceKind::Live, Permissions::add_remove())
            .unwrap();
        lock.set(wall, prism_core::ecs::components::LaserSensor::default())
            .unwrap();

        let emitter = lock.new_entity().unwrap();
        lock.set_name(emitter, Name::new("test", "emitter")).unwrap();
        lock.set(emitter, TransformTree::default()).unwrap();
        lock.set(emitter, TransformSnapshot::default()).unwrap();
        lock.set(
            emitter,
            prism_core::ecs::components::LaserEmitter {
                intensity: 1.0,
                color: Vec3::new(1.0, 0.0, 0.0),
                start_distance: 0.0,
            },
        )
        .unwrap();
        lock.set(
            emitter,
            prism_core::ecs::components::LaserLine::default(),
        )
        .unwrap();
    }

    world.manager.run_frame();

    let lock = world
        .ecs
        .start_transaction(InstanceKind::Live, Permissions::read_all())
        .unwrap();
    let emitter = lock
        .entity_by_name(&Name::new("test", "emitter"))
        .unwrap()
        .unwrap();
    let line = lock
        .get::<prism_core::ecs::components::LaserLine>(emitter)
        .unwrap()
        .unwrap();
    assert_eq!(line.segments.len(), 1);
    // The beam stops at the wall's near face (box half extent 0.5)
    assert!((line.segments[0].end.z - -4.5).abs() < 0.1);

    let sensor = lock
        .get::<prism_core::ecs::components::LaserSensor>(wall)
        .unwrap()
        .unwrap();
    assert!(sensor.illuminance.x > 0.9);

    // Sensor readings publish as signals
    let value = world.ecs.refs().get_signal(
        &SignalKey::new(entity_ref(&world.ecs, "wall"), "light_value_r").unwrap(),
    );
    assert!(value.get_signal(&lock, 0) > 0.9);
}

#[test]
fn raycast_query_reports_hit_entity() {
    let mut world = test_world();
    spawn_physics_entity(
        &world.ecs,
        "target",
        PhysicsActorType::Static,
        Transform::from_position(Vec3::new(0.0, 0.0, -3.0)),
    );
    let probe = {
        let mut lock = world
            .ecs
            .start_transaction(InstanceKind::Live, Permissions::add_remove())
            .unwrap();
        let probe = lock.new_entity().unwrap();
        lock.set_name(probe, Name::new("test", "probe")).unwrap();
        lock.set(probe, TransformTree::default()).unwrap();
        lock.set(probe, TransformSnapshot::default()).unwrap();
        lock.set(
            probe,
            prism_core::ecs::components::PhysicsQuery {
                queries: vec![prism_core::ecs::components::PhysicsQueryEntry::Raycast {
                    direction: Vec3::NEG_Z,
                    max_distance: 100.0,
                    filter_mask: u32::MAX,
                    result: None,
                }],
            },
        )
        .unwrap();
        probe
    };

    world.manager.run_frame();

    let lock = world
        .ecs
        .start_transaction(InstanceKind::Live, Permissions::read_all())
        .unwrap();
    let query = lock
        .get::<prism_core::ecs::components::PhysicsQuery>(probe)
        .unwrap()
        .unwrap();
    let prism_core::ecs::components::PhysicsQueryEntry::Raycast { result, .. } = &query.queries[0]
    else {
        panic!("query variant changed");
    };
    let hit = result.as_ref().expect("raycast should hit the target box");
    assert_eq!(hit.target, entity_ref(&world.ecs, "target"));
    assert!((hit.distance - 2.5).abs() < 0.1);
}
