// Transaction, permission, and observer behavior across the two instances.

use prism_core::ecs::components::{Physics, PhysicsActorType, TransformTree};
use prism_core::ecs::{
    ComponentEventType, ComponentKind, Ecs, EcsError, InstanceKind, Permissions,
};
use prism_core::math::Transform;
use prism_core::refs::Name;
use glam::Vec3;

fn write_all() -> Permissions {
    Permissions::add_remove()
}

#[test]
fn names_are_unique_per_instance() {
    let ecs = Ecs::new();
    let mut lock = ecs
        .start_transaction(InstanceKind::Staging, write_all())
        .unwrap();

    let a = lock.new_entity().unwrap();
    let b = lock.new_entity().unwrap();
    let name = Name::new("scene", "door");

    lock.set_name(a, name.clone()).unwrap();
    match lock.set_name(b, name.clone()) {
        Err(EcsError::DuplicateName(dup)) => assert_eq!(dup, name),
        other => panic!("expected DuplicateName, got {other:?}"),
    }

    // The same name can exist in the live instance
    drop(lock);
    let mut live = ecs
        .start_transaction(InstanceKind::Live, write_all())
        .unwrap();
    let c = live.new_entity().unwrap();
    live.set_name(c, name.clone()).unwrap();
    assert_eq!(live.entity_by_name(&name).unwrap(), Some(c));

    // Ref consistency: reverse lookup matches the forward ref
    let entity_ref = ecs.refs().get_entity(&name);
    assert_eq!(entity_ref.get_live(), c);
    assert_eq!(ecs.refs().get_entity_by_id(c), entity_ref);
}

#[test]
fn component_access_respects_permissions() {
    let ecs = Ecs::new();
    let entity = {
        let mut lock = ecs
            .start_transaction(InstanceKind::Live, write_all())
            .unwrap();
        let e = lock.new_entity().unwrap();
        lock.set(e, TransformTree::new(Transform::IDENTITY)).unwrap();
        e
    };

    // Read without the declared kind fails; existence checks do not
    let lock = ecs
        .start_transaction(InstanceKind::Live, Permissions::new().read::<Physics>())
        .unwrap();
    assert!(lock.has_kind(entity, ComponentKind::TransformTree));
    match lock.get::<TransformTree>(entity) {
        Err(EcsError::AccessDenied { kind, write }) => {
            assert_eq!(kind, ComponentKind::TransformTree);
            assert!(!write);
        }
        other => panic!("expected AccessDenied, got {other:?}"),
    }
    match lock.entities_with(&[ComponentKind::TransformTree]) {
        Err(EcsError::AccessDenied { .. }) => {}
        other => panic!("expected AccessDenied, got {other:?}"),
    }
    drop(lock);

    // Writing a declared-read-only component fails
    let mut lock = ecs
        .start_transaction(
            InstanceKind::Live,
            Permissions::new().read::<TransformTree>(),
        )
        .unwrap();
    match lock.get_mut::<TransformTree>(entity) {
        Err(EcsError::AccessDenied { write, .. }) => assert!(write),
        other => panic!("expected AccessDenied, got {other:?}"),
    }
}

#[test]
fn adding_components_requires_add_remove() {
    let ecs = Ecs::new();
    let entity = {
        let mut lock = ecs
            .start_transaction(InstanceKind::Live, write_all())
            .unwrap();
        lock.new_entity().unwrap()
    };

    let mut lock = ecs
        .start_transaction(
            InstanceKind::Live,
            Permissions::new().write::<TransformTree>(),
        )
        .unwrap();
    // Entity lacks the component, so this is an add
    assert!(matches!(
        lock.set(entity, TransformTree::default()),
        Err(EcsError::AccessDenied { .. })
    ));
    drop(lock);

    let mut lock = ecs
        .start_transaction(InstanceKind::Live, write_all())
        .unwrap();
    lock.set(entity, TransformTree::default()).unwrap();
    drop(lock);

    // Now overwriting under Write-only succeeds
    let mut lock = ecs
        .start_transaction(
            InstanceKind::Live,
            Permissions::new().write::<TransformTree>(),
        )
        .unwrap();
    lock.set(entity, TransformTree::new(Transform::from_position(Vec3::X)))
        .unwrap();
    let tree = lock.get::<TransformTree>(entity).unwrap().unwrap();
    assert_eq!(tree.pose.position, Vec3::X);
}

#[test]
fn lock_upgrade_is_forbidden() {
    let ecs = Ecs::new();

    let read_lock = ecs
        .start_transaction(
            InstanceKind::Live,
            Permissions::new().read::<TransformTree>(),
        )
        .unwrap();

    // Stricter permissions while holding a compatible read lock
    match ecs.start_transaction(
        InstanceKind::Live,
        Permissions::new().write::<TransformTree>(),
    ) {
        Err(EcsError::LockUpgradeForbidden { .. }) => {}
        other => panic!("expected LockUpgradeForbidden, got {:?}", other.err()),
    }
    match ecs.start_transaction(
        InstanceKind::Live,
        Permissions::new().read::<TransformTree>().read::<Physics>(),
    ) {
        Err(EcsError::LockUpgradeForbidden { .. }) => {}
        other => panic!("expected LockUpgradeForbidden, got {:?}", other.err()),
    }

    // A subset read is allowed concurrently
    let nested = ecs
        .start_transaction(
            InstanceKind::Live,
            Permissions::new().read::<TransformTree>(),
        )
        .unwrap();
    drop(nested);
    drop(read_lock);

    // Re-entry under a held write lock would deadlock and is rejected
    let write_lock = ecs
        .start_transaction(InstanceKind::Live, write_all())
        .unwrap();
    match ecs.start_transaction(
        InstanceKind::Live,
        Permissions::new().read::<TransformTree>(),
    ) {
        Err(EcsError::NestedTransaction { .. }) => {}
        other => panic!("expected NestedTransaction, got {:?}", other.err()),
    }
    // The other instance is unaffected
    let staging = ecs
        .start_transaction(
            InstanceKind::Staging,
            Permissions::new().read::<TransformTree>(),
        )
        .unwrap();
    drop(staging);
    drop(write_lock);
}

#[test]
fn deferred_transactions_run_after_release() {
    let ecs = Ecs::new();
    let entity = {
        let mut lock = ecs
            .start_transaction(InstanceKind::Live, write_all())
            .unwrap();
        let e = lock.new_entity().unwrap();
        lock.set(e, TransformTree::default()).unwrap();
        e
    };

    {
        let lock = ecs
            .start_transaction(
                InstanceKind::Live,
                Permissions::new().read::<TransformTree>(),
            )
            .unwrap();
        lock.defer(
            Permissions::new().write::<TransformTree>(),
            move |write_lock| {
                let tree = write_lock.get_mut::<TransformTree>(entity).unwrap().unwrap();
                tree.pose.position = Vec3::new(0.0, 5.0, 0.0);
            },
        )
        .unwrap();

        // Not yet applied while the read lock is held
        let tree = lock.get::<TransformTree>(entity).unwrap().unwrap();
        assert_eq!(tree.pose.position, Vec3::ZERO);
    }

    let lock = ecs
        .start_transaction(
            InstanceKind::Live,
            Permissions::new().read::<TransformTree>(),
        )
        .unwrap();
    let tree = lock.get::<TransformTree>(entity).unwrap().unwrap();
    assert_eq!(tree.pose.position, Vec3::new(0.0, 5.0, 0.0));
}

#[test]
fn observers_see_add_and_remove() {
    let ecs = Ecs::new();
    let mut lock = ecs
        .start_transaction(InstanceKind::Live, write_all())
        .unwrap();
    let observer = lock.watch(ComponentKind::Physics).unwrap();

    let entity = lock.new_entity().unwrap();
    lock.set(entity, Physics::new(Vec::new(), PhysicsActorType::Dynamic))
        .unwrap();
    lock.unset::<Physics>(entity).unwrap();

    let added = observer.poll(&lock).unwrap();
    assert_eq!(added.entity, entity);
    assert_eq!(added.event, ComponentEventType::Added);
    let removed = observer.poll(&lock).unwrap();
    assert_eq!(removed.event, ComponentEventType::Removed);
    assert!(observer.poll(&lock).is_none());

    // Destroy also reports removals
    lock.set(entity, Physics::default()).unwrap();
    lock.destroy(entity).unwrap();
    let added = observer.poll(&lock).unwrap();
    assert_eq!(added.event, ComponentEventType::Added);
    let removed = observer.poll(&lock).unwrap();
    assert_eq!(removed.event, ComponentEventType::Removed);
    assert!(!lock.is_valid(entity));
}

#[test]
fn destroyed_entities_invalidate_refs_and_handles() {
    let ecs = Ecs::new();
    let name = Name::new("scene", "temp");
    let mut lock = ecs
        .start_transaction(InstanceKind::Live, write_all())
        .unwrap();
    let entity = lock.new_entity().unwrap();
    lock.set_name(entity, name.clone()).unwrap();

    let entity_ref = ecs.refs().get_entity(&name);
    assert_eq!(entity_ref.get_live(), entity);

    lock.destroy(entity).unwrap();
    assert!(entity_ref.get_live().is_null());
    assert_eq!(lock.entity_by_name(&name).unwrap(), None);

    // Reused slots get a fresh generation, stale handles stay invalid
    let reused = lock.new_entity().unwrap();
    assert_eq!(reused.index, entity.index);
    assert_ne!(reused.generation, entity.generation);
    assert!(!lock.is_valid(entity));
    assert!(lock.is_valid(reused));
}

#[test]
fn transform_trees_flatten_through_parents() {
    let ecs = Ecs::new();
    let mut lock = ecs
        .start_transaction(InstanceKind::Live, write_all())
        .unwrap();

    let parent_name = Name::new("scene", "parent");
    let parent = lock.new_entity().unwrap();
    lock.set_name(parent, parent_name.clone()).unwrap();
    lock.set(
        parent,
        TransformTree::new(Transform::from_position(Vec3::new(1.0, 0.0, 0.0))),
    )
    .unwrap();

    let child = lock.new_entity().unwrap();
    lock.set(
        child,
        TransformTree::with_parent(
            Transform::from_position(Vec3::new(0.0, 2.0, 0.0)),
            ecs.refs().get_entity(&parent_name),
        ),
    )
    .unwrap();

    let tree = lock.get::<TransformTree>(child).unwrap().unwrap().clone();
    let global = tree.global_transform(&lock);
    assert_eq!(global.position, Vec3::new(1.0, 2.0, 0.0));

    // A self-parented tree terminates at the depth bound
    let loop_name = Name::new("scene", "loop");
    let looper = lock.new_entity().unwrap();
    lock.set_name(looper, loop_name.clone()).unwrap();
    lock.set(
        looper,
        TransformTree::with_parent(
            Transform::from_position(Vec3::X),
            ecs.refs().get_entity(&loop_name),
        ),
    )
    .unwrap();
    let tree = lock.get::<TransformTree>(looper).unwrap().unwrap().clone();
    let global = tree.global_transform(&lock);
    assert!(global.position.is_finite());
}
