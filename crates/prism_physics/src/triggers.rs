// triggers.rs - Trigger area overlap tracking
//
// A trigger area is a unit volume scaled by the entity's transform. Each
// frame the contained set per trigger group is rebuilt and diffed against
// the previous frame, emitting enter/leave events into the area entity's
// event queues.

use crate::manager::PhysicsManager;
use prism_core::ecs::components::{TransformSnapshot, TriggerArea, TriggerGroup, TriggerShape};
use prism_core::ecs::{ComponentKind, EcsError, Entity, Lock};
use prism_core::events::{Event, EventData, EventInput};
use std::collections::{BTreeMap, BTreeSet};

fn group_name(group: TriggerGroup) -> &'static str {
    match group {
        TriggerGroup::Player => "player",
        TriggerGroup::Object => "object",
        TriggerGroup::Magnetic => "magnetic",
    }
}

impl PhysicsManager {
    pub(crate) fn triggers_frame(&mut self, lock: &mut Lock) -> Result<(), EcsError> {
        // Snapshot the tagged entities once; areas test against this list
        let mut tagged: Vec<(Entity, TriggerGroup, glam::Vec3)> = Vec::new();
        for entity in
            lock.entities_with(&[ComponentKind::TriggerGroup, ComponentKind::TransformSnapshot])?
        {
            let Some(group) = lock.get::<TriggerGroup>(entity)?.copied() else {
                continue;
            };
            let Some(snapshot) = lock.get::<TransformSnapshot>(entity)? else {
                continue;
            };
            tagged.push((entity, group, snapshot.0.position));
        }

        for area_entity in
            lock.entities_with(&[ComponentKind::TriggerArea, ComponentKind::TransformSnapshot])?
        {
            let Some(area) = lock.get::<TriggerArea>(area_entity)? else {
                continue;
            };
            let shape = area.shape;
            let previous = area.contained.clone();
            let Some(snapshot) = lock.get::<TransformSnapshot>(area_entity)? else {
                continue;
            };
            let area_transform = snapshot.0;

            let mut contained: BTreeMap<TriggerGroup, BTreeSet<Entity>> = BTreeMap::new();
            for (entity, group, position) in &tagged {
                if *entity == area_entity {
                    continue;
                }
                // Test in the area's local space, against the unit volume
                let inv_rotation = area_transform.rotation.inverse();
                let local = (inv_rotation * (*position - area_transform.position))
                    / area_transform.scale;
                let inside = match shape {
                    TriggerShape::Box => {
                        local.x.abs() <= 0.5 && local.y.abs() <= 0.5 && local.z.abs() <= 0.5
                    }
                    TriggerShape::Sphere => local.length() <= 0.5,
                };
                if inside {
                    contained.entry(*group).or_default().insert(*entity);
                }
            }

            // Diff against the previous frame per group
            let mut events: Vec<(String, Entity)> = Vec::new();
            for group in TriggerGroup::ALL {
                let now = contained.get(&group).cloned().unwrap_or_default();
                let before = previous.get(&group).cloned().unwrap_or_default();
                for entered in now.difference(&before) {
                    events.push((format!("/trigger/{}/enter", group_name(group)), *entered));
                }
                for left in before.difference(&now) {
                    events.push((format!("/trigger/{}/leave", group_name(group)), *left));
                }
            }

            if let Some(area) = lock.get_mut::<TriggerArea>(area_entity)? {
                area.contained = contained;
            }
            if events.is_empty() {
                continue;
            }
            let sources: Vec<(String, prism_core::refs::EntityRef)> = events
                .iter()
                .map(|(queue, entity)| (queue.clone(), lock.refs().get_entity_by_id(*entity)))
                .collect();
            if let Some(input) = lock.get_mut::<EventInput>(area_entity)? {
                for ((queue, entity), (_, source)) in events.iter().zip(sources) {
                    input.register(queue.clone());
                    input.add(
                        queue,
                        Event::new(queue.clone(), source, EventData::Entity(*entity)),
                    );
                }
            }
        }
        Ok(())
    }
}
