// animation.rs - Keyframe animation stepping
//
// Each frame, animation_state advances toward animation_target at a rate
// set by the next state's delay, then the interpolated pose is written into
// the transform tree. The signals are the public interface: scripts retarget
// an animation by writing animation_target.

use crate::manager::PhysicsManager;
use glam::Vec3;
use prism_core::ecs::components::{Animation, InterpolationMode, TransformTree};
use prism_core::ecs::{ComponentKind, EcsError, Lock};
use prism_core::refs::SignalKey;

fn is_usable_scale(scale: Vec3) -> bool {
    scale.is_finite() && scale.x != 0.0 && scale.y != 0.0 && scale.z != 0.0
}

impl PhysicsManager {
    pub(crate) fn animation_frame(&mut self, lock: &mut Lock) -> Result<(), EcsError> {
        let dt = self.interval.as_secs_f64();
        for entity in lock.entities_with(&[ComponentKind::Animation])? {
            if !lock.has::<TransformTree>(entity) {
                continue;
            }
            let Some(animation) = lock.get::<Animation>(entity)?.cloned() else {
                continue;
            };
            if animation.states.is_empty() {
                continue;
            }
            let max_state = animation.states.len() as f64 - 1.0;

            let entity_ref = lock.refs().get_entity_by_id(entity);
            let Some(state_key) = SignalKey::new(entity_ref.clone(), "animation_state") else {
                continue;
            };
            let Some(target_key) = SignalKey::new(entity_ref, "animation_target") else {
                continue;
            };
            let state_signal = lock.refs().get_signal(&state_key);
            let target_signal = lock.refs().get_signal(&target_key);

            let mut current = state_signal.get_signal(lock, 0).clamp(0.0, max_state);
            let target = target_signal.get_signal(lock, 0).clamp(0.0, max_state);

            // Advance toward the target at the next state's pace
            if current != target {
                let step_state = animation.curr_next_state(current, target);
                let next = step_state.next.min(animation.states.len() - 1);
                let delay = animation.states[next].delay.max(1e-9);
                let step = dt / delay;
                current = if target >= current {
                    (current + step).min(target)
                } else {
                    (current - step).max(target)
                };
                state_signal.set_value(lock, current)?;
            }

            let state = animation.curr_next_state(current, target);
            let current_index = state.current.min(animation.states.len() - 1);
            let next_index = state.next.min(animation.states.len() - 1);
            let curr_state = &animation.states[current_index];
            let next_state = &animation.states[next_index];

            let (pos, scale) = match animation.interpolation {
                InterpolationMode::Step => (next_state.pos, next_state.scale),
                InterpolationMode::Linear => {
                    let t = state.completion;
                    (
                        curr_state.pos + t * (next_state.pos - curr_state.pos),
                        curr_state.scale + t * (next_state.scale - curr_state.scale),
                    )
                }
                InterpolationMode::Cubic => {
                    let tangent_scale = state.direction as f32 * next_state.delay as f32;
                    let t = state.completion;
                    let t2 = t * t;
                    let t3 = t2 * t;
                    let av1 = 2.0 * t3 - 3.0 * t2 + 1.0;
                    let at1 = tangent_scale * (t3 - 2.0 * t2 + t);
                    let av2 = -2.0 * t3 + 3.0 * t2;
                    let at2 = tangent_scale * (t3 - t2);
                    (
                        av1 * curr_state.pos
                            + at1 * curr_state.tangent_pos
                            + av2 * next_state.pos
                            + at2 * next_state.tangent_pos,
                        av1 * curr_state.scale
                            + at1 * curr_state.tangent_scale
                            + av2 * next_state.scale
                            + at2 * next_state.tangent_scale,
                    )
                }
            };

            if let Some(tree) = lock.get_mut::<TransformTree>(entity)? {
                tree.pose.position = pos;
                if is_usable_scale(scale) {
                    tree.pose.scale = scale;
                }
            }
        }
        Ok(())
    }
}
