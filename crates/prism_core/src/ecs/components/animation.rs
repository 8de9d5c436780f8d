// animation.rs - Keyframe state animation
//
// Animations move an entity between a list of states, driven by the
// `animation_state` and `animation_target` signals. The physics thread
// advances the state signal and writes the interpolated pose each frame.

use glam::Vec3;
use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterpolationMode {
    /// Teleport from state to state.
    Step,
    /// Constant speed between states.
    #[default]
    Linear,
    /// Cubic Hermite spline with per-state tangents.
    Cubic,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AnimationState {
    /// Time in seconds to animate to this state from any other state.
    #[serde(default)]
    pub delay: f64,

    #[serde(default, rename = "translate")]
    pub pos: Vec3,
    /// A scale of zero leaves the transform's scale unchanged.
    #[serde(default)]
    pub scale: Vec3,

    // Derivative vectors, used for cubic interpolation only
    #[serde(default, rename = "translate_tangent")]
    pub tangent_pos: Vec3,
    #[serde(default, rename = "scale_tangent")]
    pub tangent_scale: Vec3,
}

impl AnimationState {
    pub fn new(pos: Vec3, scale: Vec3) -> Self {
        Self {
            pos,
            scale,
            ..Default::default()
        }
    }
}

/// Where a fractional animation state sits between two keyframes.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CurrNextState {
    pub current: usize,
    pub next: usize,
    pub completion: f32,
    pub direction: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Animation {
    #[serde(default)]
    pub states: Vec<AnimationState>,
    #[serde(default)]
    pub interpolation: InterpolationMode,
    #[serde(default = "default_tension", rename = "cubic_tension")]
    pub tension: f32,
}

fn default_tension() -> f32 {
    0.5
}

impl Animation {
    /// Split a fractional state position into current/next keyframe indices
    /// plus completion toward the next one.
    pub fn curr_next_state(&self, current_state: f64, target_state: f64) -> CurrNextState {
        let floor_state = current_state.floor();
        let completion = (current_state - floor_state) as f32;
        if target_state >= current_state {
            CurrNextState {
                current: floor_state as usize,
                next: floor_state as usize + 1,
                completion,
                direction: 1,
            }
        } else if completion == 0.0 {
            CurrNextState {
                current: floor_state as usize,
                next: (floor_state as usize).saturating_sub(1),
                completion: 0.0,
                direction: -1,
            }
        } else {
            CurrNextState {
                current: floor_state as usize + 1,
                next: floor_state as usize,
                completion: 1.0 - completion,
                direction: -1,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn curr_next_state_forward_and_back() {
        let anim = Animation {
            states: vec![AnimationState::default(); 3],
            ..Default::default()
        };

        let s = anim.curr_next_state(0.25, 2.0);
        assert_eq!((s.current, s.next, s.direction), (0, 1, 1));
        assert!((s.completion - 0.25).abs() < 1e-6);

        // Moving backwards from a fractional state inverts completion
        let s = anim.curr_next_state(1.75, 0.0);
        assert_eq!((s.current, s.next, s.direction), (2, 1, -1));
        assert!((s.completion - 0.25).abs() < 1e-6);

        // Exactly on a state, moving backwards
        let s = anim.curr_next_state(2.0, 0.0);
        assert_eq!((s.current, s.next, s.direction), (2, 1, -1));
        assert_eq!(s.completion, 0.0);
    }
}
