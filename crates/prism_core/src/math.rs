//! Transform math shared by the simulation and physics reconciliation.
//!
//! A [`Transform`] is a decomposed TRS pose. Composition follows the usual
//! parent-to-world convention: `parent * child` is the child pose expressed
//! in the parent's parent space.

use glam::{Mat4, Quat, Vec3};
use serde::{Deserialize, Serialize};

/// Maximum parent-chain depth before a transform tree is considered cyclic.
pub const MAX_TRANSFORM_DEPTH: usize = 64;

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    #[serde(default)]
    pub position: Vec3,
    #[serde(default = "Quat::default")]
    pub rotation: Quat,
    #[serde(default = "default_scale")]
    pub scale: Vec3,
}

fn default_scale() -> Vec3 {
    Vec3::ONE
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Transform {
    pub const IDENTITY: Transform = Transform {
        position: Vec3::ZERO,
        rotation: Quat::IDENTITY,
        scale: Vec3::ONE,
    };

    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            ..Self::IDENTITY
        }
    }

    pub fn from_position_rotation(position: Vec3, rotation: Quat) -> Self {
        Self {
            position,
            rotation,
            scale: Vec3::ONE,
        }
    }

    pub fn matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.position)
    }

    pub fn transform_point(&self, point: Vec3) -> Vec3 {
        self.rotation * (point * self.scale) + self.position
    }

    pub fn transform_direction(&self, dir: Vec3) -> Vec3 {
        self.rotation * dir
    }

    /// Component-wise comparison with an absolute tolerance.
    pub fn approx_eq(&self, other: &Transform, epsilon: f32) -> bool {
        self.position.abs_diff_eq(other.position, epsilon)
            && self.rotation.abs_diff_eq(other.rotation, epsilon)
            && self.scale.abs_diff_eq(other.scale, epsilon)
    }

    /// This pose expressed relative to `ancestor`'s space.
    pub fn relative_to(&self, ancestor: &Transform) -> Transform {
        let inv_rotation = ancestor.rotation.inverse();
        let inv_scale = Vec3::ONE / ancestor.scale;
        Transform {
            position: (inv_rotation * (self.position - ancestor.position)) * inv_scale,
            rotation: inv_rotation * self.rotation,
            scale: self.scale * inv_scale,
        }
    }
}

impl std::ops::Mul for Transform {
    type Output = Transform;

    fn mul(self, child: Transform) -> Transform {
        Transform {
            position: self.transform_point(child.position),
            rotation: self.rotation * child.rotation,
            scale: self.scale * child.scale,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_and_relative_round_trip() {
        let parent = Transform {
            position: Vec3::new(1.0, 2.0, 3.0),
            rotation: Quat::from_rotation_y(std::f32::consts::FRAC_PI_2),
            scale: Vec3::splat(2.0),
        };
        let child = Transform {
            position: Vec3::new(0.5, 0.0, 0.0),
            rotation: Quat::from_rotation_x(0.3),
            scale: Vec3::ONE,
        };

        let global = parent * child;
        let back = global.relative_to(&parent);
        assert!(back.approx_eq(&child, 1e-5));
    }

    #[test]
    fn transform_point_applies_trs_order() {
        let t = Transform {
            position: Vec3::new(10.0, 0.0, 0.0),
            rotation: Quat::from_rotation_z(std::f32::consts::FRAC_PI_2),
            scale: Vec3::splat(2.0),
        };
        let p = t.transform_point(Vec3::X);
        // Scale to (2,0,0), rotate 90 deg around Z to (0,2,0), translate.
        assert!(p.abs_diff_eq(Vec3::new(10.0, 2.0, 0.0), 1e-5));
    }
}
