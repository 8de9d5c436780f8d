// convert.rs - glam <-> rapier (nalgebra) conversions
//
// The ECS speaks glam; the backend speaks nalgebra. Everything crossing
// that boundary goes through here.

use glam::{Quat, Vec3};
use prism_core::math::Transform;
use rapier3d::na::{Isometry3, Point3, Quaternion, Translation3, UnitQuaternion, Vector3};

pub fn to_na_vec(v: Vec3) -> Vector3<f32> {
    Vector3::new(v.x, v.y, v.z)
}

pub fn to_na_point(v: Vec3) -> Point3<f32> {
    Point3::new(v.x, v.y, v.z)
}

pub fn from_na_vec(v: Vector3<f32>) -> Vec3 {
    Vec3::new(v.x, v.y, v.z)
}

pub fn from_na_point(p: Point3<f32>) -> Vec3 {
    Vec3::new(p.x, p.y, p.z)
}

pub fn to_na_quat(q: Quat) -> UnitQuaternion<f32> {
    UnitQuaternion::from_quaternion(Quaternion::new(q.w, q.x, q.y, q.z))
}

pub fn from_na_quat(q: UnitQuaternion<f32>) -> Quat {
    Quat::from_xyzw(q.i, q.j, q.k, q.w)
}

/// A transform's rigid part (position + rotation) as a backend isometry.
/// Scale is applied to geometry, never to poses.
pub fn to_isometry(transform: &Transform) -> Isometry3<f32> {
    Isometry3::from_parts(
        Translation3::new(
            transform.position.x,
            transform.position.y,
            transform.position.z,
        ),
        to_na_quat(transform.rotation),
    )
}

pub fn from_isometry(isometry: &Isometry3<f32>) -> Transform {
    Transform {
        position: from_na_vec(isometry.translation.vector),
        rotation: from_na_quat(isometry.rotation),
        scale: Vec3::ONE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isometry_round_trip() {
        let t = Transform {
            position: Vec3::new(1.0, -2.0, 3.5),
            rotation: Quat::from_rotation_y(0.7),
            scale: Vec3::ONE,
        };
        let back = from_isometry(&to_isometry(&t));
        assert!(back.approx_eq(&t, 1e-6));
    }
}
