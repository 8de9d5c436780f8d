// optics.rs - Laser emitters, optical elements, and light sensors
//
// The laser system raycasts from each enabled emitter, reflecting off
// optical elements up to a bounce budget, and deposits accumulated intensity
// onto sensors. Segments land in LaserLine for the renderer to draw.

use glam::Vec3;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LaserEmitter {
    #[serde(default = "default_intensity")]
    pub intensity: f32,
    #[serde(default = "default_laser_color")]
    pub color: Vec3,
    /// Distance along the emitter's forward axis before the beam starts.
    #[serde(default)]
    pub start_distance: f32,
}

fn default_intensity() -> f32 {
    1.0
}
fn default_laser_color() -> Vec3 {
    Vec3::new(1.0, 0.0, 0.0)
}

impl Default for LaserEmitter {
    fn default() -> Self {
        Self {
            intensity: default_intensity(),
            color: default_laser_color(),
            start_distance: 0.0,
        }
    }
}

/// Mirror/filter behavior for laser hits. Default is a perfect mirror.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpticalElement {
    /// Per-channel fraction reflected on hit.
    #[serde(default = "default_reflect_tint")]
    pub reflect_tint: Vec3,
    /// Per-channel fraction transmitted through the element.
    #[serde(default)]
    pub pass_tint: Vec3,
}

fn default_reflect_tint() -> Vec3 {
    Vec3::ONE
}

impl Default for OpticalElement {
    fn default() -> Self {
        Self {
            reflect_tint: default_reflect_tint(),
            pass_tint: Vec3::ZERO,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LaserSegment {
    pub start: Vec3,
    pub end: Vec3,
    pub color: Vec3,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LaserLine {
    #[serde(default = "default_line_intensity")]
    pub intensity: f32,
    #[serde(default = "default_radius")]
    pub radius: f32,
    #[serde(default)]
    pub media_density_factor: f32,
    /// Segments in world space, rebuilt by the laser system each frame.
    #[serde(default, skip)]
    pub segments: Vec<LaserSegment>,
}

fn default_line_intensity() -> f32 {
    1.0
}
fn default_radius() -> f32 {
    0.003
}

impl Default for LaserLine {
    fn default() -> Self {
        Self {
            intensity: default_line_intensity(),
            radius: default_radius(),
            media_density_factor: 0.6,
            segments: Vec::new(),
        }
    }
}

/// Receives laser intensity at hit points and exposes it as a signal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LaserSensor {
    /// Per-channel threshold for the `value` output signal.
    #[serde(default = "default_threshold")]
    pub threshold: Vec3,
    #[serde(default, skip)]
    pub illuminance: Vec3,
}

fn default_threshold() -> Vec3 {
    Vec3::splat(0.5)
}

impl Default for LaserSensor {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            illuminance: Vec3::ZERO,
        }
    }
}

impl LaserSensor {
    pub fn numeric_field(&self, field: &str) -> Option<f64> {
        match field {
            "illuminance.r" => Some(self.illuminance.x as f64),
            "illuminance.g" => Some(self.illuminance.y as f64),
            "illuminance.b" => Some(self.illuminance.z as f64),
            _ => None,
        }
    }
}

/// Passive ambient light sampler, updated by the render thread and readable
/// from expressions on the physics thread.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LightSensor {
    #[serde(default)]
    pub position: Vec3,
    #[serde(default = "default_sensor_direction")]
    pub direction: Vec3,
    #[serde(default, skip)]
    pub illuminance: Vec3,
}

fn default_sensor_direction() -> Vec3 {
    Vec3::new(0.0, 0.0, -1.0)
}

impl Default for LightSensor {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            direction: default_sensor_direction(),
            illuminance: Vec3::ZERO,
        }
    }
}

impl LightSensor {
    pub fn numeric_field(&self, field: &str) -> Option<f64> {
        match field {
            "illuminance.r" => Some(self.illuminance.x as f64),
            "illuminance.g" => Some(self.illuminance.y as f64),
            "illuminance.b" => Some(self.illuminance.z as f64),
            _ => None,
        }
    }
}
