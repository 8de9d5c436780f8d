// physics_info.rs - Per-model convex hull settings
//
// A model's physics info maps hull names to decomposition settings. Values
// out of range are clamped with a warning rather than rejected; missing
// hulls fall back to a per-mesh-index default named `convex<i>`.

use serde_json::Value;
use std::collections::BTreeMap;

pub const DEFAULT_VOXEL_RESOLUTION: u32 = 400_000;
pub const DEFAULT_VOLUME_PERCENT_ERROR: f64 = 1.0;
pub const DEFAULT_MAX_VERTICES: u32 = 64;
pub const DEFAULT_MAX_HULLS: u32 = 64;

/// Settings for building one hull set. `name` is `<model>.<hull>` and keys
/// the collision cache.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct HullSettings {
    pub name: String,
    pub mesh_index: usize,
    pub decompose: bool,
    pub shrink_wrap: bool,
    pub voxel_resolution: u32,
    pub volume_percent_error: f64,
    pub max_vertices: u32,
    pub max_hulls: u32,
}

impl HullSettings {
    pub fn for_mesh(model: &str, hull: &str, mesh_index: usize) -> Self {
        Self {
            name: format!("{model}.{hull}"),
            mesh_index,
            decompose: false,
            shrink_wrap: false,
            voxel_resolution: DEFAULT_VOXEL_RESOLUTION,
            volume_percent_error: DEFAULT_VOLUME_PERCENT_ERROR,
            max_vertices: DEFAULT_MAX_VERTICES,
            max_hulls: DEFAULT_MAX_HULLS,
        }
    }
}

/// All hulls declared by one model's physics info JSON.
#[derive(Clone, Debug, Default)]
pub struct PhysicsInfo {
    pub model: String,
    pub(crate) hulls: BTreeMap<String, HullSettings>,
}

impl PhysicsInfo {
    /// Parse the physics info document. Unknown keys and malformed values
    /// warn and fall back to defaults; a malformed document yields an empty
    /// hull list.
    pub fn parse(model: &str, json: &str) -> PhysicsInfo {
        let mut info = PhysicsInfo {
            model: model.to_string(),
            hulls: BTreeMap::new(),
        };

        let root: Value = match serde_json::from_str(json) {
            Ok(value) => value,
            Err(err) => {
                tracing::error!(model, error = %err, "failed to parse physics info");
                return info;
            }
        };
        let Value::Object(entries) = root else {
            tracing::error!(model, "unexpected physics info root, expected object");
            return info;
        };

        for (hull_name, params) in entries {
            let mut hull = HullSettings::for_mesh(model, &hull_name, 0);
            let Value::Object(params) = params else {
                tracing::error!(hull = %hull.name, "unexpected hull settings, expected object");
                continue;
            };
            for (key, value) in params {
                match key.as_str() {
                    "mesh_index" => match value.as_u64() {
                        Some(index) => hull.mesh_index = index as usize,
                        None => warn_setting(&hull.name, "mesh_index", &value),
                    },
                    "decompose" => match value.as_bool() {
                        Some(flag) => hull.decompose = flag,
                        None => warn_setting(&hull.name, "decompose", &value),
                    },
                    "shrink_wrap" => match value.as_bool() {
                        Some(flag) => hull.shrink_wrap = flag,
                        None => warn_setting(&hull.name, "shrink_wrap", &value),
                    },
                    "voxel_resolution" => match value.as_u64() {
                        Some(resolution) => hull.voxel_resolution = resolution as u32,
                        None => warn_setting(&hull.name, "voxel_resolution", &value),
                    },
                    "volume_percent_error" => match value.as_f64() {
                        Some(error) if error > 0.0 && error < 100.0 => {
                            hull.volume_percent_error = error;
                        }
                        Some(error) => {
                            tracing::warn!(
                                hull = %hull.name,
                                value = error,
                                "volume_percent_error out of range, using default"
                            );
                            hull.volume_percent_error = DEFAULT_VOLUME_PERCENT_ERROR;
                        }
                        None => warn_setting(&hull.name, "volume_percent_error", &value),
                    },
                    "max_vertices" => match value.as_u64() {
                        Some(count) if count > 255 => {
                            tracing::warn!(
                                hull = %hull.name,
                                value = count,
                                "max_vertices exceeds backend limit of 255, clamping"
                            );
                            hull.max_vertices = 255;
                        }
                        Some(count) if count < 3 => {
                            tracing::warn!(
                                hull = %hull.name,
                                value = count,
                                "max_vertices out of range, using default"
                            );
                            hull.max_vertices = DEFAULT_MAX_VERTICES;
                        }
                        Some(count) => hull.max_vertices = count as u32,
                        None => warn_setting(&hull.name, "max_vertices", &value),
                    },
                    "max_hulls" => match value.as_u64() {
                        Some(count) => hull.max_hulls = (count as u32).max(1),
                        None => warn_setting(&hull.name, "max_hulls", &value),
                    },
                    other => {
                        tracing::warn!(hull = %hull.name, setting = other, "unknown hull setting");
                    }
                }
            }
            info.hulls.insert(hull.name.clone(), hull);
        }
        info
    }

    /// Settings for a named hull, or the per-mesh default when the name is
    /// `convex<i>` or unknown.
    pub fn hull(&self, hull_name: &str) -> HullSettings {
        let full = format!("{}.{hull_name}", self.model);
        if let Some(settings) = self.hulls.get(&full) {
            return settings.clone();
        }
        let mesh_index = hull_name
            .strip_prefix("convex")
            .and_then(|i| i.parse::<usize>().ok())
            .unwrap_or(0);
        HullSettings::for_mesh(&self.model, hull_name, mesh_index)
    }

    pub fn hulls(&self) -> impl Iterator<Item = &HullSettings> {
        self.hulls.values()
    }

    pub fn is_empty(&self) -> bool {
        self.hulls.is_empty()
    }
}

fn warn_setting(hull: &str, setting: &str, value: &Value) {
    tracing::warn!(hull, setting, %value, "invalid hull setting, using default");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_clamps_settings() {
        let json = r#"{
            "body": {
                "mesh_index": 1,
                "decompose": true,
                "shrink_wrap": true,
                "voxel_resolution": 100000,
                "volume_percent_error": 250.0,
                "max_vertices": 1000
            },
            "grip": {}
        }"#;
        let info = PhysicsInfo::parse("duck", json);

        let body = info.hull("body");
        assert_eq!(body.name, "duck.body");
        assert_eq!(body.mesh_index, 1);
        assert!(body.decompose);
        assert_eq!(body.voxel_resolution, 100_000);
        assert_eq!(body.volume_percent_error, DEFAULT_VOLUME_PERCENT_ERROR);
        assert_eq!(body.max_vertices, 255);

        let grip = info.hull("grip");
        assert!(!grip.decompose);
        assert_eq!(grip.voxel_resolution, DEFAULT_VOXEL_RESOLUTION);
    }

    #[test]
    fn convex_names_fall_back_to_mesh_index() {
        let info = PhysicsInfo::parse("duck", "{}");
        let convex2 = info.hull("convex2");
        assert_eq!(convex2.mesh_index, 2);
        assert_eq!(convex2.name, "duck.convex2");
        assert!(!convex2.decompose);
    }

    #[test]
    fn malformed_document_yields_empty_info() {
        let info = PhysicsInfo::parse("duck", "not json");
        assert!(info.is_empty());
        let info = PhysicsInfo::parse("duck", "[1, 2]");
        assert!(info.is_empty());
    }
}
