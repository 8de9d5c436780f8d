// hull.rs - Convex hull cooking and the collision cache
//
// Hull sets are built from a model mesh: either a V-HACD decomposition
// (decompose = true) or a single convex hull. Built sets serialize to the
// on-disk collision cache; a cache entry is valid only when the model hash
// and settings hash both match exactly.
//
// In-memory, hull sets live in a TTL cache of shared futures so concurrent
// requests for the same settings share one build.

use crate::convert::{from_na_point, to_na_point};
use glam::Vec3;
use parking_lot::Mutex;
use prism_asset::{Assets, Async, DispatchQueue, HullSettings, Model};
use rapier3d::parry::transformation::vhacd::VHACDParameters;
use rapier3d::prelude::SharedShape;
use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

/// Collision cache format tag. Bump when the layout changes.
pub const HULL_CACHE_MAGIC: u32 = 0xC044;

const HULL_CACHE_HEADER_SIZE: usize = 4 + 16 + 16 + 4;

/// One cooked convex hull: its vertex cloud and the backend shape built
/// from it.
pub struct ConvexHull {
    pub points: Vec<Vec3>,
    pub shape: SharedShape,
}

/// All hulls produced for one (model, settings) pair.
pub struct ConvexHullSet {
    pub hulls: Vec<ConvexHull>,
    pub model_hash: u128,
    pub settings: HullSettings,
}

/// 128-bit hash of the hull settings struct, combined with the model hash
/// in the cache header.
pub fn settings_hash(settings: &HullSettings) -> u128 {
    let encoded = bincode::serialize(settings).unwrap_or_default();
    prism_asset::content_hash(&encoded)
}

fn build_hull_from_points(points: &[Vec3]) -> Option<ConvexHull> {
    if points.len() < 3 {
        return None;
    }
    let na_points: Vec<_> = points.iter().map(|p| to_na_point(*p)).collect();
    match SharedShape::convex_hull(&na_points) {
        Some(shape) => {
            let hull_points = shape
                .as_convex_polyhedron()
                .map(|poly| poly.points().iter().map(|p| from_na_point(*p)).collect())
                .unwrap_or_else(|| points.to_vec());
            Some(ConvexHull {
                points: hull_points,
                shape,
            })
        }
        None => {
            tracing::error!(points = points.len(), "failed to cook convex hull");
            None
        }
    }
}

fn decompose_primitive(
    positions: &[Vec3],
    indices: &[u32],
    settings: &HullSettings,
    out: &mut Vec<ConvexHull>,
) {
    let na_points: Vec<_> = positions.iter().map(|p| to_na_point(*p)).collect();
    let triangles: Vec<[u32; 3]> = indices
        .chunks_exact(3)
        .map(|tri| [tri[0], tri[1], tri[2]])
        .collect();
    if na_points.len() < 3 || triangles.is_empty() {
        return;
    }

    // The backend voxelizes per axis; the settings store a total budget
    let per_axis = (settings.voxel_resolution as f64).cbrt().round() as u32;
    let params = VHACDParameters {
        resolution: per_axis.clamp(16, 256),
        concavity: (settings.volume_percent_error / 100.0) as f32,
        max_convex_hulls: settings.max_hulls,
        ..Default::default()
    };

    let decomposition =
        SharedShape::convex_decomposition_with_params(&na_points, &triangles, &params);
    let Some(compound) = decomposition.as_compound() else {
        // A single-part decomposition comes back as one convex polyhedron
        if let Some(poly) = decomposition.as_convex_polyhedron() {
            let points: Vec<Vec3> = poly.points().iter().map(|p| from_na_point(*p)).collect();
            if let Some(hull) = build_hull_from_points(&points) {
                out.push(hull);
            }
        }
        return;
    };
    for (_pose, part) in compound.shapes() {
        let Some(poly) = part.as_convex_polyhedron() else {
            continue;
        };
        let points: Vec<Vec3> = poly.points().iter().map(|p| from_na_point(*p)).collect();
        if points.len() < 3 {
            continue;
        }
        if let Some(hull) = build_hull_from_points(&points) {
            out.push(hull);
        }
    }
}

/// Cook a hull set from model geometry. Returns None when the referenced
/// mesh is missing or produced no usable hulls.
pub fn build_convex_hulls(model: &Model, settings: &HullSettings) -> Option<ConvexHullSet> {
    let Some(mesh) = model.mesh(settings.mesh_index) else {
        tracing::error!(
            hull = %settings.name,
            mesh_index = settings.mesh_index,
            "physics mesh index is missing or out of range"
        );
        return None;
    };

    let mut hulls = Vec::new();
    for primitive in &mesh.primitives {
        if settings.decompose {
            // Break the primitive into one or more convex parts
            decompose_primitive(&primitive.positions, &primitive.indices, settings, &mut hulls);
        } else {
            // Single hull over the referenced vertices
            let mut visited = HashSet::new();
            let mut points = Vec::with_capacity(primitive.positions.len());
            for &index in &primitive.indices {
                if index as usize >= primitive.positions.len() || !visited.insert(index) {
                    continue;
                }
                points.push(primitive.positions[index as usize]);
            }
            if let Some(hull) = build_hull_from_points(&points) {
                tracing::debug!(
                    hull = %settings.name,
                    points = hull.points.len(),
                    "cooked single convex hull"
                );
                hulls.push(hull);
            }
        }
    }

    if hulls.is_empty() {
        tracing::error!(hull = %settings.name, "hull cook produced no hulls");
        return None;
    }
    Some(ConvexHullSet {
        hulls,
        model_hash: model.hash,
        settings: settings.clone(),
    })
}

/// Load a hull set from the on-disk collision cache. Any mismatch (magic,
/// hash, size) rejects the file so the caller rebuilds.
pub fn load_collision_cache(
    assets: &Assets,
    model: &Model,
    settings: &HullSettings,
) -> Option<ConvexHullSet> {
    let path = format!("cache/collision/{}", settings.name);
    let asset = assets.read(&path).ok()?;
    let buf = &asset.bytes;
    if buf.len() < HULL_CACHE_HEADER_SIZE {
        tracing::error!(hull = %settings.name, "collision cache is corrupt");
        return None;
    }

    let mut cursor = std::io::Cursor::new(buf);
    let mut u32_buf = [0u8; 4];
    let mut u128_buf = [0u8; 16];

    cursor.read_exact(&mut u32_buf).ok()?;
    if u32::from_le_bytes(u32_buf) != HULL_CACHE_MAGIC {
        tracing::info!(hull = %settings.name, "ignoring outdated collision cache format");
        return None;
    }
    cursor.read_exact(&mut u128_buf).ok()?;
    if u128::from_le_bytes(u128_buf) != model.hash {
        tracing::info!(hull = %settings.name, "ignoring collision cache for changed model");
        return None;
    }
    cursor.read_exact(&mut u128_buf).ok()?;
    if u128::from_le_bytes(u128_buf) != settings_hash(settings) {
        tracing::info!(hull = %settings.name, "ignoring collision cache for changed settings");
        return None;
    }
    cursor.read_exact(&mut u32_buf).ok()?;
    let payload_size = u32::from_le_bytes(u32_buf) as usize;
    if buf.len() - HULL_CACHE_HEADER_SIZE < payload_size {
        tracing::error!(hull = %settings.name, "collision cache is corrupt");
        return None;
    }

    let payload = &buf[HULL_CACHE_HEADER_SIZE..HULL_CACHE_HEADER_SIZE + payload_size];
    let hull_points: Vec<Vec<[f32; 3]>> = match bincode::deserialize(payload) {
        Ok(points) => points,
        Err(err) => {
            tracing::error!(hull = %settings.name, error = %err, "collision cache payload is corrupt");
            return None;
        }
    };

    let mut hulls = Vec::with_capacity(hull_points.len());
    for points in hull_points {
        let points: Vec<Vec3> = points.into_iter().map(Vec3::from_array).collect();
        let hull = build_hull_from_points(&points)?;
        hulls.push(hull);
    }
    Some(ConvexHullSet {
        hulls,
        model_hash: model.hash,
        settings: settings.clone(),
    })
}

/// Write a hull set to the collision cache.
pub fn save_collision_cache(
    assets: &Assets,
    model: &Model,
    settings: &HullSettings,
    set: &ConvexHullSet,
) {
    let hull_points: Vec<Vec<[f32; 3]>> = set
        .hulls
        .iter()
        .map(|hull| hull.points.iter().map(|p| p.to_array()).collect())
        .collect();
    let payload = match bincode::serialize(&hull_points) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::error!(hull = %settings.name, error = %err, "failed to serialize hull set");
            return;
        }
    };

    let path = format!("cache/collision/{}", settings.name);
    let mut out = match assets.output_stream(&path) {
        Ok(file) => file,
        Err(err) => {
            tracing::error!(hull = %settings.name, error = %err, "failed to open collision cache");
            return;
        }
    };
    let result = out
        .write_all(&HULL_CACHE_MAGIC.to_le_bytes())
        .and_then(|_| out.write_all(&model.hash.to_le_bytes()))
        .and_then(|_| out.write_all(&settings_hash(settings).to_le_bytes()))
        .and_then(|_| out.write_all(&(payload.len() as u32).to_le_bytes()))
        .and_then(|_| out.write_all(&payload));
    if let Err(err) = result {
        tracing::error!(hull = %settings.name, error = %err, "failed to write collision cache");
    }
}

struct HullCacheEntry {
    future: Async<ConvexHullSet>,
    idle: Duration,
}

/// TTL cache of hull-set futures keyed by settings name. Entries stay for
/// at least the TTL past their last access.
pub struct HullCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, HullCacheEntry>>,
    dispatch_guard: Mutex<()>,
}

impl HullCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
            dispatch_guard: Mutex::new(()),
        }
    }

    fn load(&self, name: &str) -> Option<Async<ConvexHullSet>> {
        let mut entries = self.entries.lock();
        entries.get_mut(name).map(|entry| {
            entry.idle = Duration::ZERO;
            entry.future.clone()
        })
    }

    fn register(&self, name: String, future: Async<ConvexHullSet>) {
        self.entries.lock().insert(
            name,
            HullCacheEntry {
                future,
                idle: Duration::ZERO,
            },
        );
    }

    /// Request the hull set for `settings`, dispatching a build if no entry
    /// exists. Concurrent requests for the same key share one future.
    pub fn load_convex_hull_set(
        &self,
        assets: &Arc<Assets>,
        queue: &DispatchQueue,
        model: Async<Model>,
        settings: HullSettings,
    ) -> Async<ConvexHullSet> {
        debug_assert!(!settings.name.is_empty(), "hull settings have no name");
        if let Some(existing) = self.load(&settings.name) {
            return existing;
        }
        // Double-check under the dispatch mutex in case an in-flight build
        // registered while we waited
        let _guard = self.dispatch_guard.lock();
        if let Some(existing) = self.load(&settings.name) {
            return existing;
        }

        let assets = assets.clone();
        let name = settings.name.clone();
        let future = queue.dispatch(move || {
            let model = model.wait()?;
            if let Some(set) = load_collision_cache(&assets, &model, &settings) {
                return Some(set);
            }
            let set = build_convex_hulls(&model, &settings)?;
            save_collision_cache(&assets, &model, &settings, &set);
            Some(set)
        });
        self.register(name, future.clone());
        future
    }

    /// Age entries and evict those idle past the TTL.
    pub fn tick(&self, interval: Duration) {
        let mut entries = self.entries.lock();
        entries.retain(|name, entry| {
            entry.idle += interval;
            // In-flight builds never expire
            if !entry.future.ready() {
                entry.idle = Duration::ZERO;
                return true;
            }
            if entry.idle >= self.ttl {
                tracing::debug!(hull = %name, "evicting expired hull cache entry");
                false
            } else {
                true
            }
        });
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn drop_all(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_asset::Primitive;

    fn box_model() -> Model {
        // Unit cube as a triangle soup
        let corners = [
            Vec3::new(-0.5, -0.5, -0.5),
            Vec3::new(0.5, -0.5, -0.5),
            Vec3::new(0.5, 0.5, -0.5),
            Vec3::new(-0.5, 0.5, -0.5),
            Vec3::new(-0.5, -0.5, 0.5),
            Vec3::new(0.5, -0.5, 0.5),
            Vec3::new(0.5, 0.5, 0.5),
            Vec3::new(-0.5, 0.5, 0.5),
        ];
        let indices: Vec<u32> = vec![
            0, 1, 2, 0, 2, 3, 4, 6, 5, 4, 7, 6, 0, 4, 5, 0, 5, 1, 3, 2, 6, 3, 6, 7, 1, 5, 6, 1,
            6, 2, 0, 3, 7, 0, 7, 4,
        ];
        Model {
            name: "cube".into(),
            meshes: vec![Some(prism_asset::Mesh {
                name: "cube".into(),
                primitives: vec![Primitive {
                    positions: corners.to_vec(),
                    indices,
                }],
            })],
            hash: 0xfeed_beef,
        }
    }

    fn cube_settings() -> HullSettings {
        HullSettings::for_mesh("cube", "convex0", 0)
    }

    #[test]
    fn single_hull_build_covers_cube() {
        let set = build_convex_hulls(&box_model(), &cube_settings()).unwrap();
        assert_eq!(set.hulls.len(), 1);
        assert_eq!(set.hulls[0].points.len(), 8);
    }

    #[test]
    fn missing_mesh_fails_build() {
        let mut settings = cube_settings();
        settings.mesh_index = 4;
        assert!(build_convex_hulls(&box_model(), &settings).is_none());
    }

    #[test]
    fn cache_round_trip_and_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let assets = Assets::new(dir.path());
        let model = box_model();
        let settings = cube_settings();

        let set = build_convex_hulls(&model, &settings).unwrap();
        save_collision_cache(&assets, &model, &settings, &set);

        let loaded = load_collision_cache(&assets, &model, &settings).unwrap();
        assert_eq!(loaded.hulls.len(), set.hulls.len());
        assert_eq!(loaded.hulls[0].points.len(), set.hulls[0].points.len());

        // Cache purity: saving the same inputs twice is byte-identical
        let path = dir.path().join("cache/collision/cube.convex0");
        let first = std::fs::read(&path).unwrap();
        save_collision_cache(&assets, &model, &settings, &set);
        assert_eq!(first, std::fs::read(&path).unwrap());

        // Changed settings hash rejects the cache
        let mut changed = settings.clone();
        changed.max_vertices = 32;
        changed.name = settings.name.clone();
        assert!(load_collision_cache(&assets, &model, &changed).is_none());

        // Changed model hash rejects the cache
        let mut other_model = box_model();
        other_model.hash = 1;
        assert!(load_collision_cache(&assets, &other_model, &settings).is_none());

        // Corrupting the magic forces a rebuild
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[0] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();
        assert!(load_collision_cache(&assets, &model, &settings).is_none());
    }

    #[test]
    fn hull_cache_shares_futures_and_expires() {
        let dir = tempfile::tempdir().unwrap();
        let assets = Arc::new(Assets::new(dir.path()));
        let queue = DispatchQueue::new("HullLoading", 1);
        let cache = HullCache::new(Duration::from_secs(1));

        let model = Async::resolved(box_model());
        let a = cache.load_convex_hull_set(&assets, &queue, model.clone(), cube_settings());
        let b = cache.load_convex_hull_set(&assets, &queue, model.clone(), cube_settings());
        assert_eq!(cache.len(), 1);

        let set_a = a.wait().unwrap();
        let set_b = b.wait().unwrap();
        assert_eq!(set_a.hulls.len(), set_b.hulls.len());

        // The cook wrote the cache file; a fresh cache hits it without
        // rebuilding
        assert!(assets.exists("cache/collision/cube.convex0"));

        // TTL eviction
        cache.tick(Duration::from_millis(600));
        assert_eq!(cache.len(), 1);
        cache.tick(Duration::from_millis(600));
        assert!(cache.is_empty());
    }
}
