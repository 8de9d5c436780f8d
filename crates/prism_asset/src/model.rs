// model.rs - GLTF model facade
//
// Physics only needs positions and triangle indices per mesh primitive; the
// rest of the GLTF container stays opaque. Mesh slots are optional so a
// single undecodable mesh doesn't take the whole model down.

use glam::Vec3;

#[derive(Clone, Debug, Default)]
pub struct Primitive {
    pub positions: Vec<Vec3>,
    pub indices: Vec<u32>,
}

#[derive(Clone, Debug, Default)]
pub struct Mesh {
    pub name: String,
    pub primitives: Vec<Primitive>,
}

/// A loaded model: decoded meshes plus the content hash of the source
/// bytes. The hash keys the collision cache.
#[derive(Clone, Debug)]
pub struct Model {
    pub name: String,
    pub meshes: Vec<Option<Mesh>>,
    pub hash: u128,
}

impl Model {
    /// Decode a GLTF/GLB byte buffer. Returns None when the container
    /// itself is unreadable; individual broken meshes become None slots.
    pub fn decode(name: &str, bytes: &[u8], hash: u128) -> Option<Model> {
        let (document, buffers, _images) = match gltf::import_slice(bytes) {
            Ok(imported) => imported,
            Err(err) => {
                tracing::error!(model = name, error = %err, "failed to decode gltf model");
                return None;
            }
        };

        let mut meshes = Vec::new();
        for mesh in document.meshes() {
            let mesh_name = mesh
                .name()
                .map(str::to_string)
                .unwrap_or_else(|| format!("mesh{}", mesh.index()));
            let mut primitives = Vec::new();
            let mut valid = true;
            for primitive in mesh.primitives() {
                if primitive.mode() != gltf::mesh::Mode::Triangles {
                    tracing::warn!(
                        model = name,
                        mesh = %mesh_name,
                        "skipping non-triangle primitive"
                    );
                    continue;
                }
                let reader = primitive.reader(|buffer| {
                    buffers.get(buffer.index()).map(|data| data.0.as_slice())
                });
                let Some(positions) = reader.read_positions() else {
                    valid = false;
                    continue;
                };
                let positions: Vec<Vec3> = positions.map(Vec3::from_array).collect();
                let indices: Vec<u32> = match reader.read_indices() {
                    Some(indices) => indices.into_u32().collect(),
                    // Unindexed triangle soup
                    None => (0..positions.len() as u32).collect(),
                };
                primitives.push(Primitive { positions, indices });
            }
            if valid && !primitives.is_empty() {
                meshes.push(Some(Mesh {
                    name: mesh_name,
                    primitives,
                }));
            } else {
                tracing::error!(model = name, mesh = %mesh_name, "mesh has no usable geometry");
                meshes.push(None);
            }
        }

        Some(Model {
            name: name.to_string(),
            meshes,
            hash,
        })
    }

    pub fn mesh(&self, index: usize) -> Option<&Mesh> {
        self.meshes.get(index).and_then(Option::as_ref)
    }

    pub fn mesh_count(&self) -> usize {
        self.meshes.len()
    }
}
