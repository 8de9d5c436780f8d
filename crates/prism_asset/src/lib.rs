//! Prism Asset Pipeline
//!
//! Content-addressed byte loading, the dispatch queue, and the higher-level
//! model / physics-info / scene loaders built on top of it. All loads go
//! through the worker pool and resolve as [`Async`] futures; model bytes
//! pass a token-bucket throttle so streaming stays bounded per frame.

pub mod dispatch;
pub mod model;
pub mod physics_info;
pub mod scene;
pub mod throttle;

pub use dispatch::{Async, DispatchQueue};
pub use model::{Mesh, Model, Primitive};
pub use physics_info::{HullSettings, PhysicsInfo};
pub use scene::SceneManager;
pub use throttle::TokenBucket;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::File;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AssetError {
    #[error("asset not found: {0}")]
    NotFound(String),
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {message}")]
    Parse { path: String, message: String },
    #[error(transparent)]
    Ecs(#[from] prism_core::ecs::EcsError),
}

/// Raw asset bytes plus their 128-bit content hash.
pub struct Asset {
    pub path: String,
    pub bytes: Vec<u8>,
    pub hash: u128,
}

pub fn content_hash(bytes: &[u8]) -> u128 {
    // Infallible over an in-memory cursor
    murmur3::murmur3_x64_128(&mut Cursor::new(bytes), 0).unwrap_or(0)
}

/// Default streaming budget: 64 MiB/s with a 4 MiB burst.
const DEFAULT_THROTTLE_RATE: f64 = 64.0 * 1024.0 * 1024.0;
const DEFAULT_THROTTLE_BURST: f64 = 4.0 * 1024.0 * 1024.0;

/// The asset manager. One per engine, shared by reference.
pub struct Assets {
    root: PathBuf,
    queue: DispatchQueue,
    throttle: TokenBucket,
    asset_cache: Mutex<HashMap<String, Async<Asset>>>,
    model_cache: Mutex<HashMap<String, Async<Model>>>,
    physics_info_cache: Mutex<HashMap<String, Async<PhysicsInfo>>>,
}

impl Assets {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            queue: DispatchQueue::new("AssetLoading", 2),
            throttle: TokenBucket::new(DEFAULT_THROTTLE_RATE, DEFAULT_THROTTLE_BURST),
            asset_cache: Mutex::new(HashMap::new()),
            model_cache: Mutex::new(HashMap::new()),
            physics_info_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    /// Read an asset synchronously, bypassing the cache.
    pub fn read(&self, path: &str) -> Result<Asset, AssetError> {
        let full = self.resolve(path);
        let bytes = std::fs::read(&full).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                AssetError::NotFound(path.to_string())
            } else {
                AssetError::Io {
                    path: path.to_string(),
                    source,
                }
            }
        })?;
        let hash = content_hash(&bytes);
        Ok(Asset {
            path: path.to_string(),
            bytes,
            hash,
        })
    }

    /// Load an asset through the dispatch queue. Loads for the same path
    /// share a future.
    pub fn load(self: &std::sync::Arc<Self>, path: &str) -> Async<Asset> {
        let mut cache = self.asset_cache.lock();
        if let Some(existing) = cache.get(path) {
            return existing.clone();
        }
        let assets = self.clone();
        let path_owned = path.to_string();
        let future = self.queue.dispatch(move || match assets.read(&path_owned) {
            Ok(asset) => Some(asset),
            Err(err) => {
                tracing::error!(path = %path_owned, error = %err, "asset load failed");
                None
            }
        });
        cache.insert(path.to_string(), future.clone());
        future
    }

    /// Load and decode a GLTF model by name (`models/<name>.glb` or
    /// `models/<name>.gltf`).
    pub fn load_model(self: &std::sync::Arc<Self>, name: &str) -> Async<Model> {
        let mut cache = self.model_cache.lock();
        if let Some(existing) = cache.get(name) {
            return existing.clone();
        }
        let assets = self.clone();
        let name_owned = name.to_string();
        let future = self.queue.dispatch(move || {
            let asset = assets
                .read(&format!("models/{name_owned}.glb"))
                .or_else(|_| assets.read(&format!("models/{name_owned}.gltf")));
            let asset = match asset {
                Ok(asset) => asset,
                Err(err) => {
                    tracing::error!(model = %name_owned, error = %err, "model not found");
                    return None;
                }
            };
            assets.throttle.consume(asset.bytes.len());
            Model::decode(&name_owned, &asset.bytes, asset.hash)
        });
        cache.insert(name.to_string(), future.clone());
        future
    }

    /// Load a model's physics info (`models/<name>.physics.json`). A
    /// missing document is an empty (all-defaults) info, not an error.
    pub fn load_physics_info(self: &std::sync::Arc<Self>, name: &str) -> Async<PhysicsInfo> {
        let mut cache = self.physics_info_cache.lock();
        if let Some(existing) = cache.get(name) {
            return existing.clone();
        }
        let assets = self.clone();
        let name_owned = name.to_string();
        let future = self.queue.dispatch(move || {
            match assets.read(&format!("models/{name_owned}.physics.json")) {
                Ok(asset) => Some(PhysicsInfo::parse(
                    &name_owned,
                    &String::from_utf8_lossy(&asset.bytes),
                )),
                Err(AssetError::NotFound(_)) => Some(PhysicsInfo {
                    model: name_owned.clone(),
                    ..Default::default()
                }),
                Err(err) => {
                    tracing::error!(model = %name_owned, error = %err, "physics info load failed");
                    None
                }
            }
        });
        cache.insert(name.to_string(), future.clone());
        future
    }

    /// Open a writable stream under the asset root, creating parent
    /// directories.
    pub fn output_stream(&self, path: &str) -> Result<File, AssetError> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).map_err(|source| AssetError::Io {
                path: path.to_string(),
                source,
            })?;
        }
        File::create(&full).map_err(|source| AssetError::Io {
            path: path.to_string(),
            source,
        })
    }

    /// True when a file exists under the asset root.
    pub fn exists(&self, path: &str) -> bool {
        self.resolve(path).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn load_caches_and_hashes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data.txt"), b"hello prism").unwrap();
        let assets = Arc::new(Assets::new(dir.path()));

        let a = assets.load("data.txt");
        let b = assets.load("data.txt");
        let asset = a.wait().unwrap();
        assert_eq!(asset.bytes, b"hello prism");
        assert_eq!(asset.hash, content_hash(b"hello prism"));
        assert_ne!(asset.hash, 0);
        // Same path shares the same future
        assert!(b.wait().is_some());

        let missing = assets.load("missing.txt");
        assert!(missing.wait().is_none());
    }

    #[test]
    fn output_stream_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let assets = Assets::new(dir.path());
        let mut file = assets.output_stream("cache/collision/test.bin").unwrap();
        use std::io::Write;
        file.write_all(b"x").unwrap();
        assert!(assets.exists("cache/collision/test.bin"));
    }
}
