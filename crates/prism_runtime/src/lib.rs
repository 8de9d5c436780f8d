//! Prism Engine Runtime
//!
//! The top-level Engine context wiring core, assets, and physics together.

mod engine;

pub use engine::Engine;
