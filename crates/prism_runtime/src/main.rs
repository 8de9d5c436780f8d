//! Prism Engine Runtime
//!
//! Boots the engine: initializes logging, stages the startup scene, starts
//! the physics thread, and runs main-thread housekeeping.

use anyhow::Result;
use prism_runtime::Engine;
use std::time::Duration;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut asset_dir = String::from("assets");
    let mut scene = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--assets" => {
                asset_dir = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--assets requires a directory"))?;
            }
            name if scene.is_none() => scene = Some(name.to_string()),
            other => anyhow::bail!("unexpected argument: {other}"),
        }
    }

    tracing::info!(version = prism_core::VERSION, "Prism Engine starting");
    let mut engine = Engine::new(asset_dir);

    if let Some(scene) = scene.as_deref() {
        engine.load_scene(scene)?;
    }
    engine.start(false)?;

    // Main-thread housekeeping: sweep unused refs and report cadence
    while engine.is_running() {
        std::thread::sleep(Duration::from_secs(1));
        engine.tick();
        tracing::debug!(physics_fps = engine.physics_fps(), "engine tick");
    }

    engine.stop();
    Ok(())
}
