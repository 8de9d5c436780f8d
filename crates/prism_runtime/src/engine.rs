// engine.rs - Top-level engine context
//
// The Engine owns the process-wide subsystems (ECS instances, reference
// manager, assets, scenes, scripts, input queue) and hands references into
// the threads it hosts. Nothing here is a true global: everything flows
// from this struct.

use anyhow::{Context, Result};
use prism_asset::{Assets, SceneManager};
use prism_core::ecs::Ecs;
use prism_core::events::{Event, InputEventQueue};
use prism_core::script::ScriptManager;
use prism_core::thread::{RegisteredThread, ThreadState};
use prism_physics::{PhysicsManager, PHYSICS_FRAME_RATE};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Unused entity/signal refs are swept after this long.
const REF_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

pub struct Engine {
    ecs: Arc<Ecs>,
    assets: Arc<Assets>,
    scenes: Arc<SceneManager>,
    scripts: Arc<ScriptManager>,
    input: Arc<InputEventQueue>,
    physics_thread: RegisteredThread,
}

impl Engine {
    pub fn new(asset_dir: impl Into<PathBuf>) -> Engine {
        Engine {
            ecs: Arc::new(Ecs::new()),
            assets: Arc::new(Assets::new(asset_dir)),
            scenes: Arc::new(SceneManager::new()),
            scripts: Arc::new(ScriptManager::new()),
            input: Arc::new(InputEventQueue::new()),
            physics_thread: RegisteredThread::from_fps("Physics", PHYSICS_FRAME_RATE),
        }
    }

    pub fn ecs(&self) -> &Arc<Ecs> {
        &self.ecs
    }

    pub fn assets(&self) -> &Arc<Assets> {
        &self.assets
    }

    pub fn scenes(&self) -> &Arc<SceneManager> {
        &self.scenes
    }

    pub fn scripts(&self) -> &Arc<ScriptManager> {
        &self.scripts
    }

    /// Window/input threads push events here; the physics thread drains
    /// them at the top of each frame.
    pub fn input_sender(&self) -> prism_core::events::EventSender {
        self.input.sender()
    }

    pub fn push_input_event(&self, event: Event) {
        self.input.push(event);
    }

    /// Stage a scene. It enters the live world once the physics thread's
    /// preload gate confirms its collision assets.
    pub fn load_scene(&self, name: &str) -> Result<()> {
        self.scenes
            .load_scene(&self.ecs, &self.assets, name)
            .with_context(|| format!("loading scene '{name}'"))
    }

    /// Launch the physics thread.
    pub fn start(&mut self, start_paused: bool) -> Result<()> {
        let manager = PhysicsManager::new(
            self.ecs.clone(),
            self.assets.clone(),
            self.scenes.clone(),
            self.scripts.clone(),
            self.input.clone(),
        )
        .context("creating physics manager")?;
        if !self.physics_thread.start(manager, start_paused) {
            anyhow::bail!("physics thread already running");
        }
        tracing::info!(rate = PHYSICS_FRAME_RATE, "physics thread started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.physics_thread.state() == ThreadState::Started
    }

    pub fn physics_fps(&self) -> u32 {
        self.physics_thread.measured_fps()
    }

    /// Pause/step controls, forwarded to the physics thread.
    pub fn pause_physics(&self, pause: bool) {
        self.physics_thread.pause(pause);
    }

    pub fn step_physics(&self, frames: u64) {
        self.physics_thread.step(frames);
    }

    /// Periodic housekeeping for the main thread: sweep unused refs.
    pub fn tick(&self) {
        self.ecs.refs().tick(REF_SWEEP_INTERVAL);
    }

    pub fn stop(&mut self) {
        self.physics_thread.stop(true);
        self.physics_thread.join();
        tracing::info!("engine stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.physics_thread.stop(true);
    }
}
