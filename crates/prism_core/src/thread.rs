//! Registered thread runtime
//!
//! Long-running engine loops (physics, render, asset) are hosted as
//! cooperatively-paused threads with a fixed frame interval. A paused thread
//! sits in step mode, running exactly as many frames as [`RegisteredThread::step`]
//! requests; a stopping thread exits at the next loop head.

use parking_lot::{Condvar, Mutex};
use prism_metrics::FrameTimer;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Extra slack when a frame overruns its interval, so other threads get a
/// chance to start transactions before the next frame begins.
const OVERRUN_GRACE: Duration = Duration::from_nanos(100);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ThreadState {
    Stopped = 0,
    Started = 1,
    Stopping = 2,
}

impl ThreadState {
    fn from_u32(value: u32) -> ThreadState {
        match value {
            1 => ThreadState::Started,
            2 => ThreadState::Stopping,
            _ => ThreadState::Stopped,
        }
    }
}

/// The body of a registered thread.
pub trait ThreadHandler: Send {
    /// Called once on the worker before the first frame. Returning false
    /// stops the thread.
    fn thread_init(&mut self) -> bool {
        true
    }

    /// Called every interval. Returning false skips the frame body while
    /// preserving cadence.
    fn pre_frame(&mut self) -> bool {
        true
    }

    /// One frame of work.
    fn frame(&mut self);

    /// Called after the frame body (or the step batch, in step mode).
    fn post_frame(&mut self, _step_mode: bool) {}
}

struct ThreadShared {
    state: AtomicU32,
    state_lock: Mutex<()>,
    state_cv: Condvar,
    step_mode: AtomicBool,
    step_count: AtomicU64,
    max_step_count: AtomicU64,
    step_lock: Mutex<()>,
    step_cv: Condvar,
    measured_fps: AtomicU32,
}

impl ThreadShared {
    fn new() -> Self {
        Self {
            state: AtomicU32::new(ThreadState::Stopped as u32),
            state_lock: Mutex::new(()),
            state_cv: Condvar::new(),
            step_mode: AtomicBool::new(false),
            step_count: AtomicU64::new(0),
            max_step_count: AtomicU64::new(0),
            step_lock: Mutex::new(()),
            step_cv: Condvar::new(),
            measured_fps: AtomicU32::new(0),
        }
    }

    fn state(&self) -> ThreadState {
        ThreadState::from_u32(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ThreadState) {
        let _guard = self.state_lock.lock();
        self.state.store(state as u32, Ordering::Release);
        self.state_cv.notify_all();
    }

    fn try_transition(&self, from: ThreadState, to: ThreadState) -> bool {
        let _guard = self.state_lock.lock();
        let ok = self
            .state
            .compare_exchange(
                from as u32,
                to as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if ok {
            self.state_cv.notify_all();
        }
        ok
    }
}

/// Resets the state to Stopped when the worker exits by any path.
struct ExitGuard {
    shared: Arc<ThreadShared>,
    name: String,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        tracing::debug!(thread = %self.name, "registered thread stopping");
        self.shared.set_state(ThreadState::Stopped);
    }
}

/// Host for one long-running engine loop.
pub struct RegisteredThread {
    name: String,
    interval: Duration,
    shared: Arc<ThreadShared>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl RegisteredThread {
    pub fn new(name: impl Into<String>, interval: Duration) -> Self {
        Self {
            name: name.into(),
            interval,
            shared: Arc::new(ThreadShared::new()),
            handle: None,
        }
    }

    /// An interval derived from a target frame rate; zero yields between
    /// frames instead of sleeping.
    pub fn from_fps(name: impl Into<String>, frames_per_second: f64) -> Self {
        let interval = if frames_per_second > 0.0 {
            Duration::from_nanos((1e9 / frames_per_second) as u64)
        } else {
            Duration::ZERO
        };
        Self::new(name, interval)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn state(&self) -> ThreadState {
        self.shared.state()
    }

    pub fn measured_fps(&self) -> u32 {
        self.shared.measured_fps.load(Ordering::Relaxed)
    }

    /// Launch the worker. Fails (with an error log) unless currently
    /// Stopped.
    pub fn start<H: ThreadHandler + 'static>(&mut self, handler: H, start_paused: bool) -> bool {
        if !self
            .shared
            .try_transition(ThreadState::Stopped, ThreadState::Started)
        {
            tracing::error!(thread = %self.name, state = ?self.state(), "registered thread already started");
            return false;
        }
        if start_paused {
            self.pause(true);
        }

        let shared = self.shared.clone();
        let name = self.name.clone();
        let interval = self.interval;
        let builder = std::thread::Builder::new().name(name.clone());
        let handle = builder
            .spawn(move || worker(shared, name, interval, handler))
            .expect("failed to spawn registered thread");
        self.handle = Some(handle);
        true
    }

    /// Enter or leave step mode. Pausing takes effect at the next loop
    /// head; frames then only run via [`RegisteredThread::step`].
    pub fn pause(&self, pause: bool) {
        self.shared.step_mode.store(pause, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.shared.step_mode.load(Ordering::Acquire)
    }

    /// Request `count` more frames and wait until the worker has run them.
    /// Only meaningful while paused.
    pub fn step(&self, count: u64) {
        let target = self
            .shared
            .max_step_count
            .fetch_add(count, Ordering::AcqRel)
            + count;
        let mut guard = self.shared.step_lock.lock();
        while self.shared.step_count.load(Ordering::Acquire) < target {
            if self.shared.state() == ThreadState::Stopped {
                return;
            }
            self.shared
                .step_cv
                .wait_for(&mut guard, Duration::from_millis(50));
        }
    }

    /// Ask the worker to stop at the next loop head.
    pub fn stop(&self, wait_for_exit: bool) {
        if !self
            .shared
            .try_transition(ThreadState::Started, ThreadState::Stopping)
        {
            // Already stopping or stopped
            return;
        }
        if wait_for_exit {
            let mut guard = self.shared.state_lock.lock();
            while self.shared.state() != ThreadState::Stopped {
                self.shared.state_cv.wait(&mut guard);
            }
        }
    }

    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RegisteredThread {
    fn drop(&mut self) {
        self.stop(true);
        self.join();
    }
}

fn worker<H: ThreadHandler>(
    shared: Arc<ThreadShared>,
    name: String,
    interval: Duration,
    mut handler: H,
) {
    tracing::debug!(thread = %name, "registered thread started");
    let _exit = ExitGuard {
        shared: shared.clone(),
        name: name.clone(),
    };

    if !handler.thread_init() {
        return;
    }

    let mut timer = FrameTimer::new(120);
    let mut frame_end = Instant::now();
    while shared.state() == ThreadState::Started {
        if handler.pre_frame() {
            if shared.step_mode.load(Ordering::Acquire) {
                while shared.step_count.load(Ordering::Acquire)
                    < shared.max_step_count.load(Ordering::Acquire)
                {
                    timer.begin();
                    handler.frame();
                    timer.end();
                    shared.step_count.fetch_add(1, Ordering::AcqRel);
                }
                {
                    let _guard = shared.step_lock.lock();
                    shared.step_cv.notify_all();
                }
                handler.post_frame(true);
            } else {
                timer.begin();
                handler.frame();
                timer.end();
                handler.post_frame(false);
            }
            shared
                .measured_fps
                .store(timer.measured_fps(), Ordering::Relaxed);
        }

        let real_frame_end = Instant::now();
        if interval > Duration::ZERO {
            frame_end += interval;
            if real_frame_end >= frame_end {
                // Falling behind; reset the target instead of spiraling to
                // catch up, with a little slack for other threads.
                frame_end = real_frame_end + OVERRUN_GRACE;
            }
            std::thread::sleep(frame_end.saturating_duration_since(Instant::now()));
        } else {
            std::thread::yield_now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingHandler {
        frames: Arc<AtomicUsize>,
        init_ok: bool,
    }

    impl ThreadHandler for CountingHandler {
        fn thread_init(&mut self) -> bool {
            self.init_ok
        }

        fn frame(&mut self) {
            self.frames.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn start_stop_lifecycle() {
        let frames = Arc::new(AtomicUsize::new(0));
        let mut thread = RegisteredThread::new("test", Duration::from_millis(1));
        assert_eq!(thread.state(), ThreadState::Stopped);

        assert!(thread.start(
            CountingHandler {
                frames: frames.clone(),
                init_ok: true
            },
            false,
        ));
        assert!(!thread.start(
            CountingHandler {
                frames: frames.clone(),
                init_ok: true
            },
            false,
        ));

        while frames.load(Ordering::SeqCst) < 3 {
            std::thread::yield_now();
        }
        thread.stop(true);
        assert_eq!(thread.state(), ThreadState::Stopped);
    }

    #[test]
    fn failed_init_stops_thread() {
        let frames = Arc::new(AtomicUsize::new(0));
        let mut thread = RegisteredThread::new("test-init", Duration::from_millis(1));
        thread.start(
            CountingHandler {
                frames: frames.clone(),
                init_ok: false,
            },
            false,
        );
        thread.join();
        assert_eq!(thread.state(), ThreadState::Stopped);
        assert_eq!(frames.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn step_mode_runs_exact_frames() {
        let frames = Arc::new(AtomicUsize::new(0));
        let mut thread = RegisteredThread::new("test-step", Duration::from_millis(1));
        thread.start(
            CountingHandler {
                frames: frames.clone(),
                init_ok: true,
            },
            true,
        );

        // Paused from the start: no frames run on their own
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(frames.load(Ordering::SeqCst), 0);

        thread.step(3);
        assert_eq!(frames.load(Ordering::SeqCst), 3);

        thread.step(2);
        assert_eq!(frames.load(Ordering::SeqCst), 5);

        thread.stop(true);
    }
}
