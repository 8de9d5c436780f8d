//! Frame timing and measured-FPS tracking for registered threads

use super::ring_buffer::RingBuffer;
use std::time::{Duration, Instant};

pub struct FrameTimer {
    frame_start: Instant,
    frame_times: RingBuffer<Duration>,
    window_start: Instant,
    window_frames: u32,
    measured_fps: u32,
}

impl FrameTimer {
    pub fn new(capacity: usize) -> Self {
        let now = Instant::now();
        Self {
            frame_start: now,
            frame_times: RingBuffer::new(capacity),
            window_start: now,
            window_frames: 0,
            measured_fps: 0,
        }
    }

    pub fn begin(&mut self) {
        self.frame_start = Instant::now();
    }

    pub fn end(&mut self) {
        let now = Instant::now();
        self.frame_times.push(now - self.frame_start);

        // Measured FPS updates once per wall-clock second
        self.window_frames += 1;
        let window = now - self.window_start;
        if window >= Duration::from_secs(1) {
            self.measured_fps = (self.window_frames as f64 / window.as_secs_f64()).round() as u32;
            self.window_start = now;
            self.window_frames = 0;
        }
    }

    /// Frames completed over the last full measurement window.
    pub fn measured_fps(&self) -> u32 {
        self.measured_fps
    }

    pub fn fps(&self) -> f64 {
        let avg = self.frame_times.average();
        if avg.as_secs_f64() > 0.0 {
            1.0 / avg.as_secs_f64()
        } else {
            0.0
        }
    }

    pub fn frame_time_ms(&self) -> f64 {
        self.frame_times.average().as_secs_f64() * 1000.0
    }

    pub fn frame_time_range_ms(&self) -> (f64, f64) {
        let (min, max) = self.frame_times.min_max();
        (min.as_secs_f64() * 1000.0, max.as_secs_f64() * 1000.0)
    }
}
