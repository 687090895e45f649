//! Noise gate for the capture path.
//!
//! Opens when the frame level exceeds the threshold and stays open for a
//! hold window after the level drops, so word endings are not clipped.

/// Hold time after the last above-threshold frame, in milliseconds.
pub const GATE_HOLD_MS: u32 = 200;

#[derive(Debug, Clone)]
pub struct NoiseGate {
    threshold_db: f32,
    hold_frames: u32,
    silent_count: u32,
    open: bool,
}

impl NoiseGate {
    /// `threshold_db` is the gate threshold in dBFS (typically -60 to 0).
    /// `frame_ms` is the duration of each frame (20 for this system).
    pub fn new(threshold_db: f32, frame_ms: u32) -> Self {
        let hold_frames = if frame_ms > 0 {
            GATE_HOLD_MS / frame_ms
        } else {
            10
        };
        Self {
            threshold_db,
            hold_frames,
            silent_count: hold_frames + 1,
            open: false,
        }
    }

    /// Feed one frame's level in dBFS; returns whether the gate is open.
    pub fn update(&mut self, level_db: f32) -> bool {
        if level_db > self.threshold_db {
            self.silent_count = 0;
            self.open = true;
        } else {
            self.silent_count = self.silent_count.saturating_add(1);
            if self.silent_count > self.hold_frames {
                self.open = false;
            }
        }
        self.open
    }

    pub fn set_threshold_db(&mut self, db: f32) {
        self.threshold_db = db.clamp(crate::level::SILENCE_DB, 0.0);
    }

    pub fn threshold_db(&self) -> f32 {
        self.threshold_db
    }
}
