//! Level measurement shared by the gate, VAD and send pipeline.

/// Silence floor in dBFS.
pub const SILENCE_DB: f32 = -96.0;

/// Root mean square of a frame of f32 samples.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|&s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

/// Convert linear amplitude to dBFS, floored at [`SILENCE_DB`].
pub fn amplitude_to_db(amplitude: f32) -> f32 {
    if amplitude <= 0.0 {
        SILENCE_DB
    } else {
        (20.0 * amplitude.log10()).max(SILENCE_DB)
    }
}
