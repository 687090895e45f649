//! Persistent client settings, stored as JSON in the user config
//! directory. Unknown or missing fields fall back to defaults so old
//! settings files keep loading.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // Relay endpoint
    pub server_ip: String,
    pub server_port: u16,
    /// Control-plane (bootstrap API) port.
    pub api_port: u16,

    /// Primary channel; channel 41 is reserved as the common secondary
    /// and is rejected here.
    pub channel: u8,

    // PTT and quick-switch bindings (key names or mouse1..mouse5)
    pub hotkey_primary: String,
    pub hotkey_secondary: String,
    pub hotkey_channel1: Option<String>,
    pub hotkey_channel2: Option<String>,
    pub channel1_target: u8,
    pub channel2_target: u8,

    // Audio devices (None = system default)
    pub mic_device: Option<String>,
    pub speaker_device: Option<String>,

    /// The credential. Required to connect.
    pub funk_key: Option<String>,

    // Capture pipeline
    pub noise_gate_enabled: bool,
    /// Gate threshold in dBFS.
    pub noise_gate_threshold: f32,
    pub vad_enabled: bool,
    /// VAD aggressiveness 0–3.
    pub vad_aggressiveness: u8,
    pub agc_enabled: bool,
    /// "opus" or "pcm".
    pub codec: String,

    // Output
    pub speaker_volume: f32,

    // Sound effects
    pub sounds_enabled: bool,
    pub sound_volume: f32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_ip: "127.0.0.1".into(),
            server_port: 50_000,
            api_port: 8_001,
            channel: 42,
            hotkey_primary: "f7".into(),
            hotkey_secondary: "f8".into(),
            hotkey_channel1: None,
            hotkey_channel2: None,
            channel1_target: 41,
            channel2_target: 42,
            mic_device: None,
            speaker_device: None,
            funk_key: None,
            noise_gate_enabled: false,
            noise_gate_threshold: -40.0,
            vad_enabled: true,
            vad_aggressiveness: 2,
            agc_enabled: true,
            codec: "opus".into(),
            speaker_volume: 1.0,
            sounds_enabled: true,
            sound_volume: 1.0,
        }
    }
}

/// The settings directory (~/.config/funk on Linux).
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("funk")
}

pub fn default_settings_path() -> PathBuf {
    config_dir().join("settings.json")
}

/// Load settings; any problem (missing file, parse error) yields defaults.
pub fn load(path: &PathBuf) -> Settings {
    match std::fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(settings) => settings,
            Err(e) => {
                warn!("failed to parse {}: {} — using defaults", path.display(), e);
                Settings::default()
            }
        },
        Err(_) => Settings::default(),
    }
}

/// Save atomically: write a temp file, then rename over the target.
pub fn save(path: &PathBuf, settings: &Settings) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(settings)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
