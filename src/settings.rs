use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::audio::{CAPTURE_FRAME_SIZE, INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};
use crate::live::{Voice, DEFAULT_MODEL};

const SETTINGS_DIR_NAME: &str = "callsim";
const SETTINGS_FILE_NAME: &str = "settings.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Live model to connect to.
    pub model: String,

    /// Voice used when none is given on the command line.
    pub voice: Voice,

    /// Rate microphone frames are encoded at. The service expects 16kHz.
    pub input_sample_rate: u32,

    /// Rate of the playback mixer. Inbound audio is resampled to this when the
    /// service's declared rate differs.
    pub output_sample_rate: u32,

    /// Samples per outbound microphone frame.
    pub capture_frame_size: usize,

    /// Telemetry sampling period in ms (~60fps by default).
    pub telemetry_interval_ms: u64,

    /// Give up on a connection attempt after this long.
    pub connect_timeout_ms: u64,

    /// Outbound frames queued for the transport before new ones are dropped.
    pub outbound_queue_frames: usize,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            voice: Voice::default(),
            input_sample_rate: INPUT_SAMPLE_RATE,
            output_sample_rate: OUTPUT_SAMPLE_RATE,
            capture_frame_size: CAPTURE_FRAME_SIZE,
            telemetry_interval_ms: 16,
            connect_timeout_ms: 15_000,
            outbound_queue_frames: 32,
        }
    }
}

/// `<config dir>/callsim/settings.json`
pub fn default_settings_path() -> Result<PathBuf, String> {
    let dir = dirs::config_dir().ok_or("Could not determine config directory")?;
    Ok(dir.join(SETTINGS_DIR_NAME).join(SETTINGS_FILE_NAME))
}

pub fn load_settings(path: &Path) -> AppSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<AppSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                AppSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            AppSettings::default()
        }
    }
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
    }

    let contents =
        serde_json::to_string_pretty(settings).map_err(|e| format!("Serialize settings: {}", e))?;

    // Write to a temp file in the same directory, then rename over the target
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| format!("Write temp settings {:?}: {}", tmp_path, e))?;

    // Windows rename fails if the destination exists
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(format!("Remove existing settings file {:?}: {}", path, e));
            }
        }
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| format!("Rename temp settings {:?} to {:?}: {}", tmp_path, path, e))?;
    Ok(())
}
