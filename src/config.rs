//! Configuration types for the interview session controller.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration for an interview session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Audio capture and amplitude analysis settings.
    pub audio: AudioConfig,
    /// Recording lifecycle settings.
    pub recording: RecordingConfig,
    /// Question playback settings (avatar wait windows).
    pub playback: PlaybackConfig,
    /// Interview backend endpoint settings.
    pub backend: BackendConfig,
    /// Avatar renderer endpoint settings.
    pub avatar: AvatarConfig,
}

/// Audio capture configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Sample rate the capture path downsamples to, in Hz.
    pub capture_sample_rate: u32,
    /// Input device name (None = system default).
    pub input_device: Option<String>,
    /// Output device name for fallback playback (None = system default).
    pub output_device: Option<String>,
    /// FFT window size for the amplitude analyser (power of two).
    ///
    /// 512 samples is 32ms at 16kHz, one analysis frame per capture chunk.
    pub analysis_window: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            capture_sample_rate: 16_000,
            input_device: None,
            output_device: None,
            analysis_window: 512,
        }
    }
}

/// Recording lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Answer time ceiling in seconds. Reaching zero forces an automatic
    /// stop, exactly as if the user had pressed stop.
    pub answer_time_limit_secs: u32,
    /// Countdown tick interval in ms.
    pub countdown_tick_ms: u64,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            answer_time_limit_secs: 120,
            countdown_tick_ms: 1_000,
        }
    }
}

/// Question playback configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// How long question 1 waits for the avatar renderer before falling back
    /// to local playback, in ms. The first question tolerates a slower
    /// cold-start connection.
    pub first_question_wait_ms: u64,
    /// Wait window for every later question, in ms.
    pub subsequent_wait_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            first_question_wait_ms: 12_000,
            subsequent_wait_ms: 8_000,
        }
    }
}

/// Interview backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL of the interview API.
    pub base_url: String,
    /// Optional bearer token attached to every request.
    pub auth_token: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5219".to_owned(),
            auth_token: None,
        }
    }
}

/// Avatar renderer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AvatarConfig {
    /// Base URL of the avatar service API.
    pub base_url: String,
    /// API key sent as the `x-avatar-api-key` header.
    pub api_key: String,
    /// Face identifier for the rendered avatar.
    pub face_id: String,
    /// Maximum renderer session length in seconds.
    pub max_session_secs: u32,
    /// Maximum renderer idle time in seconds.
    pub max_idle_secs: u32,
}

impl Default for AvatarConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.avatar.example".to_owned(),
            api_key: String::new(),
            face_id: String::new(),
            max_session_secs: 3_600,
            max_idle_secs: 600,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::SessionError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be serialized or written.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::SessionError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/viva/config.toml`.
    pub fn default_path() -> PathBuf {
        if let Ok(config) = std::env::var("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("viva").join("config.toml")
        } else if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("viva").join("config.toml")
        } else {
            PathBuf::from("/tmp/viva-config/config.toml")
        }
    }
}
