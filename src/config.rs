//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix, plus GEMINI_API_KEY / API_KEY for the credential)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Credential environment variables (GEMINI_API_KEY, API_KEY)
//! 2. Environment variables (APP_API_MODEL, APP_AUDIO_FRAME_SIZE, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Prebuilt voice identities accepted by the live endpoint.
///
/// The selected voice must be one of these; `validate` rejects anything else.
pub const VOICES: [&str; 8] = [
    "Aoede",  // Warm, friendly female
    "Charon", // Deep, authoritative male
    "Fenrir", // Energetic, youthful male
    "Kore",   // Calm, professional female
    "Leda",   // Expressive, dynamic female
    "Orus",   // Wise, mature male
    "Puck",   // Playful, animated voice
    "Zephyr", // Smooth, conversational male
];

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Breaking configuration into logical groups (api, audio) keeps the session
/// controller's knobs apart from the audio pipeline's fixed-format parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub api: ApiConfig,
    pub audio: AudioConfig,
}

/// Settings for the remote live endpoint.
///
/// ## Fields:
/// - `api_key`: Client credential. Empty means "not configured" — session open
///   is rejected before any network call is attempted.
/// - `model`: Model identifier the streaming connection is keyed by
/// - `voice`: One of the prebuilt voice identities in [`VOICES`]
/// - `custom_instruction`: Free-text suffix appended to the base system instruction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub api_key: String,
    pub model: String,
    pub voice: String,
    pub custom_instruction: String,
}

/// Audio pipeline format parameters.
///
/// ## Fields:
/// - `capture_sample_rate`: Microphone capture rate in Hz (16000 for speech input)
/// - `frame_size`: Samples per capture frame (one frame = one outbound chunk)
/// - `playback_sample_rate`: Output clock rate in Hz (24000, matches response audio)
/// - `fade_out_ms`: Interruption fade-out window in milliseconds
/// - `clear_grace_ms`: Extra delay after the fade before the live set is cleared
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub capture_sample_rate: u32,
    pub frame_size: usize,
    pub playback_sample_rate: u32,
    pub fade_out_ms: u32,
    pub clear_grace_ms: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig {
                api_key: String::new(), // No credential by default; open() rejects
                model: "gemini-live-2.5-flash-preview".to_string(),
                voice: "Aoede".to_string(),
                custom_instruction: String::new(),
            },
            audio: AudioConfig {
                capture_sample_rate: 16000, // 16kHz speech input
                frame_size: 4096,           // ~256ms per frame at 16kHz
                playback_sample_rate: 24000,
                fade_out_ms: 30,
                clear_grace_ms: 50,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle the credential environment variables (GEMINI_API_KEY / API_KEY)
    ///
    /// ## Environment Variable Examples:
    /// - `APP_API_VOICE=Puck`: Override the voice identity
    /// - `APP_API_MODEL=...`: Override the model identifier
    /// - `GEMINI_API_KEY=...`: Set the client credential
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            // 1. Start with defaults - converts our Default impl to config format
            .add_source(config::Config::try_from(&AppConfig::default())?)
            // 2. Load from config.toml file (if it exists)
            .add_source(config::File::with_name("config").required(false))
            // 3. Load from environment variables with APP_ prefix
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        // The credential does not follow the APP_ prefix convention; it matches
        // what the hosted front end reads (API_KEY) plus the SDK-standard name.
        if let Ok(key) = env::var("GEMINI_API_KEY") {
            settings = settings.set_override("api.api_key", key)?;
        }

        if let Ok(key) = env::var("API_KEY") {
            settings = settings.set_override("api.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - The voice identity is one of the known prebuilt voices
    /// - Sample rates and frame size are nonzero
    /// - The fade-out window is nonzero (a zero-length ramp is an audible click)
    ///
    /// An empty `api_key` is allowed here: the missing credential is surfaced
    /// when the session is opened, not at startup.
    pub fn validate(&self) -> Result<()> {
        if !VOICES.contains(&self.api.voice.as_str()) {
            return Err(anyhow::anyhow!(
                "Unknown voice '{}'; expected one of {:?}",
                self.api.voice,
                VOICES
            ));
        }

        if self.api.model.is_empty() {
            return Err(anyhow::anyhow!("Model identifier cannot be empty"));
        }

        if self.audio.capture_sample_rate == 0 || self.audio.playback_sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if self.audio.frame_size == 0 {
            return Err(anyhow::anyhow!("Frame size must be greater than 0"));
        }

        if self.audio.fade_out_ms == 0 {
            return Err(anyhow::anyhow!("Fade-out window must be greater than 0"));
        }

        Ok(())
    }

    /// Whether a client credential has been configured.
    pub fn has_credential(&self) -> bool {
        !self.api.api_key.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test that the default configuration is valid and has expected values.
    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.audio.capture_sample_rate, 16000);
        assert_eq!(config.audio.playback_sample_rate, 24000);
        assert_eq!(config.audio.frame_size, 4096);
        assert!(!config.has_credential());
        assert!(config.validate().is_ok());
    }

    /// Test that validation catches invalid configurations.
    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.api.voice = "NotAVoice".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.frame_size = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.fade_out_ms = 0;
        assert!(config.validate().is_err());
    }

    /// Every entry in the voice list must pass validation.
    #[test]
    fn test_all_voices_valid() {
        for voice in VOICES {
            let mut config = AppConfig::default();
            config.api.voice = voice.to_string();
            assert!(config.validate().is_ok(), "voice {} rejected", voice);
        }
    }
}
