//! Runtime configuration
//!
//! Values come from `Default`, optionally overlaid by a JSON file and then by
//! `CONVERSE_*` environment variables.

use crate::audio::AudioFormat;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Error type for configuration loading
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub audio: AudioConfig,
    pub transport: TransportConfig,
    pub conversation: ConversationConfig,
    pub device: DeviceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub sample_width: u16,
    /// Bytes per captured frame
    pub frame_size: usize,
    pub initial_volume: u8,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            sample_width: 2,
            frame_size: 3200,
            initial_volume: 50,
        }
    }
}

impl AudioConfig {
    pub fn format(&self) -> AudioFormat {
        AudioFormat {
            sample_rate: self.sample_rate,
            sample_width: self.sample_width,
            frame_size: self.frame_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// WebSocket endpoint of the conversation service
    pub url: String,
    /// Sent as a bearer token when set
    pub access_token: Option<String>,
    pub deadline_secs: u64,
    pub reconnect_attempts: usize,
    pub reconnect_delay_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/converse".to_string(),
            access_token: None,
            deadline_secs: 185,
            reconnect_attempts: 3,
            reconnect_delay_ms: 1000,
        }
    }
}

impl TransportConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// Cap on automatic follow-on turns; 0 means unlimited
    pub max_follow_on_turns: usize,
    /// Per-turn recordings go here when set
    pub record_dir: Option<PathBuf>,
}

/// WAV files standing in for audio hardware
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub input_wav: Option<PathBuf>,
    pub output_wav: Option<PathBuf>,
}

impl Config {
    /// Defaults overlaid with `CONVERSE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os("CONVERSE_CONFIG") {
            Some(path) => Self::from_json_file(PathBuf::from(path))?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay values from `lookup`, keyed by environment variable name.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let audio = &mut self.audio;
        override_parsed(&lookup, "CONVERSE_SAMPLE_RATE", &mut audio.sample_rate)?;
        override_parsed(&lookup, "CONVERSE_SAMPLE_WIDTH", &mut audio.sample_width)?;
        override_parsed(&lookup, "CONVERSE_FRAME_SIZE", &mut audio.frame_size)?;
        override_parsed(&lookup, "CONVERSE_VOLUME", &mut audio.initial_volume)?;

        let transport = &mut self.transport;
        if let Some(url) = lookup("CONVERSE_URL") {
            transport.url = url;
        }
        if let Some(token) = lookup("CONVERSE_ACCESS_TOKEN") {
            transport.access_token = Some(token).filter(|t| !t.is_empty());
        }
        override_parsed(&lookup, "CONVERSE_DEADLINE_SECS", &mut transport.deadline_secs)?;
        override_parsed(&lookup, "CONVERSE_RECONNECT_ATTEMPTS", &mut transport.reconnect_attempts)?;
        override_parsed(&lookup, "CONVERSE_RECONNECT_DELAY_MS", &mut transport.reconnect_delay_ms)?;

        override_parsed(
            &lookup,
            "CONVERSE_MAX_FOLLOW_ON_TURNS",
            &mut self.conversation.max_follow_on_turns,
        )?;
        if let Some(dir) = lookup("CONVERSE_RECORD_DIR") {
            self.conversation.record_dir = Some(PathBuf::from(dir));
        }
        if let Some(path) = lookup("CONVERSE_INPUT_WAV") {
            self.device.input_wav = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup("CONVERSE_OUTPUT_WAV") {
            self.device.output_wav = Some(PathBuf::from(path));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let audio = &self.audio;
        if audio.sample_width != 2 {
            return Err(ConfigError::Invalid(format!(
                "sample width must be 2 bytes, got {}",
                audio.sample_width
            )));
        }
        if audio.sample_rate == 0 {
            return Err(ConfigError::Invalid("sample rate must be positive".into()));
        }
        if audio.frame_size == 0 || audio.frame_size % usize::from(audio.sample_width) != 0 {
            return Err(ConfigError::Invalid(format!(
                "frame size must be a positive multiple of the sample width, got {}",
                audio.frame_size
            )));
        }
        if audio.initial_volume > 100 {
            return Err(ConfigError::Invalid(format!(
                "volume must be 0-100, got {}",
                audio.initial_volume
            )));
        }
        if self.transport.deadline_secs == 0 {
            return Err(ConfigError::Invalid("deadline must be positive".into()));
        }
        Ok(())
    }
}

fn override_parsed<T, F>(lookup: &F, key: &'static str, slot: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup(key) {
        *slot = value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn overrides(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut config = Config::default();
        config.apply_overrides(|key| vars.get(key).cloned())?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.audio.format(), AudioFormat::default());
        assert_eq!(config.audio.initial_volume, 50);
        assert_eq!(config.transport.deadline(), Duration::from_secs(185));
        assert_eq!(config.transport.reconnect_attempts, 3);
        assert_eq!(config.transport.reconnect_delay(), Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let config = overrides(&[
            ("CONVERSE_SAMPLE_RATE", "24000"),
            ("CONVERSE_VOLUME", " 80 "),
            ("CONVERSE_URL", "wss://example.test/converse"),
            ("CONVERSE_ACCESS_TOKEN", "secret"),
            ("CONVERSE_MAX_FOLLOW_ON_TURNS", "4"),
            ("CONVERSE_RECORD_DIR", "/tmp/turns"),
        ])
        .unwrap();
        assert_eq!(config.audio.sample_rate, 24000);
        assert_eq!(config.audio.initial_volume, 80);
        assert_eq!(config.transport.url, "wss://example.test/converse");
        assert_eq!(config.transport.access_token.as_deref(), Some("secret"));
        assert_eq!(config.conversation.max_follow_on_turns, 4);
        assert_eq!(config.conversation.record_dir, Some(PathBuf::from("/tmp/turns")));
    }

    #[test]
    fn test_unparsable_value_names_the_key() {
        let err = overrides(&[("CONVERSE_FRAME_SIZE", "big")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { key: "CONVERSE_FRAME_SIZE", .. }
        ));
    }

    #[test]
    fn test_validation_rejects_bad_audio() {
        assert!(matches!(
            overrides(&[("CONVERSE_SAMPLE_WIDTH", "3")]),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            overrides(&[("CONVERSE_VOLUME", "101")]),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            overrides(&[("CONVERSE_FRAME_SIZE", "0")]),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_json_file_with_partial_sections() {
        let path = std::env::temp_dir().join(format!("rhoconverse-config-{}.json", std::process::id()));
        std::fs::write(
            &path,
            r#"{"audio": {"initial_volume": 70}, "transport": {"reconnect_attempts": 5}}"#,
        )
        .unwrap();
        let config = Config::from_json_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.audio.initial_volume, 70);
        assert_eq!(config.audio.sample_rate, 16000);
        assert_eq!(config.transport.reconnect_attempts, 5);
        assert_eq!(config.transport.deadline_secs, 185);
    }
}
