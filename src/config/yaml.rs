use serde::Deserialize;
use std::path::Path;

use super::{ConfigError, ConfigResult};

/// Complete YAML configuration structure
///
/// All fields are optional so a file may set only what it needs. Values found
/// here override environment variables.
///
/// # Example YAML structure
/// ```yaml
/// backend:
///   url: "ws://localhost:48911"
///   role_name: "assistant"
///   ready_timeout_secs: 60
///   keepalive_interval_secs: 30
///   reply_timeout_secs: 15
///
/// queue:
///   max_delay_secs: 30
///   song_keywords:
///     - "点歌"
///
/// audio:
///   enabled: true
///   sample_rate: 48000
///   channels: 1
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub backend: Option<BackendYaml>,
    pub queue: Option<QueueYaml>,
    pub audio: Option<AudioYaml>,
}

/// Back-end connection settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct BackendYaml {
    pub url: Option<String>,
    pub role_name: Option<String>,
    pub ready_timeout_secs: Option<u64>,
    pub keepalive_interval_secs: Option<u64>,
    pub reply_timeout_secs: Option<u64>,
}

/// Turn queue settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct QueueYaml {
    pub max_delay_secs: Option<u64>,
    pub song_keywords: Option<Vec<String>>,
}

/// Audio playback settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AudioYaml {
    pub enabled: Option<bool>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
}

impl YamlConfig {
    /// Load YAML configuration from a file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or the YAML is malformed.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config: YamlConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }
}
