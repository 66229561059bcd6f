//! Configuration module for the chat bridge
//!
//! Settings come from .env files, environment variables and an optional YAML
//! file. Priority: YAML > ENV vars > .env values > defaults.
//!
//! # Modules
//! - `yaml`: YAML configuration file loading
//! - `env`: Environment variable loading
//!
//! # Example
//! ```rust,no_run
//! use waav_chat_bridge::config::BridgeConfig;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load from environment variables only
//! let config = BridgeConfig::from_env()?;
//!
//! // Load from YAML file with environment variable overrides
//! let config = BridgeConfig::from_file(&PathBuf::from("bridge.yaml"))?;
//!
//! println!("Back-end session at {}", config.session_url()?);
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::core::audio::PcmFormat;
use crate::core::ingress::default_song_keywords;
use crate::core::session::SessionConfig;
use crate::core::turn::TurnConfig;

mod env;
mod yaml;

pub use yaml::{AudioYaml, BackendYaml, QueueYaml, YamlConfig};

/// Default back-end base URL.
pub const DEFAULT_BACKEND_URL: &str = "ws://localhost:48911";

/// Default character/role name.
pub const DEFAULT_ROLE_NAME: &str = "assistant";

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Invalid back-end URL: {0}")]
    InvalidUrl(String),
}

/// Result type for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Bridge configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Back-end base URL (`ws://` or `wss://`)
    pub backend_url: String,
    /// Character the back-end should play
    pub role_name: String,
    /// Wait for `session_started`
    pub ready_timeout: Duration,
    /// Interval between keepalive pings
    pub keepalive_interval: Duration,
    /// Idle timeout while collecting a reply
    pub reply_timeout: Duration,
    /// Queued events older than this are dropped
    pub max_event_delay: Duration,
    /// Chat messages containing any of these are not answered
    pub song_keywords: Vec<String>,
    pub audio_enabled: bool,
    pub audio_sample_rate: u32,
    pub audio_channels: u16,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        let session = SessionConfig::default();
        let turn = TurnConfig::default();
        let format = PcmFormat::default();
        Self {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            role_name: DEFAULT_ROLE_NAME.to_string(),
            ready_timeout: session.ready_timeout,
            keepalive_interval: session.keepalive_interval,
            reply_timeout: turn.reply_timeout,
            max_event_delay: turn.max_delay,
            song_keywords: default_song_keywords(),
            audio_enabled: true,
            audio_sample_rate: format.sample_rate,
            audio_channels: format.channels,
        }
    }
}

impl BridgeConfig {
    /// Load configuration from environment variables.
    ///
    /// The .env file is loaded by the binary before this runs, so its values
    /// are visible here unless a real environment variable shadows them.
    pub fn from_env() -> ConfigResult<Self> {
        let mut config = Self::default();
        env::apply_env(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file on top of the environment.
    ///
    /// Priority order (highest to lowest):
    /// 1. YAML file values
    /// 2. Environment variables (actual ENV vars override .env values)
    /// 3. .env file values
    /// 4. Default values
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, an environment
    /// variable has an invalid format, or validation fails.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let yaml_config = YamlConfig::from_file(path)?;

        let mut config = Self::default();
        env::apply_env(&mut config)?;
        config.apply_yaml(yaml_config);
        config.validate()?;
        Ok(config)
    }

    /// Override the role name, e.g. from the command line.
    pub fn with_role(mut self, role_name: impl Into<String>) -> ConfigResult<Self> {
        self.role_name = role_name.into();
        self.validate()?;
        Ok(self)
    }

    fn apply_yaml(&mut self, yaml: YamlConfig) {
        if let Some(backend) = yaml.backend {
            if let Some(url) = backend.url {
                self.backend_url = url;
            }
            if let Some(role) = backend.role_name {
                self.role_name = role;
            }
            if let Some(secs) = backend.ready_timeout_secs {
                self.ready_timeout = Duration::from_secs(secs);
            }
            if let Some(secs) = backend.keepalive_interval_secs {
                self.keepalive_interval = Duration::from_secs(secs);
            }
            if let Some(secs) = backend.reply_timeout_secs {
                self.reply_timeout = Duration::from_secs(secs);
            }
        }

        if let Some(queue) = yaml.queue {
            if let Some(secs) = queue.max_delay_secs {
                self.max_event_delay = Duration::from_secs(secs);
            }
            if let Some(keywords) = queue.song_keywords {
                self.song_keywords = keywords;
            }
        }

        if let Some(audio) = yaml.audio {
            if let Some(enabled) = audio.enabled {
                self.audio_enabled = enabled;
            }
            if let Some(rate) = audio.sample_rate {
                self.audio_sample_rate = rate;
            }
            if let Some(channels) = audio.channels {
                self.audio_channels = channels;
            }
        }
    }

    /// Check ranges and the URL.
    pub fn validate(&self) -> ConfigResult<()> {
        for (key, value) in [
            ("ready_timeout", self.ready_timeout),
            ("keepalive_interval", self.keepalive_interval),
            ("reply_timeout", self.reply_timeout),
            ("max_event_delay", self.max_event_delay),
        ] {
            if value.is_zero() {
                return Err(invalid(key, "must be greater than zero"));
            }
        }

        if self.role_name.trim().is_empty() {
            return Err(invalid("role_name", "must not be empty"));
        }
        if self.audio_sample_rate == 0 {
            return Err(invalid("audio_sample_rate", "must be greater than zero"));
        }
        if !(1..=2).contains(&self.audio_channels) {
            return Err(invalid("audio_channels", "must be 1 or 2"));
        }

        self.session_url().map(|_| ())
    }

    /// Session endpoint: `{backend_url}/ws/{role_name}`, with the role name
    /// percent-encoded as a single path segment.
    pub fn session_url(&self) -> ConfigResult<Url> {
        let mut url = Url::parse(&self.backend_url)
            .map_err(|e| ConfigError::InvalidUrl(format!("{}: {e}", self.backend_url)))?;

        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ConfigError::InvalidUrl(format!(
                "{}: scheme must be ws or wss",
                self.backend_url
            )));
        }

        url.path_segments_mut()
            .map_err(|_| ConfigError::InvalidUrl(format!("{}: not a base URL", self.backend_url)))?
            .pop_if_empty()
            .push("ws")
            .push(&self.role_name);
        Ok(url)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            ready_timeout: self.ready_timeout,
            keepalive_interval: self.keepalive_interval,
        }
    }

    pub fn turn_config(&self) -> TurnConfig {
        TurnConfig {
            max_delay: self.max_event_delay,
            reply_timeout: self.reply_timeout,
        }
    }

    pub fn pcm_format(&self) -> PcmFormat {
        PcmFormat {
            sample_rate: self.audio_sample_rate,
            channels: self.audio_channels,
        }
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}
