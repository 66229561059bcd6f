//! Environment variable overrides.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use super::{BridgeConfig, ConfigError, ConfigResult};

pub const BACKEND_URL: &str = "BACKEND_URL";
pub const ROLE_NAME: &str = "ROLE_NAME";
pub const SESSION_READY_TIMEOUT_SECS: &str = "SESSION_READY_TIMEOUT_SECS";
pub const KEEPALIVE_INTERVAL_SECS: &str = "KEEPALIVE_INTERVAL_SECS";
pub const REPLY_TIMEOUT_SECS: &str = "REPLY_TIMEOUT_SECS";
pub const MAX_EVENT_DELAY_SECS: &str = "MAX_EVENT_DELAY_SECS";
pub const SONG_KEYWORDS: &str = "SONG_KEYWORDS";
pub const AUDIO_ENABLED: &str = "AUDIO_ENABLED";
pub const AUDIO_SAMPLE_RATE: &str = "AUDIO_SAMPLE_RATE";
pub const AUDIO_CHANNELS: &str = "AUDIO_CHANNELS";

/// Apply every set environment variable on top of `config`.
pub(super) fn apply_env(config: &mut BridgeConfig) -> ConfigResult<()> {
    if let Some(url) = var(BACKEND_URL) {
        config.backend_url = url;
    }
    if let Some(role) = var(ROLE_NAME) {
        config.role_name = role;
    }
    if let Some(secs) = parse::<u64>(SESSION_READY_TIMEOUT_SECS)? {
        config.ready_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = parse::<u64>(KEEPALIVE_INTERVAL_SECS)? {
        config.keepalive_interval = Duration::from_secs(secs);
    }
    if let Some(secs) = parse::<u64>(REPLY_TIMEOUT_SECS)? {
        config.reply_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = parse::<u64>(MAX_EVENT_DELAY_SECS)? {
        config.max_event_delay = Duration::from_secs(secs);
    }
    if let Some(list) = var(SONG_KEYWORDS) {
        config.song_keywords = split_list(&list);
    }
    if let Some(enabled) = parse_bool(AUDIO_ENABLED)? {
        config.audio_enabled = enabled;
    }
    if let Some(rate) = parse::<u32>(AUDIO_SAMPLE_RATE)? {
        config.audio_sample_rate = rate;
    }
    if let Some(channels) = parse::<u16>(AUDIO_CHANNELS)? {
        config.audio_channels = channels;
    }
    Ok(())
}

/// Trimmed value of `key`, or `None` when unset or blank.
fn var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse<T>(key: &str) -> ConfigResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    var(key)
        .map(|raw| {
            raw.parse::<T>().map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            })
        })
        .transpose()
}

fn parse_bool(key: &str) -> ConfigResult<Option<bool>> {
    let Some(raw) = var(key) else {
        return Ok(None);
    };
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?} is not a boolean"),
        }),
    }
}

/// Comma-separated list, blanks removed.
pub(super) fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
