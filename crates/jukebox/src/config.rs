//! Configuration loading and parsing.
//!
//! Defines the daemon config schema (TOML) and resolves defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;

pub use jukebox_player::config::PlaybackConfig;

/// Socket path used when neither the config nor the command line names one.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/jukebox.sock";

/// Log filter used when neither `RUST_LOG`, the config nor `--log-level` sets one.
pub const DEFAULT_LOG_FILTER: &str = "info,jukebox=info,jukebox_player=info";

/// Top-level configuration loaded from TOML.
#[derive(Debug, Default, Deserialize)]
pub struct JukeboxConfig {
    /// Unix socket the daemon listens on.
    pub socket_path: Option<String>,
    /// Output device substring match.
    pub device: Option<String>,
    /// `tracing` filter directive.
    pub log_filter: Option<String>,
    /// Playback tuning.
    pub playback: Option<PlaybackSection>,
    /// Providers by name.
    pub providers: Option<BTreeMap<String, ProviderConfig>>,
}

/// `[playback]` table.
#[derive(Debug, Default, Deserialize)]
pub struct PlaybackSection {
    pub frames_per_buffer: Option<usize>,
    pub sink_capacity: Option<usize>,
    pub retry_backoff_ms: Option<u64>,
    pub drain_timeout_ms: Option<u64>,
}

/// `[providers.<name>]` table.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderConfig {
    /// Files under `root`; track ids are relative paths.
    Local { root: String },
    /// Remote tracks; `{track}` in `url_template` is replaced by the encoded track id.
    Http {
        url_template: String,
        block_size: Option<usize>,
        timeout_ms: Option<u64>,
    },
}

impl JukeboxConfig {
    /// Load configuration from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        let cfg = toml::from_str::<JukeboxConfig>(&raw)
            .with_context(|| format!("parse config {:?}", path))?;
        Ok(cfg)
    }

    /// Load `path` when given, otherwise use defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}

/// Resolve the socket path: command line, then config, then [`DEFAULT_SOCKET_PATH`].
pub fn socket_path_from_config(cfg: &JukeboxConfig, cli: Option<&Path>) -> PathBuf {
    if let Some(path) = cli {
        return path.to_path_buf();
    }
    non_empty(cfg.socket_path.as_deref())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH))
}

/// Resolve the output device name: command line, then config.
pub fn device_from_config(cfg: &JukeboxConfig, cli: Option<&str>) -> Option<String> {
    non_empty(cli)
        .or_else(|| non_empty(cfg.device.as_deref()))
        .map(str::to_string)
}

/// Resolve the log filter: command line, then config, then [`DEFAULT_LOG_FILTER`].
///
/// `RUST_LOG` is consulted separately by the subscriber setup.
pub fn log_filter_from_config(cfg: &JukeboxConfig, cli: Option<&str>) -> String {
    non_empty(cli)
        .or_else(|| non_empty(cfg.log_filter.as_deref()))
        .unwrap_or(DEFAULT_LOG_FILTER)
        .to_string()
}

/// Build playback tuning from the `[playback]` table over the defaults.
pub fn playback_from_config(cfg: &JukeboxConfig) -> Result<PlaybackConfig> {
    let mut playback = PlaybackConfig::default();
    let Some(section) = cfg.playback.as_ref() else {
        return Ok(playback);
    };
    if let Some(frames) = section.frames_per_buffer {
        if frames == 0 {
            return Err(anyhow!("playback.frames_per_buffer must be > 0"));
        }
        playback.frames_per_buffer = frames;
    }
    if let Some(capacity) = section.sink_capacity {
        if capacity == 0 {
            return Err(anyhow!("playback.sink_capacity must be > 0"));
        }
        playback.sink_capacity = capacity;
    }
    if let Some(ms) = section.retry_backoff_ms {
        playback.retry_backoff = Duration::from_millis(ms.max(1));
    }
    if let Some(ms) = section.drain_timeout_ms {
        playback.drain_timeout = Duration::from_millis(ms);
    }
    Ok(playback)
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
