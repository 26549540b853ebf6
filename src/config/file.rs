//! TOML configuration file loading
//!
//! Supports `~/.config/omni/beacon/call.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::protocol::InitiationShape;
use crate::{Error, Result};

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CallConfigFile {
    /// Agent endpoints
    #[serde(default)]
    pub agent: AgentFileConfig,

    /// Who is calling whom, and about what
    #[serde(default)]
    pub call: CallFileConfig,

    /// Connection lifecycle tuning
    #[serde(default)]
    pub transport: TransportFileConfig,

    /// Audio pipeline configuration
    #[serde(default)]
    pub audio: AudioFileConfig,

    /// Lines kept in the event log
    pub log_capacity: Option<usize>,
}

/// Agent endpoint configuration
#[derive(Debug, Default, Deserialize)]
pub struct AgentFileConfig {
    /// Streaming endpoint (e.g. `wss://host/ws/app`)
    pub stream_url: Option<String>,

    /// Base URL of the turn-based HTTP API
    pub http_url: Option<String>,

    /// Initiation message shape ("flat" or "nested")
    pub initiation_shape: Option<InitiationShape>,
}

/// Call parameters
#[derive(Debug, Default, Deserialize)]
pub struct CallFileConfig {
    pub agent_name: Option<String>,
    pub customer_name: Option<String>,
    pub amount: Option<String>,
    pub due_date: Option<String>,

    /// Language tag for the turn-based API (e.g. "hi-IN")
    pub lang: Option<String>,
}

/// Connection lifecycle configuration
#[derive(Debug, Default, Deserialize)]
pub struct TransportFileConfig {
    pub keepalive_secs: Option<u64>,
    pub backoff_base_secs: Option<u64>,
    pub backoff_max_secs: Option<u64>,
    pub max_retry: Option<u32>,
    pub connect_timeout_secs: Option<u64>,
}

/// Audio configuration
#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    /// Uplink frame duration in milliseconds
    pub frame_ms: Option<u64>,

    /// Uplink sample rate in Hz
    pub target_rate: Option<u32>,

    /// Open the microphone
    pub capture: Option<bool>,

    /// Open the speakers
    pub playback: Option<bool>,

    /// Utterance length in turn-based mode, in seconds
    pub record_secs: Option<u64>,
}

/// Load the TOML config file from the standard path
///
/// Returns `CallConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> CallConfigFile {
    let Some(path) = config_file_path() else {
        return CallConfigFile::default();
    };

    if !path.exists() {
        return CallConfigFile::default();
    }

    match load_config_file_from(&path) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to load config file, using defaults"
            );
            CallConfigFile::default()
        }
    }
}

/// Load an explicitly named config file
///
/// # Errors
///
/// Returns `Error::Config` if the file cannot be read or parsed
pub fn load_config_file_from(path: &Path) -> Result<CallConfigFile> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
    let config = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))?;
    tracing::info!(path = %path.display(), "loaded config file");
    Ok(config)
}

/// Return the config file path: `~/.config/omni/beacon/call.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| {
        d.config_dir()
            .join("omni")
            .join("beacon")
            .join("call.toml")
    })
}
