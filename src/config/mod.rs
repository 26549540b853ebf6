//! Configuration management for the Beacon call client

pub mod file;

use std::path::Path;
use std::time::Duration;

use url::Url;

use crate::protocol::InitiationShape;
use crate::session::CallParams;
use crate::transport::ReconnectPolicy;
use crate::{Error, Result};

/// Default streaming endpoint
pub const DEFAULT_STREAM_URL: &str = "wss://sureco-ai-backend.onrender.com/ws/app";

/// Default turn-based API base
pub const DEFAULT_HTTP_URL: &str = "http://localhost:3000";

/// Call client configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Agent endpoints and handshake shape
    pub agent: AgentConfig,

    /// Identity parameters sent with every connection
    pub call: CallParams,

    /// Language tag for the turn-based API
    pub lang: String,

    /// Connection lifecycle tuning
    pub transport: TransportConfig,

    /// Audio pipeline configuration
    pub audio: AudioConfig,

    /// Lines kept in the event log
    pub log_capacity: usize,
}

/// Agent endpoints
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Streaming endpoint, `ws` or `wss`
    pub stream_url: String,

    /// Turn-based API base, `http` or `https`
    pub http_url: String,

    /// Initiation message shape
    pub initiation_shape: InitiationShape,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            stream_url: DEFAULT_STREAM_URL.to_string(),
            http_url: DEFAULT_HTTP_URL.to_string(),
            initiation_shape: InitiationShape::default(),
        }
    }
}

/// Connection lifecycle configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Interval between keep-alive messages while open
    pub keepalive: Duration,

    /// Reconnect backoff
    pub reconnect: ReconnectPolicy,

    /// Upper bound on the connection handshake
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            keepalive: Duration::from_secs(20),
            reconnect: ReconnectPolicy::default(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Audio pipeline configuration
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Uplink frame duration
    pub frame_duration: Duration,

    /// Uplink sample rate in Hz
    pub target_rate: u32,

    /// Open the microphone
    pub capture: bool,

    /// Open the speakers
    pub playback: bool,

    /// Utterance length in turn-based mode
    pub record_window: Duration,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            frame_duration: Duration::from_millis(100),
            target_rate: crate::audio::TARGET_SAMPLE_RATE,
            capture: true,
            playback: true,
            record_window: Duration::from_secs(4),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agent: AgentConfig::default(),
            call: CallParams::default(),
            lang: "hi-IN".to_string(),
            transport: TransportConfig::default(),
            audio: AudioConfig::default(),
            log_capacity: crate::events::DEFAULT_CAPACITY,
        }
    }
}

impl Config {
    /// Load configuration (env > toml > default)
    ///
    /// With `path`, that file must exist and parse. Without it, the standard
    /// path is tried and silently skipped when absent.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if an explicit file is unreadable or the
    /// resulting configuration is invalid
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, |key| std::env::var(key).ok())
    }

    /// Load configuration with a custom environment lookup
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if an explicit file is unreadable or the
    /// resulting configuration is invalid
    pub fn load_with_env(path: Option<&Path>, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let fc = match path {
            Some(p) => file::load_config_file_from(p)?,
            None => file::load_config_file(),
        };
        let config = Self::from_file(fc, env)?;
        config.validate()?;
        Ok(config)
    }

    fn from_file(fc: file::CallConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let initiation_shape = match env("BEACON_CALL_INITIATION_SHAPE") {
            Some(s) => parse_shape(&s)?,
            None => fc
                .agent
                .initiation_shape
                .unwrap_or(defaults.agent.initiation_shape),
        };

        let agent = AgentConfig {
            stream_url: env("BEACON_CALL_STREAM_URL")
                .or(fc.agent.stream_url)
                .unwrap_or(defaults.agent.stream_url),
            http_url: env("BEACON_CALL_HTTP_URL")
                .or(fc.agent.http_url)
                .unwrap_or(defaults.agent.http_url),
            initiation_shape,
        };

        let call = CallParams {
            agent_name: env("BEACON_CALL_AGENT_NAME")
                .or(fc.call.agent_name)
                .unwrap_or(defaults.call.agent_name),
            customer_name: env("BEACON_CALL_CUSTOMER_NAME")
                .or(fc.call.customer_name)
                .unwrap_or(defaults.call.customer_name),
            amount: env("BEACON_CALL_AMOUNT")
                .or(fc.call.amount)
                .unwrap_or(defaults.call.amount),
            due_date: env("BEACON_CALL_DUE_DATE")
                .or(fc.call.due_date)
                .unwrap_or(defaults.call.due_date),
        };

        let lang = env("BEACON_CALL_LANG")
            .or(fc.call.lang)
            .unwrap_or(defaults.lang);

        let t = fc.transport;
        let d = defaults.transport;
        let transport = TransportConfig {
            keepalive: t.keepalive_secs.map_or(d.keepalive, Duration::from_secs),
            reconnect: ReconnectPolicy {
                base_delay: t
                    .backoff_base_secs
                    .map_or(d.reconnect.base_delay, Duration::from_secs),
                max_delay: t
                    .backoff_max_secs
                    .map_or(d.reconnect.max_delay, Duration::from_secs),
                max_retry: t.max_retry.unwrap_or(d.reconnect.max_retry),
            },
            connect_timeout: t
                .connect_timeout_secs
                .map_or(d.connect_timeout, Duration::from_secs),
        };

        let a = fc.audio;
        let da = defaults.audio;
        let audio = AudioConfig {
            frame_duration: a.frame_ms.map_or(da.frame_duration, Duration::from_millis),
            target_rate: a.target_rate.unwrap_or(da.target_rate),
            capture: a.capture.unwrap_or(da.capture),
            playback: a.playback.unwrap_or(da.playback),
            record_window: a.record_secs.map_or(da.record_window, Duration::from_secs),
        };

        Ok(Self {
            agent,
            call,
            lang,
            transport,
            audio,
            log_capacity: fc.log_capacity.unwrap_or(defaults.log_capacity),
        })
    }

    /// Check URLs, rates and durations
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first invalid setting
    pub fn validate(&self) -> Result<()> {
        check_scheme(&self.agent.stream_url, &["ws", "wss"], "stream_url")?;
        check_scheme(&self.agent.http_url, &["http", "https"], "http_url")?;

        if self.audio.target_rate == 0 {
            return Err(Error::Config("audio.target_rate must be non-zero".into()));
        }
        if self.audio.frame_duration.is_zero() {
            return Err(Error::Config("audio.frame_ms must be non-zero".into()));
        }
        if self.audio.record_window.is_zero() {
            return Err(Error::Config("audio.record_secs must be non-zero".into()));
        }
        if self.transport.keepalive.is_zero() {
            return Err(Error::Config("transport.keepalive_secs must be non-zero".into()));
        }
        if self.transport.connect_timeout.is_zero() {
            return Err(Error::Config(
                "transport.connect_timeout_secs must be non-zero".into(),
            ));
        }
        if self.transport.reconnect.base_delay.is_zero() {
            return Err(Error::Config(
                "transport.backoff_base_secs must be non-zero".into(),
            ));
        }
        if self.transport.reconnect.max_delay < self.transport.reconnect.base_delay {
            return Err(Error::Config(
                "transport.backoff_max_secs must be at least backoff_base_secs".into(),
            ));
        }
        Ok(())
    }
}

fn parse_shape(s: &str) -> Result<InitiationShape> {
    match s.trim().to_ascii_lowercase().as_str() {
        "flat" => Ok(InitiationShape::Flat),
        "nested" => Ok(InitiationShape::Nested),
        other => Err(Error::Config(format!(
            "unknown initiation shape {other:?} (expected \"flat\" or \"nested\")"
        ))),
    }
}

fn check_scheme(raw: &str, allowed: &[&str], field: &str) -> Result<()> {
    let url = Url::parse(raw).map_err(|e| Error::Config(format!("agent.{field} {raw:?}: {e}")))?;
    if allowed.contains(&url.scheme()) {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "agent.{field} must use {} (got {})",
            allowed.join(" or "),
            url.scheme()
        )))
    }
}
