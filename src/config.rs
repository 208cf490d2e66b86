//! # Configuration Management
//!
//! Loads client configuration from several sources:
//! - Default values (built into the code)
//! - TOML configuration file (`config.toml`, optional)
//! - Environment variables (with `APP_` prefix, `__` between nested keys)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (`APP_SERVER__HOST`, `APP_AUDIO__FLUSH_INTERVAL_MS`, ...)
//! 2. Configuration file (`config.toml`)
//! 3. Default values (defined in the Default impl)
//!
//! `GOOGLE_API_KEY` is checked separately: when it is set and non-empty the
//! session treats the model key as configured.
//!
//! The session settings payload sent to the server lives in its own file
//! (`session.settings_path`), JSON or TOML by extension.

use std::env;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::audio::codec::PcmOverflow;
use crate::error::{AppError, AppResult};

/// Main client configuration.
///
/// ## Sections:
/// - **server**: where to connect
/// - **audio**: device, rate and buffering parameters
/// - **session**: what the client tells the server at connect time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub audio: AudioConfig,
    pub session: SessionSettingsConfig,
}

/// Voice server endpoint.
///
/// ## Fields:
/// - `host`/`port`: server address
/// - `secure`: use `wss://` instead of `ws://`
/// - `path`: WebSocket route prefix; the session id is appended as a segment
/// - `session_id`: fixed session id, a UUID v4 is generated when unset
/// - `connect_timeout_ms`: how long `start()` waits for the socket to open
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub secure: bool,
    pub path: String,
    pub session_id: Option<String>,
    pub connect_timeout_ms: u64,
}

/// Audio pipeline parameters.
///
/// The two sample rates are fixed by the wire protocol; they are
/// configurable only so tests and odd servers can change them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub capture_sample_rate: u32,
    pub playback_sample_rate: u32,
    pub flush_interval_ms: u64,
    pub echo_cancellation: bool,
    /// 0 disables the analyser
    pub analyser_fft_size: usize,
    pub pcm_overflow: PcmOverflow,
    pub input_device: Option<String>,
    pub output_device: Option<String>,
    pub capture_queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettingsConfig {
    /// JSON or TOML file holding the settings object sent on open
    pub settings_path: Option<String>,
    pub api_key_configured: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8000,
                secure: false,
                path: "/ws".to_string(),
                session_id: None,
                connect_timeout_ms: 10_000,
            },
            audio: AudioConfig {
                capture_sample_rate: 16_000,
                playback_sample_rate: 24_000,
                flush_interval_ms: 200,
                echo_cancellation: true,
                analyser_fft_size: 256,
                pcm_overflow: PcmOverflow::Clamp,
                input_device: None,
                output_device: None,
                capture_queue_capacity: 64,
            },
            session: SessionSettingsConfig {
                settings_path: None,
                api_key_configured: false,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__HOST=voice.example.com`
    /// - `APP_SERVER__SECURE=true`
    /// - `APP_AUDIO__PCM_OVERFLOW=wrap`
    /// - `GOOGLE_API_KEY=...`: marks the API key as configured
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if env::var("GOOGLE_API_KEY").map(|k| !k.trim().is_empty()).unwrap_or(false) {
            settings = settings.set_override("session.api_key_configured", true)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Check that the values can drive a session.
    pub fn validate(&self) -> Result<()> {
        if self.server.host.trim().is_empty() {
            return Err(anyhow::anyhow!("Server host cannot be empty"));
        }

        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if !self.server.path.starts_with('/') {
            return Err(anyhow::anyhow!("Server path must start with '/'"));
        }

        if self.server.connect_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Connect timeout must be greater than 0"));
        }

        if self.audio.capture_sample_rate == 0 || self.audio.playback_sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if self.audio.flush_interval_ms == 0 {
            return Err(anyhow::anyhow!("Flush interval must be greater than 0"));
        }

        let fft = self.audio.analyser_fft_size;
        if fft != 0 && (fft < 32 || !fft.is_power_of_two()) {
            return Err(anyhow::anyhow!(
                "Analyser FFT size must be 0 or a power of two >= 32, got {}",
                fft
            ));
        }

        if self.audio.capture_queue_capacity == 0 {
            return Err(anyhow::anyhow!("Capture queue capacity must be greater than 0"));
        }

        Ok(())
    }

    /// Apply a partial JSON update, e.g. `{"server": {"port": 9000}}`.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = u16::try_from(port)
                    .map_err(|_| anyhow::anyhow!("Server port out of range: {}", port))?;
            }
            if let Some(secure) = server.get("secure").and_then(|v| v.as_bool()) {
                self.server.secure = secure;
            }
            if let Some(path) = server.get("path").and_then(|v| v.as_str()) {
                self.server.path = path.to_string();
            }
            if let Some(id) = server.get("session_id").and_then(|v| v.as_str()) {
                self.server.session_id = Some(id.to_string());
            }
        }

        if let Some(audio) = partial_config.get("audio") {
            if let Some(interval) = audio.get("flush_interval_ms").and_then(|v| v.as_u64()) {
                self.audio.flush_interval_ms = interval;
            }
            if let Some(aec) = audio.get("echo_cancellation").and_then(|v| v.as_bool()) {
                self.audio.echo_cancellation = aec;
            }
            if let Some(overflow) = audio.get("pcm_overflow") {
                self.audio.pcm_overflow = serde_json::from_value(overflow.clone())?;
            }
            if let Some(device) = audio.get("input_device").and_then(|v| v.as_str()) {
                self.audio.input_device = Some(device.to_string());
            }
            if let Some(device) = audio.get("output_device").and_then(|v| v.as_str()) {
                self.audio.output_device = Some(device.to_string());
            }
        }

        if let Some(session) = partial_config.get("session") {
            if let Some(path) = session.get("settings_path").and_then(|v| v.as_str()) {
                self.session.settings_path = Some(path.to_string());
            }
            if let Some(flag) = session.get("api_key_configured").and_then(|v| v.as_bool()) {
                self.session.api_key_configured = flag;
            }
        }

        self.validate()?;
        Ok(())
    }

    /// Configured session id, or a fresh UUID v4.
    pub fn session_id(&self) -> String {
        self.server
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string())
    }

    /// `{ws|wss}://host:port{path}/{session_id}?is_audio=true`
    pub fn websocket_url(&self, session_id: &str) -> String {
        let scheme = if self.server.secure { "wss" } else { "ws" };
        format!(
            "{}://{}:{}{}/{}?is_audio=true",
            scheme,
            self.server.host,
            self.server.port,
            self.server.path.trim_end_matches('/'),
            session_id
        )
    }

    /// Read the session settings payload, if a file is configured.
    pub fn load_session_settings(&self) -> AppResult<Option<Value>> {
        match self.session.settings_path.as_deref() {
            Some(path) => load_settings_file(Path::new(path)).map(Some),
            None => Ok(None),
        }
    }
}

/// Parse a settings file as TOML when it ends in `.toml`, JSON otherwise.
pub fn load_settings_file(path: &Path) -> AppResult<Value> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| AppError::Config(format!("Cannot read {}: {}", path.display(), e)))?;
    parse_settings(&text, path.extension().and_then(|e| e.to_str()))
}

fn parse_settings(text: &str, extension: Option<&str>) -> AppResult<Value> {
    let value: Value = match extension {
        Some("toml") => {
            let table: toml::Table = toml::from_str(text)
                .map_err(|e| AppError::Config(format!("Invalid TOML settings: {}", e)))?;
            serde_json::to_value(table)?
        }
        _ => serde_json::from_str(text)
            .map_err(|e| AppError::Config(format!("Invalid JSON settings: {}", e)))?,
    };

    if !value.is_object() {
        return Err(AppError::Config("Session settings must be an object".to_string()));
    }
    Ok(value)
}
