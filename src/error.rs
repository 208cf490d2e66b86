//! # Error Handling
//!
//! This module defines the error taxonomy for the voice client and how the
//! lower-level library errors (cpal, tungstenite, serde_json, base64, config)
//! are folded into it.
//!
//! ## Error Categories:
//! - **Device**: microphone/speaker missing, permission denied, device busy.
//!   Fatal to the `start()` of that pipeline only.
//! - **Decode**: malformed Base64 or JSON frame. The frame is dropped and the
//!   session continues.
//! - **Transport**: socket failure. The session transitions to `Closed`; there
//!   is no automatic reconnect.
//! - **ProtocolViolation**: a frame that is JSON but not an object. Ignored.
//! - **Config**: configuration file or environment problems.
//! - **Internal**: anything else (closed channels, joined threads, ...).
//!
//! ## Policy:
//! User-visible failures become system log entries in the session, never
//! panics, so the orchestration loop is never interrupted by protocol errors.

use std::fmt;

/// Custom error types for the client.
///
/// ## Usage Example:
/// ```rust,ignore
/// return Err(AppError::Device("No input device available".to_string()));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Audio device could not be opened or started
    Device(String),

    /// Malformed Base64 payload or JSON frame
    Decode(String),

    /// WebSocket failure (connect, read, write)
    Transport(String),

    /// Frame parsed as JSON but did not match any known message shape
    ProtocolViolation(String),

    /// Configuration file or environment variable problems
    Config(String),

    /// Internal failures (closed channels, worker threads that died, ...)
    Internal(String),
}

impl AppError {
    /// Machine-readable error kind, used as a structured logging field.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Device(_) => "device_error",
            AppError::Decode(_) => "decode_error",
            AppError::Transport(_) => "transport_error",
            AppError::ProtocolViolation(_) => "protocol_violation",
            AppError::Config(_) => "config_error",
            AppError::Internal(_) => "internal_error",
        }
    }

    /// Whether this error terminates the session it occurred in.
    ///
    /// Only transport failures end a session. Device failures end the
    /// pipeline that raised them; decode errors and protocol violations only
    /// drop the offending frame.
    pub fn terminates_session(&self) -> bool {
        matches!(self, AppError::Transport(_))
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Device(msg) => write!(f, "Audio device error: {}", msg),
            AppError::Decode(msg) => write!(f, "Decode error: {}", msg),
            AppError::Transport(msg) => write!(f, "Transport error: {}", msg),
            AppError::ProtocolViolation(msg) => write!(f, "Protocol violation: {}", msg),
            AppError::Config(msg) => write!(f, "Configuration error: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

/// Automatic conversion from anyhow::Error to AppError.
///
/// When you use `?` with an anyhow::Error inside a function returning
/// `AppResult`, it becomes an `AppError::Internal`.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parse failures are always about a frame we received or a settings
/// file we read, so they count as decode errors.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Decode(format!("JSON parsing error: {}", err))
    }
}

impl From<base64::DecodeError> for AppError {
    fn from(err: base64::DecodeError) -> Self {
        AppError::Decode(format!("Base64 decoding error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        AppError::Transport(err.to_string())
    }
}

/// cpal reports a different error type for every step of opening a stream.
/// They all mean the same thing to us: the device could not be used.
macro_rules! device_error_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for AppError {
                fn from(err: $ty) -> Self {
                    AppError::Device(err.to_string())
                }
            }
        )*
    };
}

device_error_from!(
    cpal::DevicesError,
    cpal::DeviceNameError,
    cpal::DefaultStreamConfigError,
    cpal::SupportedStreamConfigsError,
    cpal::BuildStreamError,
    cpal::PlayStreamError,
    cpal::PauseStreamError,
);

/// Type alias for Results that use our custom error type.
///
/// ## Usage Example:
/// ```rust,ignore
/// fn decode(frame: &str) -> AppResult<Vec<u8>> {
///     base64_decode(frame)
/// }
/// ```
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transport_errors_end_the_session() {
        assert!(AppError::Transport("reset".into()).terminates_session());
        assert!(!AppError::Decode("bad".into()).terminates_session());
        assert!(!AppError::Device("busy".into()).terminates_session());
        assert!(!AppError::ProtocolViolation("?".into()).terminates_session());
    }

    #[test]
    fn test_json_errors_become_decode_errors() {
        let err: AppError = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err()
            .into();
        assert_eq!(err.kind(), "decode_error");
        assert!(err.to_string().starts_with("Decode error"));
    }
}
