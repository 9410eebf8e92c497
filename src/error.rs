//! # Error Handling
//!
//! This module defines the error types used across the voice pipeline and how
//! they're converted from the lower-level library errors they wrap.
//!
//! ## Error Categories:
//! - **Configuration**: Missing credential or invalid settings (blocks session open)
//! - **PermissionDenied**: Microphone could not be acquired (aborts the session)
//! - **Connection**: Remote stream open/transport failure (session forced to disconnected)
//! - **MalformedAudio**: Inbound audio payload could not be decoded (chunk is skipped)
//! - **Audio**: Output device failures (no device, unsupported format)
//!
//! ## Propagation Policy:
//! Every failure is caught at the boundary where it occurs and converted into a
//! human-readable status string plus a state transition. None of these errors
//! should escape to crash the process.

use std::fmt;

/// Custom error types for the voice pipeline.
///
/// ## Usage Example:
/// ```rust
/// return Err(AppError::Configuration("API key not configured".to_string()));
/// ```
#[derive(Debug)]
pub enum AppError {
    /// Missing credential or invalid configuration values
    Configuration(String),

    /// Microphone access was denied or no usable input device exists
    PermissionDenied(String),

    /// Remote connection could not be opened or the stream failed
    Connection(String),

    /// Inbound audio payload failed to decode (bad base64, odd byte length)
    MalformedAudio(String),

    /// Output device problems (no device available, format unsupported)
    Audio(String),
}

/// Human-readable formatting for each error variant.
///
/// Used when an error is surfaced as status text or written to the log.
impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            AppError::PermissionDenied(msg) => write!(f, "Permission denied: {}", msg),
            AppError::Connection(msg) => write!(f, "Connection error: {}", msg),
            AppError::MalformedAudio(msg) => write!(f, "Malformed audio: {}", msg),
            AppError::Audio(msg) => write!(f, "Audio error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

/// Automatic conversion from configuration loading errors.
///
/// ## When this happens:
/// - config.toml has invalid syntax
/// - An APP_* environment variable has the wrong shape
/// - Configuration values fail deserialization
impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Configuration(err.to_string())
    }
}

/// Automatic conversion from WebSocket transport errors.
///
/// Any tungstenite failure (handshake, TLS, protocol) is a connection error:
/// the session is forced to `disconnected` and the user may retry manually.
impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        AppError::Connection(err.to_string())
    }
}

/// Automatic conversion from JSON errors on the wire.
///
/// A message that cannot be serialized or parsed means the stream is not
/// speaking the expected protocol, so it is treated as a connection failure.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Connection(format!("JSON error: {}", err))
    }
}

/// Automatic conversion from base64 decode failures.
///
/// Inbound audio payloads arrive base64-encoded; a decode failure marks the
/// chunk as malformed so the caller can skip it without tearing down playback.
impl From<base64::DecodeError> for AppError {
    fn from(err: base64::DecodeError) -> Self {
        AppError::MalformedAudio(format!("base64 decode failed: {}", err))
    }
}

/// Type alias for Results that use our custom error type.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_formatting() {
        let err = AppError::Configuration("API key not configured".to_string());
        assert_eq!(err.to_string(), "Configuration error: API key not configured");

        let err = AppError::MalformedAudio("odd byte length".to_string());
        assert_eq!(err.to_string(), "Malformed audio: odd byte length");
    }

    #[test]
    fn test_base64_conversion() {
        let decode_err = base64::Engine::decode(
            &base64::engine::general_purpose::STANDARD,
            "not base64!!",
        )
        .unwrap_err();
        let err: AppError = decode_err.into();
        assert!(matches!(err, AppError::MalformedAudio(_)));
    }
}
