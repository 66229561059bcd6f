//! Errors, state and timing configuration for back-end sessions.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use super::channel::ChannelError;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur while managing a back-end session.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Opening the channel or the handshake failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// `session_started` did not arrive in time
    #[error("Session handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// No session exists
    #[error("Not connected")]
    NotConnected,

    /// The channel was found closed while sending
    #[error("Channel closed")]
    ChannelClosed,

    /// Sending failed for another reason
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Outbound message could not be encoded
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl SessionError {
    /// Whether a disconnect followed by a fresh connect may fix this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NotConnected | Self::ChannelClosed)
    }
}

impl From<ChannelError> for SessionError {
    fn from(error: ChannelError) -> Self {
        match error {
            ChannelError::Closed => Self::ChannelClosed,
            ChannelError::Transport(msg) => Self::SendFailed(msg),
        }
    }
}

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

// =============================================================================
// Session State
// =============================================================================

/// Lifecycle of the single back-end session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No session has been opened yet
    #[default]
    Absent,
    /// Channel open, waiting for `session_started`
    Connecting,
    /// Handshake complete
    Ready,
    /// Session was closed or failed to start
    TornDown,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Absent => write!(f, "Absent"),
            SessionState::Connecting => write!(f, "Connecting"),
            SessionState::Ready => write!(f, "Ready"),
            SessionState::TornDown => write!(f, "TornDown"),
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Default wait for `session_started` after the handshake request.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(60);

/// Default interval between keepalive pings.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Timing knobs for [`super::SessionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Bound on the handshake wait
    pub ready_timeout: Duration,
    /// Interval between keepalive pings
    pub keepalive_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ready_timeout: DEFAULT_READY_TIMEOUT,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
        }
    }
}
