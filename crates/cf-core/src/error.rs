//! Core error types for the cluster fabric

use cf_protocol::{ErrorCode, ProtocolError};
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type
#[derive(Error, Debug)]
pub enum FabricError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reverse tunnel errors
#[derive(Error, Debug)]
pub enum TunnelError {
    /// No live tunnel is registered for the site
    #[error("Site unreachable: {0}")]
    SiteUnreachable(String),

    /// The far end did not acknowledge a channel in time
    #[error("Tunnel timeout")]
    TunnelTimeout,

    /// The tunnel carrying the channel was torn down
    #[error("Tunnel lost")]
    TunnelLost,

    /// The site's certificate did not verify for the claimed domain
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// The far end refused the channel
    #[error("Channel rejected ({code:?}): {reason}")]
    ChannelRejected { code: ErrorCode, reason: String },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Errors on a single byte pipe (virtual channel or direct connection)
#[derive(Error, Debug)]
pub enum ConduitError {
    /// The tunnel carrying this channel is gone
    #[error("Tunnel lost")]
    TunnelLost,

    /// Send attempted after the pipe was closed
    #[error("Conduit closed")]
    Closed,

    /// The channel was reset because its reader fell behind
    #[error("Channel overrun")]
    Overrun,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Interactive session errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session closed: {0}")]
    SessionClosed(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Spawning the session's process failed
    #[error("Spawn failed: {0}")]
    SpawnFailed(String),

    #[error("Access denied")]
    AccessDenied,

    #[error("Session limit exceeded")]
    LimitExceeded,

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Conduit error: {0}")]
    Conduit(#[from] ConduitError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl SessionError {
    /// Wire code reported to participants
    pub fn code(&self) -> ErrorCode {
        match self {
            SessionError::SessionClosed(_) => ErrorCode::SessionClosed,
            SessionError::SessionNotFound(_) => ErrorCode::SessionNotFound,
            SessionError::SpawnFailed(_) => ErrorCode::SpawnFailed,
            SessionError::AccessDenied => ErrorCode::AccessDenied,
            SessionError::LimitExceeded => ErrorCode::LimitExceeded,
            SessionError::UnexpectedMessage(_) | SessionError::Protocol(_) => {
                ErrorCode::InvalidMessage
            }
            SessionError::Conduit(_) => ErrorCode::Unknown,
        }
    }
}

/// Storage collaborator errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_error_codes() {
        assert_eq!(
            SessionError::SessionClosed("s".into()).code(),
            ErrorCode::SessionClosed
        );
        assert_eq!(
            SessionError::SpawnFailed("no shell".into()).code(),
            ErrorCode::SpawnFailed
        );
        assert_eq!(SessionError::AccessDenied.code(), ErrorCode::AccessDenied);
    }

    #[test]
    fn test_errors_nest_into_fabric_error() {
        let err: FabricError = TunnelError::TunnelTimeout.into();
        assert!(matches!(err, FabricError::Tunnel(TunnelError::TunnelTimeout)));
    }
}
