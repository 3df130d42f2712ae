//! Caller-facing errors
//!
//! Every authentication, authorization or certificate failure becomes
//! `AccessDenied` before it leaves the gateway. Transport failures keep
//! enough detail for the caller to decide whether to retry.

use thiserror::Error;

use cf_auth::AuthError;
use cf_core::{ConduitError, SessionError, TunnelError};
use cf_protocol::ErrorCode;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Access denied")]
    AccessDenied,

    #[error("Signup token not found")]
    TokenNotFound,

    #[error("Signup token already used")]
    TokenAlreadyUsed,

    #[error("Bad second factor")]
    BadSecondFactor,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Site unreachable: {0}")]
    SiteUnreachable(String),

    #[error("Tunnel timeout")]
    TunnelTimeout,

    #[error("Tunnel lost")]
    TunnelLost,

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Node unreachable: {0}")]
    NodeUnreachable(String),

    #[error("Session not found")]
    SessionNotFound,

    #[error("Session closed")]
    SessionClosed,

    #[error("Limit exceeded")]
    LimitExceeded,

    #[error("Session failed to start: {0}")]
    SpawnFailed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::AccessDenied => "access_denied",
            GatewayError::TokenNotFound => "token_not_found",
            GatewayError::TokenAlreadyUsed => "token_already_used",
            GatewayError::BadSecondFactor => "bad_second_factor",
            GatewayError::BadRequest(_) => "bad_request",
            GatewayError::SiteUnreachable(_) => "site_unreachable",
            GatewayError::TunnelTimeout => "tunnel_timeout",
            GatewayError::TunnelLost => "tunnel_lost",
            GatewayError::NodeNotFound(_) => "node_not_found",
            GatewayError::NodeUnreachable(_) => "node_unreachable",
            GatewayError::SessionNotFound => "session_not_found",
            GatewayError::SessionClosed => "session_closed",
            GatewayError::LimitExceeded => "limit_exceeded",
            GatewayError::SpawnFailed(_) => "spawn_failed",
            GatewayError::Internal(_) => "internal",
        }
    }

    /// Error reported by a node on the session layer
    pub fn from_node(code: ErrorCode, message: String) -> Self {
        match code {
            ErrorCode::AccessDenied | ErrorCode::AuthenticationFailed => GatewayError::AccessDenied,
            ErrorCode::SessionNotFound => GatewayError::SessionNotFound,
            ErrorCode::SessionClosed => GatewayError::SessionClosed,
            ErrorCode::SpawnFailed => GatewayError::SpawnFailed(message),
            ErrorCode::LimitExceeded => GatewayError::LimitExceeded,
            ErrorCode::TargetUnreachable => GatewayError::NodeUnreachable(message),
            ErrorCode::InvalidMessage | ErrorCode::Unknown => GatewayError::Internal(message),
        }
    }
}

impl From<AuthError> for GatewayError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::TokenNotFound => GatewayError::TokenNotFound,
            AuthError::TokenAlreadyUsed => GatewayError::TokenAlreadyUsed,
            AuthError::BadSecondFactor => GatewayError::BadSecondFactor,
            AuthError::BadParameter(msg) => GatewayError::BadRequest(msg),
            AuthError::AlreadyExists(what) => GatewayError::BadRequest(format!("{} already exists", what)),
            AuthError::Storage(e) => GatewayError::Internal(e.to_string()),
            AuthError::Internal(msg) => GatewayError::Internal(msg),
            AuthError::AccessDenied
            | AuthError::UntrustedRequester
            | AuthError::NotFound(_)
            | AuthError::Cert(_) => GatewayError::AccessDenied,
        }
    }
}

impl From<TunnelError> for GatewayError {
    fn from(e: TunnelError) -> Self {
        match e {
            TunnelError::SiteUnreachable(site) => GatewayError::SiteUnreachable(site),
            TunnelError::TunnelTimeout => GatewayError::TunnelTimeout,
            TunnelError::TunnelLost => GatewayError::TunnelLost,
            TunnelError::AuthenticationFailed => GatewayError::AccessDenied,
            TunnelError::ChannelRejected { code, reason } => GatewayError::from_node(code, reason),
            TunnelError::Protocol(e) => GatewayError::Internal(e.to_string()),
        }
    }
}

impl From<ConduitError> for GatewayError {
    fn from(e: ConduitError) -> Self {
        match e {
            ConduitError::TunnelLost => GatewayError::TunnelLost,
            ConduitError::Closed => GatewayError::SessionClosed,
            other => GatewayError::Internal(other.to_string()),
        }
    }
}

impl From<SessionError> for GatewayError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Conduit(e) => e.into(),
            other => GatewayError::from_node(other.code(), other.to_string()),
        }
    }
}
