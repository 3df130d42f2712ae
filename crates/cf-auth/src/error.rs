//! Credential authority errors

use cf_core::StorageError;
use thiserror::Error;

/// Why a certificate was not accepted
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CertError {
    /// Outside the validity window
    #[error("Certificate expired")]
    Expired,

    /// No trusted key for the claimed domain signed it
    #[error("Unknown certificate authority")]
    UnknownAuthority,

    #[error("Bad certificate signature")]
    BadSignature,

    /// The role is not one the verifier accepts
    #[error("Role not permitted")]
    RoleNotPermitted,

    #[error("Malformed certificate: {0}")]
    Malformed(String),
}

/// Credential authority operation errors
///
/// Callers across a trust boundary only ever see `AccessDenied` for
/// authentication failures; the other variants are for the signup flow and
/// for trusted in-process callers.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Access denied")]
    AccessDenied,

    /// The requester's role may not request the certificate it asked for
    #[error("Untrusted requester")]
    UntrustedRequester,

    #[error("Signup token not found")]
    TokenNotFound,

    #[error("Signup token already used")]
    TokenAlreadyUsed,

    #[error("Bad second factor")]
    BadSecondFactor,

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad parameter: {0}")]
    BadParameter(String),

    #[error("Certificate error: {0}")]
    Cert(#[from] CertError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AuthError {
    pub fn is_access_denied(&self) -> bool {
        matches!(self, AuthError::AccessDenied)
    }
}

impl From<serde_json::Error> for AuthError {
    fn from(e: serde_json::Error) -> Self {
        AuthError::Storage(StorageError::Encoding(e))
    }
}
