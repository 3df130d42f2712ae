//! Persisted account, signup and session records

use serde::{Deserialize, Serialize};

use crate::roles::Role;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub name: String,
    #[serde(default)]
    pub password_hash: Option<String>,
    /// Hex encoded HOTP seed
    #[serde(default)]
    pub otp_seed: Option<String>,
    /// Next HOTP counter to accept
    #[serde(default)]
    pub otp_counter: u64,
    #[serde(default)]
    pub allowed_logins: Vec<String>,
    #[serde(default = "default_role")]
    pub role: Role,
    pub created_at: u64,
}

fn default_role() -> Role {
    Role::User
}

impl UserRecord {
    pub fn new(name: impl Into<String>, now: u64) -> Self {
        Self {
            name: name.into(),
            password_hash: None,
            otp_seed: None,
            otp_counter: 0,
            allowed_logins: Vec::new(),
            role: Role::User,
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignupTokenRecord {
    pub user: String,
    pub allowed_logins: Vec<String>,
    pub otp_seed: String,
    pub created_at: u64,
    /// Unix seconds
    pub expires_at: u64,
    #[serde(default)]
    pub consumed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSessionRecord {
    pub user: String,
    pub bearer_token: String,
    pub created_at: u64,
    /// Unix seconds
    pub expires_at: u64,
}

/// Points a bearer token back at its session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BearerIndex {
    pub session_id: String,
}
