//! Certificate verification against a trust bundle

use std::path::Path;

use serde::{Deserialize, Serialize};

use cf_core::time::current_time_secs;

use crate::authority::CaClass;
use crate::cert::{CertKind, Certificate};
use crate::error::{AuthError, CertError};
use crate::keys::{self, KEY_LEN};
use crate::roles::Role;

/// Tolerated clock difference between issuer and verifier, in seconds
pub const CLOCK_SKEW_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedKey {
    pub key_id: String,
    /// Hex encoded
    pub public_key: String,
}

/// Public keys of one authority
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorityKeys {
    pub domain: String,
    pub class: CaClass,
    pub keys: Vec<TrustedKey>,
}

/// Everything a verifier needs to check certificates from a set of sites
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustBundle {
    pub authorities: Vec<AuthorityKeys>,
}

impl TrustBundle {
    pub fn load(path: &Path) -> Result<Self, AuthError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AuthError::Storage(cf_core::StorageError::Io(e)))?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), AuthError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AuthError::Storage(cf_core::StorageError::Io(e)))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| AuthError::Storage(cf_core::StorageError::Io(e)))
    }

    /// Add or replace the keys of one authority
    pub fn insert(&mut self, authority: AuthorityKeys) {
        self.authorities
            .retain(|a| !(a.domain == authority.domain && a.class == authority.class));
        self.authorities.push(authority);
    }

    pub fn merge(&mut self, other: TrustBundle) {
        for authority in other.authorities {
            self.insert(authority);
        }
    }

    pub fn find(&self, domain: &str, class: CaClass, key_id: &str) -> Option<[u8; KEY_LEN]> {
        self.authorities
            .iter()
            .filter(|a| a.domain == domain && a.class == class)
            .flat_map(|a| a.keys.iter())
            .find(|k| k.key_id == key_id)
            .and_then(|k| keys::decode_public_key(&k.public_key).ok())
    }

    pub fn domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self.authorities.iter().map(|a| a.domain.clone()).collect();
        domains.sort();
        domains.dedup();
        domains
    }
}

/// Verified facts from a certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub domain: String,
    pub subject: String,
    pub role: Role,
    pub principals: Vec<String>,
    pub public_key: [u8; KEY_LEN],
    pub expires_at: Option<u64>,
}

impl Identity {
    pub fn allows_login(&self, login: &str) -> bool {
        self.principals.iter().any(|p| p == login)
    }
}

/// Verifies certificates against a trust bundle
#[derive(Debug, Clone, Default)]
pub struct CertChecker {
    bundle: TrustBundle,
}

impl CertChecker {
    pub fn new(bundle: TrustBundle) -> Self {
        Self { bundle }
    }

    pub fn bundle(&self) -> &TrustBundle {
        &self.bundle
    }

    pub fn verify(&self, cert: &Certificate, accepted: &[Role]) -> Result<Identity, CertError> {
        self.verify_at(cert, accepted, current_time_secs())
    }

    /// Verify as of `now` (unix seconds)
    pub fn verify_at(
        &self,
        cert: &Certificate,
        accepted: &[Role],
        now: u64,
    ) -> Result<Identity, CertError> {
        let body = &cert.body;
        let class = match body.kind {
            CertKind::User => CaClass::User,
            CertKind::Host => CaClass::Host,
        };

        let authority_key = self
            .bundle
            .find(&body.domain, class, &body.authority_key_id)
            .ok_or(CertError::UnknownAuthority)?;

        if !keys::verify_signature(&authority_key, &body.signing_bytes()?, &cert.signature) {
            return Err(CertError::BadSignature);
        }

        if body.issued_at > now.saturating_add(CLOCK_SKEW_SECS) {
            return Err(CertError::Expired);
        }
        if body.expires_at.is_some_and(|t| now >= t) {
            return Err(CertError::Expired);
        }

        let role_matches_kind = match body.kind {
            CertKind::User => body.role.is_user_role(),
            CertKind::Host => body.role.is_host_role(),
        };
        if !role_matches_kind || !accepted.contains(&body.role) {
            return Err(CertError::RoleNotPermitted);
        }

        Ok(Identity {
            domain: body.domain.clone(),
            subject: body.subject.clone(),
            role: body.role,
            principals: body.principals.clone(),
            public_key: body.public_key,
            expires_at: body.expires_at,
        })
    }
}
