//! Certificate authority records
//!
//! An authority holds an ordered set of keys. Exactly one key is active and
//! signs new certificates; retired keys stay trusted until every certificate
//! they signed has expired, after which they can be pruned.

use serde::{Deserialize, Serialize};

use crate::checker::{AuthorityKeys, TrustedKey};
use crate::error::{AuthError, CertError};
use crate::keys::{self, KeyPair};

/// Authority class; each site domain has one of each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaClass {
    User,
    Host,
}

impl CaClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaClass::User => "user",
            CaClass::Host => "host",
        }
    }
}

impl std::fmt::Display for CaClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One signing key of an authority
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaKey {
    pub key_id: String,
    /// Hex encoded public key
    pub public_key: String,
    /// Hex encoded seed; absent for authorities imported from another site
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    pub created_at: u64,
    pub active: bool,
    /// Latest expiry among certificates this key signed
    #[serde(default)]
    pub signed_until: Option<u64>,
    /// Signed at least one certificate that never expires
    #[serde(default)]
    pub signed_forever: bool,
}

impl CaKey {
    fn generate(now: u64) -> Self {
        let pair = KeyPair::generate();
        Self {
            key_id: pair.key_id(),
            public_key: hex::encode(pair.public_key()),
            private_key: Some(pair.seed_hex()),
            created_at: now,
            active: true,
            signed_until: None,
            signed_forever: false,
        }
    }

    /// Whether certificates signed by this key may still be in circulation.
    /// Imported keys belong to another site and are never pruned here.
    fn in_use(&self, now: u64) -> bool {
        self.private_key.is_none()
            || self.active
            || self.signed_forever
            || self.signed_until.is_some_and(|t| t > now)
    }
}

/// A certificate authority for one (domain, class)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertAuthority {
    pub domain: String,
    pub class: CaClass,
    pub keys: Vec<CaKey>,
}

impl CertAuthority {
    pub fn generate(domain: impl Into<String>, class: CaClass, now: u64) -> Self {
        Self {
            domain: domain.into(),
            class,
            keys: vec![CaKey::generate(now)],
        }
    }

    /// Public-only copy of another site's authority
    pub fn from_public(public: &AuthorityKeys) -> Result<Self, CertError> {
        let imported = public
            .keys
            .iter()
            .map(|k| {
                keys::decode_public_key(&k.public_key)?;
                Ok(CaKey {
                    key_id: k.key_id.clone(),
                    public_key: k.public_key.clone(),
                    private_key: None,
                    created_at: 0,
                    active: false,
                    signed_until: None,
                    signed_forever: false,
                })
            })
            .collect::<Result<Vec<_>, CertError>>()?;
        Ok(Self {
            domain: public.domain.clone(),
            class: public.class,
            keys: imported,
        })
    }

    pub fn active_key(&self) -> Option<&CaKey> {
        self.keys.iter().find(|k| k.active)
    }

    /// The active key pair for signing
    pub fn signer(&self) -> Result<KeyPair, AuthError> {
        let key = self
            .active_key()
            .ok_or_else(|| AuthError::Internal(format!("{} has no active key", self)))?;
        let seed = key
            .private_key
            .as_deref()
            .ok_or_else(|| AuthError::Internal(format!("{} cannot sign", self)))?;
        Ok(KeyPair::from_hex(seed)?)
    }

    /// Retire the active key and add a fresh one; returns the new key id
    pub fn rotate(&mut self, now: u64) -> String {
        for key in &mut self.keys {
            key.active = false;
        }
        let key = CaKey::generate(now);
        let id = key.key_id.clone();
        self.keys.push(key);
        id
    }

    /// Record that `key_id` signed a certificate expiring at `expires_at`.
    /// Returns whether the record changed.
    pub fn note_signed(&mut self, key_id: &str, expires_at: Option<u64>) -> bool {
        let Some(key) = self.keys.iter_mut().find(|k| k.key_id == key_id) else {
            return false;
        };
        match expires_at {
            None if !key.signed_forever => {
                key.signed_forever = true;
                true
            }
            Some(t) if key.signed_until.map_or(true, |current| t > current) => {
                key.signed_until = Some(t);
                true
            }
            _ => false,
        }
    }

    /// Drop retired keys whose certificates have all expired
    pub fn prune(&mut self, now: u64) -> usize {
        let before = self.keys.len();
        self.keys.retain(|k| k.in_use(now));
        before - self.keys.len()
    }

    /// Public half for trust bundles
    pub fn public(&self) -> Result<AuthorityKeys, CertError> {
        let keys = self
            .keys
            .iter()
            .map(|k| {
                keys::decode_public_key(&k.public_key)?;
                Ok(TrustedKey {
                    key_id: k.key_id.clone(),
                    public_key: k.public_key.clone(),
                })
            })
            .collect::<Result<Vec<_>, CertError>>()?;
        Ok(AuthorityKeys {
            domain: self.domain.clone(),
            class: self.class,
            keys,
        })
    }
}

impl std::fmt::Display for CertAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} authority", self.domain, self.class)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotate_keeps_old_key_trusted() {
        let mut ca = CertAuthority::generate("example.com", CaClass::User, 100);
        let first = ca.active_key().unwrap().key_id.clone();

        let second = ca.rotate(200);
        assert_ne!(first, second);
        assert_eq!(ca.active_key().unwrap().key_id, second);
        assert_eq!(ca.keys.len(), 2);
        assert_eq!(ca.public().unwrap().keys.len(), 2);
    }

    #[test]
    fn test_prune_waits_for_outstanding_certificates() {
        let mut ca = CertAuthority::generate("example.com", CaClass::User, 100);
        let first = ca.active_key().unwrap().key_id.clone();
        assert!(ca.note_signed(&first, Some(500)));
        assert!(!ca.note_signed(&first, Some(400)));
        ca.rotate(200);

        assert_eq!(ca.prune(300), 0);
        assert_eq!(ca.prune(500), 1);
        assert_eq!(ca.keys.len(), 1);
        assert!(ca.keys[0].active);
    }

    #[test]
    fn test_forever_certificates_pin_key() {
        let mut ca = CertAuthority::generate("example.com", CaClass::Host, 100);
        let first = ca.active_key().unwrap().key_id.clone();
        assert!(ca.note_signed(&first, None));
        ca.rotate(200);

        assert_eq!(ca.prune(u64::MAX), 0);
    }

    #[test]
    fn test_never_used_retired_key_is_pruned() {
        let mut ca = CertAuthority::generate("example.com", CaClass::Host, 100);
        ca.rotate(200);
        assert_eq!(ca.prune(201), 1);
    }

    #[test]
    fn test_imported_authority_cannot_sign_and_is_kept() {
        let local = CertAuthority::generate("remote.example", CaClass::Host, 100);
        let mut imported = CertAuthority::from_public(&local.public().unwrap()).unwrap();

        assert!(imported.signer().is_err());
        assert_eq!(imported.prune(u64::MAX), 0);
        assert_eq!(imported.public().unwrap(), local.public().unwrap());
    }

    #[test]
    fn test_signer_matches_active_key() {
        let ca = CertAuthority::generate("example.com", CaClass::Host, 100);
        let signer = ca.signer().unwrap();
        assert_eq!(signer.key_id(), ca.active_key().unwrap().key_id);
    }
}
