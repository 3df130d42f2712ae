//! Signed certificates

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::CertError;
use crate::keys::{KeyPair, KEY_LEN};
use crate::roles::Role;

/// Domain separation prefix for certificate signatures
const SIGNING_CONTEXT: &[u8] = b"cf-cert-v1\0";

/// Which authority class signs a certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertKind {
    User,
    Host,
}

/// The signed portion of a certificate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateBody {
    pub kind: CertKind,
    /// Site domain whose authority signed this
    pub domain: String,
    /// User name or host name
    pub subject: String,
    pub role: Role,
    /// Logins a user certificate may assume; empty for hosts
    pub principals: Vec<String>,
    pub public_key: [u8; KEY_LEN],
    pub serial: u64,
    /// Unix seconds
    pub issued_at: u64,
    /// Unix seconds; `None` never expires
    pub expires_at: Option<u64>,
    pub authority_key_id: String,
}

/// A body plus the authority's signature over it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub body: CertificateBody,
    pub signature: Vec<u8>,
}

impl CertificateBody {
    /// Bytes covered by the signature
    pub fn signing_bytes(&self) -> Result<Vec<u8>, CertError> {
        let encoded =
            bincode::serialize(self).map_err(|e| CertError::Malformed(e.to_string()))?;
        let mut bytes = Vec::with_capacity(SIGNING_CONTEXT.len() + encoded.len());
        bytes.extend_from_slice(SIGNING_CONTEXT);
        bytes.extend_from_slice(&encoded);
        Ok(bytes)
    }

    pub fn sign(self, authority: &KeyPair) -> Result<Certificate, CertError> {
        let signature = authority.sign(&self.signing_bytes()?);
        Ok(Certificate {
            body: self,
            signature,
        })
    }
}

impl Certificate {
    pub fn subject(&self) -> &str {
        &self.body.subject
    }

    pub fn role(&self) -> Role {
        self.body.role
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CertError> {
        bincode::serialize(self).map_err(|e| CertError::Malformed(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CertError> {
        bincode::deserialize(bytes).map_err(|e| CertError::Malformed(e.to_string()))
    }

    /// Base64 form for identity files and the admin tools
    pub fn to_text(&self) -> Result<String, CertError> {
        Ok(BASE64.encode(self.to_bytes()?))
    }

    pub fn from_text(text: &str) -> Result<Self, CertError> {
        let bytes = BASE64
            .decode(text.trim())
            .map_err(|e| CertError::Malformed(e.to_string()))?;
        Self::from_bytes(&bytes)
    }
}
