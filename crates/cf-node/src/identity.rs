//! Node identity: a host key and the certificate binding it to a host name

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use cf_auth::{Certificate, KeyPair};

/// On-disk form
#[derive(Serialize, Deserialize)]
struct IdentityFile {
    domain: String,
    host: String,
    /// Hex encoded key seed
    seed: String,
    /// Base64 encoded host certificate
    certificate: String,
}

/// Host key plus its certificate
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    pub domain: String,
    pub host: String,
    pub key: KeyPair,
    pub certificate: Certificate,
}

impl NodeIdentity {
    pub fn new(key: KeyPair, certificate: Certificate) -> Self {
        Self {
            domain: certificate.body.domain.clone(),
            host: certificate.body.subject.clone(),
            key,
            certificate,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read identity {:?}", path))?;
        let file: IdentityFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse identity {:?}", path))?;

        let key = KeyPair::from_hex(&file.seed)?;
        let certificate = Certificate::from_text(&file.certificate)?;
        if certificate.body.public_key != key.public_key() {
            anyhow::bail!("Identity {:?}: certificate does not match key", path);
        }
        if certificate.body.subject != file.host || certificate.body.domain != file.domain {
            anyhow::bail!("Identity {:?}: certificate names a different host", path);
        }

        Ok(Self {
            domain: file.domain,
            host: file.host,
            key,
            certificate,
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }
        let file = IdentityFile {
            domain: self.domain.clone(),
            host: self.host.clone(),
            seed: self.key.seed_hex(),
            certificate: self.certificate.to_text()?,
        };
        std::fs::write(path, serde_json::to_string_pretty(&file)?)
            .with_context(|| format!("Failed to write identity {:?}", path))?;
        restrict_permissions(path)
    }

    /// Sign `message` with the host key
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.key.sign(message)
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .with_context(|| format!("Failed to set permissions on {:?}", path))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cf_auth::{CertKind, CertificateBody, Role};

    fn identity() -> NodeIdentity {
        let ca = KeyPair::generate();
        let key = KeyPair::generate();
        let certificate = CertificateBody {
            kind: CertKind::Host,
            domain: "example.com".into(),
            subject: "server4".into(),
            role: Role::Node,
            principals: vec![],
            public_key: key.public_key(),
            serial: 1,
            issued_at: 0,
            expires_at: None,
            authority_key_id: ca.key_id(),
        }
        .sign(&ca)
        .unwrap();
        NodeIdentity::new(key, certificate)
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id.json");
        let original = identity();
        original.save(&path).unwrap();

        let loaded = NodeIdentity::load(&path).unwrap();
        assert_eq!(loaded.host, "server4");
        assert_eq!(loaded.domain, "example.com");
        assert_eq!(loaded.certificate, original.certificate);
        assert_eq!(loaded.key.public_key(), original.key.public_key());
    }

    #[test]
    fn test_mismatched_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id.json");
        let mut broken = identity();
        broken.key = KeyPair::generate();
        broken.save(&path).unwrap();

        assert!(NodeIdentity::load(&path).is_err());
    }
}
