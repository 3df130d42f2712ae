//! The proxy's own host identity
//!
//! Sites and nodes expect the proxy to prove itself with a `Proxy` host
//! certificate during registration. The key lives only in memory; the
//! certificate is re-issued from the local host authority when it nears
//! expiry.

use std::time::Duration;

use tokio::sync::RwLock;

use cf_auth::{AuthError, AuthServer, Certificate, HostCertRequest, KeyPair, Role};
use cf_core::time::current_time_secs;

/// Validity of each proxy certificate
const CERT_VALIDITY: Duration = Duration::from_secs(24 * 3600);

/// Re-issue once less than this remains
const RENEW_BEFORE: Duration = Duration::from_secs(3600);

pub struct ProxyIdentity {
    pub domain: String,
    pub host: String,
    key: KeyPair,
    certificate: RwLock<Certificate>,
}

impl ProxyIdentity {
    /// Generate a key and issue its first certificate
    pub async fn issue(
        auth: &AuthServer,
        domain: impl Into<String>,
        host: impl Into<String>,
    ) -> Result<Self, AuthError> {
        let domain = domain.into();
        let host = host.into();
        let key = KeyPair::generate();
        let certificate = request(auth, &domain, &host, &key).await?;
        tracing::info!(%domain, %host, key_id = %key.key_id(), "Issued proxy certificate");

        Ok(Self {
            domain,
            host,
            key,
            certificate: RwLock::new(certificate),
        })
    }

    /// Current certificate, renewed first when close to expiry
    pub async fn certificate(&self, auth: &AuthServer) -> Result<Certificate, AuthError> {
        {
            let current = self.certificate.read().await;
            if !needs_renewal(&current) {
                return Ok(current.clone());
            }
        }

        let mut current = self.certificate.write().await;
        if needs_renewal(&current) {
            *current = request(auth, &self.domain, &self.host, &self.key).await?;
            tracing::info!(domain = %self.domain, "Renewed proxy certificate");
        }
        Ok(current.clone())
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.key.sign(message)
    }
}

impl std::fmt::Debug for ProxyIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyIdentity")
            .field("domain", &self.domain)
            .field("host", &self.host)
            .field("key_id", &self.key.key_id())
            .finish()
    }
}

fn needs_renewal(certificate: &Certificate) -> bool {
    match certificate.body.expires_at {
        Some(expires_at) => expires_at <= current_time_secs() + RENEW_BEFORE.as_secs(),
        None => false,
    }
}

async fn request(
    auth: &AuthServer,
    domain: &str,
    host: &str,
    key: &KeyPair,
) -> Result<Certificate, AuthError> {
    auth.issue_host_certificate(
        Role::Admin,
        HostCertRequest {
            domain: domain.to_string(),
            host: host.to_string(),
            public_key: key.public_key(),
            role: Role::Proxy,
            validity: CERT_VALIDITY,
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use cf_auth::password::PasswordCost;
    use cf_auth::{AuthConfig, CaClass, StandardPermissions};
    use cf_core::services::{MemoryEventLog, MemoryStore};

    #[tokio::test]
    async fn test_issued_certificate_verifies_as_proxy() {
        let auth = AuthServer::new(
            AuthConfig {
                domain: "example.com".into(),
                password_cost: PasswordCost::minimal(),
                ..Default::default()
            },
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryEventLog::new()),
            Arc::new(StandardPermissions),
        );
        auth.upsert_cert_authority("example.com", CaClass::Host)
            .await
            .unwrap();

        let identity = ProxyIdentity::issue(&auth, "example.com", "proxy").await.unwrap();
        let certificate = identity.certificate(&auth).await.unwrap();
        let verified = auth
            .verify_certificate(&certificate, &[Role::Proxy])
            .await
            .unwrap();

        assert_eq!(verified.subject, "proxy");
        assert_eq!(verified.domain, "example.com");
        assert!(!needs_renewal(&certificate));
    }
}
