//! Global proxy state

use std::sync::Arc;

use cf_auth::{AuthError, AuthServer, CaClass};
use cf_core::config::ProxyConfig;
use cf_core::traits::{AuditEvent, EventLog, RateLimiter};

use crate::identity::ProxyIdentity;
use crate::registry::SessionRegistry;
use crate::tunnel::TunnelRegistry;

/// Collaborators handed to the proxy at startup
#[derive(Clone)]
pub struct ProxyServices {
    pub events: Arc<dyn EventLog>,
    pub limiter: Arc<dyn RateLimiter>,
}

/// Shared state for every task in the proxy
pub struct ProxyState {
    pub config: ProxyConfig,
    pub auth: Arc<AuthServer>,
    pub identity: ProxyIdentity,
    /// Site tunnels and node presence links
    pub tunnels: Arc<TunnelRegistry>,
    /// Presence of nodes and interactive sessions
    pub sessions: Arc<SessionRegistry>,
    pub services: ProxyServices,
}

impl ProxyState {
    /// Make sure the local authorities exist, issue the proxy's own
    /// certificate and build the registries
    pub async fn bootstrap(
        config: ProxyConfig,
        auth: AuthServer,
        services: ProxyServices,
    ) -> Result<Arc<Self>, AuthError> {
        for class in [CaClass::User, CaClass::Host] {
            if auth.upsert_cert_authority(&config.domain, class).await? {
                tracing::info!(domain = %config.domain, %class, "Bootstrapped certificate authority");
            }
        }
        let identity = ProxyIdentity::issue(&auth, config.domain.clone(), config.host.clone()).await?;

        Ok(Arc::new(Self {
            tunnels: Arc::new(TunnelRegistry::new(
                config.domain.clone(),
                config.tunnel_stale_after(),
            )),
            sessions: Arc::new(SessionRegistry::new(config.presence_ttl())),
            auth: Arc::new(auth),
            identity,
            services,
            config,
        }))
    }

    pub fn local_domain(&self) -> &str {
        &self.config.domain
    }

    pub async fn audit(&self, event: AuditEvent) {
        if let Err(e) = self.services.events.emit(event).await {
            tracing::warn!(error = %e, "Failed to record audit event");
        }
    }
}

impl std::fmt::Debug for ProxyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyState")
            .field("domain", &self.config.domain)
            .field("identity", &self.identity)
            .field("links", &self.tunnels.len())
            .finish()
    }
}
