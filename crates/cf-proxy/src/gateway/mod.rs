//! Access gateway
//!
//! The single authenticated entry point. Every call other than login and
//! signup first resolves the caller's bearer session through the
//! authority; nothing else is consulted when that fails. Targets in the
//! local site are dialed directly at the address their node last
//! advertised, targets in remote sites get a virtual channel down the
//! site's tunnel. Session establishment is never retried here, so a caller
//! never ends up with two sessions from one request.

mod error;
mod session;

pub use error::GatewayError;
pub use session::{ActiveSession, SessionOutput};

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use cf_auth::{
    Action, AuthError, KeyPair, Role, SessionInfo, SignupTokenData, UserCertRequest,
    UserInvite, WebSession,
};
use cf_core::mux::FramedConduit;
use cf_core::services::Permit;
use cf_core::traits::{BoxConduit, Conduit, SessionConduit};
use cf_core::types::is_valid_name;
use cf_core::CURRENT_SITE_SHORTCUT;
use cf_protocol::{PartySnapshot, SessionMessage, StartRequest, TerminalSize};

use crate::state::ProxyState;

/// Bearer token and cookie presented with a request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub bearer: Option<String>,
    pub cookie: Option<String>,
}

impl Credentials {
    pub fn new(bearer: impl Into<String>, cookie: impl Into<String>) -> Self {
        Self {
            bearer: Some(bearer.into()),
            cookie: Some(cookie.into()),
        }
    }

    /// Credentials from a fresh login or signup
    pub fn from_session(session: &WebSession) -> Self {
        Self {
            bearer: Some(session.bearer_token.clone()),
            cookie: session.cookies.first().map(|c| c.value.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteSummary {
    pub name: String,
    pub status: SiteStatus,
    /// Whether this is the proxy's own site
    pub local: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSummary {
    pub site: String,
    pub host: String,
    pub addr: String,
    /// Sender clock of the latest heartbeat, unix millis
    pub last_seen: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub site: String,
    pub host: String,
    pub session_id: String,
    pub parties: Vec<PartySnapshot>,
    pub created_at: u64,
}

/// Target and shape of a session to start or join
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Site name or the current-site shortcut
    pub site: String,
    pub host: String,
    pub login: String,
    pub session_id: Option<String>,
    pub join_only: bool,
    pub command: Option<String>,
    pub size: TerminalSize,
}

/// Where a resolved site lives
#[derive(Debug, Clone, PartialEq, Eq)]
enum Route {
    Local(String),
    Remote(String),
}

impl Route {
    fn domain(&self) -> &str {
        match self {
            Route::Local(domain) | Route::Remote(domain) => domain,
        }
    }
}

#[derive(Clone)]
pub struct Gateway {
    state: Arc<ProxyState>,
}

impl Gateway {
    pub fn new(state: Arc<ProxyState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &Arc<ProxyState> {
        &self.state
    }

    // ---- authentication ----

    pub async fn login(&self, user: &str, password: &str, otp_code: &str) -> Result<WebSession, GatewayError> {
        Ok(self.state.auth.authenticate(user, password, otp_code).await?)
    }

    /// Invalidate the caller's session. Requests made with it fail from now
    /// on; streams already open are left running.
    pub async fn logout(&self, credentials: &Credentials) -> Result<(), GatewayError> {
        let caller = self.authenticate(credentials).await?;
        let bearer = credentials.bearer.as_deref().ok_or(GatewayError::AccessDenied)?;
        self.state.auth.invalidate_session(bearer).await?;
        info!(user = %caller.user, "Logged out");
        Ok(())
    }

    pub async fn create_signup_token(
        &self,
        credentials: &Credentials,
        user: &str,
        allowed_logins: Vec<String>,
    ) -> Result<UserInvite, GatewayError> {
        let caller = self.authorize(credentials, Action::CreateSignupToken).await?;
        let token = self.state.auth.create_signup_token(user, allowed_logins).await?;
        info!(admin = %caller.user, %user, "Signup token created");
        Ok(self.state.auth.render_user_invite(&token).await?)
    }

    pub async fn signup_token_data(&self, token: &str) -> Result<SignupTokenData, GatewayError> {
        Ok(self.state.auth.signup_token_data(token).await?)
    }

    pub async fn redeem_signup_token(
        &self,
        token: &str,
        password: &str,
        otp_code: &str,
    ) -> Result<WebSession, GatewayError> {
        Ok(self
            .state
            .auth
            .redeem_signup_token(token, password, otp_code)
            .await?)
    }

    // ---- listings ----

    /// The local site and every remote site we hold a tunnel or trust for
    pub async fn list_sites(&self, credentials: &Credentials) -> Result<Vec<SiteSummary>, GatewayError> {
        self.authorize(credentials, Action::ListSites).await?;

        let local = self.state.local_domain();
        let mut remote = self.state.tunnels.site_domains();
        remote.extend(self.state.auth.export_trust_bundle().await?.domains());
        remote.retain(|domain| domain != local);
        remote.sort();
        remote.dedup();

        let mut sites = vec![SiteSummary {
            name: local.to_string(),
            status: SiteStatus::Online,
            local: true,
        }];
        sites.extend(remote.into_iter().map(|domain| SiteSummary {
            status: if self.state.tunnels.site(&domain).is_some() {
                SiteStatus::Online
            } else {
                SiteStatus::Offline
            },
            name: domain,
            local: false,
        }));
        Ok(sites)
    }

    pub async fn list_nodes(
        &self,
        credentials: &Credentials,
        site: &str,
    ) -> Result<Vec<NodeSummary>, GatewayError> {
        self.authorize(credentials, Action::ListNodes).await?;
        let route = self.resolve_site(site)?;

        Ok(self
            .state
            .sessions
            .list_nodes(route.domain())
            .into_iter()
            .map(|node| NodeSummary {
                site: node.domain,
                host: node.host,
                addr: node.addr,
                last_seen: node.sent_at,
            })
            .collect())
    }

    /// Sessions currently believed live on a host. Membership lags reality
    /// by at most the presence window.
    pub async fn list_sessions(
        &self,
        credentials: &Credentials,
        site: &str,
        host: &str,
    ) -> Result<Vec<SessionSummary>, GatewayError> {
        self.authorize(credentials, Action::ListSessions).await?;
        let route = self.resolve_site(site)?;

        Ok(self
            .state
            .sessions
            .list_sessions(route.domain(), host)
            .into_iter()
            .map(|session| SessionSummary {
                site: session.domain,
                host: session.host,
                session_id: session.session_id,
                parties: session.parties,
                created_at: session.created_at,
            })
            .collect())
    }

    // ---- sessions ----

    /// Start or join an interactive session on a node
    pub async fn connect(
        &self,
        credentials: &Credentials,
        request: ConnectRequest,
    ) -> Result<ActiveSession, GatewayError> {
        let caller = self.authorize(credentials, Action::ConnectSession).await?;
        if !caller.allowed_logins.iter().any(|l| *l == request.login) {
            debug!(user = %caller.user, login = %request.login, "Login not allowed");
            return Err(GatewayError::AccessDenied);
        }
        if let Some(id) = request.session_id.as_deref() {
            if !is_valid_name(id) {
                return Err(GatewayError::BadRequest(format!("invalid session id {:?}", id)));
            }
        }
        if !is_valid_name(&request.host) {
            return Err(GatewayError::BadRequest(format!("invalid host {:?}", request.host)));
        }
        let route = self.resolve_site(&request.site)?;

        let permit = Permit::acquire(&self.state.services.limiter, &caller.user)
            .ok_or(GatewayError::LimitExceeded)?;

        let mut conduit = self.dial(&route, &request.host).await?;
        info!(
            user = %caller.user,
            site = %route.domain(),
            host = %request.host,
            login = %request.login,
            route = %conduit.describe(),
            "Connecting session"
        );

        let key = KeyPair::generate();
        let certificate = self
            .state
            .auth
            .issue_user_certificate(
                Role::Proxy,
                UserCertRequest {
                    user: caller.user.clone(),
                    public_key: key.public_key(),
                    role: Role::User,
                    logins: caller.allowed_logins.clone(),
                    ttl: self.state.config.user_cert_ttl,
                },
            )
            .await?;

        let certificate = certificate.to_bytes().map_err(AuthError::from)?;
        match start(&mut *conduit, &key, &certificate, &request).await {
            Ok((session_id, joined)) => {
                info!(user = %caller.user, %session_id, joined, "Session attached");
                Ok(ActiveSession::new(conduit, session_id, joined, permit))
            }
            Err(e) => {
                warn!(user = %caller.user, host = %request.host, error = %e, "Session not started");
                conduit.close().await;
                Err(e)
            }
        }
    }

    /// Resolve the caller's bearer session
    async fn authenticate(&self, credentials: &Credentials) -> Result<SessionInfo, GatewayError> {
        Ok(self
            .state
            .auth
            .validate_session(
                credentials.bearer.as_deref(),
                credentials.cookie.as_deref(),
                self.state.config.require_cookie,
            )
            .await?)
    }

    async fn authorize(&self, credentials: &Credentials, action: Action) -> Result<SessionInfo, GatewayError> {
        let caller = self.authenticate(credentials).await?;
        if !self.state.auth.permissions().allows(caller.role, action) {
            debug!(user = %caller.user, role = %caller.role, ?action, "Action not permitted");
            return Err(GatewayError::AccessDenied);
        }
        Ok(caller)
    }

    fn resolve_site(&self, site: &str) -> Result<Route, GatewayError> {
        let local = self.state.local_domain();
        if site == CURRENT_SITE_SHORTCUT || site == local {
            return Ok(Route::Local(local.to_string()));
        }
        if !is_valid_name(site) {
            return Err(GatewayError::BadRequest(format!("invalid site {:?}", site)));
        }
        Ok(Route::Remote(site.to_string()))
    }

    async fn dial(&self, route: &Route, host: &str) -> Result<BoxConduit, GatewayError> {
        let timeout = self.state.config.channel_open_timeout;
        match route {
            Route::Local(domain) => {
                let node = self
                    .state
                    .sessions
                    .node(domain, host)
                    .ok_or_else(|| GatewayError::NodeNotFound(host.to_string()))?;
                let conduit = FramedConduit::connect(&node.addr, timeout)
                    .await
                    .map_err(|e| GatewayError::NodeUnreachable(format!("{}: {}", node.addr, e)))?;
                Ok(Box::new(conduit))
            }
            Route::Remote(domain) => {
                let target = self.remote_target(domain, host);
                let channel = self.state.tunnels.open_channel(domain, &target).await?;
                Ok(Box::new(channel))
            }
        }
    }

    /// The site agent serves its own host in process and splices anything
    /// else to the address that host advertised
    fn remote_target(&self, domain: &str, host: &str) -> String {
        let agent_host = self.state.tunnels.site(domain).map(|link| link.host.clone());
        if agent_host.as_deref() == Some(host) {
            return host.to_string();
        }
        match self.state.sessions.node(domain, host) {
            Some(node) => node.addr,
            None => host.to_string(),
        }
    }
}

/// Answer the node's challenge and wait for the session to start
async fn start(
    conduit: &mut dyn Conduit,
    key: &KeyPair,
    certificate: &[u8],
    request: &ConnectRequest,
) -> Result<(String, bool), GatewayError> {
    let nonce = match conduit.recv_session().await? {
        Some(SessionMessage::Challenge { nonce }) => nonce,
        Some(SessionMessage::Error { code, message }) => return Err(GatewayError::from_node(code, message)),
        Some(other) => return Err(GatewayError::Internal(format!("expected challenge, got {:?}", other))),
        None => return Err(GatewayError::TunnelLost),
    };

    let payload = StartRequest::challenge_payload(&nonce, &request.login, request.session_id.as_deref());
    conduit
        .send_session(&SessionMessage::Start(StartRequest {
            login: request.login.clone(),
            session_id: request.session_id.clone(),
            join_only: request.join_only,
            command: request.command.clone(),
            size: request.size,
            certificate: certificate.to_vec(),
            signature: key.sign(&payload),
        }))
        .await?;

    match conduit.recv_session().await? {
        Some(SessionMessage::Started { session_id, joined }) => Ok((session_id, joined)),
        Some(SessionMessage::Error { code, message }) => Err(GatewayError::from_node(code, message)),
        Some(other) => Err(GatewayError::Internal(format!("expected started, got {:?}", other))),
        None => Err(GatewayError::TunnelLost),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use cf_auth::password::PasswordCost;
    use cf_auth::{AuthConfig, AuthServer, StandardPermissions};
    use cf_core::config::ProxyConfig;
    use cf_core::services::{MemoryEventLog, MemoryStore, Unlimited};
    use cf_protocol::{NodeHeartbeat, PresenceUpdate};

    use crate::state::ProxyServices;

    const DOMAIN: &str = "example.com";

    async fn gateway() -> Gateway {
        let store = Arc::new(MemoryStore::new());
        let events = Arc::new(MemoryEventLog::new());
        let auth = AuthServer::new(
            AuthConfig {
                domain: DOMAIN.to_string(),
                password_cost: PasswordCost::minimal(),
                ..AuthConfig::default()
            },
            store,
            events.clone(),
            Arc::new(StandardPermissions),
        );
        let config = ProxyConfig {
            domain: DOMAIN.to_string(),
            host: "proxy".to_string(),
            ..ProxyConfig::default()
        };
        let services = ProxyServices {
            events,
            limiter: Arc::new(Unlimited),
        };
        Gateway::new(ProxyState::bootstrap(config, auth, services).await.unwrap())
    }

    async fn alice(gateway: &Gateway) -> Credentials {
        let auth = &gateway.state().auth;
        auth.upsert_user("alice", vec!["alice".to_string()]).await.unwrap();
        let setup = auth.upsert_password("alice", "secret").await.unwrap();
        let (seed, counter) = cf_auth::otp::parse_otp_url(&setup.otp_url).unwrap();
        let code = cf_auth::otp::hotp(&seed, counter).unwrap();
        let session = gateway.login("alice", "secret", &code).await.unwrap();
        Credentials::from_session(&session)
    }

    fn node_heartbeat(domain: &str, host: &str) -> PresenceUpdate {
        PresenceUpdate::Node(NodeHeartbeat {
            domain: domain.to_string(),
            host: host.to_string(),
            addr: "127.0.0.1:3022".to_string(),
            sent_at: 1_000,
            seq: 1,
        })
    }

    #[tokio::test]
    async fn test_requests_without_session_are_denied() {
        let gateway = gateway().await;
        let nobody = Credentials::default();

        assert!(matches!(gateway.list_sites(&nobody).await, Err(GatewayError::AccessDenied)));
        assert!(matches!(
            gateway.list_nodes(&nobody, CURRENT_SITE_SHORTCUT).await,
            Err(GatewayError::AccessDenied)
        ));
        let forged = Credentials::new("not-a-token", "not-a-cookie");
        assert!(matches!(gateway.list_sites(&forged).await, Err(GatewayError::AccessDenied)));
    }

    #[tokio::test]
    async fn test_current_site_shortcut() {
        let gateway = gateway().await;
        let alice = alice(&gateway).await;
        gateway.state().sessions.apply(node_heartbeat(DOMAIN, "node-1"));
        gateway.state().sessions.apply(node_heartbeat("remote.net", "far-1"));

        let via_shortcut = gateway.list_nodes(&alice, CURRENT_SITE_SHORTCUT).await.unwrap();
        let explicit = gateway.list_nodes(&alice, DOMAIN).await.unwrap();
        assert_eq!(via_shortcut, explicit);
        assert_eq!(explicit.len(), 1);
        assert_eq!(explicit[0].host, "node-1");
    }

    #[tokio::test]
    async fn test_local_site_always_listed() {
        let gateway = gateway().await;
        let alice = alice(&gateway).await;

        let sites = gateway.list_sites(&alice).await.unwrap();
        assert_eq!(
            sites,
            vec![SiteSummary {
                name: DOMAIN.to_string(),
                status: SiteStatus::Online,
                local: true,
            }]
        );
    }

    #[tokio::test]
    async fn test_logout_denies_later_requests() {
        let gateway = gateway().await;
        let alice = alice(&gateway).await;

        gateway.list_sites(&alice).await.unwrap();
        gateway.logout(&alice).await.unwrap();
        assert!(matches!(gateway.list_sites(&alice).await, Err(GatewayError::AccessDenied)));
        // The session is gone, so a second logout is refused like any other call
        assert!(matches!(gateway.logout(&alice).await, Err(GatewayError::AccessDenied)));
    }

    #[tokio::test]
    async fn test_logout_requires_a_live_session() {
        let gateway = gateway().await;
        let alice = alice(&gateway).await;

        let forged = Credentials::new("no-such-bearer", "no-such-cookie");
        assert!(matches!(gateway.logout(&forged).await, Err(GatewayError::AccessDenied)));
        assert!(matches!(
            gateway.logout(&Credentials::default()).await,
            Err(GatewayError::AccessDenied)
        ));
        // Someone else's cookie with our bearer does not count
        let mixed = Credentials {
            bearer: alice.bearer.clone(),
            cookie: Some("no-such-cookie".to_string()),
        };
        assert!(matches!(gateway.logout(&mixed).await, Err(GatewayError::AccessDenied)));
        gateway.list_sites(&alice).await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_checks_login_before_dialing() {
        let gateway = gateway().await;
        let alice = alice(&gateway).await;

        let request = ConnectRequest {
            site: CURRENT_SITE_SHORTCUT.to_string(),
            host: "node-1".to_string(),
            login: "root".to_string(),
            session_id: None,
            join_only: false,
            command: None,
            size: TerminalSize::default(),
        };
        assert!(matches!(
            gateway.connect(&alice, request.clone()).await,
            Err(GatewayError::AccessDenied)
        ));

        let request = ConnectRequest {
            login: "alice".to_string(),
            ..request
        };
        assert!(matches!(
            gateway.connect(&alice, request).await,
            Err(GatewayError::NodeNotFound(ref host)) if host == "node-1"
        ));
    }

    #[tokio::test]
    async fn test_connect_to_remote_site_without_tunnel() {
        let gateway = gateway().await;
        let alice = alice(&gateway).await;

        let started = tokio::time::Instant::now();
        let result = gateway
            .connect(
                &alice,
                ConnectRequest {
                    site: "remote.net".to_string(),
                    host: "far-1".to_string(),
                    login: "alice".to_string(),
                    session_id: None,
                    join_only: false,
                    command: None,
                    size: TerminalSize::default(),
                },
            )
            .await;
        assert!(matches!(result, Err(GatewayError::SiteUnreachable(ref site)) if site == "remote.net"));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_only_admins_invite() {
        let gateway = gateway().await;
        let alice = alice(&gateway).await;

        assert!(matches!(
            gateway
                .create_signup_token(&alice, "bob", vec!["bob".to_string()])
                .await,
            Err(GatewayError::AccessDenied)
        ));

        gateway.state().auth.set_user_role("alice", Role::Admin).await.unwrap();
        let invite = gateway
            .create_signup_token(&alice, "bob", vec!["bob".to_string()])
            .await
            .unwrap();
        assert_eq!(invite.user, "bob");
        let data = gateway.signup_token_data(&invite.token).await.unwrap();
        assert_eq!(data.allowed_logins, vec!["bob".to_string()]);
    }
}
