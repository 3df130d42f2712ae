//! One inbound link, from handshake to teardown
//!
//! The proxy greets with a nonce. The site answers with its host
//! certificate, a nonce of its own and a signature over ours. Only once that
//! verifies does the link enter the registry, superseding any earlier link
//! for the same key. After that the control channel carries heartbeats and
//! presence snapshots until the link drops.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use cf_auth::keys::verify_signature;
use cf_auth::{Action, Certificate, Identity, Role};
use cf_core::mux::{Mux, MuxConfig, MuxEvents, MuxRole};
use cf_core::token::random_bytes;
use cf_core::traits::AuditEvent;
use cf_core::TunnelError;
use cf_protocol::{Message, PresenceUpdate, PROTOCOL_VERSION};

use super::registry::{Link, LinkKind};
use crate::state::ProxyState;

const NONCE_LEN: usize = 32;

/// Serve one physical connection until it drops or `cancel` fires
pub async fn serve_link<S>(
    state: Arc<ProxyState>,
    io: S,
    peer: String,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mux_config = MuxConfig {
        open_timeout: state.config.channel_open_timeout,
        ..MuxConfig::default()
    };
    let (mux, mut events) = Mux::spawn(io, MuxRole::Dialer, mux_config, format!("link {}", peer));

    let registration = tokio::select! {
        _ = cancel.cancelled() => {
            mux.close();
            return;
        }
        registration = accept_registration(&state, &mux, &mut events) => registration,
    };
    let site = match registration {
        Ok(site) => site,
        Err(e) => {
            warn!(%peer, error = %e, "Link registration failed");
            mux.close();
            return;
        }
    };

    let link = state.tunnels.register(&site.domain, &site.subject, mux);
    info!(
        site = %link.domain,
        host = %link.host,
        kind = ?link.kind,
        link_id = link.id(),
        %peer,
        "Link registered"
    );
    state
        .audit(AuditEvent::TunnelRegistered {
            site: link.domain.clone(),
            host: link.host.clone(),
        })
        .await;

    let may_publish = state
        .auth
        .permissions()
        .allows(site.role, Action::PublishPresence);
    if !may_publish {
        warn!(site = %link.domain, host = %link.host, role = %site.role, "Presence from this link will be ignored");
    }
    run_control(&state, &link, may_publish, &mut events, &cancel).await;

    if state.tunnels.unregister(&link) {
        info!(site = %link.domain, host = %link.host, "Link closed");
    }
    link.mux.close();
}

/// Proxy side of the registration handshake. Returns the site's verified
/// identity once it has been answered with our own proof.
pub async fn accept_registration(
    state: &ProxyState,
    mux: &Mux,
    events: &mut MuxEvents,
) -> Result<Identity, TunnelError> {
    let nonce = random_bytes(NONCE_LEN);
    mux.send_control(Message::Hello {
        nonce: nonce.clone(),
        version: PROTOCOL_VERSION.to_string(),
    })
    .await?;

    let message = match tokio::time::timeout(state.config.handshake_timeout, events.control.recv()).await {
        Ok(Some(message)) => message,
        Ok(None) => return Err(TunnelError::TunnelLost),
        Err(_) => {
            debug!(tunnel = %mux.label(), "Registration timed out");
            return Err(TunnelError::TunnelTimeout);
        }
    };

    let (domain, host, certificate, site_nonce, signature, version) = match message {
        Message::Register {
            domain,
            host,
            certificate,
            nonce,
            signature,
            version,
        } => (domain, host, certificate, nonce, signature, version),
        other => {
            debug!(tunnel = %mux.label(), "Expected register, got {:?}", other.message_type());
            reject(mux, "expected registration").await;
            return Err(TunnelError::AuthenticationFailed);
        }
    };

    if version.as_deref() != Some(PROTOCOL_VERSION) {
        debug!(tunnel = %mux.label(), ?version, "Site speaks a different protocol version");
    }

    let site = match verify_site(state, &nonce, &domain, &host, &certificate, &signature).await {
        Ok(site) if !site_nonce.is_empty() => site,
        Ok(_) => {
            reject(mux, "missing nonce").await;
            return Err(TunnelError::AuthenticationFailed);
        }
        Err(reason) => {
            // The site only learns that it failed
            debug!(tunnel = %mux.label(), %domain, %host, %reason, "Site not authenticated");
            reject(mux, "authentication failed").await;
            return Err(TunnelError::AuthenticationFailed);
        }
    };

    let identity = &state.identity;
    let certificate = identity
        .certificate(&state.auth)
        .await
        .and_then(|cert| cert.to_bytes().map_err(Into::into))
        .map_err(|e| {
            warn!(error = %e, "Proxy certificate unavailable");
            TunnelError::AuthenticationFailed
        })?;
    let payload = Message::register_ack_payload(&site_nonce, &identity.domain, &identity.host);
    mux.send_control(Message::RegisterAck {
        accepted: true,
        reason: None,
        certificate,
        signature: identity.sign(&payload),
    })
    .await?;

    Ok(site)
}

async fn verify_site(
    state: &ProxyState,
    nonce: &[u8],
    domain: &str,
    host: &str,
    certificate: &[u8],
    signature: &[u8],
) -> Result<Identity, String> {
    let certificate = Certificate::from_bytes(certificate).map_err(|e| e.to_string())?;
    let site = state
        .auth
        .verify_certificate(&certificate, &[Role::Node, Role::RemoteSite])
        .await
        .map_err(|e| e.to_string())?;

    if site.domain != domain || site.subject != host {
        return Err(format!(
            "certificate is for {}.{}, not {}.{}",
            site.subject, site.domain, host, domain
        ));
    }
    if !state
        .auth
        .permissions()
        .allows(site.role, Action::RegisterTunnel)
    {
        return Err(format!("role {} may not register", site.role));
    }
    let payload = Message::register_payload(nonce, domain, host);
    if !verify_signature(&site.public_key, &payload, signature) {
        return Err("signature over nonce did not verify".to_string());
    }
    Ok(site)
}

async fn reject(mux: &Mux, reason: &str) {
    let _ = mux
        .send_control(Message::RegisterAck {
            accepted: false,
            reason: Some(reason.to_string()),
            certificate: Vec::new(),
            signature: Vec::new(),
        })
        .await;
}

async fn run_control(
    state: &ProxyState,
    link: &Link,
    may_publish: bool,
    events: &mut MuxEvents,
    cancel: &CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            _ = link.mux.closed() => break,

            message = events.control.recv() => match message {
                Some(Message::Heartbeat { timestamp }) => {
                    link.record_heartbeat();
                    trace!(site = %link.domain, host = %link.host, "Heartbeat");
                    if link.mux.send_control(Message::HeartbeatAck { timestamp }).await.is_err() {
                        break;
                    }
                }
                Some(Message::HeartbeatAck { .. }) => link.record_heartbeat(),
                Some(Message::Presence(update)) => {
                    link.record_heartbeat();
                    if !may_publish {
                        trace!(site = %link.domain, host = %link.host, "Presence not permitted");
                    } else if presence_allowed(link, &update) {
                        state.sessions.apply(update);
                    } else {
                        warn!(
                            site = %link.domain,
                            host = %link.host,
                            "Dropping presence for a subject outside this link"
                        );
                    }
                }
                Some(Message::Error { code, message }) => {
                    warn!(site = %link.domain, host = %link.host, ?code, %message, "Link reported an error");
                }
                Some(other) => {
                    debug!(site = %link.domain, "Ignoring {:?} on the control channel", other.message_type());
                }
                None => break,
            },
        }
    }
}

/// Node links speak only for their own host; site tunnels for any host of
/// their domain
fn presence_allowed(link: &Link, update: &PresenceUpdate) -> bool {
    let (domain, host) = match update {
        PresenceUpdate::Node(heartbeat) => (&heartbeat.domain, &heartbeat.host),
        PresenceUpdate::Session(heartbeat) => (&heartbeat.domain, &heartbeat.host),
    };
    match link.kind {
        LinkKind::Node => *domain == link.domain && *host == link.host,
        LinkKind::Site => *domain == link.domain,
    }
}
