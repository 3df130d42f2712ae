//! Outbound link to the proxy
//!
//! Dials the proxy's tunnel endpoint over SSH, opens one session channel and
//! runs the multiplexer inside it. The SSH layer only carries bytes; both ends
//! authenticate each other with host certificates on the control channel.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use russh::client::{self, Config, Handle};
use russh::Disconnect;
use russh_keys::key::{KeyPair as SshKeyPair, PublicKey};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use cf_auth::keys::verify_signature;
use cf_auth::{CertChecker, Certificate, Identity, Role};
use cf_core::mux::{Mux, MuxConfig, MuxEvents, MuxRole};
use cf_core::token::random_bytes;
use cf_protocol::{Message, PROTOCOL_VERSION};

use super::reconnect::ExponentialBackoff;
use crate::identity::NodeIdentity;

const NONCE_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The proxy refused our registration
    #[error("Registration rejected: {0}")]
    Rejected(String),

    /// The proxy's certificate or signature did not verify
    #[error("Proxy not trusted: {0}")]
    ProxyUntrusted(String),

    #[error("Shutting down")]
    Cancelled,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Where and how to reach the proxy
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub proxy_address: String,
    pub connect_timeout: Duration,
    /// How long the proxy has for each handshake step
    pub handshake_timeout: Duration,
    pub mux: MuxConfig,
}

/// A registered link to the proxy
pub struct ProxyLink {
    pub mux: Mux,
    pub events: MuxEvents,
    /// Identity the proxy proved during the handshake
    pub proxy: Identity,
    ssh: Option<Handle<SshHandler>>,
}

impl ProxyLink {
    pub async fn close(self) {
        self.mux.close();
        if let Some(ssh) = self.ssh {
            let _ = ssh
                .disconnect(Disconnect::ByApplication, "closing", "en")
                .await;
        }
    }
}

/// Establishes links to the proxy
pub struct TunnelConnector {
    config: ConnectorConfig,
    identity: Arc<NodeIdentity>,
    checker: Arc<CertChecker>,
}

impl TunnelConnector {
    pub fn new(
        config: ConnectorConfig,
        identity: Arc<NodeIdentity>,
        checker: Arc<CertChecker>,
    ) -> Self {
        Self {
            config,
            identity,
            checker,
        }
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    /// Connect, retrying transport failures with `backoff`. Rejected
    /// registrations and untrusted proxies are not retried.
    pub async fn connect_with_retry(
        &self,
        backoff: &mut ExponentialBackoff,
        cancel: &CancellationToken,
    ) -> Result<ProxyLink, ConnectionError> {
        loop {
            let attempt = tokio::select! {
                _ = cancel.cancelled() => return Err(ConnectionError::Cancelled),
                attempt = self.try_connect() => attempt,
            };

            match attempt {
                Ok(link) => {
                    tracing::info!(
                        proxy = %self.config.proxy_address,
                        proxy_host = %link.proxy.subject,
                        "Connected to proxy"
                    );
                    backoff.reset();
                    return Ok(link);
                }
                Err(e @ ConnectionError::Rejected(_)) | Err(e @ ConnectionError::ProxyUntrusted(_)) => {
                    tracing::error!(proxy = %self.config.proxy_address, error = %e, "Giving up on proxy");
                    return Err(e);
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        proxy = %self.config.proxy_address,
                        "Connection failed: {}. Retrying in {:?}",
                        e,
                        delay
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ConnectionError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn try_connect(&self) -> Result<ProxyLink, ConnectionError> {
        let address = &self.config.proxy_address;
        tracing::debug!("Connecting to {}", address);

        let ssh_config = Arc::new(Config::default());
        let mut session = tokio::time::timeout(
            self.config.connect_timeout,
            client::connect(ssh_config, address.as_str(), SshHandler),
        )
        .await
        .map_err(|_| anyhow!("Connection to {} timed out", address))?
        .map_err(|e| anyhow!("Failed to connect to {}: {}", address, e))?;

        // Transport key only; trust is established by the certificate handshake
        let key = SshKeyPair::generate_ed25519()
            .ok_or_else(|| anyhow!("Failed to generate transport key"))?;
        let authenticated = session
            .authenticate_publickey(&self.identity.host, Arc::new(key))
            .await
            .map_err(|e| anyhow!("Authentication error: {}", e))?;
        if !authenticated {
            return Err(ConnectionError::Rejected(
                "transport authentication refused".to_string(),
            ));
        }

        let channel = session
            .channel_open_session()
            .await
            .map_err(|e| anyhow!("Failed to open session channel: {}", e))?;

        let (mux, mut events) = Mux::spawn(
            channel.into_stream(),
            MuxRole::Acceptor,
            self.config.mux.clone(),
            format!("proxy {}", address),
        );

        match self.register(&mux, &mut events).await {
            Ok(proxy) => Ok(ProxyLink {
                mux,
                events,
                proxy,
                ssh: Some(session),
            }),
            Err(e) => {
                mux.close();
                let _ = session
                    .disconnect(Disconnect::ByApplication, "registration failed", "en")
                    .await;
                Err(e)
            }
        }
    }

    /// Run the registration handshake over an already multiplexed
    /// connection. Returns the proxy's verified identity.
    pub async fn register(
        &self,
        mux: &Mux,
        events: &mut MuxEvents,
    ) -> Result<Identity, ConnectionError> {
        let hello_nonce = match self.next_control(events).await? {
            Message::Hello { nonce, version } => {
                if version != PROTOCOL_VERSION {
                    tracing::warn!(proxy_version = %version, "Proxy speaks a different protocol version");
                }
                nonce
            }
            other => {
                return Err(anyhow!("Expected hello, got {:?}", other.message_type()).into());
            }
        };

        let identity = &self.identity;
        let our_nonce = random_bytes(NONCE_LEN);
        let payload = Message::register_payload(&hello_nonce, &identity.domain, &identity.host);
        let certificate = identity
            .certificate
            .to_bytes()
            .map_err(|e| anyhow!("Failed to encode certificate: {}", e))?;

        mux.send_control(Message::Register {
            domain: identity.domain.clone(),
            host: identity.host.clone(),
            certificate,
            nonce: our_nonce.clone(),
            signature: identity.sign(&payload),
            version: Some(PROTOCOL_VERSION.to_string()),
        })
        .await
        .map_err(|e| anyhow!("Failed to send registration: {}", e))?;

        let (certificate, signature) = match self.next_control(events).await? {
            Message::RegisterAck {
                accepted: true,
                certificate,
                signature,
                ..
            } => (certificate, signature),
            Message::RegisterAck {
                accepted: false,
                reason,
                ..
            } => {
                return Err(ConnectionError::Rejected(
                    reason.unwrap_or_else(|| "no reason given".to_string()),
                ))
            }
            other => {
                return Err(anyhow!("Expected registration ack, got {:?}", other.message_type()).into());
            }
        };

        let certificate = Certificate::from_bytes(&certificate)
            .map_err(|e| ConnectionError::ProxyUntrusted(e.to_string()))?;
        let proxy = self
            .checker
            .verify(&certificate, &[Role::Proxy])
            .map_err(|e| ConnectionError::ProxyUntrusted(e.to_string()))?;

        let payload = Message::register_ack_payload(&our_nonce, &proxy.domain, &proxy.subject);
        if !verify_signature(&proxy.public_key, &payload, &signature) {
            return Err(ConnectionError::ProxyUntrusted(
                "signature over our nonce did not verify".to_string(),
            ));
        }

        Ok(proxy)
    }

    async fn next_control(&self, events: &mut MuxEvents) -> Result<Message, ConnectionError> {
        match tokio::time::timeout(self.config.handshake_timeout, events.control.recv()).await {
            Ok(Some(message)) => Ok(message),
            Ok(None) => Err(anyhow!("Proxy closed the link during the handshake").into()),
            Err(_) => Err(anyhow!("Proxy handshake timed out").into()),
        }
    }
}

/// SSH client callbacks
pub(crate) struct SshHandler;

#[async_trait]
impl client::Handler for SshHandler {
    type Error = anyhow::Error;

    /// Any server key is accepted; the proxy proves itself with its host
    /// certificate once the channel is up.
    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        tracing::debug!("Proxy transport key: {}", server_public_key.fingerprint());
        Ok(true)
    }
}
