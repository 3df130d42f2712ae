//! SSH tunnel endpoint
//!
//! Sites and nodes dial in over SSH and open one session channel, inside
//! which the link runs. SSH authentication accepts any key: the transport
//! only carries bytes, and the link handshake decides who the peer is.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use russh::server::{Auth, Handler, Msg, Session};
use russh::Channel;
use russh_keys::key::{KeyPair, PublicKey};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use cf_core::services::Permit;

use super::link::serve_link;
use crate::state::ProxyState;

/// SSH server that accepts inbound links
pub struct TunnelServer {
    ssh_config: Arc<russh::server::Config>,
    state: Arc<ProxyState>,
    cancel: CancellationToken,
}

impl TunnelServer {
    pub fn new(host_key: KeyPair, state: Arc<ProxyState>, cancel: CancellationToken) -> Self {
        let mut config = russh::server::Config::default();
        config.keys.push(host_key);
        config.auth_rejection_time = Duration::from_secs(1);
        config.auth_rejection_time_initial = Some(Duration::from_secs(0));
        config.inactivity_timeout = None;

        Self {
            ssh_config: Arc::new(config),
            state,
            cancel,
        }
    }

    /// Bind and serve until cancelled
    pub async fn run(&self, bind_addr: &str) -> Result<()> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", bind_addr))?;
        self.serve(listener).await
    }

    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        tracing::info!("Tunnel endpoint listening on {}", local_addr);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("Tunnel endpoint shutting down");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((socket, peer_addr)) => self.handle_connection(socket, peer_addr),
                        Err(e) => tracing::error!("Failed to accept connection: {}", e),
                    }
                }
            }
        }

        Ok(())
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        let limiter = &self.state.services.limiter;
        let Some(permit) = Permit::acquire(limiter, &peer_addr.ip().to_string()) else {
            tracing::warn!("Connection from {} refused by the admission limiter", peer_addr);
            return;
        };
        tracing::info!("New connection from {}", peer_addr);

        let config = Arc::clone(&self.ssh_config);
        let handler = LinkHandler {
            state: Arc::clone(&self.state),
            peer_addr,
            cancel: self.cancel.clone(),
            channel_opened: false,
        };
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let _permit = permit;
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Connection handler cancelled for {}", peer_addr);
                    return;
                }
                result = run_session(config, socket, handler) => result
            };

            match result {
                Ok(()) => tracing::info!("Connection from {} closed normally", peer_addr),
                Err(e) => tracing::warn!("Connection from {} closed with error: {}", peer_addr, e),
            }
        });
    }
}

async fn run_session(
    config: Arc<russh::server::Config>,
    socket: TcpStream,
    handler: LinkHandler,
) -> Result<()> {
    let session = russh::server::run_stream(config, socket, handler).await?;
    session.await?;
    Ok(())
}

/// Callbacks for one SSH connection
struct LinkHandler {
    state: Arc<ProxyState>,
    peer_addr: SocketAddr,
    cancel: CancellationToken,
    channel_opened: bool,
}

#[async_trait]
impl Handler for LinkHandler {
    type Error = anyhow::Error;

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        tracing::debug!(
            "Transport auth from {} ({}), key fingerprint: {}",
            self.peer_addr,
            user,
            public_key.fingerprint()
        );
        Ok(Auth::Accept)
    }

    /// The first session channel carries the link; any further ones are refused
    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.channel_opened {
            tracing::warn!("Refusing second session channel from {}", self.peer_addr);
            return Ok(false);
        }
        self.channel_opened = true;
        tracing::debug!("Link channel opened by {}", self.peer_addr);

        tokio::spawn(serve_link(
            Arc::clone(&self.state),
            channel.into_stream(),
            self.peer_addr.to_string(),
            self.cancel.clone(),
        ));
        Ok(true)
    }
}

/// Load the SSH host key, generating and saving one on first start
pub async fn load_or_generate_host_key(path: &Path) -> Result<KeyPair> {
    if path.exists() {
        tracing::info!("Loading host key from {:?}", path);
        let key = russh_keys::load_secret_key(path, None)
            .with_context(|| format!("Failed to load host key from {:?}", path))?;
        return Ok(key);
    }

    tracing::info!("Generating new host key at {:?}", path);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }

    let key = KeyPair::generate_ed25519()
        .ok_or_else(|| anyhow::anyhow!("Failed to generate Ed25519 key"))?;
    let mut pem = Vec::new();
    russh_keys::encode_pkcs8_pem(&key, &mut pem).context("Failed to encode host key")?;
    tokio::fs::write(path, pem)
        .await
        .with_context(|| format!("Failed to write host key to {:?}", path))?;
    restrict_permissions(path)?;

    Ok(key)
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
