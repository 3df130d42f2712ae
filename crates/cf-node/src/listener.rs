//! Direct connection listener
//!
//! Participants on the node's own network connect here instead of through a
//! tunnel channel. Each accepted connection passes the admission checkpoint
//! before it reaches the session server.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use cf_core::mux::FramedConduit;
use cf_core::services::Permit;

use crate::server::NodeServer;

pub struct DirectListener {
    server: Arc<NodeServer>,
    cancel: CancellationToken,
}

impl DirectListener {
    pub fn new(server: Arc<NodeServer>, cancel: CancellationToken) -> Self {
        Self { server, cancel }
    }

    /// Bind and serve until cancelled
    pub async fn run(&self, bind_addr: &str) -> Result<()> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", bind_addr))?;
        self.serve(listener).await
    }

    /// Serve an already bound listener until cancelled
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        tracing::info!("Node listening on {}", local_addr);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("Node listener shutting down");
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
        let limiter = &self.server.state().services.limiter;
        let Some(permit) = Permit::acquire(limiter, &peer_addr.ip().to_string()) else {
            tracing::warn!("Connection from {} refused by the admission limiter", peer_addr);
            return;
        };
        tracing::debug!("New connection from {}", peer_addr);

        if let Err(e) = socket.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
        }

        let server = Arc::clone(&self.server);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let conduit = FramedConduit::new(socket, peer_addr.to_string());
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Connection handler cancelled for {}", peer_addr);
                }
                _ = server.serve(Box::new(conduit)) => {
                    tracing::debug!("Connection from {} closed", peer_addr);
                }
            }
        });
    }
}
