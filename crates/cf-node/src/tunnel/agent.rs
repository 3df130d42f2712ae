//! Proxy link supervisor
//!
//! Keeps one registered link to the proxy up: heartbeats on the control
//! channel, presence over the same link, and every channel the proxy opens
//! served either by this node's session server or spliced to another host.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use cf_core::config::BackoffConfig;
use cf_core::mux::{FramedConduit, IncomingChannel, Mux, MuxEvents};
use cf_core::time::{current_time_millis, elapsed_millis};
use cf_core::traits::splice;
use cf_protocol::{ErrorCode, Message};

use super::connector::{ConnectionError, TunnelConnector};
use super::reconnect::ExponentialBackoff;
use crate::presence::{publish_snapshot, LinkPresence};
use crate::server::NodeServer;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub heartbeat_interval: Duration,
    /// Dial timeout for channels spliced to other hosts
    pub splice_timeout: Duration,
    pub backoff: BackoffConfig,
    /// Serve channels the proxy opens; only site agents do
    pub accept_channels: bool,
}

pub struct TunnelAgent {
    connector: TunnelConnector,
    server: Arc<NodeServer>,
    presence: Arc<LinkPresence>,
    config: AgentConfig,
}

impl TunnelAgent {
    pub fn new(
        connector: TunnelConnector,
        server: Arc<NodeServer>,
        presence: Arc<LinkPresence>,
        config: AgentConfig,
    ) -> Self {
        Self {
            connector,
            server,
            presence,
            config,
        }
    }

    /// Keep a link up until cancelled. Returns early only when the proxy
    /// rejects this node or fails to prove its identity.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ConnectionError> {
        let mut backoff = ExponentialBackoff::from_config(&self.config.backoff);

        loop {
            let mut link = match self.connector.connect_with_retry(&mut backoff, &cancel).await {
                Ok(link) => link,
                Err(ConnectionError::Cancelled) => return Ok(()),
                Err(e) => return Err(e),
            };

            self.serve_link(&link.mux, &mut link.events, &cancel).await;
            link.close().await;

            if cancel.is_cancelled() {
                return Ok(());
            }

            let delay = backoff.next_delay();
            warn!("Proxy link lost; reconnecting in {:?}", delay);
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Serve a registered link until it drops or `cancel` fires
    pub async fn serve_link(&self, mux: &Mux, events: &mut MuxEvents, cancel: &CancellationToken) {
        self.presence.attach(mux.clone()).await;
        if let Err(e) = publish_snapshot(self.server.table()).await {
            debug!(error = %e, "Initial presence snapshot not delivered");
        }

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                _ = mux.closed() => {
                    warn!(tunnel = %mux.label(), "Proxy link closed");
                    break;
                }

                _ = heartbeat.tick() => {
                    let ping = Message::Heartbeat { timestamp: current_time_millis() };
                    if let Err(e) = mux.send_control(ping).await {
                        warn!(tunnel = %mux.label(), error = %e, "Heartbeat not sent");
                        break;
                    }
                }

                control = events.control.recv() => match control {
                    Some(Message::HeartbeatAck { timestamp }) => {
                        trace!(latency_ms = elapsed_millis(timestamp), "Heartbeat acknowledged");
                    }
                    Some(Message::Heartbeat { timestamp }) => {
                        let _ = mux.send_control(Message::HeartbeatAck { timestamp }).await;
                    }
                    Some(Message::Error { code, message }) => {
                        warn!(tunnel = %mux.label(), ?code, %message, "Proxy reported an error");
                    }
                    Some(other) => {
                        debug!(tunnel = %mux.label(), "Ignoring {:?} on the control channel", other.message_type());
                    }
                    None => break,
                },

                incoming = events.incoming.recv() => match incoming {
                    Some(incoming) if self.config.accept_channels => self.dispatch(incoming),
                    Some(incoming) => {
                        debug!(target = %incoming.target(), "Refusing channel; not a site agent");
                        incoming.reject(ErrorCode::AccessDenied, "not a site agent").await;
                    }
                    None => break,
                },
            }
        }

        self.presence.detach().await;
    }

    fn dispatch(&self, incoming: IncomingChannel) {
        let server = self.server.clone();
        let splice_timeout = self.config.splice_timeout;

        tokio::spawn(async move {
            let target = incoming.target().to_string();
            let state = server.state();

            if target == state.host || target == state.advertise_address {
                match incoming.accept().await {
                    Ok(channel) => server.serve(Box::new(channel)).await,
                    Err(e) => debug!(%target, error = %e, "Channel gone before accept"),
                }
                return;
            }

            let mut remote = match FramedConduit::connect(&target, splice_timeout).await {
                Ok(remote) => remote,
                Err(e) => {
                    info!(%target, error = %e, "Splice target unreachable");
                    incoming
                        .reject(ErrorCode::TargetUnreachable, format!("{} unreachable", target))
                        .await;
                    return;
                }
            };
            let mut channel = match incoming.accept().await {
                Ok(channel) => channel,
                Err(e) => {
                    debug!(%target, error = %e, "Channel gone before accept");
                    return;
                }
            };
            debug!(%target, "Splicing channel to host");
            splice(&mut channel, &mut remote).await;
        });
    }
}
