//! Cluster fabric node daemon
//!
//! Hosts interactive sessions for certificate-holding participants. Accepts
//! direct connections on its listen address and, when a proxy is configured,
//! keeps a link to it for presence and (as a site agent) for tunnelled
//! channels.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cf_auth::{CertChecker, TrustBundle};
use cf_core::config::{self, NodeConfig};
use cf_core::mux::MuxConfig;
use cf_core::services::{FileRecorder, SourceLimiter, TracingEventLog};
use cf_core::traits::PresenceSink;
use cf_node::listener::DirectListener;
use cf_node::presence::{run_publisher, DiscardPresence, LinkPresence};
use cf_node::pty::resolve_shell;
use cf_node::session::{SessionSettings, SessionTable};
use cf_node::state::NodeServices;
use cf_node::tunnel::{AgentConfig, ConnectorConfig, TunnelAgent, TunnelConnector};
use cf_node::{NodeIdentity, NodeServer, NodeState};

#[derive(Parser)]
#[command(name = "cf-node")]
#[command(about = "Cluster fabric node - hosts interactive sessions")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "CF_NODE_CONFIG")]
    config: Option<PathBuf>,

    /// Direct listen address (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

    /// Proxy tunnel endpoint (overrides config)
    #[arg(long, env = "CF_PROXY_ADDRESS")]
    proxy: Option<String>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Cluster fabric node starting...");

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config::default_config_dir().join("node.toml"));
    let mut config: NodeConfig = if config_path.exists() {
        config::load_config(&config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        tracing::info!("Using default configuration");
        NodeConfig::default()
    };
    if let Some(bind) = args.bind {
        config.listen_address = bind;
    }
    if let Some(proxy) = args.proxy {
        config.proxy_address = Some(proxy);
    }

    let identity = NodeIdentity::load(&config.identity_path)
        .with_context(|| format!("Failed to load node identity from {:?}", config.identity_path))?;
    if identity.domain != config.domain || identity.host != config.host {
        tracing::warn!(
            "Identity is for {}.{} but config names {}.{}; using the identity",
            identity.host,
            identity.domain,
            config.host,
            config.domain
        );
    }
    let identity = Arc::new(identity);

    let bundle = TrustBundle::load(&config.trust_bundle_path).with_context(|| {
        format!("Failed to load trust bundle from {:?}", config.trust_bundle_path)
    })?;
    tracing::info!("Trusting authorities of {:?}", bundle.domains());
    let checker = Arc::new(CertChecker::new(bundle));

    let shell = resolve_shell(config.shell.as_deref())?;
    tracing::info!("Session shell: {}", shell);

    let link_presence = Arc::new(LinkPresence::new());
    let presence: Arc<dyn PresenceSink> = if config.proxy_address.is_some() {
        link_presence.clone()
    } else {
        Arc::new(DiscardPresence)
    };

    let services = NodeServices {
        events: Arc::new(TracingEventLog),
        recorder: Arc::new(
            FileRecorder::new(&config.recordings_dir).with_context(|| {
                format!("Failed to open recordings dir {:?}", config.recordings_dir)
            })?,
        ),
        presence,
        limiter: Arc::new(SourceLimiter::new(config.limiter.clone())),
    };
    let state = Arc::new(NodeState::new(
        identity.domain.clone(),
        identity.host.clone(),
        config.advertise_address.clone(),
        services,
    ));

    let table = SessionTable::new(
        state.clone(),
        SessionSettings {
            shell,
            input_policy: config.input_policy,
            output_buffer: config.output_buffer,
        },
    );
    let server = Arc::new(NodeServer::new(
        state.clone(),
        table.clone(),
        checker.clone(),
        config.logins.clone(),
        config.handshake_timeout,
    ));

    let cancel = CancellationToken::new();

    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        cancel_clone.cancel();
    });

    if let Some(proxy_address) = config.proxy_address.clone() {
        tokio::spawn(run_publisher(
            table.clone(),
            config.presence_interval,
            cancel.clone(),
        ));

        let connector = TunnelConnector::new(
            ConnectorConfig {
                proxy_address,
                connect_timeout: config.connect_timeout,
                handshake_timeout: config.connect_timeout,
                mux: MuxConfig::default(),
            },
            identity.clone(),
            checker,
        );
        let agent = TunnelAgent::new(
            connector,
            server.clone(),
            link_presence,
            AgentConfig {
                heartbeat_interval: config.heartbeat_interval,
                splice_timeout: config.connect_timeout,
                backoff: config.backoff.clone(),
                accept_channels: config.site_agent,
            },
        );
        if config.site_agent {
            tracing::info!("Acting as tunnel agent for site {}", identity.domain);
        }

        let agent_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = agent.run(agent_cancel.clone()).await {
                tracing::error!("Proxy link abandoned: {}", e);
                agent_cancel.cancel();
            }
        });
    } else {
        tracing::info!("No proxy configured; serving direct connections only");
    }

    let listener = DirectListener::new(server, cancel.clone());
    let result = listener.run(&config.listen_address).await;

    cancel.cancel();
    table.terminate_all();
    tracing::info!("Node shutdown complete");
    result
}
