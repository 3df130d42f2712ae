//! Cluster fabric proxy daemon
//!
//! Accepts reverse tunnels from remote sites and presence links from local
//! nodes, and serves the access gateway on a loopback API port. The
//! subcommands bootstrap accounts and node identities against the same
//! data directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cf_auth::{
    AuthConfig, AuthServer, CaClass, HostCertRequest, KeyPair, Role, StandardPermissions,
    TrustBundle,
};
use cf_core::config::{self, ProxyConfig};
use cf_core::services::{DirStore, SourceLimiter, TracingEventLog};
use cf_node::NodeIdentity;
use cf_proxy::api::ApiServer;
use cf_proxy::tunnel::{load_or_generate_host_key, run_sweeper, TunnelServer};
use cf_proxy::{Gateway, ProxyServices, ProxyState};

#[derive(Parser)]
#[command(name = "cf-proxy")]
#[command(about = "Cluster fabric proxy - reverse tunnels and the access gateway")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "CF_PROXY_CONFIG")]
    config: Option<PathBuf>,

    /// Tunnel endpoint bind address (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Create a signup token for a new user
    Invite {
        #[arg(long)]
        user: String,

        /// Logins the user may assume on nodes
        #[arg(long, value_delimiter = ',')]
        logins: Vec<String>,
    },

    /// Set a user's password and print a fresh second factor
    SetPassword {
        #[arg(long)]
        user: String,

        #[arg(long, value_delimiter = ',')]
        logins: Vec<String>,

        /// Grant the admin role
        #[arg(long)]
        admin: bool,

        #[arg(long, env = "CF_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// Issue a host identity and write it with the trust bundle
    IssueNode {
        #[arg(long)]
        host: String,

        /// Site domain (defaults to the local domain)
        #[arg(long)]
        domain: Option<String>,

        /// node or remote-site
        #[arg(long, default_value = "node")]
        role: String,

        /// Certificate validity in seconds; 0 never expires
        #[arg(long, default_value_t = 30 * 24 * 3600)]
        validity_secs: u64,

        #[arg(long)]
        out_dir: PathBuf,
    },

    /// Trust the authorities in a bundle exported by another site
    ImportTrust {
        #[arg(long)]
        bundle: PathBuf,
    },
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

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config::default_config_dir().join("proxy.toml"));
    let mut config: ProxyConfig = if config_path.exists() {
        config::load_config(&config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        tracing::info!("Using default configuration");
        ProxyConfig::default()
    };
    if let Some(bind) = args.bind {
        config.tunnel_address = bind;
    }

    let auth = open_auth(&config)?;
    match args.command {
        None => serve(config, auth).await,
        Some(command) => run_command(&config, auth, command).await,
    }
}

fn open_auth(config: &ProxyConfig) -> Result<AuthServer> {
    let store = DirStore::open(&config.data_dir)
        .with_context(|| format!("Failed to open data dir {:?}", config.data_dir))?;
    Ok(AuthServer::new(
        AuthConfig {
            domain: config.domain.clone(),
            session_ttl: config.session_ttl,
            signup_token_ttl: config.signup_token_ttl,
            ..AuthConfig::default()
        },
        Arc::new(store),
        Arc::new(TracingEventLog),
        Arc::new(StandardPermissions),
    ))
}

async fn serve(config: ProxyConfig, auth: AuthServer) -> Result<()> {
    tracing::info!("Cluster fabric proxy starting for {}...", config.domain);

    let host_key = load_or_generate_host_key(&config.host_key_path).await?;
    if let Ok(public) = host_key.clone_public_key() {
        tracing::info!("Host key fingerprint: {}", public.fingerprint());
    }

    let services = ProxyServices {
        events: Arc::new(TracingEventLog),
        limiter: Arc::new(SourceLimiter::new(config.limiter.clone())),
    };
    let tunnel_address = config.tunnel_address.clone();
    let api_address = config.api_address.clone();
    let state = ProxyState::bootstrap(config, auth, services)
        .await
        .context("Failed to bootstrap proxy state")?;

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

    tokio::spawn(run_sweeper(state.clone(), cancel.clone()));

    let api = ApiServer::new(api_address, Gateway::new(state.clone()))
        .with_shutdown_token(cancel.clone());
    let api_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = api.run().await {
            tracing::error!("API server failed: {:#}", e);
            api_cancel.cancel();
        }
    });

    let server = TunnelServer::new(host_key, state, cancel.clone());
    let result = server.run(&tunnel_address).await;

    cancel.cancel();
    tracing::info!("Proxy shutdown complete");
    result
}

async fn run_command(config: &ProxyConfig, auth: AuthServer, command: Command) -> Result<()> {
    for class in [CaClass::User, CaClass::Host] {
        auth.upsert_cert_authority(&config.domain, class).await?;
    }

    match command {
        Command::Invite { user, logins } => {
            let token = auth.create_signup_token(&user, logins).await?;
            println!("{}", auth.render_user_invite(&token).await?);
        }

        Command::SetPassword {
            user,
            logins,
            admin,
            password,
        } => {
            auth.upsert_user(&user, logins).await?;
            let setup = auth.upsert_password(&user, &password).await?;
            if admin {
                auth.set_user_role(&user, Role::Admin).await?;
            }
            println!("Password set for {}", user);
            println!("Second factor: {}", setup.otp_url);
        }

        Command::IssueNode {
            host,
            domain,
            role,
            validity_secs,
            out_dir,
        } => {
            let domain = domain.unwrap_or_else(|| config.domain.clone());
            let role: Role = role.parse().map_err(anyhow::Error::msg)?;
            if !role.is_host_role() || role == Role::Proxy {
                anyhow::bail!("{} is not a site role", role);
            }
            if domain != config.domain && auth.upsert_cert_authority(&domain, CaClass::Host).await? {
                println!("Created host authority for {}", domain);
            }

            let key = KeyPair::generate();
            let certificate = auth
                .issue_host_certificate(
                    Role::Admin,
                    HostCertRequest {
                        domain: domain.clone(),
                        host: host.clone(),
                        public_key: key.public_key(),
                        role,
                        validity: Duration::from_secs(validity_secs),
                    },
                )
                .await?;
            let bundle = auth.export_trust_bundle().await?;
            write_node_files(&out_dir, NodeIdentity::new(key, certificate), bundle)?;
            println!("Wrote identity for {}.{} to {:?}", host, domain, out_dir);
        }

        Command::ImportTrust { bundle } => {
            let bundle = TrustBundle::load(&bundle)
                .with_context(|| format!("Failed to load trust bundle {:?}", bundle))?;
            let imported = auth.import_authority(&bundle).await?;
            println!("Imported {} authorities for {:?}", imported, bundle.domains());
        }
    }
    Ok(())
}

fn write_node_files(out_dir: &Path, identity: NodeIdentity, bundle: TrustBundle) -> Result<()> {
    identity.save(&out_dir.join("node_identity.json"))?;
    bundle
        .save(&out_dir.join("trust_bundle.json"))
        .with_context(|| format!("Failed to write trust bundle to {:?}", out_dir))?;
    Ok(())
}
