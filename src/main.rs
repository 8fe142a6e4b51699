//! git-bridge gateway
//!
//! An SSH server that authenticates Git clients by public key fingerprint and
//! proxies `git upload-pack` / `git receive-pack`, plus the credential
//! service that issues personal access tokens and registers SSH keys.

mod api;
mod config;
mod credentials;
mod error;
mod fingerprint;
mod git;
mod hashing;
mod resolver;
mod ssh;
mod store;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{Level, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::ApiState;
use crate::config::GatewayConfig;
use crate::credentials::CredentialService;
use crate::resolver::AuthCache;
use crate::store::{CredentialBackend, JsonStore};

/// git-bridge - Git over SSH with delegated key lookup
#[derive(Parser, Debug)]
#[command(name = "git-bridge-gateway", version, about)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/git-bridge/gateway.toml")]
    config: PathBuf,

    /// Generate default configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Override SSH listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Override credential API listen address
    #[arg(long)]
    api_listen: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Run only the SSH gateway
    Ssh,
    /// Run only the credential API
    Api,
    /// Run the SSH gateway and the credential API (default)
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new(Level::DEBUG.to_string())
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if cli.generate_config {
        let config = GatewayConfig::default();
        let content = toml::to_string_pretty(&config)?;
        println!("{}", content);
        return Ok(());
    }

    let mut config = GatewayConfig::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;
    config.apply_env();

    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }
    if let Some(api_listen) = cli.api_listen {
        config.api.listen_addr = api_listen;
    }

    let command = cli.command.unwrap_or(Command::Serve);
    if command == Command::Serve && config.lookup.base_url.is_none() {
        config.lookup.base_url = Some(local_api_url(&config.api.listen_addr)?);
    }

    config.ensure_dirs()?;

    info!("Starting git-bridge-gateway ({:?})", command);
    let config = Arc::new(config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });
    let shutdown = move || {
        let mut rx = shutdown_rx.clone();
        async move {
            let _ = rx.wait_for(|stop| *stop).await;
        }
    };

    match command {
        Command::Ssh => run_ssh(config, shutdown()).await,
        Command::Api => {
            let (listener, state) = prepare_api(&config).await?;
            api::serve(listener, state, shutdown()).await
        }
        Command::Serve => run_serve(config, shutdown(), shutdown()).await,
    }
}

/// Run the credential API and the SSH gateway together. The API is bound
/// first, and whichever server fails first ends the process.
async fn run_serve(
    config: Arc<GatewayConfig>,
    api_shutdown: impl Future<Output = ()> + Send + 'static,
    ssh_shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let (listener, state) = prepare_api(&config).await?;
    tokio::try_join!(
        api::serve(listener, state, api_shutdown),
        run_ssh(config, ssh_shutdown),
    )?;
    Ok(())
}

async fn run_ssh(
    config: Arc<GatewayConfig>,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    if config.lookup.base_url.is_none() {
        bail!("lookup.base_url (or SSH_LOOKUP_BASE_URL) is required for the SSH gateway");
    }

    let resolver = AuthCache::new(&config.lookup).context("Failed to create identity resolver")?;
    info!("  SSH listen address: {}", config.listen_addr);
    info!(
        "  Lookup backend: {} (ttl {}s, negative ttl {}s)",
        config.lookup.base_url.as_deref().unwrap_or_default(),
        config.lookup.lookup_ttl_secs,
        config.lookup.negative_ttl_secs
    );

    ssh::run_server(config, Arc::new(resolver), shutdown).await
}

/// Open the credential store, build the API state and bind the listener.
async fn prepare_api(config: &GatewayConfig) -> Result<(TcpListener, Arc<ApiState>)> {
    let backend: Arc<dyn CredentialBackend> = match &config.api.store_path {
        Some(path) => {
            let store = JsonStore::load(path.clone())
                .await
                .with_context(|| format!("Failed to load credential store from {}", path.display()))?;
            info!("Credential store loaded from {}", path.display());
            Arc::new(store)
        }
        None => {
            warn!("No store_path configured, credentials are kept in memory only");
            Arc::new(JsonStore::in_memory())
        }
    };

    let admin = match (&config.api.admin_user, &config.api.admin_password) {
        (Some(user), Some(password)) => Some((user.clone(), password.clone())),
        (None, None) => {
            warn!("No admin credentials configured, the credential API is unauthenticated");
            None
        }
        _ => bail!("api.admin_user and api.admin_password must be set together"),
    };

    info!("  API listen address: {}", config.api.listen_addr);
    info!("  Token hash algorithm: {}", config.hashing.algorithm);

    let listener = api::bind(&config.api.listen_addr).await?;
    let service = Arc::new(CredentialService::new(backend, config.hashing.clone()));
    Ok((listener, Arc::new(ApiState::new(service, admin))))
}

/// URL of the credential API when both run in one process. A wildcard
/// listen address is reached over loopback of the same family.
fn local_api_url(listen_addr: &str) -> Result<String> {
    let addr: SocketAddr = listen_addr
        .parse()
        .with_context(|| format!("Invalid API listen address: {}", listen_addr))?;
    let ip = match addr.ip() {
        ip if !ip.is_unspecified() => ip,
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
    };
    Ok(format!("http://{}", SocketAddr::new(ip, addr.port())))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
