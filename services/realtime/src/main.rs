//! Wallet realtime server entry point

use anyhow::{bail, Context};
use clap::Parser;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wallet_realtime::{RealtimeConfig, RealtimeServer, RelayHub, StaticAuthFile};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path (TOML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address, overrides the configuration file
    #[arg(long)]
    bind_address: Option<String>,

    /// Port, overrides the configuration file
    #[arg(short, long)]
    port: Option<u16>,

    /// Relay socket shared with other instances; enables the event bridge
    #[arg(long)]
    bridge_socket: Option<PathBuf>,

    /// Host the relay hub on the bridge socket inside this process
    #[arg(long, requires = "bridge_socket")]
    run_relay_hub: bool,

    /// Emit JSON log lines
    #[arg(long)]
    log_json: bool,

    /// JSON file with static tokens and wallet grants
    #[arg(long)]
    tokens: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "wallet_realtime=info,warn".into());
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!("Starting wallet realtime server");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args)?;
    info!("Configuration loaded: {:?}", config);

    let auth = match &args.tokens {
        Some(path) => StaticAuthFile::load(path)
            .with_context(|| format!("Failed to load token file {}", path.display()))?,
        None => {
            warn!("No token file given; every authentication attempt will be rejected");
            StaticAuthFile::default()
        }
    };
    let (verifier, wallet_access) = auth.into_parts();

    let _hub = if args.run_relay_hub {
        let Some(path) = config.bridge.relay_socket_path.as_ref() else {
            bail!("--run-relay-hub needs a relay socket path");
        };
        let hub = RelayHub::bind(path).context("Failed to bind relay hub")?;
        info!("Relay hub listening on {}", hub.path().display());
        Some(hub.spawn())
    } else {
        None
    };

    let server = Arc::new(RealtimeServer::new(
        config,
        Arc::new(verifier),
        Arc::new(wallet_access),
    ));
    server.connect_bridge().await;

    // Handle shutdown gracefully
    tokio::spawn(shutdown_on_signal(tokio::signal::ctrl_c(), server.clone()));

    if let Err(e) = server.start().await {
        error!("Realtime server error: {}", e);
        return Err(e.into());
    }

    Ok(())
}

/// Shut the server down once `signal` fires
///
/// A signal handler that cannot be installed leaves the server running.
async fn shutdown_on_signal<F>(signal: F, server: Arc<RealtimeServer>)
where
    F: Future<Output = std::io::Result<()>>,
{
    match signal.await {
        Ok(()) => {
            info!("Shutdown signal received");
            server.shutdown();
        }
        Err(e) => error!("Failed to install CTRL+C signal handler: {}", e),
    }
}

fn load_config(args: &Args) -> anyhow::Result<RealtimeConfig> {
    let mut config = RealtimeConfig::load(args.config.as_deref())?;

    if let Some(bind_address) = &args.bind_address {
        config.server.bind_address = bind_address.clone();
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(socket) = &args.bridge_socket {
        config.bridge.enabled = true;
        config.bridge.relay_socket_path = Some(socket.clone());
    }

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wallet_realtime::{AllowAllWalletAccess, StaticTokenVerifier};

    fn server() -> Arc<RealtimeServer> {
        Arc::new(RealtimeServer::new(
            RealtimeConfig::default(),
            Arc::new(StaticTokenVerifier::default()),
            Arc::new(AllowAllWalletAccess),
        ))
    }

    #[tokio::test]
    async fn test_signal_shuts_server_down() {
        let server = server();
        shutdown_on_signal(async { Ok(()) }, server.clone()).await;
        assert!(server.manager().is_shutting_down());
    }

    #[tokio::test]
    async fn test_failed_signal_install_keeps_serving() {
        let server = server();
        let failed = async { Err(std::io::Error::new(std::io::ErrorKind::Other, "no signals")) };
        shutdown_on_signal(failed, server.clone()).await;
        assert!(!server.manager().is_shutting_down());
    }
}
