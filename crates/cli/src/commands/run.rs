//! Run command implementation
//!
//! Starts a validator from a data directory holding `priv_key`, `peers.json`
//! and optionally `peers.genesis.json` and `config.json`. Command line flags
//! override the config file.

use anyhow::{Context, Result};
use clap::Args;
use hashweave_adapters::{HttpServer, ServerConfig};
use hashweave_federation::{DummyApp, InmemProxy, LogExceptions, Node, NodeConfig, TcpTransport};
use hashweave_protocol::{PeerSet, Signer};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tracing::error;

use super::keygen::read_key;

pub const PEERS_FILE: &str = "peers.json";
pub const GENESIS_PEERS_FILE: &str = "peers.genesis.json";
pub const CONFIG_FILE: &str = "config.json";

#[derive(Args)]
pub struct RunArgs {
    /// Data directory with the key, peers and optional config
    #[arg(long, default_value = ".hashweave")]
    pub datadir: PathBuf,
    /// Address to listen on for peers
    #[arg(short, long)]
    pub listen: Option<String>,
    /// Address announced to peers
    #[arg(long)]
    pub advertise: Option<String>,
    /// Node name
    #[arg(short, long)]
    pub moniker: Option<String>,
    /// Persist the hashgraph in the data directory
    #[arg(long)]
    pub store: bool,
    /// Catch up from a peer's snapshot on start
    #[arg(long)]
    pub fast_sync: bool,
    /// Gossip interval in milliseconds
    #[arg(long)]
    pub heartbeat: Option<u64>,
    /// Maximum events per sync response
    #[arg(long)]
    pub sync_limit: Option<usize>,
    /// Address for the HTTP service
    #[arg(long)]
    pub http: Option<String>,
}

/// Execute the run command
pub async fn execute_run_command(args: RunArgs) -> Result<()> {
    let key = read_key(&args.datadir)?;
    let genesis = load_genesis_peers(&args.datadir)?;
    let config = build_config(&args)?;

    println!("🌐 Starting Hashweave node {}...", config.moniker);
    println!("📁 Data directory: {}", args.datadir.display());
    println!("🔑 Public key: {}", key.public_key_hex());
    println!("👥 Genesis peers: {}", genesis.len());
    println!();

    let transport = Arc::new(
        TcpTransport::bind(
            &config.bind_addr,
            config.advertise_addr.clone(),
            config.max_pool,
            config.tcp_timeout(),
        )
        .await
        .context("Failed to bind the peer transport")?,
    );
    let app = Arc::new(DummyApp::new());
    let proxy = Arc::new(InmemProxy::new(app, Arc::new(LogExceptions)));

    let node = Node::new(config, key, genesis, transport, proxy).context("Failed to create node")?;
    node.run().await.context("Failed to start node")?;

    if let Some(bind_addr) = args.http.clone() {
        let server = HttpServer::new(ServerConfig { bind_addr }, node.clone());
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("HTTP service stopped: {}", e);
            }
        });
    }

    println!("✅ Node {} started in state {}", node.id(), node.state().await);
    println!("🔄 Node running... Press Ctrl+C to shutdown");
    wait_for_shutdown().await;

    println!("\n🛑 Shutting down node...");
    node.shutdown().await.context("Failed to shutdown node gracefully")?;
    println!("✅ Node shutdown complete");
    Ok(())
}

/// Genesis peers come from `peers.genesis.json`, falling back to
/// `peers.json`.
pub fn load_genesis_peers(datadir: &Path) -> Result<PeerSet> {
    let genesis = datadir.join(GENESIS_PEERS_FILE);
    let path = if genesis.exists() {
        genesis
    } else {
        datadir.join(PEERS_FILE)
    };
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read peers file: {}", path.display()))?;
    PeerSet::from_json(&raw).with_context(|| format!("Invalid peers file: {}", path.display()))
}

pub fn build_config(args: &RunArgs) -> Result<NodeConfig> {
    let file = args.datadir.join(CONFIG_FILE);
    let mut config = if file.exists() {
        NodeConfig::from_file(&file)?
    } else {
        NodeConfig::default()
    };
    if let Some(listen) = &args.listen {
        config.bind_addr = listen.clone();
    }
    if let Some(advertise) = &args.advertise {
        config.advertise_addr = Some(advertise.clone());
    }
    if let Some(moniker) = &args.moniker {
        config.moniker = moniker.clone();
    }
    if args.store {
        config.data_dir = Some(args.datadir.join("db"));
    }
    if args.fast_sync {
        config.enable_fast_sync = true;
    }
    if let Some(heartbeat) = args.heartbeat {
        config.heartbeat_ms = heartbeat;
    }
    if let Some(limit) = args.sync_limit {
        config.sync_limit = limit;
    }
    Ok(config)
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
