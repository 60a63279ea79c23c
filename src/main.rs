//! Anvil node binary.
//!
//! Usage:
//!   anvil <name> <port> <public-url> [bootstrap-peer-url]
//!
//! Runs one node: loads or generates the identity keypair, restores the
//! chain from the data directory, starts the HTTP mesh server, announces to
//! the bootstrap peer, and enters the consensus event loop. Exits 0 on
//! SIGINT, non-zero when storage cannot be opened or restored.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use anvil::config::AnvilConfig;
use anvil::mesh::server::{self, MeshServer};
use anvil::node::{Node, NodeContext};
use anvil::storage::ChainStore;

/// Anvil participation-weighted payment network node.
#[derive(Parser, Debug)]
#[command(name = "anvil", version, about = "Anvil payment network node")]
struct Cli {
    /// Human-readable node name (logging and health output).
    name: String,

    /// Port the mesh server listens on.
    port: u16,

    /// URL peers use to reach this node, e.g. http://127.0.0.1:7001
    public_url: String,

    /// Bootstrap peer URL to announce to on startup.
    bootstrap_peer: Option<String>,

    /// Data directory for keys, chain and account cache.
    #[arg(long, default_value = "./anvil-data")]
    data_dir: PathBuf,

    /// Listen host.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let data_dir = cli.data_dir.join(&cli.name);
    let config = AnvilConfig::load(&data_dir);

    let store = ChainStore::open(&data_dir)?;
    let keypair = store.load_or_generate_keypair()?;
    let address = keypair.address();

    let ctx = NodeContext {
        name: cli.name.clone(),
        public_url: cli.public_url.clone(),
        keypair,
        address,
        params: config.protocol,
    };
    tracing::info!(
        name = %cli.name,
        address = %address,
        url = %cli.public_url,
        "starting anvil node"
    );

    let mut node = Node::new(ctx, store)?;

    let listen_addr: SocketAddr = format!("{}:{}", cli.host, cli.port).parse()?;
    let mesh_server = MeshServer {
        ctx: node.context(),
        node: node.state(),
        inbound: node.inbound_sender(),
    };
    tokio::spawn(async move {
        if let Err(e) = server::serve(listen_addr, mesh_server).await {
            tracing::error!(error = %e, "mesh server failed");
        }
    });

    node.bootstrap(cli.bootstrap_peer.as_deref()).await;

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("ctrl-c received, shutting down");
        shutdown_signal.cancel();
    });
    node.run(shutdown).await;
    Ok(())
}
