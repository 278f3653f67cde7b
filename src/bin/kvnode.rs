//! Storage node process.
//!
//! Started by a process launcher with the machine's identity:
//!
//!   RUST_LOG=ringstore=debug kvnode --name server1 --address 127.0.0.1 --port 50000

use clap::Parser;
use ringstore::{KvNode, NodeConfig, ServerIdentity};
use std::net::SocketAddr;
use tracing::info;

/// Storage node arguments.
#[derive(Parser, Debug)]
#[command(name = "kvnode")]
#[command(about = "Partitioned key-value storage node")]
struct Args {
    /// Node name announced in cluster metadata
    #[arg(long)]
    name: String,

    /// Address announced in cluster metadata
    #[arg(long, default_value = "127.0.0.1")]
    address: String,

    /// Port announced in cluster metadata
    #[arg(long)]
    port: u16,

    /// Bind to this address instead of address:port
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Target migration batch size in bytes
    #[arg(long)]
    batch_bytes: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "ringstore=info".to_string()),
        )
        .init();

    let args = Args::parse();

    let mut config = NodeConfig::new(ServerIdentity::new(args.name, args.address, args.port));
    if let Some(bind) = args.bind {
        config = config.with_bind_addr(bind);
    }
    if let Some(bytes) = args.batch_bytes {
        config = config.with_transfer_batch_bytes(bytes);
    }

    let node = KvNode::start(config).await?;
    info!(node = %node.identity(), addr = %node.local_addr(), "Waiting for controller");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            node.shutdown();
        }
        _ = node.terminated() => {}
    }

    node.wait().await;
    Ok(())
}
