//! Send a single control command to a storage node.
//!
//! The command is given in its line form, one argument per word:
//!
//!   kvctl --port 50000 LOCK_WRITE
//!   kvctl --port 50000 UPDATE "server1,127.0.0.1,50000;server2,127.0.0.1,50001"
//!   kvctl --port 50000 RESOLVE_MIGRATION 7

use clap::Parser;
use ringstore::network::client::RpcClient;
use ringstore::network::rpc::{ControlRequest, ControlResponse};
use ringstore::{RetryConfig, ServerIdentity};
use std::process::ExitCode;
use std::time::Duration;
use tracing::debug;

/// Control command arguments.
#[derive(Parser, Debug)]
#[command(name = "kvctl")]
#[command(about = "Send a control command to a storage node")]
struct Args {
    /// Node address
    #[arg(long, default_value = "127.0.0.1")]
    address: String,

    /// Node port
    #[arg(long)]
    port: u16,

    /// Seconds to wait for the reply
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    /// Command keyword followed by its arguments
    #[arg(required = true, num_args = 1..)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "ringstore=warn".to_string()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let text = format!("{}\r", args.command.join("\n"));
    let request = ControlRequest::from_text(&text)?;
    debug!(command = %request, "Parsed control command");

    let target = ServerIdentity::new("target", args.address, args.port);
    let retry = RetryConfig::default().with_request_timeout(Duration::from_secs(args.timeout));
    let reply = RpcClient::new(retry).send_control(&target, request).await?;

    match reply {
        ControlResponse::Failed { reason } => {
            eprintln!("FAILED: {}", reason);
            Ok(ExitCode::FAILURE)
        }
        ControlResponse::Success => {
            println!("SUCCESS");
            Ok(ExitCode::SUCCESS)
        }
        ControlResponse::MoveDataComplete {
            migration_id,
            transferred,
        } => {
            println!("MOVE_DATA_COMPLETE {} {}", migration_id, transferred);
            Ok(ExitCode::SUCCESS)
        }
        ControlResponse::MigrationResolved {
            migration_id,
            outcome,
        } => {
            println!("MIGRATION_RESOLVED {} {:?}", migration_id, outcome);
            Ok(ExitCode::SUCCESS)
        }
    }
}
