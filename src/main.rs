//! liveim chat relay
//!
//! Runs the relay server or a demo client that prints what the relay
//! delivers and sends stdin lines to the room.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use liveim_relay::client::{self, ClientError};
use liveim_relay::config::{ClientOverrides, RelayConfig, ServerOverrides};
use liveim_relay::server::RelayServer;

/// liveim chat relay
///
/// Chat demo on WebSocket
#[derive(Parser, Debug)]
#[command(name = "liveim")]
#[command(version, about, long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// TOML config file with [server] and [client] sections
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the chat relay server
    Server {
        /// Server id
        #[arg(short = 'i', long = "serverid")]
        id: Option<String>,

        /// Listen address, host:port or :port for all interfaces
        #[arg(short, long)]
        listen: Option<String>,
    },
    /// Start a chat client
    Client {
        /// Server address
        #[arg(short, long)]
        addr: Option<String>,

        /// Client user id
        #[arg(short, long)]
        user: Option<String>,

        /// Heartbeat interval in seconds
        #[arg(long)]
        heartbeat: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    info!("liveim relay v{}", env!("CARGO_PKG_VERSION"));

    let result = run(args).await;
    if let Err(e) = &result {
        error!("Could not run command: {:#}", e);
    }
    result
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = RelayConfig::load_optional(args.config.as_deref())?;

    match args.command {
        Command::Server { id, listen } => run_server(&config, ServerOverrides { id, listen }).await,
        Command::Client {
            addr,
            user,
            heartbeat,
        } => {
            let overrides = ClientOverrides {
                addr,
                user,
                heartbeat_secs: heartbeat,
            };
            run_client(&config, overrides).await
        }
    }
}

async fn run_server(config: &RelayConfig, overrides: ServerOverrides) -> anyhow::Result<()> {
    let server = Arc::new(RelayServer::new(config.server_config(overrides)?));
    info!(
        "Starting relay {} on {}",
        server.config().id,
        server.config().listen_addr()
    );

    let server_handle = Arc::clone(&server);

    // Spawn shutdown signal handler
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        server_handle.shutdown();
    });

    server.run().await?;

    info!("Server shutdown complete");
    Ok(())
}

async fn run_client(config: &RelayConfig, overrides: ClientOverrides) -> anyhow::Result<()> {
    let client_config = config.client_config(overrides)?;
    let mut handle = client::connect(&client_config).await?;
    info!("Connected as {}", client_config.user);

    if let Some(mut inbound) = handle.take_inbound() {
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                info!("Receive message: {}", message);
            }
        });
    }

    let conn = handle.connection();
    let sender = Arc::clone(&conn);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Err(e) = sender.write_text(line).await {
                warn!("Failed to send message: {}", e);
                break;
            }
        }
    });

    tokio::select! {
        exit = handle.closed() => {
            match exit {
                Some(ClientError::RemoteClosed) | None => info!("Connection closed"),
                Some(e) => warn!("Connection closed: {}", e),
            }
        }
        _ = shutdown_signal() => {
            info!("Closing connection...");
            conn.close().await;
        }
    }

    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
