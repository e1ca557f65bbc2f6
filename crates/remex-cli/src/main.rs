//! Remex demo - host or drive a remote execution server.
//!
//! `remex server` hosts the demo catalog until Ctrl+C, `remex client` runs a
//! scripted session against a running server, and `remex both` does both in
//! one process.

mod demo;

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use remex_core::{Dispatcher, Endpoint, RemoteExecutionServer, ServerConfig};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Role {
    Server,
    Client,
    Both,
}

#[derive(Parser, Debug)]
#[command(name = "remex")]
#[command(about = "Remote object execution demo")]
struct Args {
    /// Which side(s) of the connection to run
    #[arg(value_enum, default_value = "both")]
    role: Role,

    /// Endpoint name the server listens on
    #[arg(short, long, default_value = "MyRemoteServer")]
    name: String,

    /// Host of the server ("." is this machine)
    #[arg(long, default_value = ".")]
    host: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let endpoint = Endpoint::on_host(args.host, args.name);

    if args.role == Role::Client {
        return demo::run_client(endpoint).await;
    }

    let dispatcher = Arc::new(Dispatcher::from_catalog(demo::catalog()));
    let server = RemoteExecutionServer::start(ServerConfig::new(endpoint), dispatcher).await?;
    info!("Remote execution server listening on {}", server.endpoint());

    let outcome = match args.role {
        Role::Both => demo::run_client(server.endpoint().clone()).await,
        _ => {
            // Wait for shutdown signal
            tokio::signal::ctrl_c().await?;
            info!("Shutdown signal received");
            Ok(())
        }
    };

    server.shutdown().await;
    info!("Server stopped");
    outcome
}
