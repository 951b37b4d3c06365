// fxtunnel CLI: run the tunnel server or the tunnel client

mod logging;

use clap::{Parser, Subcommand};
use fxtunnel_client::TunnelClient;
use fxtunnel_config::{exit, Config};
use fxtunnel_server::{ServerError, TunnelServer};
use fxtunnel_store::{FileStore, Store};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "fxtunnel")]
#[command(about = "Self-hosted tunnels: public subdomains and ports for local services")]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "fxtunnel.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the tunnel server
    Serve,
    /// Run the tunnel client with the configured tunnels
    Client,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load_from_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("fxtunnel: {}", e);
            std::process::exit(exit::CONFIG_ERROR);
        }
    };

    if let Err(e) = logging::initialize_logging(&config.logging) {
        eprintln!("fxtunnel: failed to initialize logging: {}", e);
        std::process::exit(exit::CONFIG_ERROR);
    }

    let code = match cli.command {
        Command::Serve => run_server(config).await,
        Command::Client => run_client(config).await,
    };
    std::process::exit(code);
}

/// Resolve when the process receives TERM or INT
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install TERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn run_server(config: Config) -> i32 {
    if let Err(e) = config.validate_server() {
        error!("{}", e);
        return exit::CONFIG_ERROR;
    }

    let store: Arc<dyn Store> = match FileStore::open(config.server.store_path.clone()).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("{}", e);
            return exit::STORE_FAILURE;
        }
    };

    let server = match TunnelServer::new(&config, store) {
        Ok(server) => server,
        Err(e) => {
            error!("{}", e);
            return server_exit_code(&e);
        }
    };

    let state = server.state();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        state.shutdown.cancel();
    });

    match server.start().await {
        Ok(()) => exit::OK,
        Err(e) => {
            error!("{}", e);
            server_exit_code(&e)
        }
    }
}

fn server_exit_code(e: &ServerError) -> i32 {
    match e {
        ServerError::ConfigError(_) => exit::CONFIG_ERROR,
        ServerError::BindError(_) => exit::BIND_FAILURE,
        ServerError::StoreError(_) => exit::STORE_FAILURE,
        ServerError::TlsError(_) => exit::CONFIG_ERROR,
        _ => 1,
    }
}

async fn run_client(config: Config) -> i32 {
    if let Err(e) = config.validate_client() {
        error!("{}", e);
        return exit::CONFIG_ERROR;
    }

    let client = match TunnelClient::new(config.client) {
        Ok(client) => client,
        Err(e) => {
            error!("{}", e);
            return exit::CONFIG_ERROR;
        }
    };

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        signal_token.cancel();
    });

    match client.run(shutdown).await {
        Ok(()) => exit::OK,
        Err(e) => {
            error!("{}", e);
            1
        }
    }
}
