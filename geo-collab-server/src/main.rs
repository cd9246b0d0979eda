//! geo-collab server: hosts shared map rooms over WebSocket.
//!
//! Usage: geo-collab-server [--config collab.toml] [--bind 0.0.0.0:9090]

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

use geo_collab::{CollabConfig, CollabServer};

#[derive(Parser)]
#[command(name = "geo-collab-server", version, about = "Real-time map collaboration server")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the bind address from the config file
    #[arg(long)]
    bind: Option<String>,

    /// Override the per-room member cap
    #[arg(long)]
    max_members: Option<usize>,

    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let mut config = match &cli.config {
        Some(path) => match CollabConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                log::error!("Failed to load {}: {e}", path.display());
                return ExitCode::FAILURE;
            }
        },
        None => CollabConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.server.bind_addr = bind;
    }
    if cli.max_members.is_some() {
        config.server.max_members_per_room = cli.max_members;
    }

    let server = CollabServer::new(config.server);
    if let Err(e) = server.run().await {
        log::error!("Server stopped: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
