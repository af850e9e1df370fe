//! Server entry point.

use clap::Parser;
use image_relay::{AppConfig, server};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "image-relay", version, about = "Container-image replication service")]
struct Args {
    /// Data directory holding tasks, archives, pipes and credentials.
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:8787")]
    listen: String,

    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = AppConfig::new(args.data_dir, args.listen);
    if let Err(err) = server::run(config).await {
        tracing::error!("server failed: {}", err);
        std::process::exit(1);
    }
}
