use std::path::PathBuf;

use ::tracing::error;
use clap::Parser;

mod config;
mod pipeline;
mod scanner;
mod service;
mod tracing;
use tracing::setup_tracing;

use config::Config;
use service::Service;

#[derive(Parser)]
#[command(name = "filehaven")]
#[command(about = "Content-addressed file ingestion", long_about = None)]
struct Cli {
    /// Path to the configuration file. Defaults to
    /// ~/.filehaven/filehaven.toml, then /etc/filehaven.toml.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing() {
        eprintln!("failed to setup tracing: {:?}", e);
        return;
    }

    let config = match &cli.config {
        Some(path) => Config::from_path(path),
        None => Config::search(),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load config: {:#}", e);
            return;
        }
    };

    let service = match Service::new(config).await {
        Ok(service) => service,
        Err(e) => {
            error!("failed to initialize: {:#}", e);
            return;
        }
    };
    if let Err(e) = service.start().await {
        error!("ingestion failed: {:#}", e);
        std::process::exit(1);
    }
}
