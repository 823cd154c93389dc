//! Object gateway entry point.

mod config;
mod upload;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::config::GatewayConfig;

#[derive(Debug, Parser)]
#[command(name = "objgate-gateway", version, about = "Resumable multipart uploads into an object store")]
struct Cli {
    /// Config file (default: ~/.config/objgate/config.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Upload a local file, resuming an earlier interrupted upload of it.
    Upload {
        #[arg(long)]
        bucket: String,
        /// Object key; defaults to the file name.
        #[arg(long)]
        object: Option<String>,
        file: PathBuf,
    },
    /// Write the default configuration file.
    InitConfig,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting objgate gateway");

    match cli.command {
        Command::InitConfig => {
            let path = GatewayConfig::default().save(cli.config.as_deref())?;
            tracing::info!(path = %path.display(), "default configuration written");
        }
        Command::Upload {
            bucket,
            object,
            file,
        } => {
            let config = GatewayConfig::load(cli.config.as_deref())?;
            let object = match object {
                Some(object) => object,
                None => file
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .ok_or_else(|| anyhow::anyhow!("cannot derive an object key from {}", file.display()))?,
            };

            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(upload::run(&config, &bucket, &object, &file))?;
        }
    }

    tracing::info!("gateway shut down cleanly");
    Ok(())
}
