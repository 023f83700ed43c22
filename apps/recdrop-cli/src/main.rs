//! recdrop command-line uploader entry point.

mod app;
mod config;

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Upload recordings to an HTTP endpoint with automatic retries.
#[derive(Debug, Parser)]
#[command(name = "recdrop", version, about)]
pub struct Args {
    /// Destination URL every file is uploaded to.
    pub url: String,

    /// Files to upload.
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Item id assigned to the first file; later files count up from it.
    #[arg(long, default_value_t = 1)]
    pub first_id: u64,

    /// Content type sent with every file (overrides the configured default).
    #[arg(long)]
    pub content_type: Option<String>,

    /// Configuration file (defaults to the per-user config).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting recdrop");

    let config = match &args.config {
        Some(path) => config::Config::load_from(path)?,
        None => config::Config::load()?,
    };
    tracing::debug!(staging = %config.uploader.staging_dir.display(), "configuration loaded");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(config, args))
}
