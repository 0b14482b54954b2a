use clap::Parser;
use mimalloc::MiMalloc;
use mt_multiproxy::{Config, Hooks};
use std::path::PathBuf;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Puts several Minetest servers behind one address.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path of the TOML configuration file.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();
    let config = Config::load(&args.config)?;

    tracing::info!(servers = config.servers.len(), "Started");
    mt_multiproxy::run(config, Hooks::with_builtins()).await
}
