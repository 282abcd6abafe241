//! cachefsd entry point.

mod app;
mod config;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cachefsd", version, about = "Local cache daemon for a remote object store")]
struct Cli {
    /// Configuration file (default: ~/.config/cachefs/cachefsd.toml).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the transfer scheduler and the adapter link (default).
    Run,
    /// Run the privilege broker. Started by `run`.
    #[command(hide = true)]
    Broker(BrokerArgs),
}

#[derive(Debug, Args)]
pub struct BrokerArgs {
    /// Socket to listen on.
    #[arg(long)]
    pub socket: PathBuf,

    /// The only process allowed to issue requests.
    #[arg(long)]
    pub authorized_pid: u32,

    /// Root of the shared cache tree.
    #[arg(long)]
    pub cache_dir: PathBuf,

    /// Multipart chunk size in bytes.
    #[arg(long, default_value_t = cachefs_transfer::DEFAULT_CHUNK_SIZE)]
    pub chunk_size: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,cachefs=debug")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting cachefsd");
            let config = config::DaemonConfig::load(cli.config.as_deref())?;
            app::run(config).await
        }
        Command::Broker(args) => app::run_broker(args).await,
    }
}
