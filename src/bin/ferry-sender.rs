use anyhow::{Context, Result};
use clap::Parser;
use fileferry::{sender, SenderConfig, Shutdown};
use std::path::PathBuf;

/// Watch a directory and deliver files to configured peers.
#[derive(Parser)]
#[command(name = "ferry-sender", version, about)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "FERRY_SENDER_CONFIG")]
    config: PathBuf,

    /// Enable debug logging (RUST_LOG overrides)
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    fileferry::logging::init(args.verbose);

    let config = SenderConfig::from_toml_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    let shutdown = Shutdown::new();
    shutdown.listen_for_signals();

    sender::run(config, shutdown).await.context("sender failed")?;
    Ok(())
}
