use anyhow::{Context, Result};
use clap::Parser;
use fileferry::{receiver, ReceiverConfig, Shutdown};
use std::path::PathBuf;

/// Accept files from configured peers and land them atomically.
#[derive(Parser)]
#[command(name = "ferry-receiver", version, about)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "FERRY_RECEIVER_CONFIG")]
    config: PathBuf,

    /// Enable debug logging (RUST_LOG overrides)
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    fileferry::logging::init(args.verbose);

    let config = ReceiverConfig::from_toml_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    let shutdown = Shutdown::new();
    shutdown.listen_for_signals();

    receiver::run(config, shutdown)
        .await
        .context("receiver failed")?;
    Ok(())
}
