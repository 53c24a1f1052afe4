use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use webpilot::Config;

/// Reactive browser task engine: drives a browser agent with an LLM planner
/// and verifier over a control socket.
#[derive(Parser)]
#[command(name = "webpilot", version, about, long_about = None)]
struct Cli {
    /// Port for the HTTP surface and control socket
    #[arg(short, long)]
    port: Option<u16>,

    /// Log filter when RUST_LOG is not set
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::from_env(cli.port).context("startup configuration invalid")?;
    webpilot::server::serve(config).await
}
