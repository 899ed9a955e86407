use clap::Parser;
use tracing_subscriber::EnvFilter;

use litmcp::cli::{Cli, run};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so the stdio MCP transport stays clean.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("LITMCP_LOG").unwrap_or_else(|_| EnvFilter::new("litmcp=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    run(cli).await
}
