//! memcast_agent binary: parse args, set up logging, run until Ctrl-C.

use memcast_agent::config::{self, Command};
use memcast_agent::sampler::SystemMemory;
use memcast_agent::server;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = match config::from_env()? {
        Command::Run(cfg) => cfg,
        Command::Help(usage) => {
            println!("{usage}");
            return Ok(());
        }
    };

    let agent = server::start(cfg, SystemMemory::new()).await?;
    agent.wait().await?;
    Ok(())
}
