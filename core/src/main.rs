/// wnode-status - envelope relay node entry point
use std::env;
use tracing_subscriber::EnvFilter;
use wnode_core::{supervisor, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let config = Config::from_args(&args).map_err(|e| anyhow::anyhow!("Making config failed: {}", e))?;

    println!("{}", supervisor::header(&config));

    supervisor::run(config)
        .await
        .map_err(|e| anyhow::anyhow!("Node error: {}", e))?;

    Ok(())
}
