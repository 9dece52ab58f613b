mod commands;
mod config;
mod lock;
mod storage;

use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use commands::App;
use config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging (stderr; stdout carries command output)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();

    debug!("Starting docstore-local");
    info!("  Data dir: {}", config.effective_data_dir().display());
    debug!("  Lock dir: {}", config.effective_lock_dir().display());
    debug!("  Lock timeout: {:?}", config.lock_timeout());

    let app = App::from_config(&config);
    let output = app.execute(&config.command).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
