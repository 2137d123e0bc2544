mod config;
mod database;
mod engine;
mod incident;
mod notify;
mod pool;
mod probe;
mod queue;
mod region;
mod scheduler;
#[cfg(test)]
mod testutil;
mod validation;
mod worker;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use crate::config::Config;
use crate::pool::{LibsqlManager, LibsqlPool};

#[derive(Parser, Debug)]
#[command(name = "upwatch-service", version, about = "Uptime monitoring engine")]
struct Cli {
    /// Path to the TOML config file; defaults to the user config dir.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the database path from the config file.
    #[arg(short, long)]
    database: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    logger::init();
    let cli = Cli::parse();

    let config = Config::from_config(cli.config.as_deref())?;
    let db_path = cli
        .database
        .unwrap_or_else(|| PathBuf::from(&config.database.path));
    info!(path = %db_path.display(), "opening database");

    let database = libsql::Builder::new_local(&db_path)
        .build()
        .await
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;
    let pool = LibsqlPool::builder(LibsqlManager::new(database))
        .build()
        .map_err(|e| anyhow::anyhow!("failed to build connection pool: {e}"))?;

    let engine = Arc::new(engine::bootstrap(&config, pool).await?);
    engine.initialize().await?;

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");
    engine.shutdown().await;
    Ok(())
}
