/// Shared test fixtures: temp-file databases and canned probe results.
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Result;
use tempfile::TempDir;
use uuid::Uuid;

use crate::database::models::{from_unix, to_unix};
use crate::database::{LibsqlStore, initialize_database};
use crate::pool::{LibsqlManager, LibsqlPool};
use crate::probe::{ProbeErrorKind, ProbeResult};
use crate::queue::LibsqlQueue;

async fn test_pool() -> Result<(LibsqlPool, TempDir)> {
    let dir = TempDir::new()?;
    let db_path = dir.path().join("test.db");
    let database = libsql::Builder::new_local(&db_path).build().await?;
    let pool = LibsqlPool::builder(LibsqlManager::new(database))
        .build()
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    {
        let conn = pool.get().await.map_err(|e| anyhow::anyhow!("{e}"))?;
        initialize_database(&conn).await?;
    }
    Ok((pool, dir))
}

pub async fn test_store() -> Result<(Arc<LibsqlStore>, TempDir)> {
    let (pool, dir) = test_pool().await?;
    Ok((Arc::new(LibsqlStore::new(pool)), dir))
}

pub async fn test_queue() -> Result<(LibsqlQueue, TempDir)> {
    let (pool, dir) = test_pool().await?;
    Ok((LibsqlQueue::new(pool), dir))
}

pub async fn test_store_and_queue() -> Result<(Arc<LibsqlStore>, Arc<LibsqlQueue>, TempDir)> {
    let (pool, dir) = test_pool().await?;
    Ok((
        Arc::new(LibsqlStore::new(pool.clone())),
        Arc::new(LibsqlQueue::new(pool)),
        dir,
    ))
}

pub fn failed_probe(monitor_uuid: Uuid, region: &str) -> ProbeResult {
    ProbeResult::new(monitor_uuid, region).failed(
        120,
        ProbeErrorKind::ConnectionRefused,
        "connection refused",
    )
}

pub fn successful_probe(monitor_uuid: Uuid, region: &str) -> ProbeResult {
    ProbeResult::new(monitor_uuid, region).succeeded(42, Some(200))
}

/// `SystemTime::now()` truncated to whole seconds, matching the
/// resolution timestamps survive a trip through the store with.
pub fn now_secs() -> SystemTime {
    from_unix(to_unix(SystemTime::now()))
}
