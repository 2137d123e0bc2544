use anyhow::Result;
use libsql::Connection;

/// Schema version - increment when making schema changes
const SCHEMA_VERSION: i32 = 2;

/// Run database migrations
///
/// This is the single source of truth for the engine schema; the CRUD
/// layer reads and writes these tables but never migrates them.
pub async fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL,
            description TEXT
        )",
        (),
    )
    .await?;

    let current_version = get_current_version(conn).await?;

    if current_version >= SCHEMA_VERSION {
        tracing::debug!("Database schema is up to date (version {})", current_version);
        return Ok(());
    }

    tracing::info!("Running migrations from version {} to {}", current_version, SCHEMA_VERSION);

    if current_version < 1 {
        run_migration_v1(conn).await?;
        record_migration(conn, 1, "Monitors, incidents, channels, probe history").await?;
    }

    if current_version < 2 {
        run_migration_v2(conn).await?;
        record_migration(conn, 2, "Durable check queue tables").await?;
    }

    tracing::info!("Database migrations completed (now at version {})", SCHEMA_VERSION);
    Ok(())
}

async fn get_current_version(conn: &Connection) -> Result<i32> {
    let mut rows = conn.query("SELECT MAX(version) FROM schema_migrations", ()).await?;

    if let Some(row) = rows.next().await? {
        let version: Option<i32> = row.get(0)?;
        Ok(version.unwrap_or(0))
    } else {
        Ok(0)
    }
}

async fn record_migration(conn: &Connection, version: i32, description: &str) -> Result<()> {
    let now = crate::database::models::to_unix(std::time::SystemTime::now());

    conn.execute(
        "INSERT INTO schema_migrations (version, applied_at, description) VALUES (?, ?, ?)",
        libsql::params![version, now, description],
    )
    .await?;

    tracing::info!("Applied migration v{}: {}", version, description);
    Ok(())
}

/// Migration v1: monitors, incidents, notification channels, and the
/// per-check history table.
async fn run_migration_v1(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS monitors (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            uuid TEXT NOT NULL UNIQUE,
            organization_id TEXT NOT NULL,
            name TEXT,
            monitor_type TEXT NOT NULL,
            http_config TEXT,
            tcp_config TEXT,
            interval_seconds INTEGER NOT NULL DEFAULT 30,
            regions TEXT NOT NULL DEFAULT '[]',
            enabled INTEGER NOT NULL DEFAULT 1,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )",
        (),
    )
    .await?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS incidents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            monitor_uuid TEXT NOT NULL,
            region TEXT,
            status TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            ended_at INTEGER,
            last_error TEXT,
            last_error_kind TEXT
        )",
        (),
    )
    .await?;

    // The central consistency guarantee: one open incident per
    // (monitor, region). NULL regions collapse to '' so they collide too.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_incidents_one_open
         ON incidents (monitor_uuid, COALESCE(region, ''))
         WHERE status = 'open'",
        (),
    )
    .await?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_incidents_monitor
         ON incidents (monitor_uuid, started_at)",
        (),
    )
    .await?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS notification_channels (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            uuid TEXT NOT NULL UNIQUE,
            organization_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            config TEXT NOT NULL DEFAULT '{}',
            enabled INTEGER NOT NULL DEFAULT 1,
            trigger_events TEXT NOT NULL DEFAULT '[\"down\",\"recovery\"]',
            monitor_uuids TEXT,
            cooldown_minutes INTEGER NOT NULL DEFAULT 5,
            last_notified_at INTEGER
        )",
        (),
    )
    .await?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS probe_results (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            monitor_uuid TEXT NOT NULL,
            region TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            success INTEGER NOT NULL,
            latency_ms INTEGER NOT NULL,
            status_code INTEGER,
            error TEXT,
            error_kind TEXT,
            created_at INTEGER NOT NULL
        )",
        (),
    )
    .await?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_probe_results_monitor
         ON probe_results (monitor_uuid, timestamp)",
        (),
    )
    .await?;

    Ok(())
}

/// Migration v2: the durable queue - repeat definitions keyed by job key
/// plus leased one-off jobs.
async fn run_migration_v2(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS check_schedules (
            job_key TEXT PRIMARY KEY,
            monitor_uuid TEXT NOT NULL,
            interval_seconds INTEGER NOT NULL,
            next_run_at INTEGER NOT NULL
        )",
        (),
    )
    .await?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS check_jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            monitor_uuid TEXT NOT NULL,
            enqueued_at INTEGER NOT NULL,
            available_at INTEGER NOT NULL,
            lease_expires_at INTEGER,
            attempts INTEGER NOT NULL DEFAULT 0
        )",
        (),
    )
    .await?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_check_jobs_available
         ON check_jobs (available_at)",
        (),
    )
    .await?;

    Ok(())
}
