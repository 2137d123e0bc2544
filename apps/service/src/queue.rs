use anyhow::Result;
use async_trait::async_trait;
use libsql::params;
use std::time::{Duration, SystemTime};
use uuid::Uuid;

use crate::database::models::{from_unix, to_unix};
use crate::pool::{LibsqlManager, LibsqlPool};

/// How long a claimed job stays invisible before it is considered
/// abandoned and redelivered.
const LEASE_SECONDS: u64 = 60;

/// Delay before a failed job becomes claimable again.
const RETRY_DELAY_SECONDS: u64 = 15;

/// Deterministic repeat-definition key for a monitor. Replacing a
/// schedule under the same key can never leave two definitions active.
pub fn job_key(monitor_uuid: Uuid) -> String {
    format!("monitor:{monitor_uuid}")
}

/// A claimed check job.
#[derive(Debug, Clone)]
pub struct CheckJob {
    pub id: i64,
    pub monitor_uuid: Uuid,
    pub attempts: i64,
}

/// A registered repeat definition.
#[derive(Debug, Clone)]
pub struct Schedule {
    pub monitor_uuid: Uuid,
    pub interval_seconds: u64,
    pub next_run_at: SystemTime,
}

/// Durable at-least-once job queue.
///
/// Repeat definitions live in `check_schedules` keyed by [`job_key`];
/// runnable work lives in `check_jobs` and is handed out under a lease.
/// A job that is neither acked nor failed is redelivered once its lease
/// expires, which is why downstream consumers must be idempotent.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Create or replace the repeat definition for a monitor.
    async fn upsert_schedule(&self, monitor_uuid: Uuid, interval_seconds: u64) -> Result<()>;

    /// Cancel the repeat definition. No-op when none exists.
    async fn remove_schedule(&self, monitor_uuid: Uuid) -> Result<()>;

    async fn schedules(&self) -> Result<Vec<Schedule>>;

    /// Enqueue a one-off check independent of the recurring cadence.
    async fn enqueue_check(&self, monitor_uuid: Uuid) -> Result<i64>;

    /// Instantiate jobs for due schedules and advance their cadence.
    /// Safe to call from concurrent pollers; each due schedule fires once.
    async fn promote_due(&self, now: SystemTime) -> Result<usize>;

    /// Claim up to `limit` runnable jobs under a lease.
    async fn claim(&self, now: SystemTime, limit: usize) -> Result<Vec<CheckJob>>;

    /// Acknowledge successful processing; fully removes the job.
    async fn ack(&self, job_id: i64) -> Result<()>;

    /// Release a job for redelivery after a processing failure.
    async fn fail(&self, job_id: i64) -> Result<()>;
}

/// LibSQL queue implementation sharing the engine connection pool.
pub struct LibsqlQueue {
    pool: LibsqlPool,
}

impl LibsqlQueue {
    pub fn new(pool: LibsqlPool) -> Self {
        Self { pool }
    }

    async fn get_conn(&self) -> Result<deadpool::managed::Object<LibsqlManager>> {
        Ok(self.pool.get().await?)
    }
}

#[async_trait]
impl JobQueue for LibsqlQueue {
    async fn upsert_schedule(&self, monitor_uuid: Uuid, interval_seconds: u64) -> Result<()> {
        let conn = self.get_conn().await?;
        let next_run_at = to_unix(SystemTime::now() + Duration::from_secs(interval_seconds));

        conn.execute(
            "INSERT INTO check_schedules (job_key, monitor_uuid, interval_seconds, next_run_at) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT(job_key) DO UPDATE SET \
                 interval_seconds = excluded.interval_seconds, \
                 next_run_at = excluded.next_run_at",
            params![
                job_key(monitor_uuid),
                monitor_uuid.to_string(),
                interval_seconds as i64,
                next_run_at
            ],
        )
        .await?;

        Ok(())
    }

    async fn remove_schedule(&self, monitor_uuid: Uuid) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "DELETE FROM check_schedules WHERE job_key = ?",
            params![job_key(monitor_uuid)],
        )
        .await?;
        Ok(())
    }

    async fn schedules(&self) -> Result<Vec<Schedule>> {
        let conn = self.get_conn().await?;
        let mut stmt = conn
            .prepare("SELECT monitor_uuid, interval_seconds, next_run_at FROM check_schedules")
            .await?;

        let mut rows = stmt.query(()).await?;
        let mut schedules = Vec::new();

        while let Some(row) = rows.next().await? {
            let uuid_str: String = row.get(0)?;
            schedules.push(Schedule {
                monitor_uuid: Uuid::parse_str(&uuid_str)?,
                interval_seconds: row.get::<i64>(1)? as u64,
                next_run_at: from_unix(row.get(2)?),
            });
        }

        Ok(schedules)
    }

    async fn enqueue_check(&self, monitor_uuid: Uuid) -> Result<i64> {
        let conn = self.get_conn().await?;
        let now = to_unix(SystemTime::now());

        conn.execute(
            "INSERT INTO check_jobs (monitor_uuid, enqueued_at, available_at) VALUES (?, ?, ?)",
            params![monitor_uuid.to_string(), now, now],
        )
        .await?;

        Ok(conn.last_insert_rowid())
    }

    async fn promote_due(&self, now: SystemTime) -> Result<usize> {
        let conn = self.get_conn().await?;
        let now_unix = to_unix(now);

        let mut stmt = conn
            .prepare(
                "SELECT job_key, monitor_uuid, interval_seconds, next_run_at \
                 FROM check_schedules WHERE next_run_at <= ?",
            )
            .await?;

        let mut rows = stmt.query(params![now_unix]).await?;
        let mut due = Vec::new();
        while let Some(row) = rows.next().await? {
            let key: String = row.get(0)?;
            let uuid_str: String = row.get(1)?;
            let interval: i64 = row.get(2)?;
            let next_run_at: i64 = row.get(3)?;
            due.push((key, uuid_str, interval, next_run_at));
        }

        let mut promoted = 0;
        for (key, uuid_str, interval, next_run_at) in due {
            // CAS on next_run_at: whichever poller advances the cadence
            // gets to enqueue the job for this tick.
            let affected = conn
                .execute(
                    "UPDATE check_schedules SET next_run_at = ? \
                     WHERE job_key = ? AND next_run_at = ?",
                    params![now_unix + interval, key.clone(), next_run_at],
                )
                .await?;

            if affected == 0 {
                continue;
            }

            conn.execute(
                "INSERT INTO check_jobs (monitor_uuid, enqueued_at, available_at) \
                 VALUES (?, ?, ?)",
                params![uuid_str, now_unix, now_unix],
            )
            .await?;
            promoted += 1;
        }

        Ok(promoted)
    }

    async fn claim(&self, now: SystemTime, limit: usize) -> Result<Vec<CheckJob>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let conn = self.get_conn().await?;
        let now_unix = to_unix(now);

        let mut stmt = conn
            .prepare(
                "SELECT id, monitor_uuid, attempts FROM check_jobs \
                 WHERE available_at <= ? \
                   AND (lease_expires_at IS NULL OR lease_expires_at <= ?) \
                 ORDER BY id LIMIT ?",
            )
            .await?;

        let mut rows = stmt.query(params![now_unix, now_unix, limit as i64]).await?;
        let mut candidates = Vec::new();
        while let Some(row) = rows.next().await? {
            let uuid_str: String = row.get(1)?;
            candidates.push((row.get::<i64>(0)?, Uuid::parse_str(&uuid_str)?, row.get::<i64>(2)?));
        }

        let lease_until = now_unix + LEASE_SECONDS as i64;
        let mut claimed = Vec::new();
        for (id, monitor_uuid, attempts) in candidates {
            let affected = conn
                .execute(
                    "UPDATE check_jobs SET lease_expires_at = ?, attempts = attempts + 1 \
                     WHERE id = ? AND (lease_expires_at IS NULL OR lease_expires_at <= ?)",
                    params![lease_until, id, now_unix],
                )
                .await?;

            if affected > 0 {
                claimed.push(CheckJob { id, monitor_uuid, attempts: attempts + 1 });
            }
        }

        Ok(claimed)
    }

    async fn ack(&self, job_id: i64) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.execute("DELETE FROM check_jobs WHERE id = ?", params![job_id]).await?;
        Ok(())
    }

    async fn fail(&self, job_id: i64) -> Result<()> {
        let conn = self.get_conn().await?;
        let retry_at = to_unix(SystemTime::now() + Duration::from_secs(RETRY_DELAY_SECONDS));

        conn.execute(
            "UPDATE check_jobs SET lease_expires_at = NULL, available_at = ? WHERE id = ?",
            params![retry_at, job_id],
        )
        .await?;

        Ok(())
    }
}
