/// Monitor scheduler.
///
/// Owns the mapping from enabled monitors to recurring check schedules
/// in the durable queue. Every operation here is idempotent: schedules
/// are keyed by monitor, so re-registering replaces in place and
/// removing something absent is a no-op.
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::database::Store;
use crate::queue::JobQueue;
use crate::validation::MIN_INTERVAL_SECONDS;

pub struct MonitorScheduler {
    store: Arc<dyn Store>,
    queue: Arc<dyn JobQueue>,
}

impl MonitorScheduler {
    pub fn new(store: Arc<dyn Store>, queue: Arc<dyn JobQueue>) -> Self {
        Self { store, queue }
    }

    /// Register a schedule for every enabled monitor. Called once at
    /// engine startup; safe to call again since registration replaces
    /// in place.
    pub async fn initialize(&self) -> Result<()> {
        let monitors = self
            .store
            .get_enabled_monitors()
            .await
            .context("failed to load monitors for scheduling")?;

        for monitor in &monitors {
            self.schedule_monitor(monitor.uuid, monitor.interval_seconds).await?;
        }
        info!(count = monitors.len(), "registered monitor schedules");
        Ok(())
    }

    /// Create or replace the recurring schedule for one monitor.
    pub async fn schedule_monitor(&self, monitor_uuid: Uuid, interval_seconds: u64) -> Result<()> {
        let interval = if interval_seconds < MIN_INTERVAL_SECONDS {
            warn!(
                monitor = %monitor_uuid,
                requested = interval_seconds,
                "check interval below minimum, clamping to {MIN_INTERVAL_SECONDS}s"
            );
            MIN_INTERVAL_SECONDS
        } else {
            interval_seconds
        };

        self.queue
            .upsert_schedule(monitor_uuid, interval)
            .await
            .with_context(|| format!("failed to schedule monitor {monitor_uuid}"))?;
        debug!(monitor = %monitor_uuid, interval_secs = interval, "schedule registered");
        Ok(())
    }

    /// Replace a monitor's schedule after its interval changed. The
    /// upsert is a single atomic replace, so no window exists where the
    /// monitor has zero or two schedules.
    pub async fn update_monitor_schedule(
        &self,
        monitor_uuid: Uuid,
        interval_seconds: u64,
    ) -> Result<()> {
        self.schedule_monitor(monitor_uuid, interval_seconds).await
    }

    /// Drop a monitor's schedule. No-op if none exists.
    pub async fn remove_monitor_schedule(&self, monitor_uuid: Uuid) -> Result<()> {
        self.queue
            .remove_schedule(monitor_uuid)
            .await
            .with_context(|| format!("failed to unschedule monitor {monitor_uuid}"))?;
        debug!(monitor = %monitor_uuid, "schedule removed");
        Ok(())
    }

    /// Enqueue a one-off check outside the recurring cadence, used when
    /// a monitor is created or re-enabled so its first result arrives
    /// immediately.
    pub async fn trigger_immediate_check(&self, monitor_uuid: Uuid) -> Result<()> {
        self.queue
            .enqueue_check(monitor_uuid)
            .await
            .with_context(|| format!("failed to enqueue immediate check for {monitor_uuid}"))?;
        debug!(monitor = %monitor_uuid, "immediate check enqueued");
        Ok(())
    }

    /// Repair drift between the monitor table and the schedule table:
    /// register schedules missing for enabled monitors, fix intervals
    /// that no longer match, and drop schedules whose monitor is gone
    /// or disabled. Covers lifecycle hooks that were lost to a crash.
    pub async fn reconcile(&self) -> Result<()> {
        let monitors = self.store.get_enabled_monitors().await?;
        let schedules = self.queue.schedules().await?;

        let mut repaired = 0usize;
        for monitor in &monitors {
            let want = monitor.interval_seconds.max(MIN_INTERVAL_SECONDS);
            let current = schedules
                .iter()
                .find(|s| s.monitor_uuid == monitor.uuid)
                .map(|s| s.interval_seconds);
            if current != Some(want) {
                self.schedule_monitor(monitor.uuid, monitor.interval_seconds).await?;
                repaired += 1;
            }
        }

        let mut removed = 0usize;
        for schedule in &schedules {
            if !monitors.iter().any(|m| m.uuid == schedule.monitor_uuid) {
                self.remove_monitor_schedule(schedule.monitor_uuid).await?;
                removed += 1;
            }
        }

        if repaired > 0 || removed > 0 {
            info!(repaired, removed, "reconciled monitor schedules");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::Monitor;
    use crate::testutil;

    async fn scheduler() -> Result<(MonitorScheduler, Arc<dyn JobQueue>, Arc<dyn Store>, tempfile::TempDir)>
    {
        let (store, queue, dir) = testutil::test_store_and_queue().await?;
        let store: Arc<dyn Store> = store;
        let queue: Arc<dyn JobQueue> = queue;
        Ok((
            MonitorScheduler::new(store.clone(), queue.clone()),
            queue,
            store,
            dir,
        ))
    }

    #[tokio::test]
    async fn scheduling_twice_keeps_one_schedule() -> Result<()> {
        let (scheduler, queue, _store, _dir) = scheduler().await?;
        let uuid = Uuid::new_v4();

        scheduler.schedule_monitor(uuid, 30).await?;
        scheduler.schedule_monitor(uuid, 60).await?;

        let schedules = queue.schedules().await?;
        assert_eq!(schedules.len(), 1);
        assert_eq!(schedules[0].interval_seconds, 60);
        Ok(())
    }

    #[tokio::test]
    async fn sub_minimum_interval_is_clamped() -> Result<()> {
        let (scheduler, queue, _store, _dir) = scheduler().await?;
        let uuid = Uuid::new_v4();

        scheduler.schedule_monitor(uuid, 1).await?;

        let schedules = queue.schedules().await?;
        assert_eq!(schedules[0].interval_seconds, MIN_INTERVAL_SECONDS);
        Ok(())
    }

    #[tokio::test]
    async fn removing_missing_schedule_is_a_noop() -> Result<()> {
        let (scheduler, _queue, _store, _dir) = scheduler().await?;
        scheduler.remove_monitor_schedule(Uuid::new_v4()).await?;
        Ok(())
    }

    #[tokio::test]
    async fn reconcile_repairs_missing_and_orphaned_schedules() -> Result<()> {
        let (scheduler, queue, store, _dir) = scheduler().await?;

        // Enabled monitor with no schedule: should gain one.
        let monitor = Monitor::new_http("org-1", "https://example.com");
        store.save_monitor(&monitor).await?;

        // Schedule with no monitor behind it: should be dropped.
        let orphan = Uuid::new_v4();
        queue.upsert_schedule(orphan, 30).await?;

        scheduler.reconcile().await?;

        let schedules = queue.schedules().await?;
        assert_eq!(schedules.len(), 1);
        assert_eq!(schedules[0].monitor_uuid, monitor.uuid);
        Ok(())
    }

    #[tokio::test]
    async fn reconcile_repairs_interval_drift() -> Result<()> {
        let (scheduler, queue, store, _dir) = scheduler().await?;

        let mut monitor = Monitor::new_http("org-1", "https://example.com");
        monitor.interval_seconds = 120;
        store.save_monitor(&monitor).await?;
        queue.upsert_schedule(monitor.uuid, 30).await?;

        scheduler.reconcile().await?;

        let schedules = queue.schedules().await?;
        assert_eq!(schedules[0].interval_seconds, 120);
        Ok(())
    }
}
