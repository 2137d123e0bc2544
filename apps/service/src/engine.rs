/// Engine lifecycle.
///
/// `UptimeEngine` ties the scheduler, worker pool, and region tracker
/// together behind an idempotent, race-safe lifecycle. The state lock
/// is held for the entire initialization, so concurrent callers wait
/// for the in-flight attempt instead of starting a second one, and a
/// failed attempt leaves the engine stopped and retryable.
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::database::{self, LibsqlStore, Store};
use crate::incident::IncidentDetector;
use crate::notify::{HttpApiMailer, NotificationDispatcher};
use crate::pool::LibsqlPool;
use crate::probe::ProbeExecutor;
use crate::queue::{JobQueue, LibsqlQueue};
use crate::region::RegionHealthTracker;
use crate::scheduler::MonitorScheduler;
use crate::worker::{ExecutorService, WorkerContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineState {
    Stopped,
    Ready,
}

pub struct UptimeEngine {
    scheduler: Arc<MonitorScheduler>,
    worker: Arc<ExecutorService>,
    regions: Arc<RegionHealthTracker>,
    state: Mutex<EngineState>,
    reconcile_interval: Duration,
    reconcile_handle: Mutex<Option<JoinHandle<()>>>,
}

/// Build an engine from configuration and a database pool. Runs the
/// schema migrations and wires every component together; the engine is
/// returned stopped.
pub async fn bootstrap(config: &Config, pool: LibsqlPool) -> Result<UptimeEngine> {
    {
        let conn = pool.get().await.map_err(|e| anyhow::anyhow!("{e}"))?;
        database::initialize_database(&conn)
            .await
            .context("failed to run database migrations")?;
    }

    let store: Arc<dyn Store> = Arc::new(LibsqlStore::new(pool.clone()));
    let queue: Arc<dyn JobQueue> = Arc::new(LibsqlQueue::new(pool));

    let mailer = Arc::new(HttpApiMailer::new(
        config.mailer.api_url.clone(),
        config.mailer.api_key.clone(),
        config.mailer.from.clone(),
    )?);
    let dispatcher = Arc::new(NotificationDispatcher::new(store.clone(), mailer)?);

    let regions = Arc::new(RegionHealthTracker::new(
        config.regions.clone(),
        Duration::from_secs(config.engine.region_sweep_seconds),
    )?);

    let ctx = WorkerContext {
        store: store.clone(),
        queue: queue.clone(),
        prober: Arc::new(ProbeExecutor::new(config.engine.probe_timeout_seconds)?),
        detector: Arc::new(IncidentDetector::new(store.clone())),
        dispatcher,
        regions: regions.clone(),
    };
    let worker = Arc::new(ExecutorService::new(
        ctx,
        config.engine.concurrency,
        Duration::from_millis(config.engine.queue_poll_ms),
        Duration::from_secs(config.engine.shutdown_grace_seconds),
    ));

    let scheduler = Arc::new(MonitorScheduler::new(store, queue));

    Ok(UptimeEngine::new(
        scheduler,
        worker,
        regions,
        Duration::from_secs(config.engine.reconcile_seconds),
    ))
}

impl UptimeEngine {
    pub fn new(
        scheduler: Arc<MonitorScheduler>,
        worker: Arc<ExecutorService>,
        regions: Arc<RegionHealthTracker>,
        reconcile_interval: Duration,
    ) -> Self {
        Self {
            scheduler,
            worker,
            regions,
            state: Mutex::new(EngineState::Stopped),
            reconcile_interval,
            reconcile_handle: Mutex::new(None),
        }
    }

    /// Bring the engine up. Idempotent: a second call while running is
    /// a no-op, and concurrent calls collapse onto one initialization
    /// because the state lock is held throughout.
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.lock().await;
        if *state == EngineState::Ready {
            return Ok(());
        }

        info!("initializing uptime engine");
        self.scheduler
            .initialize()
            .await
            .context("failed to register monitor schedules")?;
        self.worker.start().await;
        self.regions.start().await;

        let engine = Arc::clone(self);
        *self.reconcile_handle.lock().await = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.reconcile_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // immediate first tick is redundant with initialize()
            loop {
                ticker.tick().await;
                if let Err(e) = engine.scheduler.reconcile().await {
                    error!("schedule reconciliation failed: {e:#}");
                }
            }
        }));

        *state = EngineState::Ready;
        info!("uptime engine ready");
        Ok(())
    }

    /// Tear the engine down in reverse start order. Each phase is
    /// best-effort so a stuck component cannot wedge the rest of the
    /// shutdown. Idempotent.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if *state == EngineState::Stopped {
            return;
        }

        info!("shutting down uptime engine");
        if let Some(handle) = self.reconcile_handle.lock().await.take() {
            handle.abort();
        }
        self.regions.stop().await;
        self.worker.stop().await;
        *state = EngineState::Stopped;
        info!("uptime engine stopped");
    }

    /// Hook for a newly created monitor: register its schedule and run
    /// its first check immediately.
    pub async fn on_monitor_created(&self, monitor_uuid: Uuid, interval_seconds: u64) -> Result<()> {
        if !self.ensure_ready("monitor created").await {
            return Ok(());
        }
        self.scheduler.schedule_monitor(monitor_uuid, interval_seconds).await?;
        self.scheduler.trigger_immediate_check(monitor_uuid).await?;
        Ok(())
    }

    /// Hook for an updated monitor: re-register or remove its schedule
    /// depending on the enabled flag. Re-enabling also triggers an
    /// immediate check so the recovery is observed right away.
    pub async fn on_monitor_updated(
        &self,
        monitor_uuid: Uuid,
        interval_seconds: u64,
        enabled: bool,
    ) -> Result<()> {
        if !self.ensure_ready("monitor updated").await {
            return Ok(());
        }
        if enabled {
            self.scheduler.update_monitor_schedule(monitor_uuid, interval_seconds).await?;
            self.scheduler.trigger_immediate_check(monitor_uuid).await?;
        } else {
            self.scheduler.remove_monitor_schedule(monitor_uuid).await?;
        }
        Ok(())
    }

    /// Hook for a deleted monitor.
    pub async fn on_monitor_deleted(&self, monitor_uuid: Uuid) -> Result<()> {
        if !self.ensure_ready("monitor deleted").await {
            return Ok(());
        }
        self.scheduler.remove_monitor_schedule(monitor_uuid).await?;
        Ok(())
    }

    /// Hooks wait on the state lock, so one arriving during an
    /// in-flight initialize() runs after it completes rather than
    /// racing it. Against a stopped engine they warn and no-op; the
    /// reconcile sweep repairs the drift after the next start.
    async fn ensure_ready(&self, hook: &str) -> bool {
        let state = self.state.lock().await;
        if *state != EngineState::Ready {
            warn!("ignoring {hook} hook, engine is not running");
            return false;
        }
        true
    }
}
