/// Check executor service.
///
/// A bounded worker pool fed from the durable queue. The poll loop
/// promotes due schedules, claims as many jobs as there are free
/// permits, and runs each claimed job on its own task. Jobs are acked
/// only after the full pipeline ran; anything that dies mid-flight is
/// redelivered when its lease expires.
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rand::Rng;
use tokio::sync::{Mutex, Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::database::Store;
use crate::incident::IncidentDetector;
use crate::notify::NotificationDispatcher;
use crate::probe::{ProbeErrorKind, ProbeExecutor, ProbeResult};
use crate::queue::{CheckJob, JobQueue};
use crate::region::RegionHealthTracker;
use crate::validation;

/// Everything one check job needs, cheap to clone into worker tasks.
#[derive(Clone)]
pub struct WorkerContext {
    pub store: Arc<dyn Store>,
    pub queue: Arc<dyn JobQueue>,
    pub prober: Arc<ProbeExecutor>,
    pub detector: Arc<IncidentDetector>,
    pub dispatcher: Arc<NotificationDispatcher>,
    pub regions: Arc<RegionHealthTracker>,
}

pub struct ExecutorService {
    ctx: WorkerContext,
    concurrency: usize,
    poll_interval: Duration,
    shutdown_grace: Duration,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ExecutorService {
    pub fn new(
        ctx: WorkerContext,
        concurrency: usize,
        poll_interval: Duration,
        shutdown_grace: Duration,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            ctx,
            concurrency: concurrency.max(1),
            poll_interval,
            shutdown_grace,
            shutdown_tx,
            handle: Mutex::new(None),
        }
    }

    /// Spawn the poll loop. Idempotent.
    pub async fn start(&self) {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            return;
        }

        let ctx = self.ctx.clone();
        let concurrency = self.concurrency;
        let poll_interval = self.poll_interval;
        let shutdown_grace = self.shutdown_grace;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        *handle = Some(tokio::spawn(async move {
            let semaphore = Arc::new(Semaphore::new(concurrency));
            let mut tasks: JoinSet<()> = JoinSet::new();

            loop {
                // Jitter the poll so multiple service instances sharing
                // a database do not claim in lockstep.
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..100));
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(poll_interval + jitter) => {}
                }

                while tasks.try_join_next().is_some() {}

                let now = SystemTime::now();
                if let Err(e) = ctx.queue.promote_due(now).await {
                    error!("failed to promote due schedules: {e:#}");
                    continue;
                }

                let free = semaphore.available_permits();
                if free == 0 {
                    continue;
                }

                let jobs = match ctx.queue.claim(now, free).await {
                    Ok(jobs) => jobs,
                    Err(e) => {
                        error!("failed to claim check jobs: {e:#}");
                        continue;
                    }
                };

                for job in jobs {
                    let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                        break;
                    };
                    let ctx = ctx.clone();
                    tasks.spawn(async move {
                        run_job(&ctx, &job).await;
                        drop(permit);
                    });
                }
            }

            // Let in-flight checks finish within the grace period, then
            // abandon the rest; their leases will redeliver them.
            let drain = async {
                while tasks.join_next().await.is_some() {}
            };
            if tokio::time::timeout(shutdown_grace, drain).await.is_err() {
                warn!("shutdown grace elapsed, abandoning in-flight checks");
                tasks.abort_all();
            }
        }));
        info!(concurrency, "check executor started");
    }

    /// Signal the poll loop to stop and wait for it to drain.
    pub async fn stop(&self) {
        let Some(handle) = self.handle.lock().await.take() else {
            return;
        };
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = handle.await {
            warn!("executor task ended abnormally: {e}");
        }
        info!("check executor stopped");
    }
}

/// Run one claimed job end to end: probe every region the monitor
/// covers, persist results, feed the incident detector, and dispatch
/// notifications for any transition. The job is failed (and later
/// redelivered) only when persistence or detection broke; notification
/// errors are logged and absorbed so a flaky webhook cannot re-probe a
/// monitor.
pub async fn run_job(ctx: &WorkerContext, job: &CheckJob) {
    let monitor = match ctx.store.get_monitor(job.monitor_uuid).await {
        Ok(Some(monitor)) => monitor,
        Ok(None) => {
            debug!(monitor = %job.monitor_uuid, "dropping check for deleted monitor");
            ack(ctx, job).await;
            return;
        }
        Err(e) => {
            error!(monitor = %job.monitor_uuid, "failed to load monitor: {e:#}");
            fail(ctx, job).await;
            return;
        }
    };

    if !monitor.enabled {
        debug!(monitor = %monitor.uuid, "dropping check for disabled monitor");
        ack(ctx, job).await;
        return;
    }

    let regions = if monitor.regions.is_empty() {
        ctx.regions.region_names()
    } else {
        monitor.regions.clone()
    };

    // A monitor that cannot be checked must surface as a diagnosed
    // failure in its history, not as a silent gap.
    let invalid = validation::validate_monitor(&monitor).err();

    let mut job_failed = false;
    for region in &regions {
        let result = match &invalid {
            Some(e) => ProbeResult::new(monitor.uuid, region)
                .failed(0, ProbeErrorKind::Internal, format!("invalid monitor: {e:#}")),
            None => ctx.prober.execute(&monitor, region).await,
        };
        debug!(
            monitor = %monitor.uuid,
            region = %region,
            success = result.success,
            latency_ms = result.latency_ms,
            "probe completed"
        );

        if let Err(e) = ctx.store.save_probe_result(&result).await {
            error!(monitor = %monitor.uuid, region = %region, "failed to persist probe result: {e:#}");
            job_failed = true;
            continue;
        }

        match ctx.detector.observe(&result).await {
            Ok(Some(event)) => {
                if let Err(e) =
                    ctx.dispatcher.dispatch(&monitor, &event.incident, event.kind).await
                {
                    warn!(
                        monitor = %monitor.uuid,
                        "notification dispatch failed for {} event: {e:#}",
                        event.kind
                    );
                }
            }
            Ok(None) => {}
            Err(e) => {
                error!(monitor = %monitor.uuid, region = %region, "incident detection failed: {e:#}");
                job_failed = true;
            }
        }
    }

    if job_failed {
        fail(ctx, job).await;
    } else {
        ack(ctx, job).await;
    }
}

async fn ack(ctx: &WorkerContext, job: &CheckJob) {
    if let Err(e) = ctx.queue.ack(job.id).await {
        error!(job = job.id, "failed to ack check job: {e:#}");
    }
}

async fn fail(ctx: &WorkerContext, job: &CheckJob) {
    if let Err(e) = ctx.queue.fail(job.id).await {
        error!(job = job.id, "failed to release check job: {e:#}");
    }
}
