/// Region health tracker.
///
/// Keeps an advisory liveness view of the configured probe regions by
/// periodically polling each region's health endpoint. Regions without
/// an endpoint (such as the local region) are always considered
/// healthy. Health is observational only and never gates check
/// execution.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Result;
use futures::future::join_all;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RegionConfig;

#[derive(Debug, Clone)]
pub struct RegionHealth {
    pub healthy: bool,
    pub last_checked: SystemTime,
    pub last_error: Option<String>,
}

pub struct RegionHealthTracker {
    regions: Vec<RegionConfig>,
    interval: Duration,
    client: reqwest::Client,
    health: Arc<RwLock<HashMap<String, RegionHealth>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RegionHealthTracker {
    pub fn new(regions: Vec<RegionConfig>, interval: Duration) -> Result<Self> {
        let client =
            reqwest::Client::builder().timeout(Duration::from_secs(5)).build()?;
        Ok(Self {
            regions,
            interval,
            client,
            health: Arc::new(RwLock::new(HashMap::new())),
            handle: Mutex::new(None),
        })
    }

    /// Names of every configured region, in configuration order.
    pub fn region_names(&self) -> Vec<String> {
        self.regions.iter().map(|r| r.name.clone()).collect()
    }

    /// Current health view. Regions not yet swept are absent.
    pub async fn snapshot(&self) -> HashMap<String, RegionHealth> {
        self.health.read().await.clone()
    }

    /// Whether a region is currently considered healthy. Unknown
    /// regions are treated as healthy so that checks keep flowing
    /// before the first sweep completes.
    pub async fn is_healthy(&self, region: &str) -> bool {
        self.health
            .read()
            .await
            .get(region)
            .map(|h| h.healthy)
            .unwrap_or(true)
    }

    /// Start the periodic sweep. Idempotent.
    pub async fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            return;
        }

        let tracker = Arc::clone(self);
        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tracker.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                tracker.sweep().await;
            }
        }));
        info!(
            regions = self.regions.len(),
            interval_secs = self.interval.as_secs(),
            "region health tracker started"
        );
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
            info!("region health tracker stopped");
        }
    }

    /// Poll every region once and record the outcome.
    pub async fn sweep(&self) {
        let checks = self.regions.iter().map(|region| async {
            let outcome = self.probe_region(region).await;
            (region.name.clone(), outcome)
        });

        let now = SystemTime::now();
        let results = join_all(checks).await;

        let mut health = self.health.write().await;
        for (name, outcome) in results {
            match outcome {
                Ok(()) => {
                    debug!(region = %name, "region healthy");
                    health.insert(name, RegionHealth {
                        healthy: true,
                        last_checked: now,
                        last_error: None,
                    });
                }
                Err(e) => {
                    warn!(region = %name, "region health check failed: {e:#}");
                    health.insert(name, RegionHealth {
                        healthy: false,
                        last_checked: now,
                        last_error: Some(format!("{e:#}")),
                    });
                }
            }
        }
    }

    async fn probe_region(&self, region: &RegionConfig) -> Result<()> {
        let Some(url) = &region.health_url else {
            // Local regions have no endpoint to poll.
            return Ok(());
        };
        self.client.get(url).send().await?.error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(regions: Vec<RegionConfig>) -> Arc<RegionHealthTracker> {
        Arc::new(RegionHealthTracker::new(regions, Duration::from_secs(60)).unwrap())
    }

    #[tokio::test]
    async fn region_without_endpoint_is_healthy() {
        let t = tracker(vec![RegionConfig { name: "local".into(), health_url: None }]);
        t.sweep().await;
        assert!(t.is_healthy("local").await);
        let snapshot = t.snapshot().await;
        assert!(snapshot["local"].healthy);
        assert!(snapshot["local"].last_error.is_none());
    }

    #[tokio::test]
    async fn unknown_region_defaults_to_healthy() {
        let t = tracker(vec![]);
        assert!(t.is_healthy("never-swept").await);
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_marked_down() {
        // Port 1 on localhost refuses connections.
        let t = tracker(vec![RegionConfig {
            name: "eu-west".into(),
            health_url: Some("http://127.0.0.1:1/health".into()),
        }]);
        t.sweep().await;
        assert!(!t.is_healthy("eu-west").await);
        let snapshot = t.snapshot().await;
        assert!(snapshot["eu-west"].last_error.is_some());
    }

    #[tokio::test]
    async fn region_names_preserve_configuration_order() {
        let t = tracker(vec![
            RegionConfig { name: "us-east".into(), health_url: None },
            RegionConfig { name: "eu-west".into(), health_url: None },
        ]);
        assert_eq!(t.region_names(), vec!["us-east", "eu-west"]);
    }
}
