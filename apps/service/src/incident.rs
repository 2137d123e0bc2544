use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info};

use crate::database::Store;
use crate::database::models::{Incident, TriggerEvent};
use crate::probe::ProbeResult;

/// A state transition worth broadcasting.
#[derive(Debug, Clone)]
pub struct IncidentEvent {
    pub kind: TriggerEvent,
    pub incident: Incident,
}

/// Incident detector - the per-(monitor, region) up/down state machine.
///
/// State lives entirely in the store: "down" means an open incident row
/// exists for the key. All four transitions reduce to conditional
/// writes, so duplicate delivery from the at-least-once queue and
/// concurrent workers collapse to a single incident.
pub struct IncidentDetector {
    store: Arc<dyn Store>,
}

impl IncidentDetector {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Feed one probe result through the state machine.
    ///
    /// Returns an event only on Up -> Down and Down -> Up transitions;
    /// repeats of the current state are silent.
    pub async fn observe(&self, result: &ProbeResult) -> Result<Option<IncidentEvent>> {
        if result.success {
            let closed = self
                .store
                .close_open_incident(result.monitor_uuid, Some(&result.region), result.timestamp)
                .await?;

            return Ok(closed.map(|incident| {
                info!(
                    monitor = %result.monitor_uuid,
                    region = %result.region,
                    incident = incident.id,
                    "monitor recovered"
                );
                IncidentEvent { kind: TriggerEvent::Recovery, incident }
            }));
        }

        match self.store.open_incident(result).await? {
            Some(incident) => {
                info!(
                    monitor = %result.monitor_uuid,
                    region = %result.region,
                    incident = incident.id,
                    error = result.error.as_deref().unwrap_or("unknown"),
                    "monitor went down"
                );
                Ok(Some(IncidentEvent { kind: TriggerEvent::Down, incident }))
            }
            None => {
                // Down -> Down: keep diagnostics fresh, emit nothing.
                debug!(
                    monitor = %result.monitor_uuid,
                    region = %result.region,
                    "monitor still down"
                );
                self.store.refresh_open_incident(result).await?;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::IncidentStatus;
    use crate::probe::types::ProbeErrorKind;
    use crate::testutil;
    use std::time::Duration;
    use uuid::Uuid;

    #[tokio::test]
    async fn duplicate_failures_open_one_incident() -> Result<()> {
        let (store, _dir) = testutil::test_store().await?;
        let detector = IncidentDetector::new(store.clone());
        let monitor_uuid = Uuid::new_v4();

        let failure = testutil::failed_probe(monitor_uuid, "us-east");

        let first = detector.observe(&failure).await?;
        assert!(matches!(first, Some(IncidentEvent { kind: TriggerEvent::Down, .. })));

        // Same failed result delivered again (at-least-once queue).
        let second = detector.observe(&failure).await?;
        assert!(second.is_none(), "replayed failure must not create or announce anything");

        let open = store.find_open_incident(monitor_uuid, Some("us-east")).await?;
        assert!(open.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn success_without_open_incident_is_silent() -> Result<()> {
        let (store, _dir) = testutil::test_store().await?;
        let detector = IncidentDetector::new(store.clone());

        let ok = testutil::successful_probe(Uuid::new_v4(), "us-east");
        assert!(detector.observe(&ok).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn down_then_recovery_round_trip() -> Result<()> {
        let (store, _dir) = testutil::test_store().await?;
        let detector = IncidentDetector::new(store.clone());
        let monitor_uuid = Uuid::new_v4();

        let started = testutil::now_secs();
        let mut failure = testutil::failed_probe(monitor_uuid, "us-east");
        failure.timestamp = started;
        detector.observe(&failure).await?;

        let mut recovery = testutil::successful_probe(monitor_uuid, "us-east");
        recovery.timestamp = started + Duration::from_secs(90);
        let event = detector.observe(&recovery).await?.unwrap();

        assert_eq!(event.kind, TriggerEvent::Recovery);
        let incident = event.incident;
        assert_eq!(incident.status, IncidentStatus::Closed);
        let downtime = incident.downtime().unwrap();
        assert_eq!(downtime, Duration::from_secs(90));
        assert!(incident.ended_at.unwrap() > incident.started_at);

        assert!(store.find_open_incident(monitor_uuid, Some("us-east")).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn continued_failures_refresh_diagnostics() -> Result<()> {
        let (store, _dir) = testutil::test_store().await?;
        let detector = IncidentDetector::new(store.clone());
        let monitor_uuid = Uuid::new_v4();

        let failure = testutil::failed_probe(monitor_uuid, "us-east");
        detector.observe(&failure).await?;

        let mut timeout = testutil::failed_probe(monitor_uuid, "us-east");
        timeout.error = Some("request timed out".into());
        timeout.error_kind = Some(ProbeErrorKind::Timeout);
        detector.observe(&timeout).await?;

        let open = store.find_open_incident(monitor_uuid, Some("us-east")).await?.unwrap();
        assert_eq!(open.last_error.as_deref(), Some("request timed out"));
        assert_eq!(open.last_error_kind, Some(ProbeErrorKind::Timeout));
        Ok(())
    }

    /// Full cycle: success, success, failure, failure, success
    /// yields exactly one incident, opened at the third probe and closed
    /// at the fifth.
    #[tokio::test]
    async fn five_probe_scenario() -> Result<()> {
        let (store, _dir) = testutil::test_store().await?;
        let detector = IncidentDetector::new(store.clone());
        let monitor_uuid = Uuid::new_v4();
        let t0 = testutil::now_secs();

        let mut events = Vec::new();
        for (i, success) in [true, true, false, false, true].into_iter().enumerate() {
            let mut probe = if success {
                testutil::successful_probe(monitor_uuid, "us-east")
            } else {
                testutil::failed_probe(monitor_uuid, "us-east")
            };
            probe.timestamp = t0 + Duration::from_secs(30 * i as u64);
            if let Some(event) = detector.observe(&probe).await? {
                events.push(event);
            }
        }

        assert_eq!(events.len(), 2, "exactly one down and one recovery");
        assert_eq!(events[0].kind, TriggerEvent::Down);
        assert_eq!(events[1].kind, TriggerEvent::Recovery);

        let incident = &events[1].incident;
        assert_eq!(incident.started_at, t0 + Duration::from_secs(60));
        assert_eq!(incident.ended_at.unwrap(), t0 + Duration::from_secs(120));
        Ok(())
    }
}
