/// Notification module - fans incident transitions out to channels.
///
/// Channel resolution and the cooldown filter run against the store;
/// delivery itself is per-channel isolated so one broken webhook never
/// silences the rest.
pub mod message;

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::database::Store;
use crate::database::models::{
    ChannelKind, Incident, Monitor, NotificationChannel, TriggerEvent,
};

/// The external email-sending capability.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<()>;
}

/// Mailer posting to an HTTP email API (Resend-style JSON endpoint).
pub struct HttpApiMailer {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    from: String,
}

impl HttpApiMailer {
    pub fn new(api_url: String, api_key: String, from: String) -> Result<Self> {
        let client =
            reqwest::Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self { client, api_url, api_key, from })
    }
}

#[async_trait]
impl Mailer for HttpApiMailer {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<()> {
        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "from": self.from,
                "to": to,
                "subject": subject,
                "html": html,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            bail!("email API rejected send: {}", response.status());
        }
        Ok(())
    }
}

/// Notification dispatcher.
pub struct NotificationDispatcher {
    store: Arc<dyn Store>,
    mailer: Arc<dyn Mailer>,
    client: reqwest::Client,
}

impl NotificationDispatcher {
    pub fn new(store: Arc<dyn Store>, mailer: Arc<dyn Mailer>) -> Result<Self> {
        let client =
            reqwest::Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self { store, mailer, client })
    }

    /// Fan one incident transition out to every eligible channel.
    ///
    /// Eligibility: enabled, same organization, subscribed to the event,
    /// in scope for the monitor, and outside its cooldown window. The
    /// cooldown clock only advances after a provider accepts the send,
    /// making delivery at-least-once with cooldown-based deduplication.
    pub async fn dispatch(
        &self,
        monitor: &Monitor,
        incident: &Incident,
        event: TriggerEvent,
    ) -> Result<()> {
        let channels = self
            .store
            .get_channels_for_org(&monitor.organization_id)
            .await
            .context("failed to load notification channels")?;

        let now = SystemTime::now();
        for channel in channels {
            if !channel.applies_to(monitor, event) {
                continue;
            }
            if !channel.cooldown_expired(now) {
                debug!(
                    channel = %channel.uuid,
                    monitor = %monitor.uuid,
                    "suppressing {event} notification, channel in cooldown"
                );
                continue;
            }

            // One channel failing must not block the others; that holds
            // for the cooldown-clock write too, not just the send.
            match self.deliver(&channel, monitor, incident, event).await {
                Ok(()) => {
                    info!(
                        channel = %channel.uuid,
                        kind = %channel.kind,
                        monitor = %monitor.uuid,
                        "sent {event} notification"
                    );
                    if let Some(id) = channel.id {
                        match self
                            .store
                            .mark_channel_notified(id, channel.last_notified_at, now)
                            .await
                        {
                            Ok(true) => {}
                            Ok(false) => debug!(
                                channel = %channel.uuid,
                                "cooldown clock already advanced by a concurrent dispatcher"
                            ),
                            Err(e) => warn!(
                                channel = %channel.uuid,
                                "failed to advance cooldown clock: {e:#}"
                            ),
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        channel = %channel.uuid,
                        kind = %channel.kind,
                        monitor = %monitor.uuid,
                        "failed to send {event} notification: {e:#}"
                    );
                }
            }
        }

        Ok(())
    }

    async fn deliver(
        &self,
        channel: &NotificationChannel,
        monitor: &Monitor,
        incident: &Incident,
        event: TriggerEvent,
    ) -> Result<()> {
        match channel.kind {
            ChannelKind::Email => {
                let to = channel
                    .config
                    .email
                    .as_deref()
                    .context("email channel has no address configured")?;
                self.mailer
                    .send(
                        to,
                        &message::email_subject(monitor, event),
                        &message::email_html(monitor, incident, event),
                    )
                    .await
            }
            ChannelKind::Discord => {
                let url = channel
                    .config
                    .webhook_url
                    .as_deref()
                    .context("discord channel has no webhook configured")?;
                self.post_webhook(url, &message::discord_payload(monitor, incident, event))
                    .await
            }
            ChannelKind::Slack => {
                let url = channel
                    .config
                    .slack_webhook_url
                    .as_deref()
                    .context("slack channel has no webhook configured")?;
                let payload = message::slack_payload(
                    monitor,
                    incident,
                    event,
                    channel.config.slack_channel.as_deref(),
                );
                self.post_webhook(url, &payload).await
            }
        }
    }

    async fn post_webhook(&self, url: &str, payload: &serde_json::Value) -> Result<()> {
        let response = self.client.post(url).json(payload).send().await?;
        if !response.status().is_success() {
            bail!("webhook returned {}", response.status());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::LibsqlStore;
    use crate::database::models::{ChannelConfig, IncidentStatus};
    use crate::probe::ProbeResult;
    use crate::testutil;
    use std::sync::Mutex;
    use uuid::Uuid;

    /// Mailer recording sends, failing for addresses on its deny list.
    struct MockMailer {
        sent: Mutex<Vec<String>>,
        failing: Vec<String>,
    }

    impl MockMailer {
        fn new(failing: &[&str]) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                failing: failing.iter().map(|s| s.to_string()).collect(),
            }
        }

        fn sent_to(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Mailer for MockMailer {
        async fn send(&self, to: &str, _subject: &str, _html: &str) -> Result<()> {
            if self.failing.iter().any(|f| f == to) {
                bail!("smtp backend exploded");
            }
            self.sent.lock().unwrap().push(to.to_string());
            Ok(())
        }
    }

    /// Store wrapper simulating an outage confined to the cooldown
    /// clock update.
    struct BrokenClockStore {
        inner: Arc<LibsqlStore>,
    }

    #[async_trait]
    impl Store for BrokenClockStore {
        async fn get_enabled_monitors(&self) -> Result<Vec<Monitor>> {
            self.inner.get_enabled_monitors().await
        }

        async fn get_monitor(&self, uuid: Uuid) -> Result<Option<Monitor>> {
            self.inner.get_monitor(uuid).await
        }

        async fn save_monitor(&self, monitor: &Monitor) -> Result<i64> {
            self.inner.save_monitor(monitor).await
        }

        async fn delete_monitor(&self, uuid: Uuid) -> Result<()> {
            self.inner.delete_monitor(uuid).await
        }

        async fn save_probe_result(&self, result: &ProbeResult) -> Result<i64> {
            self.inner.save_probe_result(result).await
        }

        async fn recent_probe_results(
            &self,
            monitor_uuid: Uuid,
            limit: usize,
        ) -> Result<Vec<ProbeResult>> {
            self.inner.recent_probe_results(monitor_uuid, limit).await
        }

        async fn open_incident(&self, result: &ProbeResult) -> Result<Option<Incident>> {
            self.inner.open_incident(result).await
        }

        async fn refresh_open_incident(&self, result: &ProbeResult) -> Result<()> {
            self.inner.refresh_open_incident(result).await
        }

        async fn close_open_incident(
            &self,
            monitor_uuid: Uuid,
            region: Option<&str>,
            ended_at: SystemTime,
        ) -> Result<Option<Incident>> {
            self.inner.close_open_incident(monitor_uuid, region, ended_at).await
        }

        async fn find_open_incident(
            &self,
            monitor_uuid: Uuid,
            region: Option<&str>,
        ) -> Result<Option<Incident>> {
            self.inner.find_open_incident(monitor_uuid, region).await
        }

        async fn get_channels_for_org(
            &self,
            organization_id: &str,
        ) -> Result<Vec<NotificationChannel>> {
            self.inner.get_channels_for_org(organization_id).await
        }

        async fn save_channel(&self, channel: &NotificationChannel) -> Result<i64> {
            self.inner.save_channel(channel).await
        }

        async fn mark_channel_notified(
            &self,
            _channel_id: i64,
            _previous: Option<SystemTime>,
            _now: SystemTime,
        ) -> Result<bool> {
            bail!("simulated store outage")
        }
    }

    fn email_channel(org: &str, address: &str) -> NotificationChannel {
        NotificationChannel::new(org, ChannelKind::Email, ChannelConfig {
            email: Some(address.into()),
            ..Default::default()
        })
    }

    fn open_incident(monitor: &Monitor) -> Incident {
        Incident {
            id: 1,
            monitor_uuid: monitor.uuid,
            region: Some("us-east".into()),
            status: IncidentStatus::Open,
            started_at: SystemTime::now(),
            ended_at: None,
            last_error: Some("connection refused".into()),
            last_error_kind: None,
        }
    }

    #[tokio::test]
    async fn cooldown_suppresses_and_expiry_sends() -> Result<()> {
        let (store, _dir) = testutil::test_store().await?;
        let mailer = Arc::new(MockMailer::new(&[]));

        let monitor = Monitor::new_http("org-1", "https://example.com");
        store.save_monitor(&monitor).await?;

        let mut cooling = email_channel("org-1", "cooling@example.com");
        cooling.cooldown_minutes = 5;
        cooling.last_notified_at = Some(SystemTime::now() - Duration::from_secs(3 * 60));
        store.save_channel(&cooling).await?;

        let mut ready = email_channel("org-1", "ready@example.com");
        ready.cooldown_minutes = 5;
        ready.last_notified_at = Some(SystemTime::now() - Duration::from_secs(6 * 60));
        store.save_channel(&ready).await?;

        let dispatcher = NotificationDispatcher::new(store.clone(), mailer.clone())?;
        dispatcher.dispatch(&monitor, &open_incident(&monitor), TriggerEvent::Down).await?;

        assert_eq!(mailer.sent_to(), vec!["ready@example.com".to_string()]);

        // The send advanced the ready channel's cooldown clock.
        let channels = store.get_channels_for_org("org-1").await?;
        let ready_after = channels
            .iter()
            .find(|c| c.config.email.as_deref() == Some("ready@example.com"))
            .unwrap();
        let age = SystemTime::now()
            .duration_since(ready_after.last_notified_at.unwrap())
            .unwrap();
        assert!(age < Duration::from_secs(5));
        Ok(())
    }

    #[tokio::test]
    async fn scoped_channel_ignores_other_monitors() -> Result<()> {
        let (store, _dir) = testutil::test_store().await?;
        let mailer = Arc::new(MockMailer::new(&[]));

        let covered = Monitor::new_http("org-1", "https://covered.example.com");
        let uncovered = Monitor::new_http("org-1", "https://uncovered.example.com");
        store.save_monitor(&covered).await?;
        store.save_monitor(&uncovered).await?;

        let mut scoped = email_channel("org-1", "scoped@example.com");
        scoped.monitor_uuids = Some(vec![covered.uuid]);
        store.save_channel(&scoped).await?;

        let unscoped = email_channel("org-1", "all@example.com");
        store.save_channel(&unscoped).await?;

        let dispatcher = NotificationDispatcher::new(store.clone(), mailer.clone())?;
        dispatcher
            .dispatch(&uncovered, &open_incident(&uncovered), TriggerEvent::Down)
            .await?;

        assert_eq!(mailer.sent_to(), vec!["all@example.com".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn one_failing_channel_does_not_block_others() -> Result<()> {
        let (store, _dir) = testutil::test_store().await?;
        let mailer = Arc::new(MockMailer::new(&["broken@example.com"]));

        let monitor = Monitor::new_http("org-1", "https://example.com");
        store.save_monitor(&monitor).await?;

        store.save_channel(&email_channel("org-1", "broken@example.com")).await?;
        store.save_channel(&email_channel("org-1", "working@example.com")).await?;

        let dispatcher = NotificationDispatcher::new(store.clone(), mailer.clone())?;
        dispatcher.dispatch(&monitor, &open_incident(&monitor), TriggerEvent::Down).await?;

        assert_eq!(mailer.sent_to(), vec!["working@example.com".to_string()]);

        // Failed channel keeps an untouched cooldown clock and will be
        // retried on the next event.
        let channels = store.get_channels_for_org("org-1").await?;
        let broken = channels
            .iter()
            .find(|c| c.config.email.as_deref() == Some("broken@example.com"))
            .unwrap();
        assert!(broken.last_notified_at.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn clock_update_failure_does_not_block_siblings() -> Result<()> {
        let (inner, _dir) = testutil::test_store().await?;
        let store = Arc::new(BrokenClockStore { inner: inner.clone() });
        let mailer = Arc::new(MockMailer::new(&[]));

        let monitor = Monitor::new_http("org-1", "https://example.com");
        inner.save_monitor(&monitor).await?;

        inner.save_channel(&email_channel("org-1", "first@example.com")).await?;
        inner.save_channel(&email_channel("org-1", "second@example.com")).await?;

        let dispatcher = NotificationDispatcher::new(store, mailer.clone())?;
        dispatcher.dispatch(&monitor, &open_incident(&monitor), TriggerEvent::Down).await?;

        // Both sends happen even though neither cooldown write landed.
        let mut sent = mailer.sent_to();
        sent.sort();
        assert_eq!(sent, vec!["first@example.com".to_string(), "second@example.com".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn recovery_event_respects_trigger_subscription() -> Result<()> {
        let (store, _dir) = testutil::test_store().await?;
        let mailer = Arc::new(MockMailer::new(&[]));

        let monitor = Monitor::new_http("org-1", "https://example.com");
        store.save_monitor(&monitor).await?;

        let mut down_only = email_channel("org-1", "down-only@example.com");
        down_only.trigger_events = vec![TriggerEvent::Down];
        store.save_channel(&down_only).await?;

        let mut incident = open_incident(&monitor);
        incident.status = IncidentStatus::Closed;
        incident.ended_at = Some(SystemTime::now());

        let dispatcher = NotificationDispatcher::new(store.clone(), mailer.clone())?;
        dispatcher.dispatch(&monitor, &incident, TriggerEvent::Recovery).await?;

        assert!(mailer.sent_to().is_empty());
        Ok(())
    }
}
