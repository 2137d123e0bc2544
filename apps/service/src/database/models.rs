use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::probe::types::ProbeErrorKind;

/// Convert SystemTime to a unix-seconds column value
pub fn to_unix(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

/// Convert a unix-seconds column value back to SystemTime
pub fn from_unix(timestamp: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(timestamp.max(0) as u64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorType {
    Http,
    Tcp,
}

impl MonitorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorType::Http => "http",
            MonitorType::Tcp => "tcp",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "http" => Some(MonitorType::Http),
            "tcp" => Some(MonitorType::Tcp),
            _ => None,
        }
    }
}

impl std::fmt::Display for MonitorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub url: String,
    /// Explicit allow-list of status codes; `None` means any 2xx/3xx.
    #[serde(default)]
    pub accepted_status_codes: Option<Vec<u16>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpConfig {
    pub host: String,
    pub port: u16,
}

/// Monitor model - a configured target plus cadence.
///
/// Owned by the CRUD layer; the engine only reads these and reacts to
/// lifecycle hooks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Monitor {
    pub id: Option<i64>,
    pub uuid: Uuid,
    pub organization_id: String,
    pub name: Option<String>,
    pub monitor_type: MonitorType,
    pub http_config: Option<HttpConfig>,
    pub tcp_config: Option<TcpConfig>,
    pub interval_seconds: u64,
    /// Regions to probe from; empty means every configured region.
    pub regions: Vec<String>,
    pub enabled: bool,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
}

impl Monitor {
    pub fn new_http(organization_id: impl Into<String>, url: impl Into<String>) -> Self {
        let now = SystemTime::now();
        Self {
            id: None,
            uuid: Uuid::new_v4(),
            organization_id: organization_id.into(),
            name: None,
            monitor_type: MonitorType::Http,
            http_config: Some(HttpConfig { url: url.into(), accepted_status_codes: None }),
            tcp_config: None,
            interval_seconds: 30,
            regions: Vec::new(),
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn new_tcp(organization_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        let now = SystemTime::now();
        Self {
            id: None,
            uuid: Uuid::new_v4(),
            organization_id: organization_id.into(),
            name: None,
            monitor_type: MonitorType::Tcp,
            http_config: None,
            tcp_config: Some(TcpConfig { host: host.into(), port }),
            interval_seconds: 30,
            regions: Vec::new(),
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Human-readable identity used in alert bodies: name, URL, or
    /// host:port, in that order.
    pub fn display_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        if let Some(http) = &self.http_config {
            return http.url.clone();
        }
        if let Some(tcp) = &self.tcp_config {
            return format!("{}:{}", tcp.host, tcp.port);
        }
        self.uuid.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    Open,
    Closed,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Open => "open",
            IncidentStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(IncidentStatus::Open),
            "closed" => Some(IncidentStatus::Closed),
            _ => None,
        }
    }
}

impl std::fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Incident model - a bounded interval during which a monitor was down
/// as seen from one region (`region = None` for global aggregation).
///
/// Invariant: at most one open incident per (monitor, region), enforced
/// by a partial unique index and conditional writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: i64,
    pub monitor_uuid: Uuid,
    pub region: Option<String>,
    pub status: IncidentStatus,
    pub started_at: SystemTime,
    pub ended_at: Option<SystemTime>,
    pub last_error: Option<String>,
    pub last_error_kind: Option<ProbeErrorKind>,
}

impl Incident {
    /// Downtime covered by this incident; `None` while still open.
    pub fn downtime(&self) -> Option<Duration> {
        self.ended_at?.duration_since(self.started_at).ok()
    }
}

/// Event types a channel can subscribe to, and the kind attached to an
/// emitted incident transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerEvent {
    Down,
    Recovery,
}

impl TriggerEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerEvent::Down => "down",
            TriggerEvent::Recovery => "recovery",
        }
    }
}

impl std::fmt::Display for TriggerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Email,
    Discord,
    Slack,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Email => "email",
            ChannelKind::Discord => "discord",
            ChannelKind::Slack => "slack",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "email" => Some(ChannelKind::Email),
            "discord" => Some(ChannelKind::Discord),
            "slack" => Some(ChannelKind::Slack),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type-specific channel configuration, stored as a JSON column.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub slack_webhook_url: Option<String>,
    #[serde(default)]
    pub slack_channel: Option<String>,
}

/// Notification channel model.
///
/// Every field is CRUD-owned except `last_notified_at`, which the
/// dispatcher advances after a provider accepts a send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationChannel {
    pub id: Option<i64>,
    pub uuid: Uuid,
    pub organization_id: String,
    pub kind: ChannelKind,
    pub config: ChannelConfig,
    pub enabled: bool,
    pub trigger_events: Vec<TriggerEvent>,
    /// `None` covers every monitor in the organization.
    pub monitor_uuids: Option<Vec<Uuid>>,
    pub cooldown_minutes: i64,
    pub last_notified_at: Option<SystemTime>,
}

impl NotificationChannel {
    pub fn new(
        organization_id: impl Into<String>,
        kind: ChannelKind,
        config: ChannelConfig,
    ) -> Self {
        Self {
            id: None,
            uuid: Uuid::new_v4(),
            organization_id: organization_id.into(),
            kind,
            config,
            enabled: true,
            trigger_events: vec![TriggerEvent::Down, TriggerEvent::Recovery],
            monitor_uuids: None,
            cooldown_minutes: 5,
            last_notified_at: None,
        }
    }

    /// Whether this channel wants `event` for `monitor`.
    pub fn applies_to(&self, monitor: &Monitor, event: TriggerEvent) -> bool {
        if !self.enabled || self.organization_id != monitor.organization_id {
            return false;
        }
        if !self.trigger_events.contains(&event) {
            return false;
        }
        match &self.monitor_uuids {
            None => true,
            Some(uuids) => uuids.contains(&monitor.uuid),
        }
    }

    /// Cooldown is per channel, not per monitor: one suppression clock
    /// shared by every monitor the channel covers.
    pub fn cooldown_expired(&self, now: SystemTime) -> bool {
        let Some(last) = self.last_notified_at else {
            return true;
        };
        match now.duration_since(last) {
            Ok(elapsed) => elapsed > Duration::from_secs(self.cooldown_minutes.max(0) as u64 * 60),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cooldown_window_boundaries() {
        let now = SystemTime::now();
        let mut channel =
            NotificationChannel::new("org", ChannelKind::Email, ChannelConfig::default());
        channel.cooldown_minutes = 5;

        assert!(channel.cooldown_expired(now), "never-notified channel is eligible");

        channel.last_notified_at = Some(now - Duration::from_secs(3 * 60));
        assert!(!channel.cooldown_expired(now), "3min ago is inside a 5min cooldown");

        channel.last_notified_at = Some(now - Duration::from_secs(6 * 60));
        assert!(channel.cooldown_expired(now), "6min ago is past a 5min cooldown");
    }

    #[test]
    fn scope_filter() {
        let monitor = Monitor::new_http("org-1", "https://example.com");
        let other = Monitor::new_http("org-1", "https://other.example.com");

        let mut channel =
            NotificationChannel::new("org-1", ChannelKind::Email, ChannelConfig::default());
        assert!(channel.applies_to(&monitor, TriggerEvent::Down), "unscoped covers all");

        channel.monitor_uuids = Some(vec![monitor.uuid]);
        assert!(channel.applies_to(&monitor, TriggerEvent::Down));
        assert!(!channel.applies_to(&other, TriggerEvent::Down));

        channel.monitor_uuids = None;
        channel.trigger_events = vec![TriggerEvent::Recovery];
        assert!(!channel.applies_to(&monitor, TriggerEvent::Down));
        assert!(channel.applies_to(&monitor, TriggerEvent::Recovery));

        let foreign = Monitor::new_http("org-2", "https://example.org");
        channel.trigger_events = vec![TriggerEvent::Down];
        assert!(!channel.applies_to(&foreign, TriggerEvent::Down), "other org never matches");
    }

    #[test]
    fn display_name_fallbacks() {
        let mut m = Monitor::new_http("org", "https://example.com");
        assert_eq!(m.display_name(), "https://example.com");
        m.name = Some("prod api".into());
        assert_eq!(m.display_name(), "prod api");

        let t = Monitor::new_tcp("org", "db.internal", 5432);
        assert_eq!(t.display_name(), "db.internal:5432");
    }
}
