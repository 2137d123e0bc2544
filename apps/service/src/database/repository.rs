use anyhow::{Context, Result};
use async_trait::async_trait;
use libsql::{Row, params};
use std::time::SystemTime;
use uuid::Uuid;

use super::models::{
    self, ChannelConfig, ChannelKind, Incident, IncidentStatus, Monitor, MonitorType,
    NotificationChannel, TriggerEvent,
};
use crate::pool::{LibsqlManager, LibsqlPool};
use crate::probe::types::{ProbeErrorKind, ProbeResult};

/// Store trait - the engine's persistence contract.
///
/// Incident and cooldown mutations are conditional writes: the store is
/// the arbiter of concurrent transitions, so workers in separate
/// processes stay consistent without in-process locks.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_enabled_monitors(&self) -> Result<Vec<Monitor>>;

    async fn get_monitor(&self, uuid: Uuid) -> Result<Option<Monitor>>;

    /// Insert or update a monitor. The CRUD layer owns this; the engine
    /// itself only calls it from tests.
    async fn save_monitor(&self, monitor: &Monitor) -> Result<i64>;

    async fn delete_monitor(&self, uuid: Uuid) -> Result<()>;

    async fn save_probe_result(&self, result: &ProbeResult) -> Result<i64>;

    async fn recent_probe_results(&self, monitor_uuid: Uuid, limit: usize)
    -> Result<Vec<ProbeResult>>;

    /// Open an incident for the result's (monitor, region) key.
    ///
    /// Returns `None` when an incident is already open for the key; the
    /// partial unique index makes concurrent opens collapse to one row.
    async fn open_incident(&self, result: &ProbeResult) -> Result<Option<Incident>>;

    /// Refresh `last_error` on an already-open incident (Down -> Down).
    async fn refresh_open_incident(&self, result: &ProbeResult) -> Result<()>;

    /// Close the open incident for the key, if any.
    ///
    /// The close is compare-and-swap on (id, status) so a concurrent
    /// closer wins exactly once.
    async fn close_open_incident(
        &self,
        monitor_uuid: Uuid,
        region: Option<&str>,
        ended_at: SystemTime,
    ) -> Result<Option<Incident>>;

    async fn find_open_incident(
        &self,
        monitor_uuid: Uuid,
        region: Option<&str>,
    ) -> Result<Option<Incident>>;

    async fn get_channels_for_org(&self, organization_id: &str)
    -> Result<Vec<NotificationChannel>>;

    async fn save_channel(&self, channel: &NotificationChannel) -> Result<i64>;

    /// Advance a channel's cooldown clock, but only if it still reads
    /// `previous` - the optimistic guard against a concurrent dispatcher.
    async fn mark_channel_notified(
        &self,
        channel_id: i64,
        previous: Option<SystemTime>,
        now: SystemTime,
    ) -> Result<bool>;
}

/// LibSQL store implementation
pub struct LibsqlStore {
    pool: LibsqlPool,
}

impl LibsqlStore {
    pub fn new(pool: LibsqlPool) -> Self {
        Self { pool }
    }

    async fn get_conn(&self) -> Result<deadpool::managed::Object<LibsqlManager>> {
        Ok(self.pool.get().await?)
    }
}

const MONITOR_COLUMNS: &str = "id, uuid, organization_id, name, monitor_type, http_config, \
     tcp_config, interval_seconds, regions, enabled, created_at, updated_at";

fn monitor_from_row(row: &Row) -> Result<Monitor> {
    let uuid_str: String = row.get(1)?;
    let type_str: String = row.get(4)?;
    let http_config: Option<String> = row.get(5)?;
    let tcp_config: Option<String> = row.get(6)?;
    let regions: String = row.get(8)?;

    Ok(Monitor {
        id: Some(row.get(0)?),
        uuid: Uuid::parse_str(&uuid_str)?,
        organization_id: row.get(2)?,
        name: row.get(3)?,
        monitor_type: MonitorType::parse(&type_str)
            .with_context(|| format!("unknown monitor type {type_str}"))?,
        http_config: http_config.as_deref().map(serde_json::from_str).transpose()?,
        tcp_config: tcp_config.as_deref().map(serde_json::from_str).transpose()?,
        interval_seconds: row.get::<i64>(7)? as u64,
        regions: serde_json::from_str(&regions)?,
        enabled: row.get::<i64>(9)? != 0,
        created_at: models::from_unix(row.get(10)?),
        updated_at: models::from_unix(row.get(11)?),
    })
}

const INCIDENT_COLUMNS: &str =
    "id, monitor_uuid, region, status, started_at, ended_at, last_error, last_error_kind";

fn incident_from_row(row: &Row) -> Result<Incident> {
    let uuid_str: String = row.get(1)?;
    let status_str: String = row.get(3)?;
    let kind: Option<String> = row.get(7)?;

    Ok(Incident {
        id: row.get(0)?,
        monitor_uuid: Uuid::parse_str(&uuid_str)?,
        region: row.get(2)?,
        status: IncidentStatus::parse(&status_str)
            .with_context(|| format!("unknown incident status {status_str}"))?,
        started_at: models::from_unix(row.get(4)?),
        ended_at: row.get::<Option<i64>>(5)?.map(models::from_unix),
        last_error: row.get(6)?,
        last_error_kind: kind.as_deref().and_then(ProbeErrorKind::parse),
    })
}

const CHANNEL_COLUMNS: &str = "id, uuid, organization_id, kind, config, enabled, \
     trigger_events, monitor_uuids, cooldown_minutes, last_notified_at";

fn channel_from_row(row: &Row) -> Result<NotificationChannel> {
    let uuid_str: String = row.get(1)?;
    let kind_str: String = row.get(3)?;
    let config: String = row.get(4)?;
    let trigger_events: String = row.get(6)?;
    let monitor_uuids: Option<String> = row.get(7)?;

    Ok(NotificationChannel {
        id: Some(row.get(0)?),
        uuid: Uuid::parse_str(&uuid_str)?,
        organization_id: row.get(2)?,
        kind: ChannelKind::parse(&kind_str)
            .with_context(|| format!("unknown channel kind {kind_str}"))?,
        config: serde_json::from_str::<ChannelConfig>(&config)?,
        enabled: row.get::<i64>(5)? != 0,
        trigger_events: serde_json::from_str::<Vec<TriggerEvent>>(&trigger_events)?,
        monitor_uuids: monitor_uuids.as_deref().map(serde_json::from_str).transpose()?,
        cooldown_minutes: row.get(8)?,
        last_notified_at: row.get::<Option<i64>>(9)?.map(models::from_unix),
    })
}

#[async_trait]
impl Store for LibsqlStore {
    async fn get_enabled_monitors(&self) -> Result<Vec<Monitor>> {
        let conn = self.get_conn().await?;
        let mut stmt = conn
            .prepare(&format!("SELECT {MONITOR_COLUMNS} FROM monitors WHERE enabled = 1"))
            .await?;

        let mut rows = stmt.query(()).await?;
        let mut monitors = Vec::new();

        while let Some(row) = rows.next().await? {
            monitors.push(monitor_from_row(&row)?);
        }

        Ok(monitors)
    }

    async fn get_monitor(&self, uuid: Uuid) -> Result<Option<Monitor>> {
        let conn = self.get_conn().await?;
        let mut stmt = conn
            .prepare(&format!("SELECT {MONITOR_COLUMNS} FROM monitors WHERE uuid = ?"))
            .await?;

        let mut rows = stmt.query(params![uuid.to_string()]).await?;

        match rows.next().await? {
            Some(row) => Ok(Some(monitor_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn save_monitor(&self, monitor: &Monitor) -> Result<i64> {
        let conn = self.get_conn().await?;
        let http_config =
            monitor.http_config.as_ref().map(serde_json::to_string).transpose()?;
        let tcp_config = monitor.tcp_config.as_ref().map(serde_json::to_string).transpose()?;
        let regions = serde_json::to_string(&monitor.regions)?;

        if let Some(id) = monitor.id {
            conn.execute(
                "UPDATE monitors SET organization_id = ?, name = ?, monitor_type = ?, \
                 http_config = ?, tcp_config = ?, interval_seconds = ?, regions = ?, \
                 enabled = ?, updated_at = ? WHERE id = ?",
                params![
                    monitor.organization_id.clone(),
                    monitor.name.clone(),
                    monitor.monitor_type.as_str(),
                    http_config,
                    tcp_config,
                    monitor.interval_seconds as i64,
                    regions,
                    monitor.enabled as i64,
                    models::to_unix(monitor.updated_at),
                    id
                ],
            )
            .await?;
            Ok(id)
        } else {
            conn.execute(
                "INSERT INTO monitors (uuid, organization_id, name, monitor_type, http_config, \
                 tcp_config, interval_seconds, regions, enabled, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    monitor.uuid.to_string(),
                    monitor.organization_id.clone(),
                    monitor.name.clone(),
                    monitor.monitor_type.as_str(),
                    http_config,
                    tcp_config,
                    monitor.interval_seconds as i64,
                    regions,
                    monitor.enabled as i64,
                    models::to_unix(monitor.created_at),
                    models::to_unix(monitor.updated_at)
                ],
            )
            .await?;

            Ok(conn.last_insert_rowid())
        }
    }

    async fn delete_monitor(&self, uuid: Uuid) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.execute("DELETE FROM monitors WHERE uuid = ?", params![uuid.to_string()]).await?;
        Ok(())
    }

    async fn save_probe_result(&self, result: &ProbeResult) -> Result<i64> {
        let conn = self.get_conn().await?;

        conn.execute(
            "INSERT INTO probe_results (monitor_uuid, region, timestamp, success, latency_ms, \
             status_code, error, error_kind, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                result.monitor_uuid.to_string(),
                result.region.clone(),
                models::to_unix(result.timestamp),
                result.success as i64,
                result.latency_ms as i64,
                result.status_code.map(|v| v as i64),
                result.error.clone(),
                result.error_kind.map(|k| k.as_str()),
                models::to_unix(SystemTime::now())
            ],
        )
        .await?;

        Ok(conn.last_insert_rowid())
    }

    async fn recent_probe_results(
        &self,
        monitor_uuid: Uuid,
        limit: usize,
    ) -> Result<Vec<ProbeResult>> {
        let conn = self.get_conn().await?;
        let mut stmt = conn
            .prepare(
                "SELECT monitor_uuid, region, timestamp, success, latency_ms, status_code, \
                 error, error_kind FROM probe_results WHERE monitor_uuid = ? \
                 ORDER BY timestamp DESC LIMIT ?",
            )
            .await?;

        let mut rows = stmt.query(params![monitor_uuid.to_string(), limit as i64]).await?;
        let mut results = Vec::new();

        while let Some(row) = rows.next().await? {
            let uuid_str: String = row.get(0)?;
            let kind: Option<String> = row.get(7)?;

            results.push(ProbeResult {
                monitor_uuid: Uuid::parse_str(&uuid_str)?,
                region: row.get(1)?,
                timestamp: models::from_unix(row.get(2)?),
                success: row.get::<i64>(3)? != 0,
                latency_ms: row.get::<i64>(4)? as u64,
                status_code: row.get::<Option<i64>>(5)?.map(|v| v as u16),
                error: row.get(6)?,
                error_kind: kind.as_deref().and_then(ProbeErrorKind::parse),
            });
        }

        Ok(results)
    }

    async fn open_incident(&self, result: &ProbeResult) -> Result<Option<Incident>> {
        let conn = self.get_conn().await?;

        // Relies on idx_incidents_one_open: a concurrent or duplicate
        // open for the same key inserts nothing and affects zero rows.
        let affected = conn
            .execute(
                "INSERT OR IGNORE INTO incidents (monitor_uuid, region, status, started_at, \
                 last_error, last_error_kind) VALUES (?, ?, 'open', ?, ?, ?)",
                params![
                    result.monitor_uuid.to_string(),
                    result.region.clone(),
                    models::to_unix(result.timestamp),
                    result.error.clone(),
                    result.error_kind.map(|k| k.as_str())
                ],
            )
            .await?;

        if affected == 0 {
            return Ok(None);
        }

        Ok(Some(Incident {
            id: conn.last_insert_rowid(),
            monitor_uuid: result.monitor_uuid,
            region: Some(result.region.clone()),
            status: IncidentStatus::Open,
            started_at: result.timestamp,
            ended_at: None,
            last_error: result.error.clone(),
            last_error_kind: result.error_kind,
        }))
    }

    async fn refresh_open_incident(&self, result: &ProbeResult) -> Result<()> {
        let conn = self.get_conn().await?;

        conn.execute(
            "UPDATE incidents SET last_error = ?, last_error_kind = ? \
             WHERE monitor_uuid = ? AND COALESCE(region, '') = ? AND status = 'open'",
            params![
                result.error.clone(),
                result.error_kind.map(|k| k.as_str()),
                result.monitor_uuid.to_string(),
                result.region.clone()
            ],
        )
        .await?;

        Ok(())
    }

    async fn close_open_incident(
        &self,
        monitor_uuid: Uuid,
        region: Option<&str>,
        ended_at: SystemTime,
    ) -> Result<Option<Incident>> {
        let conn = self.get_conn().await?;

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {INCIDENT_COLUMNS} FROM incidents \
                 WHERE monitor_uuid = ? AND COALESCE(region, '') = ? AND status = 'open' \
                 LIMIT 1"
            ))
            .await?;

        let mut rows = stmt
            .query(params![monitor_uuid.to_string(), region.unwrap_or("").to_string()])
            .await?;

        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        let mut incident = incident_from_row(&row)?;

        let affected = conn
            .execute(
                "UPDATE incidents SET status = 'closed', ended_at = ? \
                 WHERE id = ? AND status = 'open'",
                params![models::to_unix(ended_at), incident.id],
            )
            .await?;

        if affected == 0 {
            // Raced with another worker closing the same incident.
            return Ok(None);
        }

        incident.status = IncidentStatus::Closed;
        incident.ended_at = Some(ended_at);
        Ok(Some(incident))
    }

    async fn find_open_incident(
        &self,
        monitor_uuid: Uuid,
        region: Option<&str>,
    ) -> Result<Option<Incident>> {
        let conn = self.get_conn().await?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {INCIDENT_COLUMNS} FROM incidents \
                 WHERE monitor_uuid = ? AND COALESCE(region, '') = ? AND status = 'open' \
                 LIMIT 1"
            ))
            .await?;

        let mut rows = stmt
            .query(params![monitor_uuid.to_string(), region.unwrap_or("").to_string()])
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(incident_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn get_channels_for_org(
        &self,
        organization_id: &str,
    ) -> Result<Vec<NotificationChannel>> {
        let conn = self.get_conn().await?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {CHANNEL_COLUMNS} FROM notification_channels \
                 WHERE organization_id = ? AND enabled = 1"
            ))
            .await?;

        let mut rows = stmt.query(params![organization_id.to_string()]).await?;
        let mut channels = Vec::new();

        while let Some(row) = rows.next().await? {
            channels.push(channel_from_row(&row)?);
        }

        Ok(channels)
    }

    async fn save_channel(&self, channel: &NotificationChannel) -> Result<i64> {
        let conn = self.get_conn().await?;
        let config = serde_json::to_string(&channel.config)?;
        let trigger_events = serde_json::to_string(&channel.trigger_events)?;
        let monitor_uuids =
            channel.monitor_uuids.as_ref().map(serde_json::to_string).transpose()?;

        if let Some(id) = channel.id {
            conn.execute(
                "UPDATE notification_channels SET organization_id = ?, kind = ?, config = ?, \
                 enabled = ?, trigger_events = ?, monitor_uuids = ?, cooldown_minutes = ?, \
                 last_notified_at = ? WHERE id = ?",
                params![
                    channel.organization_id.clone(),
                    channel.kind.as_str(),
                    config,
                    channel.enabled as i64,
                    trigger_events,
                    monitor_uuids,
                    channel.cooldown_minutes,
                    channel.last_notified_at.map(models::to_unix),
                    id
                ],
            )
            .await?;
            Ok(id)
        } else {
            conn.execute(
                "INSERT INTO notification_channels (uuid, organization_id, kind, config, \
                 enabled, trigger_events, monitor_uuids, cooldown_minutes, last_notified_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    channel.uuid.to_string(),
                    channel.organization_id.clone(),
                    channel.kind.as_str(),
                    config,
                    channel.enabled as i64,
                    trigger_events,
                    monitor_uuids,
                    channel.cooldown_minutes,
                    channel.last_notified_at.map(models::to_unix)
                ],
            )
            .await?;

            Ok(conn.last_insert_rowid())
        }
    }

    async fn mark_channel_notified(
        &self,
        channel_id: i64,
        previous: Option<SystemTime>,
        now: SystemTime,
    ) -> Result<bool> {
        let conn = self.get_conn().await?;

        // `IS` gives null-safe equality, so an untouched NULL clock
        // matches a NULL expectation.
        let affected = conn
            .execute(
                "UPDATE notification_channels SET last_notified_at = ? \
                 WHERE id = ? AND last_notified_at IS ?",
                params![models::to_unix(now), channel_id, previous.map(models::to_unix)],
            )
            .await?;

        Ok(affected > 0)
    }
}
