/// Monitor configuration validation.
use anyhow::{Result, bail};
use url::Url;

use crate::database::models::{Monitor, MonitorType};

/// Floor for check intervals. Anything tighter would let a single
/// monitor saturate the worker pool.
pub const MIN_INTERVAL_SECONDS: u64 = 10;

pub fn validate_monitor(monitor: &Monitor) -> Result<()> {
    if monitor.interval_seconds < MIN_INTERVAL_SECONDS {
        bail!(
            "check interval {}s is below the minimum of {}s",
            monitor.interval_seconds,
            MIN_INTERVAL_SECONDS
        );
    }

    match monitor.monitor_type {
        MonitorType::Http => {
            let Some(http) = &monitor.http_config else {
                bail!("http monitor is missing its http configuration");
            };
            let url = Url::parse(&http.url)?;
            if url.scheme() != "http" && url.scheme() != "https" {
                bail!("unsupported url scheme '{}'", url.scheme());
            }
        }
        MonitorType::Tcp => {
            let Some(tcp) = &monitor.tcp_config else {
                bail!("tcp monitor is missing its tcp configuration");
            };
            if tcp.host.trim().is_empty() {
                bail!("tcp monitor host must not be empty");
            }
            if tcp.port == 0 {
                bail!("tcp monitor port must be non-zero");
            }
        }
    }

    Ok(())
}
