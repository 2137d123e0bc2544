use anyhow::Result;

use super::checker::{Checker, HttpChecker, TcpChecker};
use super::types::{ProbeErrorKind, ProbeResult};
use crate::database::models::{Monitor, MonitorType};

/// Probe executor - performs one network check per (monitor, region).
///
/// Expected network failures come back encoded in the `ProbeResult`;
/// this never returns an error for a target that is merely down.
pub struct ProbeExecutor {
    http_checker: HttpChecker,
    tcp_checker: TcpChecker,
}

impl ProbeExecutor {
    pub fn new(timeout_seconds: u64) -> Result<Self> {
        Ok(Self {
            http_checker: HttpChecker::new(timeout_seconds)?,
            tcp_checker: TcpChecker::new(timeout_seconds),
        })
    }

    pub async fn execute(&self, monitor: &Monitor, region: &str) -> ProbeResult {
        let result = ProbeResult::new(monitor.uuid, region);

        match monitor.monitor_type {
            MonitorType::Http => {
                let Some(http) = &monitor.http_config else {
                    return result.failed(
                        0,
                        ProbeErrorKind::Internal,
                        "http monitor has no http_config",
                    );
                };

                match self.http_checker.check(&http.url).await {
                    Ok((latency_ms, status_code)) => {
                        let code = status_code.unwrap_or_default();
                        if status_accepted(code, http.accepted_status_codes.as_deref()) {
                            result.succeeded(latency_ms, status_code)
                        } else {
                            result
                                .failed(
                                    latency_ms,
                                    ProbeErrorKind::HttpStatus,
                                    format!("unexpected HTTP status {code}"),
                                )
                                .with_status(code)
                        }
                    }
                    Err(e) => result.failed(e.latency_ms, e.kind, e.message),
                }
            }
            MonitorType::Tcp => {
                let Some(tcp) = &monitor.tcp_config else {
                    return result.failed(
                        0,
                        ProbeErrorKind::Internal,
                        "tcp monitor has no tcp_config",
                    );
                };

                let target = format!("{}:{}", tcp.host, tcp.port);
                match self.tcp_checker.check(&target).await {
                    Ok((latency_ms, _)) => result.succeeded(latency_ms, None),
                    Err(e) => result.failed(e.latency_ms, e.kind, e.message),
                }
            }
        }
    }
}

/// Default predicate accepts any 2xx/3xx; monitors may pin an explicit
/// allow-list instead.
fn status_accepted(code: u16, accepted: Option<&[u16]>) -> bool {
    match accepted {
        Some(codes) => codes.contains(&code),
        None => (200..400).contains(&code),
    }
}
