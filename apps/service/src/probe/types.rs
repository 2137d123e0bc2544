use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

/// Category of an expected probe failure.
///
/// These are normal outcomes of checking unreliable endpoints and are
/// carried on the result, never raised as errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeErrorKind {
    Timeout,
    Dns,
    Tls,
    ConnectionRefused,
    Connection,
    HttpStatus,
    /// Misconfiguration or an engine-side fault; surfaces as repeated
    /// down incidents with this diagnostic kind rather than a silent gap.
    Internal,
}

impl ProbeErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeErrorKind::Timeout => "timeout",
            ProbeErrorKind::Dns => "dns",
            ProbeErrorKind::Tls => "tls",
            ProbeErrorKind::ConnectionRefused => "connection_refused",
            ProbeErrorKind::Connection => "connection",
            ProbeErrorKind::HttpStatus => "http_status",
            ProbeErrorKind::Internal => "internal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "timeout" => Some(ProbeErrorKind::Timeout),
            "dns" => Some(ProbeErrorKind::Dns),
            "tls" => Some(ProbeErrorKind::Tls),
            "connection_refused" => Some(ProbeErrorKind::ConnectionRefused),
            "connection" => Some(ProbeErrorKind::Connection),
            "http_status" => Some(ProbeErrorKind::HttpStatus),
            "internal" => Some(ProbeErrorKind::Internal),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProbeErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a single reachability check from one region.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub monitor_uuid: Uuid,
    pub region: String,
    pub timestamp: SystemTime,
    pub success: bool,
    /// Wall-clock duration of the attempt, recorded for failures too.
    pub latency_ms: u64,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    pub error_kind: Option<ProbeErrorKind>,
}

impl ProbeResult {
    pub fn new(monitor_uuid: Uuid, region: impl Into<String>) -> Self {
        Self {
            monitor_uuid,
            region: region.into(),
            timestamp: SystemTime::now(),
            success: false,
            latency_ms: 0,
            status_code: None,
            error: None,
            error_kind: None,
        }
    }

    pub fn succeeded(mut self, latency_ms: u64, status_code: Option<u16>) -> Self {
        self.success = true;
        self.latency_ms = latency_ms;
        self.status_code = status_code;
        self
    }

    pub fn failed(mut self, latency_ms: u64, kind: ProbeErrorKind, message: impl Into<String>) -> Self {
        self.success = false;
        self.latency_ms = latency_ms;
        self.error = Some(message.into());
        self.error_kind = Some(kind);
        self
    }

    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }
}
