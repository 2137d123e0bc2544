use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::time::timeout;

use super::types::ProbeErrorKind;

/// Transport-level failure of a check attempt.
///
/// Latency is captured even when the attempt fails so slow failures are
/// distinguishable from fast ones in history.
#[derive(Debug, Clone)]
pub struct CheckError {
    pub kind: ProbeErrorKind,
    pub message: String,
    pub latency_ms: u64,
}

/// Checker trait for the supported probe transports.
///
/// `Ok` means the attempt reached the target and carries latency plus the
/// HTTP status code when there is one; whether the response counts as
/// "up" is the executor's call.
#[async_trait::async_trait]
pub trait Checker: Send + Sync {
    async fn check(&self, target: &str) -> Result<(u64, Option<u16>), CheckError>;
}

/// HTTP/HTTPS checker
pub struct HttpChecker {
    client: reqwest::Client,
}

impl HttpChecker {
    pub fn new(timeout_seconds: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl Checker for HttpChecker {
    async fn check(&self, target: &str) -> Result<(u64, Option<u16>), CheckError> {
        let start = Instant::now();

        match self.client.get(target).send().await {
            Ok(response) => {
                let latency = start.elapsed().as_millis() as u64;
                Ok((latency, Some(response.status().as_u16())))
            }
            Err(e) => {
                let latency = start.elapsed().as_millis() as u64;
                Err(CheckError {
                    kind: classify_reqwest_error(&e),
                    message: e.to_string(),
                    latency_ms: latency,
                })
            }
        }
    }
}

/// Map a reqwest transport error onto the probe failure taxonomy.
fn classify_reqwest_error(e: &reqwest::Error) -> ProbeErrorKind {
    if e.is_timeout() {
        return ProbeErrorKind::Timeout;
    }

    // reqwest does not expose the cause precisely; sniff the source chain.
    let mut message = e.to_string().to_lowercase();
    let mut source = std::error::Error::source(e);
    while let Some(cause) = source {
        message.push(' ');
        message.push_str(&cause.to_string().to_lowercase());
        source = cause.source();
    }

    if message.contains("dns") || message.contains("resolve") {
        ProbeErrorKind::Dns
    } else if message.contains("certificate") || message.contains("tls") || message.contains("ssl") {
        ProbeErrorKind::Tls
    } else if message.contains("connection refused") {
        ProbeErrorKind::ConnectionRefused
    } else {
        ProbeErrorKind::Connection
    }
}

/// TCP port checker
pub struct TcpChecker {
    timeout_duration: Duration,
}

impl TcpChecker {
    pub fn new(timeout_seconds: u64) -> Self {
        Self { timeout_duration: Duration::from_secs(timeout_seconds) }
    }
}

#[async_trait::async_trait]
impl Checker for TcpChecker {
    async fn check(&self, target: &str) -> Result<(u64, Option<u16>), CheckError> {
        let start = Instant::now();

        let connect = tokio::net::TcpStream::connect(target);

        match timeout(self.timeout_duration, connect).await {
            Err(_) => Err(CheckError {
                kind: ProbeErrorKind::Timeout,
                message: format!("connection to {target} timed out"),
                latency_ms: start.elapsed().as_millis() as u64,
            }),
            Ok(Err(e)) => Err(CheckError {
                kind: classify_io_error(&e),
                message: format!("connection to {target} failed: {e}"),
                latency_ms: start.elapsed().as_millis() as u64,
            }),
            Ok(Ok(_stream)) => Ok((start.elapsed().as_millis() as u64, None)),
        }
    }
}

fn classify_io_error(e: &std::io::Error) -> ProbeErrorKind {
    match e.kind() {
        std::io::ErrorKind::ConnectionRefused => ProbeErrorKind::ConnectionRefused,
        std::io::ErrorKind::TimedOut => ProbeErrorKind::Timeout,
        // getaddrinfo failures surface as generic errors with no kind
        _ if e.to_string().to_lowercase().contains("resolve") => ProbeErrorKind::Dns,
        _ => ProbeErrorKind::Connection,
    }
}
