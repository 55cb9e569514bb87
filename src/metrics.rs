//! Prometheus counters for the directory (RED: Rate, Errors, Duration) and the
//! small HTTP endpoint serving them together with liveness and readiness.

use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::ldap_protocol::ResultCode;

/// Upper bounds of the duration histogram buckets, in seconds. +Inf is the count.
const DURATION_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Operations with their own request, error and duration series.
const OPERATIONS: [&str; 8] = [
    "bind", "search", "add", "modify", "delete", "modify_dn", "compare", "extended",
];

/// Buckets are stored non-cumulatively and summed up when rendering.
#[derive(Debug, Default)]
struct DurationHistogram {
    buckets: [AtomicU64; 11],
    count: AtomicU64,
    sum_micros: AtomicU64,
}

impl DurationHistogram {
    fn observe(&self, duration: Duration) {
        let micros = duration.as_micros().min(u64::MAX as u128) as u64;
        let secs = duration.as_secs_f64();
        if let Some(i) = DURATION_BUCKETS.iter().position(|&le| secs <= le) {
            self.buckets[i].fetch_add(1, Ordering::Relaxed);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
struct OperationCounters {
    requests: AtomicU64,
    errors: AtomicU64,
    duration: DurationHistogram,
}

#[derive(Debug)]
pub struct Metrics {
    /// Client connections accepted since start.
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    /// Undecodable PDUs; each one closes its connection.
    pub parse_errors: AtomicU64,
    operations: [OperationCounters; 8],
    /// Responses by LDAP result code name.
    results: DashMap<&'static str, AtomicU64>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
            operations: Default::default(),
            results: DashMap::new(),
        }
    }
}

/// Codes that report an outcome rather than a failure.
fn is_error(code: ResultCode) -> bool {
    !matches!(
        code,
        ResultCode::Success | ResultCode::CompareTrue | ResultCode::CompareFalse
    )
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn operation(&self, op: &str) -> Option<&OperationCounters> {
        OPERATIONS
            .iter()
            .position(|name| *name == op)
            .map(|i| &self.operations[i])
    }

    #[inline]
    pub fn connection_opened(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a dispatched request. Unknown names (unbind, abandon) are ignored.
    #[inline]
    pub fn inc_request(&self, op: &str) {
        if let Some(counters) = self.operation(op) {
            counters.requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn observe_duration(&self, op: &str, duration: Duration) {
        if let Some(counters) = self.operation(op) {
            counters.duration.observe(duration);
        }
    }

    /// Records the result code of a final response.
    pub fn record_result(&self, op: &str, code: ResultCode) {
        self.results
            .entry(code.name())
            .or_insert_with(AtomicU64::default)
            .fetch_add(1, Ordering::Relaxed);
        if is_error(code) {
            if let Some(counters) = self.operation(op) {
                counters.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("# HELP ldap_directory_connections_total Total number of client connections accepted.\n");
        out.push_str("# TYPE ldap_directory_connections_total counter\n");
        out.push_str(&format!(
            "ldap_directory_connections_total {}\n",
            self.connections_total.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP ldap_directory_connections_active Client connections currently open.\n");
        out.push_str("# TYPE ldap_directory_connections_active gauge\n");
        out.push_str(&format!(
            "ldap_directory_connections_active {}\n",
            self.connections_active.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP ldap_directory_parse_errors_total Total number of undecodable LDAP messages.\n");
        out.push_str("# TYPE ldap_directory_parse_errors_total counter\n");
        out.push_str(&format!(
            "ldap_directory_parse_errors_total {}\n",
            self.parse_errors.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP ldap_directory_requests_total Total LDAP requests by operation.\n");
        out.push_str("# TYPE ldap_directory_requests_total counter\n");
        for (op, counters) in OPERATIONS.iter().zip(&self.operations) {
            out.push_str(&format!(
                "ldap_directory_requests_total{{op=\"{}\"}} {}\n",
                op,
                counters.requests.load(Ordering::Relaxed)
            ));
        }

        out.push_str("# HELP ldap_directory_errors_total Total failed LDAP requests by operation.\n");
        out.push_str("# TYPE ldap_directory_errors_total counter\n");
        for (op, counters) in OPERATIONS.iter().zip(&self.operations) {
            out.push_str(&format!(
                "ldap_directory_errors_total{{op=\"{}\"}} {}\n",
                op,
                counters.errors.load(Ordering::Relaxed)
            ));
        }

        out.push_str("# HELP ldap_directory_results_total Final responses by LDAP result code.\n");
        out.push_str("# TYPE ldap_directory_results_total counter\n");
        let mut results: Vec<(&'static str, u64)> = self
            .results
            .iter()
            .map(|entry| (*entry.key(), entry.value().load(Ordering::Relaxed)))
            .collect();
        results.sort_unstable();
        for (code, count) in results {
            out.push_str(&format!(
                "ldap_directory_results_total{{code=\"{}\"}} {}\n",
                code, count
            ));
        }

        out.push_str("# HELP ldap_directory_request_duration_seconds Request duration in seconds by operation.\n");
        out.push_str("# TYPE ldap_directory_request_duration_seconds histogram\n");
        for (op, counters) in OPERATIONS.iter().zip(&self.operations) {
            let hist = &counters.duration;
            let count = hist.count.load(Ordering::Relaxed);
            let mut cum = 0u64;
            for (i, &le) in DURATION_BUCKETS.iter().enumerate() {
                cum += hist.buckets[i].load(Ordering::Relaxed);
                out.push_str(&format!(
                    "ldap_directory_request_duration_seconds_bucket{{op=\"{}\",le=\"{}\"}} {}\n",
                    op, le, cum
                ));
            }
            out.push_str(&format!(
                "ldap_directory_request_duration_seconds_bucket{{op=\"{}\",le=\"+Inf\"}} {}\n",
                op, count
            ));
            let sum_secs = hist.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
            out.push_str(&format!(
                "ldap_directory_request_duration_seconds_sum{{op=\"{}\"}} {}\n",
                op, sum_secs
            ));
            out.push_str(&format!(
                "ldap_directory_request_duration_seconds_count{{op=\"{}\"}} {}\n",
                op, count
            ));
        }

        out
    }
}

/// Body of GET /ready.
#[derive(Serialize)]
struct ReadyBody {
    ready: bool,
}

/// Path of the first HTTP request line ("GET /health HTTP/1.1" -> "/health").
fn request_path(first_line: &str) -> &str {
    let mut parts = first_line.trim().split_ascii_whitespace();
    let _method = parts.next();
    let path = parts.next().unwrap_or("");
    if path.starts_with('/') {
        path
    } else {
        ""
    }
}

pub type ReadyCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Serves GET /metrics, GET /health (always 200) and GET /ready (200 once
/// `ready` holds, 503 before) on `addr`.
pub async fn run_metrics_server(addr: &str, metrics: Arc<Metrics>, ready: ReadyCheck) -> Result<()> {
    let socket_addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("Invalid metrics listen address: {}", addr))?;
    let listener = TcpListener::bind(&socket_addr)
        .await
        .with_context(|| format!("Failed to bind metrics server to {}", socket_addr))?;
    info!("Metrics server listening on http://{} (GET /metrics, /health, /ready)", socket_addr);
    serve_metrics(listener, metrics, ready).await
}

pub async fn serve_metrics(listener: TcpListener, metrics: Arc<Metrics>, ready: ReadyCheck) -> Result<()> {
    loop {
        let (mut stream, _peer) = match listener.accept().await {
            Ok(accept) => accept,
            Err(e) => {
                error!("Metrics accept error: {}", e);
                continue;
            }
        };

        let metrics = Arc::clone(&metrics);
        let ready = Arc::clone(&ready);

        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            let mut total = 0usize;
            loop {
                match stream.read(&mut buf[total..]).await {
                    Ok(0) => break,
                    Ok(n) => {
                        total += n;
                        if buf[..total].windows(4).any(|w| w == b"\r\n\r\n") || total >= buf.len() {
                            break;
                        }
                    }
                    Err(_) => return,
                }
            }

            let request = String::from_utf8_lossy(&buf[..total]);
            let path = request.lines().next().map(request_path).unwrap_or("");

            let (status, body, content_type) = match path {
                "/health" => ("200 OK", "ok".to_string(), "text/plain; charset=utf-8"),
                "/ready" => {
                    let ready = ready();
                    let body = serde_json::to_string(&ReadyBody { ready })
                        .unwrap_or_else(|_| r#"{"ready":false}"#.to_string());
                    let status = if ready { "200 OK" } else { "503 Service Unavailable" };
                    (status, body, "application/json")
                }
                "/metrics" => ("200 OK", metrics.render(), "text/plain; charset=utf-8"),
                _ => (
                    "404 Not Found",
                    "Not found. Supported: GET /metrics, GET /health, GET /ready.\n".to_string(),
                    "text/plain; charset=utf-8",
                ),
            };
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: {}\r\nConnection: close\r\nContent-Length: {}\r\n\r\n{}",
                status,
                content_type,
                body.len(),
                body
            );

            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        });
    }
}
