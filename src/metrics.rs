//! Prometheus-compatible metrics for interest management
//!
//! Exposes matching-pass and throttle metrics in Prometheus format.
//! Default endpoint: http://localhost:9090/metrics

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info};

/// Samples kept for pass-time percentiles
const PASS_HISTORY_LEN: usize = 1000;

/// Metrics registry for one interest session
#[derive(Debug)]
pub struct InterestMetrics {
    // Registry sizes
    pub rules_live: AtomicU64,
    pub attributes_live: AtomicU64,
    pub replicas_tracked: AtomicU64,
    pub peers_with_rules: AtomicU64,

    // Pass output
    pub matched_pairs: AtomicU64,
    pub handlers_run: AtomicU64,
    pub handlers_reused: AtomicU64,
    pub handler_faults: AtomicU64,
    pub interest_joins: AtomicU64,
    pub interest_leaves: AtomicU64,
    pub commands_applied: AtomicU64,
    pub commands_rejected: AtomicU64,

    // Pass timing (microseconds)
    pub pass_time_us: AtomicU64,
    pub pass_time_p95_us: AtomicU64,
    pub pass_time_p99_us: AtomicU64,
    pub pass_time_max_us: AtomicU64,
    pub pass_count: AtomicU64,

    // Throttle decisions
    pub values_sent: AtomicU64,
    pub values_suppressed: AtomicU64,

    start_time: Instant,

    // Rolling pass times for percentile calculation
    pass_history: RwLock<VecDeque<u64>>,
}

impl InterestMetrics {
    pub fn new() -> Self {
        Self {
            rules_live: AtomicU64::new(0),
            attributes_live: AtomicU64::new(0),
            replicas_tracked: AtomicU64::new(0),
            peers_with_rules: AtomicU64::new(0),
            matched_pairs: AtomicU64::new(0),
            handlers_run: AtomicU64::new(0),
            handlers_reused: AtomicU64::new(0),
            handler_faults: AtomicU64::new(0),
            interest_joins: AtomicU64::new(0),
            interest_leaves: AtomicU64::new(0),
            commands_applied: AtomicU64::new(0),
            commands_rejected: AtomicU64::new(0),
            pass_time_us: AtomicU64::new(0),
            pass_time_p95_us: AtomicU64::new(0),
            pass_time_p99_us: AtomicU64::new(0),
            pass_time_max_us: AtomicU64::new(0),
            pass_count: AtomicU64::new(0),
            values_sent: AtomicU64::new(0),
            values_suppressed: AtomicU64::new(0),
            start_time: Instant::now(),
            pass_history: RwLock::new(VecDeque::with_capacity(PASS_HISTORY_LEN)),
        }
    }

    /// Record a pass time and update percentiles
    pub fn record_pass_time(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.pass_time_us.store(us, Ordering::Relaxed);
        self.pass_count.fetch_add(1, Ordering::Relaxed);

        let mut history = self.pass_history.write();
        history.push_back(us);
        while history.len() > PASS_HISTORY_LEN {
            history.pop_front();
        }

        if history.len() >= 10 {
            let mut sorted: Vec<u64> = history.iter().copied().collect();
            sorted.sort_unstable();

            let p95_idx = (sorted.len() as f32 * 0.95) as usize;
            let p99_idx = (sorted.len() as f32 * 0.99) as usize;

            self.pass_time_p95_us.store(sorted[p95_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.pass_time_p99_us.store(sorted[p99_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.pass_time_max_us.store(sorted.last().copied().unwrap_or(0), Ordering::Relaxed);
        }
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-format metrics output
    pub fn to_prometheus(&self) -> String {
        let mut output = String::with_capacity(4096);

        macro_rules! metric {
            ($name:expr, $help:expr, $type:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $name, $help, $name, $type, $name, $value
                ));
            };
        }

        // Registry
        metric!("replica_interest_rules", "Live interest rules", "gauge",
            self.rules_live.load(Ordering::Relaxed));
        metric!("replica_interest_attributes", "Live interest attributes", "gauge",
            self.attributes_live.load(Ordering::Relaxed));
        metric!("replica_interest_replicas", "Replicas tracked by the last pass", "gauge",
            self.replicas_tracked.load(Ordering::Relaxed));
        metric!("replica_interest_peers", "Peers with at least one rule", "gauge",
            self.peers_with_rules.load(Ordering::Relaxed));

        // Pass output
        metric!("replica_interest_matched_pairs", "Replica/peer pairs in the last pass", "gauge",
            self.matched_pairs.load(Ordering::Relaxed));
        metric!("replica_interest_handlers_run_total", "Handler runs", "counter",
            self.handlers_run.load(Ordering::Relaxed));
        metric!("replica_interest_handlers_reused_total", "Clean handler slots served from cache", "counter",
            self.handlers_reused.load(Ordering::Relaxed));
        metric!("replica_interest_handler_faults_total", "Handler runs that faulted", "counter",
            self.handler_faults.load(Ordering::Relaxed));
        metric!("replica_interest_joins_total", "Peers that gained interest in a replica", "counter",
            self.interest_joins.load(Ordering::Relaxed));
        metric!("replica_interest_leaves_total", "Peers that lost interest in a replica", "counter",
            self.interest_leaves.load(Ordering::Relaxed));
        metric!("replica_interest_commands_applied_total", "Queued commands applied", "counter",
            self.commands_applied.load(Ordering::Relaxed));
        metric!("replica_interest_commands_rejected_total", "Queued commands rejected", "counter",
            self.commands_rejected.load(Ordering::Relaxed));

        // Timing
        metric!("replica_interest_pass_time_microseconds", "Last matching pass time", "gauge",
            self.pass_time_us.load(Ordering::Relaxed));
        metric!("replica_interest_pass_time_p95_microseconds", "95th percentile pass time", "gauge",
            self.pass_time_p95_us.load(Ordering::Relaxed));
        metric!("replica_interest_pass_time_p99_microseconds", "99th percentile pass time", "gauge",
            self.pass_time_p99_us.load(Ordering::Relaxed));
        metric!("replica_interest_pass_time_max_microseconds", "Maximum pass time", "gauge",
            self.pass_time_max_us.load(Ordering::Relaxed));
        metric!("replica_interest_pass_count", "Matching passes run", "counter",
            self.pass_count.load(Ordering::Relaxed));

        // Throttles
        metric!("replica_interest_values_sent_total", "Attribute values sent", "counter",
            self.values_sent.load(Ordering::Relaxed));
        metric!("replica_interest_values_suppressed_total", "Attribute values suppressed by throttles", "counter",
            self.values_suppressed.load(Ordering::Relaxed));

        metric!("replica_interest_uptime_seconds", "Uptime in seconds", "counter",
            self.uptime_seconds());

        output
    }

    /// Generate JSON format metrics (alternative for direct API access)
    pub fn to_json(&self) -> String {
        let load = |v: &AtomicU64| v.load(Ordering::Relaxed);
        serde_json::json!({
            "registry": {
                "rules": load(&self.rules_live),
                "attributes": load(&self.attributes_live),
                "replicas": load(&self.replicas_tracked),
                "peers": load(&self.peers_with_rules),
            },
            "pass": {
                "count": load(&self.pass_count),
                "matched_pairs": load(&self.matched_pairs),
                "handlers_run": load(&self.handlers_run),
                "handlers_reused": load(&self.handlers_reused),
                "handler_faults": load(&self.handler_faults),
                "joins": load(&self.interest_joins),
                "leaves": load(&self.interest_leaves),
                "time_us": load(&self.pass_time_us),
                "time_p95_us": load(&self.pass_time_p95_us),
                "time_p99_us": load(&self.pass_time_p99_us),
                "time_max_us": load(&self.pass_time_max_us),
            },
            "commands": {
                "applied": load(&self.commands_applied),
                "rejected": load(&self.commands_rejected),
            },
            "throttle": {
                "sent": load(&self.values_sent),
                "suppressed": load(&self.values_suppressed),
            },
            "uptime_seconds": self.uptime_seconds(),
        })
        .to_string()
    }
}

impl Default for InterestMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(metrics: Arc<InterestMetrics>, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        let (mut socket, peer) = listener.accept().await?;
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 1024];

            match socket.read(&mut buffer).await {
                Ok(n) if n > 0 => {
                    let request = String::from_utf8_lossy(&buffer[..n]);

                    let response = if request.starts_with("GET /metrics/json") || request.starts_with("GET /json") {
                        let body = metrics.to_json();
                        format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            body.len(),
                            body
                        )
                    } else if request.starts_with("GET /metrics") {
                        let body = metrics.to_prometheus();
                        format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            body.len(),
                            body
                        )
                    } else if request.starts_with("GET /health") || request.starts_with("GET / ") {
                        let body = "OK";
                        format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            body.len(),
                            body
                        )
                    } else {
                        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string()
                    };

                    if let Err(e) = socket.write_all(response.as_bytes()).await {
                        debug!("Failed to write metrics response to {}: {}", peer, e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Failed to read from metrics socket {}: {}", peer, e);
                }
            }
        });
    }
}
