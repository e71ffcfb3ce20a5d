//! Metrics Collection for l7proxify
//!
//! Provides atomic counters, a handshake latency histogram, and a
//! Prometheus-compatible /metrics endpoint.

use axum::{extract::State, routing::get, Router};
use l7proxify_shared::ErrorCategory;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::policy::RuleAction;

/// Proxy-wide metrics
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    sessions_total: AtomicU64,
    sessions_active: AtomicU64,
    /// Sessions that reached the relay phase
    sessions_relayed: AtomicU64,
    /// Rule decisions
    rule_allow: AtomicU64,
    rule_deny: AtomicU64,
    rule_none: AtomicU64,
    /// Failures by category
    failed_framing: AtomicU64,
    failed_protocol: AtomicU64,
    failed_policy: AtomicU64,
    failed_transport: AtomicU64,
    /// Relayed bytes
    bytes_to_backend: AtomicU64,
    bytes_from_backend: AtomicU64,
    /// Accept-to-relay latency
    handshake_latency: Mutex<LatencyHistogram>,
}

/// Latency histogram for percentile calculation
struct LatencyHistogram {
    /// Recent latencies (ring buffer, microseconds)
    values: Vec<u64>,
    pos: usize,
    count: u64,
    sum: u64,
}

impl LatencyHistogram {
    fn new(capacity: usize) -> Self {
        Self {
            values: vec![0; capacity],
            pos: 0,
            count: 0,
            sum: 0,
        }
    }

    fn record(&mut self, latency_us: u64) {
        self.values[self.pos] = latency_us;
        self.pos = (self.pos + 1) % self.values.len();
        self.count += 1;
        self.sum += latency_us;
    }

    fn percentile(&self, p: f64) -> u64 {
        let count = self.count.min(self.values.len() as u64) as usize;
        if count == 0 {
            return 0;
        }

        let mut sorted = self.values[..count].to_vec();
        sorted.sort_unstable();

        let idx = ((count as f64 * p / 100.0) as usize).min(count - 1);
        sorted[idx]
    }

    fn average(&self) -> u64 {
        if self.count == 0 { 0 } else { self.sum / self.count }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                sessions_total: AtomicU64::new(0),
                sessions_active: AtomicU64::new(0),
                sessions_relayed: AtomicU64::new(0),
                rule_allow: AtomicU64::new(0),
                rule_deny: AtomicU64::new(0),
                rule_none: AtomicU64::new(0),
                failed_framing: AtomicU64::new(0),
                failed_protocol: AtomicU64::new(0),
                failed_policy: AtomicU64::new(0),
                failed_transport: AtomicU64::new(0),
                bytes_to_backend: AtomicU64::new(0),
                bytes_from_backend: AtomicU64::new(0),
                handshake_latency: Mutex::new(LatencyHistogram::new(10000)),
            }),
        }
    }

    pub fn session_opened(&self) {
        self.inner.sessions_total.fetch_add(1, Ordering::Relaxed);
        self.inner.sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.inner.sessions_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record the rule decision for a session; `None` means no rule matched.
    pub fn record_decision(&self, action: Option<RuleAction>) {
        let counter = match action {
            Some(RuleAction::Allow) => &self.inner.rule_allow,
            Some(RuleAction::Deny) => &self.inner.rule_deny,
            None => &self.inner.rule_none,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self, category: ErrorCategory) {
        let counter = match category {
            ErrorCategory::Framing => &self.inner.failed_framing,
            ErrorCategory::Protocol => &self.inner.failed_protocol,
            ErrorCategory::Policy => &self.inner.failed_policy,
            // Configuration errors never reach a session.
            ErrorCategory::Transport | ErrorCategory::Configuration => &self.inner.failed_transport,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a session entering the relay phase after `latency_us` of handshake inspection.
    pub async fn record_relay_started(&self, latency_us: u64) {
        self.inner.sessions_relayed.fetch_add(1, Ordering::Relaxed);
        self.inner.handshake_latency.lock().await.record(latency_us);
    }

    pub fn record_bytes(&self, to_backend: u64, from_backend: u64) {
        self.inner.bytes_to_backend.fetch_add(to_backend, Ordering::Relaxed);
        self.inner.bytes_from_backend.fetch_add(from_backend, Ordering::Relaxed);
    }

    pub fn sessions_active(&self) -> u64 {
        self.inner.sessions_active.load(Ordering::Relaxed)
    }

    /// Generate Prometheus-format metrics text
    pub async fn to_prometheus(&self) -> String {
        let lat = self.inner.handshake_latency.lock().await;
        let p50 = lat.percentile(50.0);
        let p95 = lat.percentile(95.0);
        let p99 = lat.percentile(99.0);
        let avg = lat.average();
        drop(lat);

        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let m = &self.inner;

        format!(
r#"# HELP l7proxify_sessions_total Total number of accepted client connections
# TYPE l7proxify_sessions_total counter
l7proxify_sessions_total {}

# HELP l7proxify_sessions_active Number of sessions currently open
# TYPE l7proxify_sessions_active gauge
l7proxify_sessions_active {}

# HELP l7proxify_sessions_relayed_total Sessions that reached the relay phase
# TYPE l7proxify_sessions_relayed_total counter
l7proxify_sessions_relayed_total {}

# HELP l7proxify_rule_decisions_total Rule evaluations by outcome
# TYPE l7proxify_rule_decisions_total counter
l7proxify_rule_decisions_total{{action="allow"}} {}
l7proxify_rule_decisions_total{{action="deny"}} {}
l7proxify_rule_decisions_total{{action="none"}} {}

# HELP l7proxify_session_failures_total Failed sessions by error category
# TYPE l7proxify_session_failures_total counter
l7proxify_session_failures_total{{category="framing"}} {}
l7proxify_session_failures_total{{category="protocol"}} {}
l7proxify_session_failures_total{{category="policy"}} {}
l7proxify_session_failures_total{{category="transport"}} {}

# HELP l7proxify_bytes_total Total bytes relayed
# TYPE l7proxify_bytes_total counter
l7proxify_bytes_total{{direction="to_backend"}} {}
l7proxify_bytes_total{{direction="from_backend"}} {}

# HELP l7proxify_handshake_latency_us Accept-to-relay latency in microseconds
# TYPE l7proxify_handshake_latency_us summary
l7proxify_handshake_latency_us{{quantile="0.5"}} {}
l7proxify_handshake_latency_us{{quantile="0.95"}} {}
l7proxify_handshake_latency_us{{quantile="0.99"}} {}
l7proxify_handshake_latency_us_avg {}
"#,
            load(&m.sessions_total),
            load(&m.sessions_active),
            load(&m.sessions_relayed),
            load(&m.rule_allow),
            load(&m.rule_deny),
            load(&m.rule_none),
            load(&m.failed_framing),
            load(&m.failed_protocol),
            load(&m.failed_policy),
            load(&m.failed_transport),
            load(&m.bytes_to_backend),
            load(&m.bytes_from_backend),
            p50, p95, p99, avg,
        )
    }
}

/// Serve `/metrics` and `/health` until the listener fails.
pub async fn serve(addr: SocketAddr, metrics: Metrics) {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(|| async { "OK" }))
        .with_state(metrics);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            warn!("Failed to start metrics endpoint on {}: {}", addr, e);
            return;
        }
    };
    info!("Metrics endpoint: http://{}/metrics", addr);

    if let Err(e) = axum::serve(listener, app).await {
        warn!("Metrics server error: {}", e);
    }
}

async fn metrics_handler(State(metrics): State<Metrics>) -> String {
    metrics.to_prometheus().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_percentiles() {
        let mut h = LatencyHistogram::new(4);
        assert_eq!(h.percentile(50.0), 0);
        for v in [10, 20, 30, 40, 50] {
            h.record(v);
        }
        // Ring buffer of 4 keeps 50, 20, 30, 40.
        assert_eq!(h.percentile(0.0), 20);
        assert_eq!(h.percentile(99.0), 50);
        assert_eq!(h.average(), 30);
    }

    #[tokio::test]
    async fn test_prometheus_output() {
        let metrics = Metrics::new();
        metrics.session_opened();
        metrics.session_opened();
        metrics.session_closed();
        metrics.record_decision(Some(RuleAction::Allow));
        metrics.record_decision(None);
        metrics.record_failure(ErrorCategory::Policy);
        metrics.record_relay_started(1500).await;
        metrics.record_bytes(100, 2048);

        assert_eq!(metrics.sessions_active(), 1);

        let text = metrics.to_prometheus().await;
        assert!(text.contains("l7proxify_sessions_total 2"));
        assert!(text.contains("l7proxify_sessions_active 1"));
        assert!(text.contains("l7proxify_sessions_relayed_total 1"));
        assert!(text.contains(r#"l7proxify_rule_decisions_total{action="allow"} 1"#));
        assert!(text.contains(r#"l7proxify_rule_decisions_total{action="none"} 1"#));
        assert!(text.contains(r#"l7proxify_session_failures_total{category="policy"} 1"#));
        assert!(text.contains(r#"l7proxify_bytes_total{direction="from_backend"} 2048"#));
        assert!(text.contains("l7proxify_handshake_latency_us_avg 1500"));
    }
}
