use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::{extract::State, http::StatusCode, response::IntoResponse};
use dashmap::DashMap;

use epp_common::EndpointId;
use epp_scheduler::PoolRegistry;

use crate::session::SessionOutcome;
use crate::state::AppState;

/// Upper bounds (seconds) of the decision latency histogram.
const LATENCY_BUCKETS: [f64; 8] = [0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0];

#[derive(Debug, Default)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; LATENCY_BUCKETS.len()],
    count: AtomicU64,
    sum_micros: AtomicU64,
}

impl LatencyHistogram {
    pub fn observe(&self, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        if let Some(i) = LATENCY_BUCKETS.iter().position(|b| secs <= *b) {
            self.buckets[i].fetch_add(1, Ordering::Relaxed);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    fn render(&self, name: &str, help: &str, out: &mut String) {
        let _ = write!(out, "# HELP {name} {help}\n# TYPE {name} histogram\n");
        let mut cumulative = 0u64;
        for (bound, bucket) in LATENCY_BUCKETS.iter().zip(self.buckets.iter()) {
            cumulative += bucket.load(Ordering::Relaxed);
            let _ = writeln!(out, "{name}_bucket{{le=\"{bound}\"}} {cumulative}");
        }
        let count = self.count.load(Ordering::Relaxed);
        let sum = self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        let _ = write!(
            out,
            "{name}_bucket{{le=\"+Inf\"}} {count}\n{name}_sum {sum}\n{name}_count {count}\n"
        );
    }
}

#[derive(Debug, Default)]
pub struct Metrics {
    pub sessions_total: AtomicU64,
    pub sessions_inflight: AtomicU64,
    pub routed_total: AtomicU64,
    pub routed_disaggregated_total: AtomicU64,
    pub routed_fallback_total: AtomicU64,
    pub routed_saturated_total: AtomicU64,
    pub rejected_no_capacity_total: AtomicU64,
    pub rejected_unknown_pool_total: AtomicU64,
    pub rejected_body_too_large_total: AtomicU64,
    pub cancelled_total: AtomicU64,
    pub timed_out_total: AtomicU64,
    pub protocol_errors_total: AtomicU64,
    pub approximate_classifications_total: AtomicU64,
    pub scrape_errors_total: AtomicU64,
    pub endpoints_expired_total: AtomicU64,
    pub decision_latency: LatencyHistogram,
    pub routed_by_endpoint: DashMap<EndpointId, u64>,
}

/// Keeps `sessions_inflight` accurate even when a session task is aborted.
pub struct InflightGuard<'a> {
    metrics: &'a Metrics,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.metrics.sessions_inflight.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Metrics {
    pub fn session_started(&self) -> InflightGuard<'_> {
        self.sessions_total.fetch_add(1, Ordering::Relaxed);
        self.sessions_inflight.fetch_add(1, Ordering::Relaxed);
        InflightGuard { metrics: self }
    }

    pub fn session_finished(&self, outcome: &SessionOutcome) {
        let counter = match outcome {
            SessionOutcome::Routed { .. } => return,
            SessionOutcome::NoCapacity => &self.rejected_no_capacity_total,
            SessionOutcome::UnknownPool => &self.rejected_unknown_pool_total,
            SessionOutcome::BodyTooLarge => &self.rejected_body_too_large_total,
            SessionOutcome::Cancelled => &self.cancelled_total,
            SessionOutcome::TimedOut => &self.timed_out_total,
            SessionOutcome::ProtocolError => &self.protocol_errors_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_routed(
        &self,
        endpoint: &EndpointId,
        disaggregated: bool,
        fallback: bool,
        saturated: bool,
        latency: Duration,
    ) {
        self.routed_total.fetch_add(1, Ordering::Relaxed);
        if disaggregated {
            self.routed_disaggregated_total
                .fetch_add(1, Ordering::Relaxed);
        }
        if fallback {
            self.routed_fallback_total.fetch_add(1, Ordering::Relaxed);
        }
        if saturated {
            self.routed_saturated_total.fetch_add(1, Ordering::Relaxed);
        }
        self.decision_latency.observe(latency);
        *self
            .routed_by_endpoint
            .entry(endpoint.clone())
            .or_insert(0) += 1;
    }
}

fn counter(out: &mut String, name: &str, help: &str, value: &AtomicU64) {
    let _ = write!(
        out,
        "# HELP {name} {help}\n# TYPE {name} counter\n{name} {}\n",
        value.load(Ordering::Relaxed)
    );
}

pub fn render_metrics(metrics: &Metrics, registry: &PoolRegistry) -> String {
    let mut body = String::new();

    counter(
        &mut body,
        "epp_sessions_total",
        "Processing sessions opened by the proxy.",
        &metrics.sessions_total,
    );
    let _ = write!(
        body,
        "# HELP epp_sessions_inflight Processing sessions currently open.\n\
         # TYPE epp_sessions_inflight gauge\n\
         epp_sessions_inflight {}\n",
        metrics.sessions_inflight.load(Ordering::Relaxed)
    );
    counter(
        &mut body,
        "epp_routed_total",
        "Requests routed to an endpoint.",
        &metrics.routed_total,
    );
    counter(
        &mut body,
        "epp_routed_disaggregated_total",
        "Requests routed to a prefill endpoint for split serving.",
        &metrics.routed_disaggregated_total,
    );
    counter(
        &mut body,
        "epp_routed_fallback_total",
        "Requests routed outside their preferred role.",
        &metrics.routed_fallback_total,
    );
    counter(
        &mut body,
        "epp_routed_saturated_total",
        "Requests routed to an endpoint at or past the saturation load.",
        &metrics.routed_saturated_total,
    );
    counter(
        &mut body,
        "epp_rejected_no_capacity_total",
        "Retryable rejections because no endpoint was available.",
        &metrics.rejected_no_capacity_total,
    );
    counter(
        &mut body,
        "epp_rejected_unknown_pool_total",
        "Fatal rejections because the pool is unknown.",
        &metrics.rejected_unknown_pool_total,
    );
    counter(
        &mut body,
        "epp_rejected_body_too_large_total",
        "Fatal rejections because the request body exceeded the limit.",
        &metrics.rejected_body_too_large_total,
    );
    counter(
        &mut body,
        "epp_cancelled_total",
        "Sessions closed by the proxy before a decision.",
        &metrics.cancelled_total,
    );
    counter(
        &mut body,
        "epp_timed_out_total",
        "Sessions that exhausted their time budget.",
        &metrics.timed_out_total,
    );
    counter(
        &mut body,
        "epp_protocol_errors_total",
        "Sessions closed on a protocol error.",
        &metrics.protocol_errors_total,
    );
    counter(
        &mut body,
        "epp_approximate_classifications_total",
        "Requests whose prompt length came from the byte heuristic.",
        &metrics.approximate_classifications_total,
    );
    counter(
        &mut body,
        "epp_scrape_errors_total",
        "Failed endpoint metric scrapes.",
        &metrics.scrape_errors_total,
    );
    counter(
        &mut body,
        "epp_endpoints_expired_total",
        "Endpoints removed after not being seen within the TTL.",
        &metrics.endpoints_expired_total,
    );
    metrics.decision_latency.render(
        "epp_decision_latency_seconds",
        "Time from request headers to routing decision.",
        &mut body,
    );

    body.push_str("# HELP epp_endpoint_routed_total Requests routed per endpoint.\n");
    body.push_str("# TYPE epp_endpoint_routed_total counter\n");
    let mut routed: Vec<(String, u64)> = metrics
        .routed_by_endpoint
        .iter()
        .map(|e| (e.key().to_string(), *e.value()))
        .collect();
    routed.sort();
    for (endpoint, n) in routed {
        let _ = writeln!(body, "epp_endpoint_routed_total{{endpoint=\"{endpoint}\"}} {n}");
    }

    body.push_str("# HELP epp_endpoint_load Effective load per endpoint, reservations included.\n");
    body.push_str("# TYPE epp_endpoint_load gauge\n");
    let snapshots: Vec<_> = registry
        .pool_names()
        .into_iter()
        .filter_map(|pool| registry.snapshot(&pool).ok())
        .collect();
    for snap in &snapshots {
        for ep in &snap.endpoints {
            let _ = writeln!(
                body,
                "epp_endpoint_load{{pool=\"{}\",endpoint=\"{}\",role=\"{}\"}} {}",
                snap.pool,
                ep.id,
                ep.role,
                ep.load()
            );
        }
    }
    body.push_str("# HELP epp_endpoint_reserved Speculative reservations per endpoint.\n");
    body.push_str("# TYPE epp_endpoint_reserved gauge\n");
    for snap in &snapshots {
        for ep in &snap.endpoints {
            let _ = writeln!(
                body,
                "epp_endpoint_reserved{{pool=\"{}\",endpoint=\"{}\"}} {}",
                snap.pool, ep.id, ep.reserved
            );
        }
    }
    body.push_str("# HELP epp_endpoint_healthy Whether the endpoint is healthy (1) or not (0).\n");
    body.push_str("# TYPE epp_endpoint_healthy gauge\n");
    for snap in &snapshots {
        for ep in &snap.endpoints {
            let _ = writeln!(
                body,
                "epp_endpoint_healthy{{pool=\"{}\",endpoint=\"{}\"}} {}",
                snap.pool,
                ep.id,
                u8::from(ep.healthy)
            );
        }
    }

    body
}

/// GET /metrics: Prometheus text exposition format.
pub async fn metrics_handler(State(st): State<AppState>) -> impl IntoResponse {
    let body = render_metrics(&st.metrics, st.scheduler.registry());
    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// GET /healthz: liveness.
pub async fn healthz_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// GET /readyz: same signal the gRPC health service reports.
pub async fn readyz_handler(State(st): State<AppState>) -> impl IntoResponse {
    if st.readiness.is_ready(st.scheduler.registry(), &st.pool_name) {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}
