//! Prometheus metrics for decision evaluation, the decision cache, policy
//! reloads, the source circuit breaker, and the HTTP surface.

use std::time::{Duration, Instant};

use axum::{
    extract::{MatchedPath, Request},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use tracing::{debug, error};

use crate::model::{Decision, Effect};

pub struct EngineMetricsRegistry {
    pub registry: Registry,

    /// Decisions by effect, resource type, action, and whether the answer
    /// came from the cache or a fresh evaluation.
    pub decisions_total: IntCounterVec,
    /// Fresh evaluation latency by effect.
    pub decision_duration: HistogramVec,
    /// Decision cache operations (get/put/clear by result).
    pub cache_operations_total: IntCounterVec,
    /// Policy reloads by result and trigger (api/refresh).
    pub policy_reload_total: IntCounterVec,
    /// Policies in the currently served set.
    pub active_policies: IntGauge,
    /// Circuit breaker state transitions.
    pub breaker_transitions_total: IntCounterVec,

    pub http_requests_total: IntCounterVec,
    pub http_request_duration: HistogramVec,
    pub http_requests_in_flight: IntGauge,
}

impl EngineMetricsRegistry {
    pub fn new() -> Self {
        let registry = Registry::new();

        let decisions_total = IntCounterVec::new(
            Opts::new("pdp_decisions_total", "Authorization decisions"),
            &["effect", "resource_type", "action", "source"],
        )
        .expect("Failed to create decisions_total metric");

        let decision_duration = HistogramVec::new(
            HistogramOpts::new(
                "pdp_decision_duration_seconds",
                "Duration of fresh policy evaluations in seconds",
            )
            .buckets(vec![
                0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05,
            ]),
            &["effect"],
        )
        .expect("Failed to create decision_duration metric");

        let cache_operations_total = IntCounterVec::new(
            Opts::new("pdp_cache_operations_total", "Decision cache operations"),
            &["operation", "result"],
        )
        .expect("Failed to create cache_operations_total metric");

        let policy_reload_total = IntCounterVec::new(
            Opts::new("pdp_policy_reload_total", "Policy reload operations"),
            &["result", "trigger"],
        )
        .expect("Failed to create policy_reload_total metric");

        let active_policies = IntGauge::new(
            "pdp_active_policies",
            "Number of policies in the served set",
        )
        .expect("Failed to create active_policies metric");

        let breaker_transitions_total = IntCounterVec::new(
            Opts::new(
                "pdp_source_breaker_transitions_total",
                "Policy source circuit breaker transitions",
            ),
            &["state"],
        )
        .expect("Failed to create breaker_transitions_total metric");

        let http_requests_total = IntCounterVec::new(
            Opts::new("pdp_http_requests_total", "Total HTTP requests"),
            &["method", "endpoint", "status_code"],
        )
        .expect("Failed to create http_requests_total metric");

        let http_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "pdp_http_request_duration_seconds",
                "HTTP request duration in seconds",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
            &["method", "endpoint"],
        )
        .expect("Failed to create http_request_duration metric");

        let http_requests_in_flight =
            IntGauge::new("pdp_http_requests_in_flight", "Concurrent HTTP requests")
                .expect("Failed to create http_requests_in_flight metric");

        for collector in [
            Box::new(decisions_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(decision_duration.clone()),
            Box::new(cache_operations_total.clone()),
            Box::new(policy_reload_total.clone()),
            Box::new(active_policies.clone()),
            Box::new(breaker_transitions_total.clone()),
            Box::new(http_requests_total.clone()),
            Box::new(http_request_duration.clone()),
            Box::new(http_requests_in_flight.clone()),
        ] {
            registry
                .register(collector)
                .expect("Failed to register metric");
        }

        Self {
            registry,
            decisions_total,
            decision_duration,
            cache_operations_total,
            policy_reload_total,
            active_policies,
            breaker_transitions_total,
            http_requests_total,
            http_request_duration,
            http_requests_in_flight,
        }
    }

    pub fn gather_metrics(&self) -> Result<String, Box<dyn std::error::Error>> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

impl Default for EngineMetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Global metrics registry instance.
pub static ENGINE_METRICS: Lazy<EngineMetricsRegistry> = Lazy::new(EngineMetricsRegistry::new);

pub struct EngineMetricsHelper;

impl EngineMetricsHelper {
    pub fn record_decision(decision: &Decision, resource_type: &str, action: &str, source: &str) {
        let effect = effect_label(decision.effect);
        ENGINE_METRICS
            .decisions_total
            .with_label_values(&[effect, resource_type, action, source])
            .inc();
    }

    pub fn record_decision_duration(decision: &Decision, duration: Duration) {
        ENGINE_METRICS
            .decision_duration
            .with_label_values(&[effect_label(decision.effect)])
            .observe(duration.as_secs_f64());
    }

    pub fn record_cache_operation(operation: &str, result: &str) {
        ENGINE_METRICS
            .cache_operations_total
            .with_label_values(&[operation, result])
            .inc();
    }

    pub fn record_reload(result: &str, trigger: &str) {
        ENGINE_METRICS
            .policy_reload_total
            .with_label_values(&[result, trigger])
            .inc();
    }

    pub fn set_active_policies(count: usize) {
        ENGINE_METRICS
            .active_policies
            .set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    pub fn record_breaker_transition(state: &str) {
        ENGINE_METRICS
            .breaker_transitions_total
            .with_label_values(&[state])
            .inc();
    }
}

fn effect_label(effect: Effect) -> &'static str {
    match effect {
        Effect::Permit => "PERMIT",
        Effect::Deny => "DENY",
    }
}

/// HTTP metrics middleware.
pub async fn engine_metrics_middleware(req: Request, next: Next) -> Response {
    let start_time = Instant::now();
    let method = req.method().clone();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map_or("unknown".to_string(), |p| normalize_path(p.as_str()));

    ENGINE_METRICS.http_requests_in_flight.inc();
    let response = next.run(req).await;
    ENGINE_METRICS.http_requests_in_flight.dec();

    let duration = start_time.elapsed();
    let status_code = response.status();

    ENGINE_METRICS
        .http_requests_total
        .with_label_values(&[method.as_str(), &path, &status_code.as_u16().to_string()])
        .inc();
    ENGINE_METRICS
        .http_request_duration
        .with_label_values(&[method.as_str(), &path])
        .observe(duration.as_secs_f64());

    debug!(
        method = %method,
        path = %path,
        status = %status_code,
        duration_ms = %duration.as_millis(),
        "HTTP request processed"
    );

    response
}

/// Normalize paths so per-subject routes do not explode label cardinality.
fn normalize_path(path: &str) -> String {
    match path {
        p if p.starts_with("/v1/subjects/") => "/v1/subjects/{id}/permissions".to_string(),
        p => p.to_string(),
    }
}

/// Prometheus text endpoint handler.
pub async fn engine_metrics_handler() -> impl IntoResponse {
    match ENGINE_METRICS.gather_metrics() {
        Ok(metrics) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            metrics,
        ),
        Err(e) => {
            error!("Failed to gather metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                format!("Error gathering metrics: {e}"),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn registry_creation_registers_collectors() {
        let metrics = EngineMetricsRegistry::new();
        assert!(!metrics.registry.gather().is_empty());
    }

    #[test]
    fn decision_recording_does_not_panic() {
        let decision = Decision {
            effect: Effect::Permit,
            matched_policy: Some("plan_create_policy".into()),
            evaluated_at: Utc::now(),
        };
        EngineMetricsHelper::record_decision(&decision, "plans", "create", "engine");
        EngineMetricsHelper::record_decision_duration(&decision, Duration::from_micros(40));
    }

    #[test]
    fn subject_paths_are_normalized() {
        assert_eq!(
            normalize_path("/v1/subjects/alice/permissions"),
            "/v1/subjects/{id}/permissions"
        );
        assert_eq!(normalize_path("/v1/authorize"), "/v1/authorize");
    }
}
