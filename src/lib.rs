#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, future_incompatible)]

//! Attribute-based policy decision service.
//!
//! Evaluates authorization requests against an ordered set of named
//! policies, each a nested AND/OR rule tree over attribute comparisons,
//! with first-match semantics and default-deny. Decisions are memoized in
//! a TTL cache, and a fail-secure refresher keeps the policy set current
//! from an external source without ever falling back to permissive
//! defaults.

use std::sync::Arc;

use axum::{
    http,
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::CorsLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

pub mod cache;
pub mod config;
pub mod documentation;
pub mod engine;
pub mod errors;
pub mod handlers;
pub mod metrics;
pub mod model;
pub mod policy;
pub mod source;
pub mod validation;

pub use cache::{DecisionCache, DecisionCacheConfig};
pub use config::AppConfig;
pub use documentation::ApiDoc;
pub use engine::{DecisionEngine, DecisionService, FailMode};
pub use errors::{AppError, AuthorizationError, PolicyError, SourceError};
pub use handlers::{AppState, AuthorizeRequest, AuthorizeResponse};
pub use model::{
    AccessRequest, AttributeMap, AttributeValue, Decision, Effect, PolicyBundle, PolicyDocument,
    SubjectAttributes,
};
pub use policy::{compile, PolicySet};
pub use source::{
    BreakerConfig, CircuitBreaker, FilePolicySource, PolicyRefresher, PolicySource,
    SubjectDirectory,
};

use metrics::EngineMetricsHelper;

/// Build the application state from configured files: the policy bundle at
/// startup plus an optional subject attribute directory. A malformed
/// document fails startup; an unreadable policy file starts the engine
/// unloaded (fail-closed unless `POLICY_FAIL_OPEN` is set) and leaves the
/// refresher to install the first set it can fetch.
pub fn load_startup_state(config: &AppConfig) -> Result<Arc<AppState>, AppError> {
    let (engine, mut subjects) = match std::fs::read_to_string(&config.policy_file) {
        Ok(raw) => {
            let bundle: PolicyBundle = serde_json::from_str(&raw)?;
            let set = policy::compile(&bundle.document)?;
            EngineMetricsHelper::set_active_policies(set.len());
            tracing::info!(
                policies = set.len(),
                policy_file = %config.policy_file.display(),
                "policy set loaded"
            );
            (
                DecisionEngine::new(set),
                bundle.subjects.unwrap_or_default(),
            )
        }
        Err(e) => {
            tracing::warn!(
                policy_file = %config.policy_file.display(),
                error = %e,
                "policy file unreadable at startup; starting unloaded"
            );
            (
                DecisionEngine::unloaded(config.fail_mode),
                SubjectAttributes::new(),
            )
        }
    };

    if let Some(path) = &config.subject_file {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::io(format!("Failed to read subject file {}", path.display()), e)
        })?;
        subjects = serde_json::from_str(&raw)?;
        tracing::info!(subjects = subjects.len(), subject_file = %path.display(), "subject directory loaded");
    }

    let engine = Arc::new(engine);
    let cache = Arc::new(DecisionCache::new(config.cache.clone()));
    Ok(Arc::new(AppState {
        service: DecisionService::new(engine, cache),
        directory: Arc::new(SubjectDirectory::new(subjects)),
    }))
}

/// Spawn the background policy refresher against the configured policy
/// file, if refresh is enabled.
pub fn spawn_refresher(config: &AppConfig, state: &Arc<AppState>) {
    let Some(interval) = config.refresh_interval else {
        tracing::info!("policy refresh disabled");
        return;
    };
    let refresher = PolicyRefresher::new(
        Arc::clone(state.service.engine()),
        Arc::clone(state.service.cache()),
        Arc::clone(&state.directory),
        Arc::new(FilePolicySource::new(config.policy_file.clone())),
        config.breaker.clone(),
    );
    tokio::spawn(refresher.run(interval));
}

pub fn app(state: Arc<AppState>) -> Router {
    let cors = match std::env::var("ALLOWED_ORIGINS") {
        Ok(origins) if !origins.trim().is_empty() => {
            let mut layer = CorsLayer::new();
            for o in origins.split(',') {
                if let Ok(origin) = o.trim().parse::<http::HeaderValue>() {
                    layer = layer.allow_origin(origin);
                }
            }
            layer
        }
        // No origins unless explicitly configured.
        _ => CorsLayer::new(),
    };

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/v1/authorize", post(handlers::authorize))
        .route("/v1/policies/reload", post(handlers::reload_policies))
        .route("/v1/cache/invalidate", post(handlers::invalidate_cache))
        .route(
            "/v1/subjects/{id}/permissions",
            get(handlers::subject_permissions),
        )
        .route("/metrics", get(handlers::get_metrics))
        .layer(axum::middleware::from_fn(metrics::engine_metrics_middleware))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
