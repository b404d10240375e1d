//! HTTP request handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::documentation::HealthCheckResponse;
use crate::engine::DecisionService;
use crate::errors::{AppError, AuthorizationError};
use crate::metrics::{engine_metrics_handler, EngineMetricsHelper};
use crate::model::{AccessRequest, AttributeMap, Decision, Effect, PolicyBundle};
use crate::source::SubjectDirectory;
use crate::validation::validate_authorize_request;

pub struct AppState {
    pub service: DecisionService,
    pub directory: Arc<SubjectDirectory>,
}

/// Authorization request wire shape. The subject may be given inline, by
/// `subject_id` resolved through the attribute directory, or both (inline
/// attributes win on conflicts).
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AuthorizeRequest {
    /// Caller-supplied identifier, echoed into the audit log.
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<AttributeMap>,
    pub resource_type: String,
    pub action: String,
    #[serde(default)]
    pub context: AttributeMap,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AuthorizeResponse {
    pub decision: Effect,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_policy: Option<String>,
    pub evaluated_at: chrono::DateTime<chrono::Utc>,
}

impl From<Decision> for AuthorizeResponse {
    fn from(decision: Decision) -> Self {
        Self {
            decision: decision.effect,
            matched_policy: decision.matched_policy,
            evaluated_at: decision.evaluated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ReloadResponse {
    pub policies: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct InvalidateResponse {
    pub removed: usize,
}

/// One granted (resource_type, action) pair for a directory subject.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct GrantedPermission {
    pub resource_type: String,
    pub action: String,
    pub policy: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SubjectPermissionsResponse {
    pub subject_id: String,
    pub permissions: Vec<GrantedPermission>,
}

#[utoipa::path(
    post,
    path = "/v1/authorize",
    tag = "authorization",
    request_body = AuthorizeRequest,
    responses(
        (status = 200, description = "Decision made", body = AuthorizeResponse),
        (status = 400, description = "Invalid request parameters", body = crate::documentation::ErrorResponse),
        (status = 404, description = "Unknown subject_id", body = crate::documentation::ErrorResponse)
    )
)]
/// Evaluate one authorization request.
///
/// Callers always get a decision for a well-formed request: no matching
/// policy, absent attributes, and an unreachable policy source all come
/// back as DENY, never as an error.
pub async fn authorize(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AuthorizeRequest>,
) -> Result<Json<AuthorizeResponse>, AppError> {
    validate_authorize_request(&body)?;

    let subject = resolve_subject(&state, &body)?;
    let request = AccessRequest {
        subject,
        resource_type: body.resource_type.trim().to_string(),
        action: body.action.trim().to_string(),
        context: body.context,
    };

    let decision = state.service.decide(&request).await;

    tracing::info!(
        request_id = %body.request_id,
        decision = ?decision.effect,
        matched_policy = decision.matched_policy.as_deref().unwrap_or("-"),
        resource_type = %request.resource_type,
        action = %request.action,
        "Authorization decision made"
    );

    Ok(Json(decision.into()))
}

fn resolve_subject(
    state: &AppState,
    body: &AuthorizeRequest,
) -> Result<AttributeMap, AuthorizationError> {
    let mut subject = match &body.subject_id {
        Some(id) => state
            .directory
            .snapshot()
            .get(id)
            .cloned()
            .ok_or_else(|| AuthorizationError::UnknownSubject {
                subject_id: id.clone(),
            })?,
        None => AttributeMap::new(),
    };
    if let Some(inline) = &body.subject {
        for (key, value) in inline {
            subject.insert(key.clone(), value.clone());
        }
    }
    Ok(subject)
}

#[utoipa::path(
    post,
    path = "/v1/policies/reload",
    tag = "policies",
    request_body = PolicyBundle,
    responses(
        (status = 200, description = "Policy set swapped", body = ReloadResponse),
        (status = 400, description = "Document rejected; previous set retained", body = crate::documentation::ErrorResponse)
    )
)]
/// Atomically replace the policy set (and optionally the subject
/// directory). A rejected document leaves the previous set serving; a
/// successful swap clears the decision cache.
pub async fn reload_policies(
    State(state): State<Arc<AppState>>,
    Json(bundle): Json<PolicyBundle>,
) -> Result<Json<ReloadResponse>, AppError> {
    let policies = match state.service.reload(&bundle.document).await {
        Ok(count) => count,
        Err(e) => {
            EngineMetricsHelper::record_reload("failure", "api");
            return Err(e.into());
        }
    };
    if let Some(subjects) = bundle.subjects {
        state.directory.swap(subjects);
    }
    EngineMetricsHelper::record_reload("success", "api");
    EngineMetricsHelper::set_active_policies(policies);

    tracing::info!(policies, "policy set reloaded via API");
    Ok(Json(ReloadResponse { policies }))
}

#[utoipa::path(
    post,
    path = "/v1/cache/invalidate",
    tag = "policies",
    responses(
        (status = 200, description = "Decision cache cleared", body = InvalidateResponse)
    )
)]
/// Drop every cached decision.
pub async fn invalidate_cache(
    State(state): State<Arc<AppState>>,
) -> Json<InvalidateResponse> {
    let removed = state.service.invalidate_cache().await;
    Json(InvalidateResponse { removed })
}

#[utoipa::path(
    get,
    path = "/v1/subjects/{id}/permissions",
    tag = "authorization",
    params(("id" = String, Path, description = "Subject identifier in the attribute directory")),
    responses(
        (status = 200, description = "Granted permissions", body = SubjectPermissionsResponse),
        (status = 404, description = "Unknown subject", body = crate::documentation::ErrorResponse)
    )
)]
/// List every (resource_type, action) pair the current policy set grants
/// a directory subject, probing the pairs the set itself mentions.
pub async fn subject_permissions(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SubjectPermissionsResponse>, AppError> {
    let subject = state
        .directory
        .snapshot()
        .get(&id)
        .cloned()
        .ok_or(AuthorizationError::UnknownSubject {
            subject_id: id.clone(),
        })?;

    let engine = state.service.engine();
    let mut permissions = Vec::new();
    if let Some(set) = engine.snapshot() {
        for (resource_type, action) in set.probe_matrix() {
            let request = AccessRequest {
                subject: subject.clone(),
                resource_type: resource_type.clone(),
                action: action.clone(),
                context: AttributeMap::new(),
            };
            let decision = crate::engine::evaluate_against(&set, &request);
            if decision.effect == Effect::Permit {
                permissions.push(GrantedPermission {
                    resource_type,
                    action,
                    policy: decision.matched_policy.unwrap_or_default(),
                });
            }
        }
    }

    Ok(Json(SubjectPermissionsResponse {
        subject_id: id,
        permissions,
    }))
}

#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthCheckResponse)
    )
)]
/// Health check endpoint.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthCheckResponse> {
    let policies = state
        .service
        .engine()
        .snapshot()
        .map_or(0, |set| set.len());
    Json(HealthCheckResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        policies,
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

#[utoipa::path(
    get,
    path = "/metrics",
    tag = "metrics",
    responses(
        (status = 200, description = "Prometheus metrics", content_type = "text/plain"),
        (status = 500, description = "Failed to gather metrics")
    )
)]
/// Metrics endpoint.
pub async fn get_metrics() -> impl axum::response::IntoResponse {
    engine_metrics_handler().await
}
