use utoipa::{
    openapi::security::{ApiKey, ApiKeyValue, Http, HttpAuthScheme, SecurityScheme},
    Modify, OpenApi,
};

use crate::handlers::{
    AuthorizeRequest, AuthorizeResponse, GrantedPermission, InvalidateResponse, ReloadResponse,
    SubjectPermissionsResponse,
};
use crate::model::{PolicyBundle, PolicyDefinition, PolicyDocument};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Policy Decision Service API",
        version = "0.1.0",
        description = "Attribute-based authorization decisions over nested boolean rule trees, with a TTL decision cache and a fail-secure policy refresh loop",
        license(name = "MIT OR Apache-2.0")
    ),
    servers(
        (url = "http://localhost:8082", description = "Local development server")
    ),
    paths(
        crate::handlers::authorize,
        crate::handlers::reload_policies,
        crate::handlers::invalidate_cache,
        crate::handlers::subject_permissions,
        crate::handlers::health_check,
        crate::handlers::get_metrics,
    ),
    components(
        schemas(
            AuthorizeRequest,
            AuthorizeResponse,
            ReloadResponse,
            InvalidateResponse,
            GrantedPermission,
            SubjectPermissionsResponse,
            PolicyBundle,
            PolicyDocument,
            PolicyDefinition,
            HealthCheckResponse,
            ErrorResponse,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "authorization", description = "Authorization operations"),
        (name = "policies", description = "Policy set management"),
        (name = "health", description = "Health check operations"),
        (name = "metrics", description = "Metrics operations")
    )
)]
pub struct ApiDoc;

pub struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "api_key",
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::new("X-API-Key"))),
            );
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(Http::new(HttpAuthScheme::Bearer)),
            );
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize, utoipa::ToSchema)]
pub struct HealthCheckResponse {
    pub status: String,
    pub version: String,
    pub policies: usize,
    pub timestamp: String,
}

#[derive(serde::Serialize, serde::Deserialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    pub error: ErrorDetails,
}

#[derive(serde::Serialize, serde::Deserialize, utoipa::ToSchema)]
pub struct ErrorDetails {
    #[schema(example = "authorization_error")]
    pub r#type: String,
    #[schema(example = "Invalid action: (empty)")]
    pub message: String,
    #[schema(example = 400)]
    pub status: u16,
}
