use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Configuration errors in a policy document. All of these are raised at
/// load or reload time; a rejected reload leaves the previous set serving.
#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("Duplicate policy name: {name}")]
    DuplicatePolicyName { name: String },

    #[error("Unknown shared rule referenced: {name}")]
    UnknownRuleReference { name: String },

    #[error("Cyclic rule reference through: {name}")]
    CyclicRuleReference { name: String },

    #[error("Rule tree in policy '{policy}' exceeds depth limit of {limit}")]
    RuleTreeTooDeep { policy: String, limit: usize },

    #[error("Invalid attribute path '{path}': {reason}")]
    InvalidAttributePath { path: String, reason: String },

    #[error("Invalid literal in policy '{policy}': {reason}")]
    InvalidLiteral { policy: String, reason: String },

    #[error("Policy document parsing failed")]
    DocumentParse {
        #[from]
        source: serde_json::Error,
    },
}

#[derive(Error, Debug)]
pub enum AuthorizationError {
    #[error("Invalid action: {reason}")]
    InvalidAction { reason: String },

    #[error("Invalid resource type: {reason}")]
    InvalidResourceType { reason: String },

    #[error("Invalid attributes in {field}: {reason}")]
    InvalidAttributes { field: String, reason: String },

    #[error("Unknown subject: {subject_id}")]
    UnknownSubject { subject_id: String },
}

/// Failures of the external policy source. These never reach `evaluate`
/// callers; the refresher logs them and keeps the last-known-good set.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Policy source unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Policy source returned a malformed payload: {reason}")]
    MalformedPayload { reason: String },
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Authorization(#[from] AuthorizationError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("I/O error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON processing error")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("Internal server error: {context}")]
    Internal { context: String },
}

impl AppError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Authorization(AuthorizationError::UnknownSubject { .. }) => {
                StatusCode::NOT_FOUND
            }

            AppError::Policy(_) | AppError::Authorization(_) => StatusCode::BAD_REQUEST,

            AppError::Source(_) => StatusCode::SERVICE_UNAVAILABLE,

            AppError::Io { .. } | AppError::Json { .. } | AppError::Internal { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            AppError::Policy(_) => "policy_error",
            AppError::Authorization(_) => "authorization_error",
            AppError::Source(_) => "source_error",
            AppError::Io { .. } => "io_error",
            AppError::Json { .. } => "json_error",
            AppError::Internal { .. } => "internal_error",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_type = self.error_type();
        let error_message = self.to_string();

        let body = Json(json!({
            "error": {
                "type": error_type,
                "message": error_message,
                "status": status.as_u16(),
            }
        }));

        (status, body).into_response()
    }
}
