//! The HTTP error envelope.
//!
//! Every failure leaving the API is one of a small set of machine codes
//! with an imperative message and optional structured details; 5xx
//! responses carry an opaque trace id for support correlation.

use {
    axum::{
        Json,
        http::StatusCode,
        response::{IntoResponse, Response},
    },
    tracing::error,
};

use dockyard_protocol::{ErrorBody, error_codes};

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: None,
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn auth_required(auth_url: impl Into<String>) -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            error_codes::AUTH_REQUIRED,
            "link your GitHub account, then retry",
        )
        .with_details(serde_json::json!({ "githubAuthURL": auth_url.into() }))
    }

    pub fn invalid_request(message: impl Into<String>, field: &str) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            error_codes::INVALID_REQUEST,
            message,
        )
        .with_details(serde_json::json!({ "field": field }))
    }

    pub fn repo_not_found(owner: &str, name: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            error_codes::REPO_NOT_FOUND,
            format!("repository {owner}/{name} is not accessible with the current token"),
        )
    }

    pub fn workspace_exists(name: &str) -> Self {
        Self::new(
            StatusCode::CONFLICT,
            error_codes::WORKSPACE_EXISTS,
            format!("workspace '{name}' already exists; delete it or pick another name"),
        )
        .with_details(serde_json::json!({ "workspaceName": name }))
    }

    pub fn invalid_provider(requested: &str, available: &[String]) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            error_codes::INVALID_PROVIDER,
            format!("provider '{requested}' is not available; pick one of the listed providers"),
        )
        .with_details(serde_json::json!({ "availableProviders": available }))
    }

    pub fn insufficient_resources(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            error_codes::INSUFFICIENT_RESOURCES,
            message,
        )
    }

    pub fn provider_error(provider: &str, operation: &str, message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            error_codes::PROVIDER_ERROR,
            message,
        )
        .with_details(serde_json::json!({ "provider": provider, "operation": operation }))
    }

    /// Unknown entity id (workspace, node). The taxonomy reserves
    /// `repo_not_found` for repositories, so these 404s carry
    /// `invalid_request` with the offending id in details.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, error_codes::INVALID_REQUEST, what)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            error_codes::INTERNAL_ERROR,
            message,
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let trace_id = if self.status.is_server_error() {
            let trace_id = uuid::Uuid::new_v4().to_string();
            error!(
                trace_id = %trace_id,
                code = self.code,
                message = %self.message,
                "request failed"
            );
            Some(trace_id)
        } else {
            None
        };
        let body = ErrorBody {
            code: self.code.to_string(),
            message: self.message,
            details: self.details,
            trace_id,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<dockyard_registry::Error> for ApiError {
    fn from(e: dockyard_registry::Error) -> Self {
        match e {
            dockyard_registry::Error::NotFound { entity, id } => {
                ApiError::not_found(format!("{entity} not found: {id}"))
            },
            dockyard_registry::Error::Conflict(message) => ApiError::new(
                StatusCode::CONFLICT,
                error_codes::INVALID_REQUEST,
                message,
            ),
            other => ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                error_codes::DATABASE_ERROR,
                other.to_string(),
            ),
        }
    }
}

impl From<dockyard_github::Error> for ApiError {
    fn from(e: dockyard_github::Error) -> Self {
        use dockyard_github::Error as Gh;
        match &e {
            Gh::AuthRequired => ApiError::new(
                StatusCode::UNAUTHORIZED,
                error_codes::AUTH_REQUIRED,
                "GitHub rejected the stored token; re-link your account",
            ),
            Gh::NotFound(_) => ApiError::new(
                StatusCode::NOT_FOUND,
                error_codes::REPO_NOT_FOUND,
                e.to_string(),
            ),
            Gh::RateLimited { .. } | Gh::Transient(_) => {
                ApiError::insufficient_resources(e.to_string())
            },
            _ => ApiError::internal(e.to_string()),
        }
    }
}

impl From<dockyard_transport::Error> for ApiError {
    fn from(e: dockyard_transport::Error) -> Self {
        use dockyard_transport::Error as Tr;
        match &e {
            Tr::PoolExhausted | Tr::PoolClosed => {
                ApiError::insufficient_resources("execution pool exhausted; retry with backoff")
            },
            Tr::Timeout => ApiError::insufficient_resources("node did not answer in time"),
            _ => ApiError::internal(e.to_string()),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
