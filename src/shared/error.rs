use axum::{http::StatusCode, response::IntoResponse, Json};

/// Error taxonomy for the whole API surface.
///
/// `MeetingStarted` is deliberately distinct from `Validation`: it signals a
/// state-machine violation (mutating a live meeting) rather than bad input
/// shape. `Backend` wraps third-party transport failures and surfaces as a
/// gateway error; the detailed cause is logged at the failure site, never
/// sent to the client.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    MeetingStarted(String),
    #[error("the {0} backend is not enabled")]
    DisabledBackend(String),
    #[error("the {0} backend is not allowed by this queue")]
    NotAllowedBackend(String),
    #[error("{message}")]
    Backend { backend_type: String, message: String },
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    /// User-facing wrapper for any provider transport failure. Names the
    /// provider, hides its internals.
    pub fn backend_failure(backend_type: &str) -> Self {
        let mut pretty = backend_type.to_string();
        if let Some(first) = pretty.get_mut(0..1) {
            first.make_ascii_uppercase();
        }
        ApiError::Backend {
            backend_type: backend_type.to_string(),
            message: format!(
                "An unexpected error occurred in {pretty}. \
                 Please try again later, and contact support if the problem persists."
            ),
        }
    }

    pub fn meeting_started() -> Self {
        ApiError::MeetingStarted(
            "This meeting has already been started; its assignee and meeting type \
             can no longer be changed."
                .to_string(),
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            Self::Validation(_) | Self::DisabledBackend(_) | Self::NotAllowedBackend(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::MeetingStarted(_) => StatusCode::CONFLICT,
            Self::Backend { .. } => StatusCode::BAD_GATEWAY,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Database(_) | Self::Pool(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let message = match &self {
            // Do not leak database/pool details to the client.
            Self::Database(_) | Self::Pool(_) | Self::Internal(_) => {
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meeting_started_maps_to_conflict() {
        let resp = ApiError::meeting_started().into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn backend_failure_maps_to_bad_gateway_and_names_provider() {
        let err = ApiError::backend_failure("zoom");
        assert!(err.to_string().contains("Zoom"));
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn validation_maps_to_bad_request() {
        let resp = ApiError::Validation("bad input".into()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn disabled_backend_mentions_name() {
        assert_eq!(
            ApiError::DisabledBackend("bluejeans".into()).to_string(),
            "the bluejeans backend is not enabled"
        );
    }
}
