pub mod bluejeans;
pub mod inperson;
pub mod phaser;
pub mod registry;
pub mod zoom;

use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Json, Redirect};
use axum::routing::get;
use axum::Router;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::shared::error::ApiError;
use crate::shared::models::User;
use crate::shared::state::AppState;
use crate::users::AuthedUser;

pub use registry::BackendRegistry;

/// Client-facing description of a provider. Pure data, no side effects.
#[derive(Debug, Clone, Serialize)]
pub struct BackendPublicData {
    pub name: &'static str,
    pub friendly_name: &'static str,
    pub enabled: bool,
    pub docs_url: Option<String>,
    pub profile_url: Option<String>,
    pub telephone_num: Option<String>,
    pub intl_telephone_url: Option<String>,
}

/// Transport-class failures from a provider's third-party API. Callers map
/// any of these to `ApiError::backend_failure` so the boundary can answer
/// with a gateway error instead of a 4xx.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("{backend} request failed: {source}")]
    Transport {
        backend: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{backend} returned HTTP {status}: {body}")]
    Api {
        backend: &'static str,
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("user {user} has not authorized {backend}")]
    NotAuthorized { backend: &'static str, user: String },
    #[error("{backend} response was missing {detail}")]
    Malformed {
        backend: &'static str,
        detail: String,
    },
}

/// Capability contract implemented once per meeting provider.
#[async_trait]
pub trait MeetingBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn public_data(&self) -> BackendPublicData;

    /// Whether the user has valid stored credentials for this provider.
    async fn is_authorized(&self, user: &User) -> bool;

    /// Idempotent: metadata that already names a meeting is returned
    /// unchanged. Otherwise schedules a meeting for `assignee` with the
    /// third-party API and returns metadata enriched with the provider user
    /// id, meeting id, and join URL.
    async fn save_user_meeting(
        &self,
        metadata: serde_json::Value,
        assignee: &User,
    ) -> Result<serde_json::Value, BackendError>;
}

impl std::fmt::Debug for dyn MeetingBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeetingBackend")
            .field("name", &self.name())
            .finish()
    }
}

/// A meeting whose metadata names a meeting (or is otherwise non-empty) has
/// been started; providers use this for their idempotence short-circuit and
/// the state machine derives STARTED from it.
pub fn metadata_is_empty(metadata: &serde_json::Value) -> bool {
    match metadata {
        serde_json::Value::Null => true,
        serde_json::Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

#[derive(Debug, Serialize)]
struct BackendListResponse {
    backends: Vec<BackendPublicData>,
    default_backend: String,
}

async fn list_backends(State(state): State<Arc<AppState>>) -> Json<BackendListResponse> {
    Json(BackendListResponse {
        backends: state.registry.public_data(),
        default_backend: state.registry.default_backend().to_string(),
    })
}

#[derive(Debug, Deserialize)]
struct AuthorizeParams {
    /// Where to send the browser after the callback completes.
    state: Option<String>,
}

async fn zoom_authorize(
    State(state): State<Arc<AppState>>,
    AuthedUser(_user): AuthedUser,
    Query(params): Query<AuthorizeParams>,
) -> Result<Redirect, ApiError> {
    let zoom = state
        .registry
        .zoom()
        .ok_or_else(|| ApiError::DisabledBackend("zoom".to_string()))?;
    let redirect_uri = format!("{}/callback/zoom/", state.config.public_base_url);
    let return_to = params.state.unwrap_or_else(|| "/".to_string());
    Ok(Redirect::to(&zoom.auth_url(&redirect_uri, &return_to)))
}

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: String,
    state: Option<String>,
}

async fn zoom_callback(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Query(params): Query<CallbackParams>,
) -> Result<impl IntoResponse, ApiError> {
    let zoom = state
        .registry
        .zoom()
        .ok_or_else(|| ApiError::DisabledBackend("zoom".to_string()))?;
    let redirect_uri = format!("{}/callback/zoom/", state.config.public_base_url);
    zoom.complete_authorization(&user, &params.code, &redirect_uri)
        .await
        .map_err(|err| {
            tracing::error!(user = %user.username, error = %err, "zoom authorization failed");
            ApiError::backend_failure("zoom")
        })?;
    tracing::info!(user = %user.username, "zoom account linked");
    Ok(Redirect::to(params.state.as_deref().unwrap_or("/")))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/backends", get(list_backends))
        .route("/api/backends/zoom/authorize", get(zoom_authorize))
        .route("/callback/zoom/", get(zoom_callback))
}
