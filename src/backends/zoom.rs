use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use diesel::prelude::*;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use uuid::Uuid;

use super::{metadata_is_empty, BackendError, BackendPublicData, MeetingBackend};
use crate::config::ZoomConfig;
use crate::shared::models::User;
use crate::shared::utils::DbPool;

pub const NAME: &str = "zoom";

const BASE_URL: &str = "https://zoom.us";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
// Refresh slightly before the advertised expiry.
const EXPIRY_BUFFER_SECS: i64 = 60;

#[derive(Debug, Deserialize)]
struct ZoomTokenResponse {
    access_token: String,
    refresh_token: String,
    expires_in: i64,
}

#[derive(Debug, Deserialize)]
struct ZoomMe {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ZoomMeeting {
    id: Value,
    host_id: String,
    join_url: String,
}

/// Zoom provider. Each user links their own Zoom account through the OAuth
/// authorization-code flow; refresh/access tokens live in the user's
/// `backend_metadata['zoom']` and are refreshed in place as a side effect of
/// scheduling. A rejected refresh (revoked grant) clears the stored entry so
/// `is_authorized` reports false until the user re-links.
pub struct ZoomBackend {
    config: ZoomConfig,
    pool: DbPool,
    http_client: Client,
    base_url: String,
}

impl ZoomBackend {
    pub fn new(config: ZoomConfig, pool: DbPool) -> Self {
        Self {
            config,
            pool,
            http_client: Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            base_url: BASE_URL.to_string(),
        }
    }

    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    fn basic_auth_header(&self) -> String {
        let credentials = format!("{}:{}", self.config.client_id, self.config.client_secret);
        format!("Basic {}", BASE64.encode(credentials.as_bytes()))
    }

    pub fn auth_url(&self, redirect_uri: &str, return_to: &str) -> String {
        format!(
            "{}/oauth/authorize?response_type=code&client_id={}&scope={}&state={}&redirect_uri={}",
            self.base_url,
            urlencoding::encode(&self.config.client_id),
            urlencoding::encode("meeting:read meeting:write"),
            urlencoding::encode(return_to),
            urlencoding::encode(redirect_uri),
        )
    }

    async fn request_token(&self, params: &[(&str, &str)]) -> Result<ZoomTokenResponse, BackendError> {
        let resp = self
            .http_client
            .post(format!("{}/oauth/token", self.base_url))
            .header("Authorization", self.basic_auth_header())
            .header("Accept", "application/json")
            .query(params)
            .send()
            .await
            .map_err(|source| BackendError::Transport { backend: NAME, source })?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendError::Api { backend: NAME, status, body });
        }
        resp.json()
            .await
            .map_err(|source| BackendError::Transport { backend: NAME, source })
    }

    /// Exchange an authorization code and store the linked account on the
    /// user's profile metadata.
    pub async fn complete_authorization(
        &self,
        user: &User,
        code: &str,
        redirect_uri: &str,
    ) -> Result<(), BackendError> {
        let token = self
            .request_token(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
            ])
            .await?;

        let me: ZoomMe = self
            .get_json(&format!("{}/v2/users/me", self.base_url), &token.access_token)
            .await?;

        let meta = json!({
            "user_id": me.id,
            "access_token": token.access_token,
            "refresh_token": token.refresh_token,
            "access_token_expires": Utc::now().timestamp() + token.expires_in - EXPIRY_BUFFER_SECS,
        });
        self.store_account(user.id, Some(meta))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        access_token: &str,
    ) -> Result<T, BackendError> {
        let resp = self
            .http_client
            .get(url)
            .bearer_auth(access_token)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|source| BackendError::Transport { backend: NAME, source })?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendError::Api { backend: NAME, status, body });
        }
        resp.json()
            .await
            .map_err(|source| BackendError::Transport { backend: NAME, source })
    }

    /// Write (or clear, with `None`) the `zoom` entry of the user's stored
    /// backend metadata.
    fn store_account(&self, user_id: Uuid, account: Option<Value>) -> Result<(), BackendError> {
        use crate::shared::models::schema::users::dsl::*;

        let mut conn = self.pool.get().map_err(|e| BackendError::Malformed {
            backend: NAME,
            detail: format!("connection pool unavailable: {e}"),
        })?;
        let current: Value = users
            .filter(id.eq(user_id))
            .select(backend_metadata)
            .first(&mut conn)
            .map_err(|e| BackendError::Malformed {
                backend: NAME,
                detail: format!("failed to load user metadata: {e}"),
            })?;
        let mut map = match current {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        match account {
            Some(meta) => {
                map.insert("zoom".to_string(), meta);
            }
            None => {
                map.remove("zoom");
            }
        }
        diesel::update(users.filter(id.eq(user_id)))
            .set(backend_metadata.eq(Value::Object(map)))
            .execute(&mut conn)
            .map_err(|e| BackendError::Malformed {
                backend: NAME,
                detail: format!("failed to persist user metadata: {e}"),
            })?;
        Ok(())
    }

    /// Current access token for the user, refreshing if it has expired. A
    /// rejected refresh clears the stored linkage instead of looping.
    async fn access_token(&self, user: &User) -> Result<(String, String), BackendError> {
        let account = user
            .backend_metadata
            .get("zoom")
            .filter(|v| !v.is_null())
            .ok_or_else(|| BackendError::NotAuthorized {
                backend: NAME,
                user: user.username.clone(),
            })?;

        let zoom_user_id = account
            .get("user_id")
            .and_then(Value::as_str)
            .ok_or_else(|| BackendError::Malformed {
                backend: NAME,
                detail: "stored account is missing user_id".to_string(),
            })?
            .to_string();
        let expires = account
            .get("access_token_expires")
            .and_then(Value::as_i64)
            .unwrap_or(0);

        if Utc::now().timestamp() <= expires {
            let token = account
                .get("access_token")
                .and_then(Value::as_str)
                .ok_or_else(|| BackendError::Malformed {
                    backend: NAME,
                    detail: "stored account is missing access_token".to_string(),
                })?;
            return Ok((token.to_string(), zoom_user_id));
        }

        let refresh_token = account
            .get("refresh_token")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        match self
            .request_token(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", &refresh_token),
            ])
            .await
        {
            Ok(token) => {
                let meta = json!({
                    "user_id": zoom_user_id,
                    "access_token": token.access_token,
                    "refresh_token": token.refresh_token,
                    "access_token_expires":
                        Utc::now().timestamp() + token.expires_in - EXPIRY_BUFFER_SECS,
                });
                if let Err(err) = self.store_account(user.id, Some(meta)) {
                    tracing::warn!(user = %user.username, error = %err,
                        "failed to persist refreshed zoom tokens");
                }
                Ok((token.access_token, zoom_user_id))
            }
            Err(BackendError::Api { status, body, .. }) if status.is_client_error() => {
                // Revoked or expired grant: force re-authorization.
                tracing::warn!(user = %user.username, %status,
                    "zoom refused token refresh, clearing stored authorization");
                if let Err(err) = self.store_account(user.id, None) {
                    tracing::warn!(user = %user.username, error = %err,
                        "failed to clear zoom authorization");
                }
                Err(BackendError::Api { backend: NAME, status, body })
            }
            Err(other) => Err(other),
        }
    }

    async fn create_meeting(
        &self,
        access_token: &str,
        zoom_user_id: &str,
    ) -> Result<ZoomMeeting, BackendError> {
        let resp = self
            .http_client
            .post(format!("{}/v2/users/{}/meetings", self.base_url, zoom_user_id))
            .bearer_auth(access_token)
            .json(&json!({
                "topic": "Office Hours Meeting",
                "start_time": Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            }))
            .send()
            .await
            .map_err(|source| BackendError::Transport { backend: NAME, source })?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendError::Api { backend: NAME, status, body });
        }
        resp.json()
            .await
            .map_err(|source| BackendError::Transport { backend: NAME, source })
    }
}

#[async_trait]
impl MeetingBackend for ZoomBackend {
    fn name(&self) -> &'static str {
        NAME
    }

    fn public_data(&self) -> BackendPublicData {
        BackendPublicData {
            name: NAME,
            friendly_name: "Zoom",
            enabled: true,
            docs_url: self.config.docs_url.clone(),
            profile_url: self.config.profile_url.clone(),
            telephone_num: self.config.telephone_num.clone(),
            intl_telephone_url: self.config.intl_telephone_url.clone(),
        }
    }

    async fn is_authorized(&self, user: &User) -> bool {
        user.backend_metadata
            .get("zoom")
            .is_some_and(|v| !v.is_null())
    }

    async fn save_user_meeting(
        &self,
        metadata: Value,
        assignee: &User,
    ) -> Result<Value, BackendError> {
        if !metadata_is_empty(&metadata) && metadata.get("meeting_id").is_some() {
            return Ok(metadata);
        }

        let (access_token, zoom_user_id) = self.access_token(assignee).await?;
        let meeting = self.create_meeting(&access_token, &zoom_user_id).await?;

        let mut map = match metadata {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        map.insert("user_id".to_string(), Value::String(meeting.host_id));
        map.insert("meeting_id".to_string(), meeting.id.clone());
        map.insert("numeric_meeting_id".to_string(), meeting.id);
        map.insert("meeting_url".to_string(), Value::String(meeting.join_url));
        Ok(Value::Object(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::test_user;
    use diesel::r2d2::ConnectionManager;
    use diesel::PgConnection;

    fn test_config() -> ZoomConfig {
        ZoomConfig {
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            docs_url: None,
            profile_url: None,
            telephone_num: None,
            intl_telephone_url: None,
        }
    }

    // A pool that never connects; tests below only hit paths that do not
    // touch the database, or that tolerate a pool failure.
    fn dead_pool() -> DbPool {
        let manager = ConnectionManager::<PgConnection>::new("postgres://localhost/void");
        diesel::r2d2::Pool::builder()
            .max_size(1)
            .connection_timeout(std::time::Duration::from_millis(10))
            .build_unchecked(manager)
    }

    fn linked_user(expires_at: i64) -> User {
        let mut user = test_user("host");
        user.backend_metadata = json!({
            "zoom": {
                "user_id": "z-user",
                "access_token": "tok",
                "refresh_token": "refresh",
                "access_token_expires": expires_at,
            }
        });
        user
    }

    #[tokio::test]
    async fn save_short_circuits_on_populated_metadata() {
        let backend = ZoomBackend::new(test_config(), dead_pool());
        let metadata = json!({"meeting_id": "987", "meeting_url": "https://zoom.us/j/987"});
        // No HTTP server is running; reaching the API would fail loudly.
        let out = backend
            .save_user_meeting(metadata.clone(), &linked_user(0))
            .await
            .unwrap();
        assert_eq!(out, metadata);
    }

    #[tokio::test]
    async fn unlinked_user_is_not_authorized() {
        let backend = ZoomBackend::new(test_config(), dead_pool());
        assert!(!backend.is_authorized(&test_user("host")).await);
        assert!(backend.is_authorized(&linked_user(0)).await);
    }

    #[tokio::test]
    async fn save_creates_meeting_and_enriches_metadata() {
        let mut server = mockito::Server::new_async().await;
        let create = server
            .mock("POST", "/v2/users/z-user/meetings")
            .match_header("authorization", "Bearer tok")
            .with_status(201)
            .with_body(
                serde_json::json!({
                    "id": 12345,
                    "host_id": "z-user",
                    "join_url": "https://zoom.us/j/12345",
                })
                .to_string(),
            )
            .create_async()
            .await;

        let backend =
            ZoomBackend::new(test_config(), dead_pool()).with_base_url(server.url());
        let user = linked_user(Utc::now().timestamp() + 3600);
        let out = backend
            .save_user_meeting(json!({}), &user)
            .await
            .unwrap();
        create.assert_async().await;
        assert_eq!(out["meeting_id"], json!(12345));
        assert_eq!(out["meeting_url"], json!("https://zoom.us/j/12345"));
        assert_eq!(out["user_id"], json!("z-user"));
    }

    #[tokio::test]
    async fn rejected_refresh_surfaces_api_error() {
        let mut server = mockito::Server::new_async().await;
        let refresh = server
            .mock("POST", "/oauth/token")
            .match_query(mockito::Matcher::UrlEncoded(
                "grant_type".into(),
                "refresh_token".into(),
            ))
            .with_status(401)
            .with_body("{\"reason\":\"revoked\"}")
            .create_async()
            .await;

        let backend =
            ZoomBackend::new(test_config(), dead_pool()).with_base_url(server.url());
        // Expired token forces the refresh path.
        let user = linked_user(0);
        let err = backend
            .save_user_meeting(json!({}), &user)
            .await
            .unwrap_err();
        refresh.assert_async().await;
        assert!(matches!(err, BackendError::Api { .. }));
    }

    #[test]
    fn auth_url_carries_state_and_redirect() {
        let backend = ZoomBackend::new(test_config(), dead_pool());
        let url = backend.auth_url("https://app.example.com/callback/zoom/", "/preferences");
        assert!(url.starts_with("https://zoom.us/oauth/authorize?"));
        assert!(url.contains("client_id=client"));
        assert!(url.contains("state=%2Fpreferences"));
    }
}
