use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::RwLock;

use super::{metadata_is_empty, BackendError, BackendPublicData, MeetingBackend};
use crate::config::BluejeansConfig;
use crate::shared::models::User;

pub const NAME: &str = "bluejeans";

const BASE_URL: &str = "https://api.bluejeans.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
const EXPIRY_BUFFER_SECS: i64 = 60;
const MEETING_LENGTH_MS: i64 = 30 * 60 * 1000;

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    enterprise_id: i64,
    expires_at: i64,
}

#[derive(Debug, Deserialize)]
struct TokenScope {
    enterprise: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    scope: TokenScope,
}

#[derive(Debug, Deserialize)]
struct UserSearchResponse {
    count: usize,
    users: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct ScheduledMeeting {
    id: Value,
    #[serde(rename = "numericMeetingId")]
    numeric_meeting_id: Value,
}

/// BlueJeans provider. Unlike Zoom there is no per-user OAuth dance: the
/// server authenticates with enterprise client credentials and schedules on
/// behalf of any user found in the enterprise directory by email.
pub struct BluejeansBackend {
    config: BluejeansConfig,
    http_client: Client,
    base_url: String,
    token: RwLock<Option<CachedToken>>,
}

impl BluejeansBackend {
    pub fn new(config: BluejeansConfig) -> Self {
        Self {
            config,
            http_client: Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            base_url: BASE_URL.to_string(),
            token: RwLock::new(None),
        }
    }

    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    async fn session(&self) -> Result<CachedToken, BackendError> {
        if let Some(token) = self.token.read().await.clone() {
            if Utc::now().timestamp() <= token.expires_at {
                return Ok(token);
            }
        }

        let resp = self
            .http_client
            .post(format!("{}/oauth2/token?Client", self.base_url))
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|source| BackendError::Transport { backend: NAME, source })?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendError::Api { backend: NAME, status, body });
        }
        let data: TokenResponse = resp
            .json()
            .await
            .map_err(|source| BackendError::Transport { backend: NAME, source })?;

        let token = CachedToken {
            access_token: data.access_token,
            enterprise_id: data.scope.enterprise,
            expires_at: Utc::now().timestamp() + data.expires_in - EXPIRY_BUFFER_SECS,
        };
        *self.token.write().await = Some(token.clone());
        Ok(token)
    }

    async fn find_user(&self, email: &str) -> Result<Option<Value>, BackendError> {
        let token = self.session().await?;
        let resp = self
            .http_client
            .get(format!(
                "{}/v1/enterprise/{}/users",
                self.base_url, token.enterprise_id
            ))
            .bearer_auth(&token.access_token)
            .query(&[("emailId", email)])
            .send()
            .await
            .map_err(|source| BackendError::Transport { backend: NAME, source })?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendError::Api { backend: NAME, status, body });
        }
        let mut found: UserSearchResponse = resp
            .json()
            .await
            .map_err(|source| BackendError::Transport { backend: NAME, source })?;
        match found.count {
            0 => Ok(None),
            1 => Ok(Some(found.users.remove(0))),
            n => Err(BackendError::Malformed {
                backend: NAME,
                detail: format!("{n} directory entries match {email}"),
            }),
        }
    }

    async fn create_meeting(&self, user_id: i64) -> Result<ScheduledMeeting, BackendError> {
        let token = self.session().await?;
        let now_ms = Utc::now().timestamp_millis();
        let resp = self
            .http_client
            .post(format!(
                "{}/v1/user/{}/scheduled_meeting",
                self.base_url, user_id
            ))
            .bearer_auth(&token.access_token)
            .json(&json!({
                "title": "Office Hours",
                "description": "",
                "start": now_ms,
                "end": now_ms + MEETING_LENGTH_MS,
                "endPointType": "WEB_APP",
                "endPointVersion": "2.10",
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
impl MeetingBackend for BluejeansBackend {
    fn name(&self) -> &'static str {
        NAME
    }

    fn public_data(&self) -> BackendPublicData {
        BackendPublicData {
            name: NAME,
            friendly_name: "BlueJeans",
            enabled: true,
            docs_url: self.config.docs_url.clone(),
            profile_url: None,
            telephone_num: self.config.telephone_num.clone(),
            intl_telephone_url: self.config.intl_telephone_url.clone(),
        }
    }

    async fn is_authorized(&self, user: &User) -> bool {
        match self.find_user(&user.email).await {
            Ok(found) => found.is_some(),
            Err(err) => {
                tracing::warn!(user = %user.username, error = %err,
                    "bluejeans directory lookup failed");
                false
            }
        }
    }

    async fn save_user_meeting(
        &self,
        metadata: Value,
        assignee: &User,
    ) -> Result<Value, BackendError> {
        if !metadata_is_empty(&metadata) && metadata.get("numeric_meeting_id").is_some() {
            return Ok(metadata);
        }

        let directory_entry = self.find_user(&assignee.email).await?.ok_or_else(|| {
            BackendError::NotAuthorized {
                backend: NAME,
                user: assignee.username.clone(),
            }
        })?;
        let user_id = directory_entry
            .get("id")
            .and_then(Value::as_i64)
            .ok_or_else(|| BackendError::Malformed {
                backend: NAME,
                detail: "directory entry is missing id".to_string(),
            })?;

        let meeting = self.create_meeting(user_id).await?;
        let numeric_id = meeting.numeric_meeting_id.clone();

        let mut map = match metadata {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        map.insert("user_id".to_string(), json!(user_id));
        map.insert("meeting_id".to_string(), meeting.id);
        map.insert("numeric_meeting_id".to_string(), numeric_id.clone());
        let join_id = match &numeric_id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        map.insert(
            "meeting_url".to_string(),
            Value::String(format!("https://bluejeans.com/{join_id}")),
        );
        Ok(Value::Object(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::test_user;

    fn test_config() -> BluejeansConfig {
        BluejeansConfig {
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            docs_url: None,
            telephone_num: None,
            intl_telephone_url: None,
        }
    }

    async fn token_mock(server: &mut mockito::ServerGuard) -> mockito::Mock {
        server
            .mock("POST", "/oauth2/token?Client")
            .with_status(200)
            .with_body(
                json!({
                    "access_token": "bj-token",
                    "expires_in": 3600,
                    "scope": { "enterprise": 42 },
                })
                .to_string(),
            )
            .create_async()
            .await
    }

    #[tokio::test]
    async fn save_schedules_meeting_for_directory_user() {
        let mut server = mockito::Server::new_async().await;
        let _token = token_mock(&mut server).await;
        let _lookup = server
            .mock("GET", "/v1/enterprise/42/users")
            .match_query(mockito::Matcher::UrlEncoded(
                "emailId".into(),
                "host@example.com".into(),
            ))
            .with_status(200)
            .with_body(json!({"count": 1, "users": [{"id": 7}]}).to_string())
            .create_async()
            .await;
        let _create = server
            .mock("POST", "/v1/user/7/scheduled_meeting")
            .with_status(200)
            .with_body(json!({"id": 555, "numericMeetingId": "123456789"}).to_string())
            .create_async()
            .await;

        let backend = BluejeansBackend::new(test_config()).with_base_url(server.url());
        let out = backend
            .save_user_meeting(json!({}), &test_user("host"))
            .await
            .unwrap();
        assert_eq!(out["user_id"], json!(7));
        assert_eq!(out["meeting_url"], json!("https://bluejeans.com/123456789"));
    }

    #[tokio::test]
    async fn save_short_circuits_on_populated_metadata() {
        // No mocks registered: any HTTP call would fail the test.
        let mut server = mockito::Server::new_async().await;
        let backend = BluejeansBackend::new(test_config()).with_base_url(server.url());
        let metadata = json!({"numeric_meeting_id": "123456789"});
        let out = backend
            .save_user_meeting(metadata.clone(), &test_user("host"))
            .await
            .unwrap();
        assert_eq!(out, metadata);
    }

    #[tokio::test]
    async fn unknown_directory_user_is_not_authorized() {
        let mut server = mockito::Server::new_async().await;
        let _token = token_mock(&mut server).await;
        let _lookup = server
            .mock("GET", "/v1/enterprise/42/users")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(json!({"count": 0, "users": []}).to_string())
            .create_async()
            .await;

        let backend = BluejeansBackend::new(test_config()).with_base_url(server.url());
        assert!(!backend.is_authorized(&test_user("host")).await);

        let err = backend
            .save_user_meeting(json!({}), &test_user("host"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::NotAuthorized { .. }));
    }
}
