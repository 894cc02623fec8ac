use axum::extract::{FromRequestParts, Path, State};
use axum::http::request::Parts;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use chrono::{Duration, Utc};
use diesel::prelude::*;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::shared::error::ApiError;
use crate::shared::models::{schema, NewUser, User};
use crate::shared::state::AppState;

const OTP_DIGITS: u32 = 6;
const OTP_TTL_MINUTES: i64 = 10;

#[derive(Debug, Clone, Serialize)]
pub struct ShallowUser {
    pub id: Uuid,
    pub username: String,
    pub email: String,
}

impl From<&User> for ShallowUser {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            email: user.email.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct UserProfile {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub phone_number: String,
    pub phone_verified: bool,
    pub notify_me_host: bool,
    pub notify_me_attendee: bool,
    /// backend name -> whether this user holds valid credentials for it.
    pub authorized_backends: HashMap<String, bool>,
}

/// Bearer-token authentication. The wider SSO integration lives outside this
/// service; every request carries `Authorization: Bearer <api_token>`.
pub struct AuthedUser(pub User);

#[async_trait::async_trait]
impl FromRequestParts<Arc<AppState>> for AuthedUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        use schema::users::dsl::*;

        let token = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(|| ApiError::Unauthorized("missing bearer token".to_string()))?
            .to_string();

        let mut conn = state.conn.get()?;
        let user = users
            .filter(api_token.eq(&token))
            .first::<User>(&mut conn)
            .optional()?
            .ok_or_else(|| ApiError::Unauthorized("invalid bearer token".to_string()))?;
        Ok(AuthedUser(user))
    }
}

pub fn load_user(conn: &mut PgConnection, user_id: Uuid) -> Result<User, ApiError> {
    use schema::users::dsl::*;
    users
        .find(user_id)
        .first::<User>(conn)
        .optional()?
        .ok_or_else(|| ApiError::NotFound("user not found".to_string()))
}

/// Provision a user and mint their API token. Exposed to the `create-user`
/// subcommand; there is no self-service signup.
pub fn create_user(
    conn: &mut PgConnection,
    username: &str,
    email: &str,
) -> Result<(User, String), ApiError> {
    let token: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(40)
        .map(char::from)
        .collect();
    let user: User = diesel::insert_into(schema::users::table)
        .values(NewUser {
            username: username.to_string(),
            email: email.to_string(),
            api_token: Some(token.clone()),
        })
        .get_result(conn)?;
    Ok((user, token))
}

fn generate_otp() -> String {
    let code: u32 = rand::thread_rng().gen_range(0..10u32.pow(OTP_DIGITS));
    format!("{code:06}")
}

/// A submitted code matches when it equals the stored one, the stored one
/// has not expired, and a verification is actually pending.
pub fn otp_matches(user: &User, submitted: &str, now: chrono::DateTime<Utc>) -> bool {
    match (&user.otp_token, &user.otp_expiration) {
        (Some(stored), Some(expiration)) => {
            !stored.is_empty() && stored == submitted && now <= *expiration
        }
        _ => false,
    }
}

async fn user_profile(state: &AppState, user: &User) -> UserProfile {
    let mut authorized_backends = HashMap::new();
    for name in state.registry.enabled_names() {
        if let Ok(backend) = state.registry.get(name) {
            authorized_backends.insert(name.to_string(), backend.is_authorized(user).await);
        }
    }
    UserProfile {
        id: user.id,
        username: user.username.clone(),
        email: user.email.clone(),
        phone_number: user.phone_number.clone(),
        phone_verified: user.phone_verified,
        notify_me_host: user.notify_me_host,
        notify_me_attendee: user.notify_me_attendee,
        authorized_backends,
    }
}

async fn list_users(
    State(state): State<Arc<AppState>>,
    AuthedUser(_user): AuthedUser,
) -> Result<Json<Vec<ShallowUser>>, ApiError> {
    use schema::users::dsl::*;
    let mut conn = state.conn.get()?;
    let rows = users.order(username.asc()).load::<User>(&mut conn)?;
    Ok(Json(rows.iter().map(ShallowUser::from).collect()))
}

async fn get_user(
    State(state): State<Arc<AppState>>,
    AuthedUser(requester): AuthedUser,
    Path(user_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut conn = state.conn.get()?;
    let user = load_user(&mut conn, user_id)?;
    drop(conn);
    if requester.id == user.id {
        let profile = user_profile(&state, &user).await;
        Ok(Json(serde_json::to_value(profile).map_err(|e| {
            ApiError::Internal(format!("serialization failed: {e}"))
        })?))
    } else {
        Ok(Json(serde_json::json!(ShallowUser::from(&user))))
    }
}

#[derive(Debug, Deserialize)]
struct PreferencesUpdate {
    notify_me_host: Option<bool>,
    notify_me_attendee: Option<bool>,
}

async fn update_preferences(
    State(state): State<Arc<AppState>>,
    AuthedUser(requester): AuthedUser,
    Path(user_id): Path<Uuid>,
    Json(update): Json<PreferencesUpdate>,
) -> Result<Json<serde_json::Value>, ApiError> {
    use schema::users::dsl::*;
    if requester.id != user_id {
        return Err(ApiError::Forbidden(
            "you may only change your own preferences".to_string(),
        ));
    }
    let mut conn = state.conn.get()?;
    let user: User = diesel::update(users.find(user_id))
        .set((
            notify_me_host.eq(update.notify_me_host.unwrap_or(requester.notify_me_host)),
            notify_me_attendee.eq(update
                .notify_me_attendee
                .unwrap_or(requester.notify_me_attendee)),
        ))
        .get_result(&mut conn)?;
    drop(conn);
    let profile = user_profile(&state, &user).await;
    Ok(Json(serde_json::json!(profile)))
}

#[derive(Debug, Deserialize)]
struct OtpRequest {
    phone_number: String,
}

async fn request_otp(
    State(state): State<Arc<AppState>>,
    AuthedUser(requester): AuthedUser,
    Path(user_id): Path<Uuid>,
    Json(request): Json<OtpRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    use schema::users::dsl::*;
    if requester.id != user_id {
        return Err(ApiError::Forbidden(
            "you may only verify your own phone number".to_string(),
        ));
    }
    let phone = request.phone_number.trim().to_string();
    if phone.is_empty() {
        return Err(ApiError::Validation("phone number is required".to_string()));
    }

    let code = generate_otp();
    state.notifier.send_verification_code(&phone, &code).await?;

    let mut conn = state.conn.get()?;
    diesel::update(users.find(user_id))
        .set((
            otp_token.eq(Some(code)),
            otp_phone_number.eq(Some(phone)),
            otp_expiration.eq(Some(Utc::now() + Duration::minutes(OTP_TTL_MINUTES))),
        ))
        .execute(&mut conn)?;
    Ok(Json(serde_json::json!({ "detail": "verification code sent" })))
}

#[derive(Debug, Deserialize)]
struct OtpVerify {
    otp_token: String,
}

async fn verify_otp(
    State(state): State<Arc<AppState>>,
    AuthedUser(requester): AuthedUser,
    Path(user_id): Path<Uuid>,
    Json(request): Json<OtpVerify>,
) -> Result<Json<serde_json::Value>, ApiError> {
    use schema::users::dsl::*;
    if requester.id != user_id {
        return Err(ApiError::Forbidden(
            "you may only verify your own phone number".to_string(),
        ));
    }
    if !otp_matches(&requester, &request.otp_token, Utc::now()) {
        return Err(ApiError::Validation(
            "incorrect or expired verification code".to_string(),
        ));
    }
    let verified_number = requester.otp_phone_number.clone().unwrap_or_default();

    let mut conn = state.conn.get()?;
    let user: User = diesel::update(users.find(user_id))
        .set((
            phone_number.eq(verified_number),
            phone_verified.eq(true),
            otp_token.eq(None::<String>),
            otp_phone_number.eq(None::<String>),
            otp_expiration.eq(None::<chrono::DateTime<Utc>>),
        ))
        .get_result(&mut conn)?;
    drop(conn);
    let profile = user_profile(&state, &user).await;
    Ok(Json(serde_json::json!(profile)))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/users", get(list_users))
        .route("/api/users/:user_id", get(get_user).patch(update_preferences))
        .route("/api/users/:user_id/otp", post(request_otp))
        .route("/api/users/:user_id/otp/verify", post(verify_otp))
}

#[cfg(test)]
pub fn test_user(username: &str) -> User {
    User {
        id: Uuid::new_v4(),
        username: username.to_string(),
        email: format!("{username}@example.com"),
        api_token: None,
        phone_number: String::new(),
        phone_verified: false,
        notify_me_host: false,
        notify_me_attendee: false,
        backend_metadata: serde_json::json!({}),
        otp_token: None,
        otp_phone_number: None,
        otp_expiration: None,
        created_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn otp_matches_only_pending_unexpired_codes() {
        let now = Utc::now();
        let mut user = test_user("student");
        assert!(!otp_matches(&user, "123456", now));

        user.otp_token = Some("123456".to_string());
        user.otp_expiration = Some(now + Duration::minutes(5));
        assert!(otp_matches(&user, "123456", now));
        assert!(!otp_matches(&user, "654321", now));

        user.otp_expiration = Some(now - Duration::minutes(1));
        assert!(!otp_matches(&user, "123456", now));
    }

    #[test]
    fn generated_codes_are_six_digits() {
        for _ in 0..32 {
            let code = generate_otp();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }
}
