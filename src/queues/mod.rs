use axum::extract::{Path, Query, State};
use axum::response::Json;
use axum::routing::{delete, get, post};
use axum::Router;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::meetings::{self, MeetingPayload};
use crate::realtime::{queue_topic, user_topic, ChangeEvent};
use crate::shared::error::ApiError;
use crate::shared::models::{
    schema, NewQueue, NewQueueHost, Queue, User, QUEUE_STATUS_CLOSED, QUEUE_STATUS_OPEN,
};
use crate::shared::state::AppState;
use crate::users::{AuthedUser, ShallowUser};

impl Queue {
    pub fn is_open(&self) -> bool {
        self.status == QUEUE_STATUS_OPEN
    }

    /// Drop `backend` from the allowed list, adding `default` if it is not
    /// already present so the list never ends up empty. Returns whether the
    /// list changed; callers persist the new value themselves.
    pub fn replace_allowed_backend_with_default(&mut self, backend: &str, default: &str) -> bool {
        if !self.allowed_backends.iter().any(|b| b == backend) {
            return false;
        }
        self.allowed_backends.retain(|b| b != backend);
        if !self.allowed_backends.iter().any(|b| b == default) {
            self.allowed_backends.push(default.to_string());
        }
        true
    }
}

/// Active queues only. Soft-deleted rows stay in the table but are invisible
/// to every lookup that goes through here.
pub fn load_queue(conn: &mut PgConnection, queue_id: i64) -> Result<Queue, ApiError> {
    use schema::queues::dsl::*;
    queues
        .find(queue_id)
        .filter(deleted_at.is_null())
        .first::<Queue>(conn)
        .optional()?
        .ok_or_else(|| ApiError::NotFound("queue not found".to_string()))
}

pub fn queue_hosts(conn: &mut PgConnection, for_queue: i64) -> Result<Vec<User>, ApiError> {
    use schema::{queue_hosts, users};
    Ok(queue_hosts::table
        .inner_join(users::table)
        .filter(queue_hosts::queue_id.eq(for_queue))
        .select(User::as_select())
        .order(users::username.asc())
        .load::<User>(conn)?)
}

pub fn is_host(conn: &mut PgConnection, for_queue: i64, host: Uuid) -> Result<bool, ApiError> {
    use schema::queue_hosts::dsl::*;
    let count: i64 = queue_hosts
        .filter(queue_id.eq(for_queue))
        .filter(user_id.eq(host))
        .count()
        .get_result(conn)?;
    Ok(count > 0)
}

fn require_host(conn: &mut PgConnection, queue: &Queue, user: &User) -> Result<(), ApiError> {
    if is_host(conn, queue.id, user.id)? {
        Ok(())
    } else {
        Err(ApiError::Forbidden(
            "you are not a host of this queue".to_string(),
        ))
    }
}

fn validate_backends(state: &AppState, allowed: &[String]) -> Result<(), ApiError> {
    if allowed.is_empty() {
        return Err(ApiError::Validation(
            "a queue must allow at least one meeting type".to_string(),
        ));
    }
    for name in allowed {
        if !state.registry.contains(name) {
            return Err(ApiError::DisabledBackend(name.clone()));
        }
    }
    Ok(())
}

fn validate_status(status: &str) -> Result<(), ApiError> {
    if status == QUEUE_STATUS_OPEN || status == QUEUE_STATUS_CLOSED {
        Ok(())
    } else {
        Err(ApiError::Validation(format!(
            "status must be {QUEUE_STATUS_OPEN:?} or {QUEUE_STATUS_CLOSED:?}"
        )))
    }
}

#[derive(Debug, Serialize)]
pub struct QueuePayload {
    #[serde(flatten)]
    pub queue: Queue,
    pub hosts: Vec<ShallowUser>,
    pub meetings: Vec<MeetingPayload>,
    pub line_length: usize,
}

pub fn queue_payload(conn: &mut PgConnection, queue: Queue) -> Result<QueuePayload, ApiError> {
    let hosts = queue_hosts(conn, queue.id)?;
    let meetings = meetings::meetings_for_queue(conn, queue.id)?;
    let line_length = meetings
        .iter()
        .filter(|m| m.status != meetings::MeetingStatus::Started)
        .count();
    Ok(QueuePayload {
        queue,
        hosts: hosts.iter().map(ShallowUser::from).collect(),
        meetings,
        line_length,
    })
}

/// What anyone may see about a queue without hosting it.
#[derive(Debug, Serialize)]
pub struct PublicQueuePayload {
    pub id: i64,
    pub name: String,
    pub status: String,
    pub allowed_backends: Vec<String>,
    pub hosts: Vec<ShallowUser>,
    pub line_length: usize,
}

fn public_payload(conn: &mut PgConnection, queue: Queue) -> Result<PublicQueuePayload, ApiError> {
    let hosts = queue_hosts(conn, queue.id)?;
    let line_length = meetings::line_length(conn, queue.id)?;
    Ok(PublicQueuePayload {
        id: queue.id,
        name: queue.name,
        status: queue.status,
        allowed_backends: queue.allowed_backends,
        hosts: hosts.iter().map(ShallowUser::from).collect(),
        line_length,
    })
}

async fn list_queues(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
) -> Result<Json<Vec<Queue>>, ApiError> {
    use schema::{queue_hosts, queues};
    let mut conn = state.conn.get()?;
    let rows = queues::table
        .inner_join(queue_hosts::table)
        .filter(queue_hosts::user_id.eq(user.id))
        .filter(queues::deleted_at.is_null())
        .select(Queue::as_select())
        .order(queues::id.asc())
        .load::<Queue>(&mut conn)?;
    Ok(Json(rows))
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    #[serde(default)]
    q: String,
}

/// Substring search over open queues, matching the queue name or a host's
/// username.
async fn search_queues(
    State(state): State<Arc<AppState>>,
    AuthedUser(_user): AuthedUser,
    Query(params): Query<SearchParams>,
) -> Result<Json<Vec<PublicQueuePayload>>, ApiError> {
    use schema::{queue_hosts, queues, users};
    let mut conn = state.conn.get()?;
    let pattern = format!("%{}%", params.q.trim());

    let mut rows = queues::table
        .filter(queues::deleted_at.is_null())
        .filter(queues::status.eq(QUEUE_STATUS_OPEN))
        .filter(queues::name.ilike(&pattern))
        .limit(50)
        .load::<Queue>(&mut conn)?;
    let by_host = queues::table
        .inner_join(queue_hosts::table.inner_join(users::table))
        .filter(queues::deleted_at.is_null())
        .filter(queues::status.eq(QUEUE_STATUS_OPEN))
        .filter(users::username.ilike(&pattern))
        .select(Queue::as_select())
        .limit(50)
        .load::<Queue>(&mut conn)?;
    for queue in by_host {
        if !rows.iter().any(|q| q.id == queue.id) {
            rows.push(queue);
        }
    }
    rows.sort_by(|a, b| a.name.cmp(&b.name));

    let mut payloads = Vec::with_capacity(rows.len());
    for queue in rows {
        payloads.push(public_payload(&mut conn, queue)?);
    }
    Ok(Json(payloads))
}

#[derive(Debug, Deserialize)]
struct QueueCreate {
    name: String,
    #[serde(default)]
    description: String,
    allowed_backends: Option<Vec<String>>,
}

async fn create_queue(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Json(body): Json<QueueCreate>,
) -> Result<Json<QueuePayload>, ApiError> {
    let name = body.name.trim().to_string();
    if name.is_empty() {
        return Err(ApiError::Validation("queue name is required".to_string()));
    }
    let allowed = body
        .allowed_backends
        .unwrap_or_else(|| vec![state.registry.default_backend().to_string()]);
    validate_backends(&state, &allowed)?;

    let mut conn = state.conn.get()?;
    let queue: Queue = conn.transaction(|conn| {
        let queue: Queue = diesel::insert_into(schema::queues::table)
            .values(NewQueue {
                name,
                description: body.description,
                status: QUEUE_STATUS_OPEN.to_string(),
                allowed_backends: allowed,
            })
            .get_result(conn)?;
        diesel::insert_into(schema::queue_hosts::table)
            .values(NewQueueHost {
                queue_id: queue.id,
                user_id: user.id,
            })
            .execute(conn)?;
        diesel::result::QueryResult::Ok(queue)
    })?;

    state
        .publisher
        .publish(&user_topic(user.id), ChangeEvent::created("queue", queue.id));
    let payload = queue_payload(&mut conn, queue)?;
    Ok(Json(payload))
}

async fn get_queue(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Path(queue_id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut conn = state.conn.get()?;
    let queue = load_queue(&mut conn, queue_id)?;
    if is_host(&mut conn, queue.id, user.id)? {
        let payload = queue_payload(&mut conn, queue)?;
        Ok(Json(serde_json::json!(payload)))
    } else {
        let payload = public_payload(&mut conn, queue)?;
        Ok(Json(serde_json::json!(payload)))
    }
}

#[derive(Debug, Deserialize)]
struct QueueUpdate {
    name: Option<String>,
    description: Option<String>,
    status: Option<String>,
    allowed_backends: Option<Vec<String>>,
}

async fn update_queue(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Path(queue_id): Path<i64>,
    Json(body): Json<QueueUpdate>,
) -> Result<Json<QueuePayload>, ApiError> {
    use schema::queues::dsl::*;
    let mut conn = state.conn.get()?;
    let queue = load_queue(&mut conn, queue_id)?;
    require_host(&mut conn, &queue, &user)?;

    let new_name = match body.name {
        Some(n) => {
            let n = n.trim().to_string();
            if n.is_empty() {
                return Err(ApiError::Validation("queue name is required".to_string()));
            }
            n
        }
        None => queue.name.clone(),
    };
    let new_status = body.status.unwrap_or_else(|| queue.status.clone());
    validate_status(&new_status)?;
    let new_allowed = body
        .allowed_backends
        .unwrap_or_else(|| queue.allowed_backends.clone());
    validate_backends(&state, &new_allowed)?;

    let updated: Queue = diesel::update(queues.find(queue.id))
        .set((
            name.eq(new_name),
            description.eq(body.description.unwrap_or_else(|| queue.description.clone())),
            status.eq(new_status),
            allowed_backends.eq(&new_allowed),
        ))
        .get_result(&mut conn)?;

    // Meetings waiting in line may not keep a meeting type the queue no
    // longer allows; started ones are past the point of no return and keep
    // theirs.
    meetings::reset_disallowed_unstarted(&mut conn, &updated, &state.registry)?;

    state
        .publisher
        .publish(&queue_topic(updated.id), ChangeEvent::updated("queue", updated.id));
    let payload = queue_payload(&mut conn, updated)?;
    Ok(Json(payload))
}

async fn delete_queue(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Path(queue_id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    use schema::queues::dsl::*;
    let mut conn = state.conn.get()?;
    let queue = load_queue(&mut conn, queue_id)?;
    require_host(&mut conn, &queue, &user)?;

    diesel::update(queues.find(queue.id))
        .set(deleted_at.eq(Some(chrono::Utc::now())))
        .execute(&mut conn)?;

    state
        .publisher
        .publish(&queue_topic(queue.id), ChangeEvent::deleted("queue", queue.id));
    Ok(Json(serde_json::json!({ "detail": "queue deleted" })))
}

#[derive(Debug, Deserialize)]
struct HostAdd {
    user_id: Uuid,
}

async fn add_host(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Path(queue_id): Path<i64>,
    Json(body): Json<HostAdd>,
) -> Result<Json<QueuePayload>, ApiError> {
    let mut conn = state.conn.get()?;
    let queue = load_queue(&mut conn, queue_id)?;
    require_host(&mut conn, &queue, &user)?;
    let new_host = crate::users::load_user(&mut conn, body.user_id)?;

    if !is_host(&mut conn, queue.id, new_host.id)? {
        diesel::insert_into(schema::queue_hosts::table)
            .values(NewQueueHost {
                queue_id: queue.id,
                user_id: new_host.id,
            })
            .execute(&mut conn)?;
        state
            .publisher
            .publish(&queue_topic(queue.id), ChangeEvent::updated("queue", queue.id));
        state
            .publisher
            .publish(&user_topic(new_host.id), ChangeEvent::updated("user", queue.id));
    }
    let payload = queue_payload(&mut conn, queue)?;
    Ok(Json(payload))
}

async fn remove_host(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Path((queue_id, host_id)): Path<(i64, Uuid)>,
) -> Result<Json<QueuePayload>, ApiError> {
    let mut conn = state.conn.get()?;
    let queue = load_queue(&mut conn, queue_id)?;
    require_host(&mut conn, &queue, &user)?;

    let hosts = queue_hosts(&mut conn, queue.id)?;
    if hosts.len() == 1 && hosts[0].id == host_id {
        return Err(ApiError::Validation(
            "a queue must keep at least one host".to_string(),
        ));
    }

    let removed = diesel::delete(
        schema::queue_hosts::table
            .filter(schema::queue_hosts::queue_id.eq(queue.id))
            .filter(schema::queue_hosts::user_id.eq(host_id)),
    )
    .execute(&mut conn)?;
    if removed > 0 {
        state
            .publisher
            .publish(&queue_topic(queue.id), ChangeEvent::updated("queue", queue.id));
        state
            .publisher
            .publish(&user_topic(host_id), ChangeEvent::updated("user", queue.id));
    }
    let payload = queue_payload(&mut conn, queue)?;
    Ok(Json(payload))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/queues", get(list_queues).post(create_queue))
        .route("/api/queues/search", get(search_queues))
        .route(
            "/api/queues/:queue_id",
            get(get_queue).patch(update_queue).delete(delete_queue),
        )
        .route("/api/queues/:queue_id/hosts", post(add_host))
        .route("/api/queues/:queue_id/hosts/:host_id", delete(remove_host))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn queue_with(allowed: &[&str]) -> Queue {
        Queue {
            id: 1,
            name: "Office Hours".to_string(),
            description: String::new(),
            status: QUEUE_STATUS_OPEN.to_string(),
            allowed_backends: allowed.iter().map(|b| b.to_string()).collect(),
            created_at: Utc::now(),
            deleted_at: None,
        }
    }

    #[test]
    fn replacing_absent_backend_is_a_no_op() {
        let mut queue = queue_with(&["inperson"]);
        assert!(!queue.replace_allowed_backend_with_default("zoom", "inperson"));
        assert_eq!(queue.allowed_backends, vec!["inperson"]);
    }

    #[test]
    fn replacing_backend_adds_default_when_missing() {
        let mut queue = queue_with(&["zoom"]);
        assert!(queue.replace_allowed_backend_with_default("zoom", "inperson"));
        assert_eq!(queue.allowed_backends, vec!["inperson"]);
    }

    #[test]
    fn replacing_backend_does_not_duplicate_default() {
        let mut queue = queue_with(&["zoom", "inperson"]);
        assert!(queue.replace_allowed_backend_with_default("zoom", "inperson"));
        assert_eq!(queue.allowed_backends, vec!["inperson"]);
    }

    #[test]
    fn allowed_list_never_empties() {
        let mut queue = queue_with(&["bluejeans"]);
        queue.replace_allowed_backend_with_default("bluejeans", "inperson");
        assert!(!queue.allowed_backends.is_empty());
    }

    #[test]
    fn queue_status_gates_is_open() {
        let mut queue = queue_with(&["inperson"]);
        assert!(queue.is_open());
        queue.status = QUEUE_STATUS_CLOSED.to_string();
        assert!(!queue.is_open());
    }

    #[test]
    fn status_validation_rejects_unknown_values() {
        assert!(validate_status(QUEUE_STATUS_OPEN).is_ok());
        assert!(validate_status(QUEUE_STATUS_CLOSED).is_ok());
        assert!(validate_status("paused").is_err());
    }
}
