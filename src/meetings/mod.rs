use axum::extract::{Path, State};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::backends::{metadata_is_empty, BackendRegistry};
use crate::queues::{self, load_queue};
use crate::realtime::{queue_topic, user_topic, ChangeEvent};
use crate::shared::error::ApiError;
use crate::shared::models::{schema, Meeting, NewAttendee, NewMeeting, Queue, User};
use crate::shared::state::AppState;
use crate::users::{AuthedUser, ShallowUser};

/// Derived, never stored. A meeting with populated backend metadata has been
/// started; one with an assignee but empty metadata is assigned; anything
/// else is waiting unassigned. The ordering is the lifecycle: a meeting only
/// ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MeetingStatus {
    Unassigned,
    Assigned,
    Started,
}

impl Meeting {
    pub fn status(&self) -> MeetingStatus {
        if !metadata_is_empty(&self.backend_metadata) {
            MeetingStatus::Started
        } else if self.assignee_id.is_some() {
            MeetingStatus::Assigned
        } else {
            MeetingStatus::Unassigned
        }
    }

    pub fn is_started(&self) -> bool {
        self.status() == MeetingStatus::Started
    }
}

/// The single immutability guard on a live meeting: once started, its
/// assignee and meeting type are frozen. Everything else stays editable.
pub fn guard_mutation(
    current: &Meeting,
    new_assignee: Option<Uuid>,
    new_backend_type: &str,
) -> Result<(), ApiError> {
    if current.is_started()
        && (new_assignee != current.assignee_id || new_backend_type != current.backend_type)
    {
        return Err(ApiError::meeting_started());
    }
    Ok(())
}

/// Resolve the meeting type for a queue. An explicit request must name an
/// enabled backend that the queue allows; with no request, prefer the
/// registry default, falling back to the first allowed backend that is
/// still enabled.
pub fn choose_backend_type(
    requested: Option<&str>,
    queue: &Queue,
    registry: &BackendRegistry,
) -> Result<String, ApiError> {
    if let Some(name) = requested {
        if !registry.contains(name) {
            return Err(ApiError::DisabledBackend(name.to_string()));
        }
        if !queue.allowed_backends.iter().any(|b| b == name) {
            return Err(ApiError::NotAllowedBackend(name.to_string()));
        }
        return Ok(name.to_string());
    }
    let default = registry.default_backend();
    if queue.allowed_backends.iter().any(|b| b == default) {
        return Ok(default.to_string());
    }
    queue
        .allowed_backends
        .iter()
        .find(|b| registry.contains(b))
        .cloned()
        .ok_or_else(|| {
            ApiError::DisabledBackend(
                queue
                    .allowed_backends
                    .first()
                    .cloned()
                    .unwrap_or_else(|| default.to_string()),
            )
        })
}

/// Starting is reserved for the assigned host: other hosts of the queue
/// (and anyone while the meeting is unassigned) are turned away before the
/// state machine runs.
pub fn require_assignee(meeting: &Meeting, user: &User) -> Result<(), ApiError> {
    if meeting.assignee_id == Some(user.id) {
        Ok(())
    } else {
        Err(ApiError::Forbidden(
            "only the assigned host may start this meeting".to_string(),
        ))
    }
}

/// Zero-based place in the waiting line, ordered by creation (ids are
/// monotonic). Started meetings are out of the line entirely: they neither
/// occupy a place nor count toward anyone else's.
pub fn line_place_of(queue_meetings: &[Meeting], meeting_id: i64) -> Option<usize> {
    let mut in_line: Vec<&Meeting> = queue_meetings
        .iter()
        .filter(|m| !m.is_started())
        .collect();
    in_line.sort_by_key(|m| m.id);
    in_line.iter().position(|m| m.id == meeting_id)
}

/// State transitions observable by the notification and realtime layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeetingEvent {
    Created { first_in_line: bool },
    Updated,
    Started,
    Deleted,
}

#[derive(Debug, Serialize)]
pub struct MeetingPayload {
    pub id: i64,
    pub queue_id: i64,
    pub backend_type: String,
    pub backend_metadata: serde_json::Value,
    pub agenda: String,
    pub created_at: DateTime<Utc>,
    pub assignee: Option<ShallowUser>,
    pub attendees: Vec<ShallowUser>,
    pub status: MeetingStatus,
    pub line_place: Option<usize>,
}

fn load_queue_meetings(conn: &mut PgConnection, for_queue: i64) -> Result<Vec<Meeting>, ApiError> {
    use schema::meetings::dsl::*;
    Ok(meetings
        .filter(queue_id.eq(for_queue))
        .order(id.asc())
        .load::<Meeting>(conn)?)
}

fn attendee_users(conn: &mut PgConnection, for_meeting: i64) -> Result<Vec<User>, ApiError> {
    use schema::{attendees, users};
    Ok(attendees::table
        .inner_join(users::table)
        .filter(attendees::meeting_id.eq(for_meeting))
        .order(attendees::id.asc())
        .select(User::as_select())
        .load::<User>(conn)?)
}

fn build_payload(
    conn: &mut PgConnection,
    meeting: &Meeting,
    queue_meetings: &[Meeting],
) -> Result<MeetingPayload, ApiError> {
    let assignee = match meeting.assignee_id {
        Some(assignee_id) => Some(ShallowUser::from(&crate::users::load_user(
            conn,
            assignee_id,
        )?)),
        None => None,
    };
    let attendees = attendee_users(conn, meeting.id)?;
    Ok(MeetingPayload {
        id: meeting.id,
        queue_id: meeting.queue_id,
        backend_type: meeting.backend_type.clone(),
        backend_metadata: meeting.backend_metadata.clone(),
        agenda: meeting.agenda.clone(),
        created_at: meeting.created_at,
        assignee,
        attendees: attendees.iter().map(ShallowUser::from).collect(),
        status: meeting.status(),
        line_place: line_place_of(queue_meetings, meeting.id),
    })
}

pub fn meeting_payload(conn: &mut PgConnection, meeting: &Meeting) -> Result<MeetingPayload, ApiError> {
    let queue_meetings = load_queue_meetings(conn, meeting.queue_id)?;
    build_payload(conn, meeting, &queue_meetings)
}

pub fn meetings_for_queue(
    conn: &mut PgConnection,
    for_queue: i64,
) -> Result<Vec<MeetingPayload>, ApiError> {
    let queue_meetings = load_queue_meetings(conn, for_queue)?;
    let mut payloads = Vec::with_capacity(queue_meetings.len());
    for meeting in &queue_meetings {
        payloads.push(build_payload(conn, meeting, &queue_meetings)?);
    }
    Ok(payloads)
}

pub fn line_length(conn: &mut PgConnection, for_queue: i64) -> Result<usize, ApiError> {
    let queue_meetings = load_queue_meetings(conn, for_queue)?;
    Ok(queue_meetings.iter().filter(|m| !m.is_started()).count())
}

/// All meetings the user currently attends, across queues.
pub fn meetings_for_attendee(
    conn: &mut PgConnection,
    attendee: Uuid,
) -> Result<Vec<MeetingPayload>, ApiError> {
    use schema::{attendees, meetings, queues};
    let rows = meetings::table
        .inner_join(attendees::table)
        .inner_join(queues::table)
        .filter(attendees::user_id.eq(attendee))
        .filter(queues::deleted_at.is_null())
        .select(Meeting::as_select())
        .order(meetings::id.asc())
        .load::<Meeting>(conn)?;
    let mut payloads = Vec::with_capacity(rows.len());
    for meeting in &rows {
        payloads.push(meeting_payload(conn, meeting)?);
    }
    Ok(payloads)
}

/// After a queue's allowed list shrinks, meetings still waiting in line may
/// reference a type the queue no longer allows; move them to the queue's
/// fallback choice. Started meetings keep theirs.
pub fn reset_disallowed_unstarted(
    conn: &mut PgConnection,
    queue: &Queue,
    registry: &BackendRegistry,
) -> Result<usize, ApiError> {
    use schema::meetings::dsl::*;
    let queue_meetings = load_queue_meetings(conn, queue.id)?;
    let mut moved = 0;
    for meeting in queue_meetings {
        if meeting.is_started()
            || queue.allowed_backends.iter().any(|b| *b == meeting.backend_type)
        {
            continue;
        }
        let fallback = choose_backend_type(None, queue, registry)?;
        diesel::update(meetings.find(meeting.id))
            .set(backend_type.eq(&fallback))
            .execute(conn)?;
        moved += 1;
    }
    Ok(moved)
}

/// Fan a transition out to the realtime publisher and, for the two
/// transitions that warrant it, to SMS. The state change is already
/// committed by the time this runs, so failures here are logged and
/// swallowed, never reported as a failed mutation.
async fn dispatch(
    state: &AppState,
    queue: &Queue,
    meeting: &Meeting,
    attendees: &[User],
    event: MeetingEvent,
) {
    let change = match event {
        MeetingEvent::Created { .. } => ChangeEvent::created("meeting", meeting.id),
        MeetingEvent::Deleted => ChangeEvent::deleted("meeting", meeting.id),
        _ => ChangeEvent::updated("meeting", meeting.id),
    };
    state.publisher.publish(&queue_topic(queue.id), change.clone());
    for attendee in attendees {
        state.publisher.publish(&user_topic(attendee.id), change.clone());
    }

    match event {
        MeetingEvent::Created { first_in_line: true } => {
            let hosts = state
                .conn
                .get()
                .map_err(ApiError::from)
                .and_then(|mut conn| queues::queue_hosts(&mut conn, queue.id));
            match hosts {
                Ok(hosts) => {
                    state.notifier.queue_has_waiting_attendee(queue, &hosts).await;
                }
                Err(err) => {
                    tracing::error!(queue = queue.id, error = %err,
                        "failed to load hosts for notification, skipping");
                }
            }
        }
        MeetingEvent::Started => {
            state.notifier.meeting_started(queue, attendees).await;
        }
        _ => {}
    }
}

#[derive(Debug, Deserialize)]
struct MeetingCreate {
    attendee_ids: Option<Vec<Uuid>>,
    assignee_id: Option<Uuid>,
    backend_type: Option<String>,
    #[serde(default)]
    agenda: String,
}

async fn create_meeting(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Path(queue_id): Path<i64>,
    Json(body): Json<MeetingCreate>,
) -> Result<Json<MeetingPayload>, ApiError> {
    let mut conn = state.conn.get()?;
    let queue = load_queue(&mut conn, queue_id)?;
    let requester_is_host = queues::is_host(&mut conn, queue.id, user.id)?;

    if !queue.is_open() && !requester_is_host {
        return Err(ApiError::Validation(
            "this queue is closed and not accepting new attendees".to_string(),
        ));
    }

    let mut attendee_ids = body.attendee_ids.unwrap_or_else(|| vec![user.id]);
    let mut seen = HashSet::new();
    attendee_ids.retain(|id| seen.insert(*id));
    if attendee_ids.is_empty() {
        return Err(ApiError::Validation(
            "a meeting needs at least one attendee".to_string(),
        ));
    }
    if !requester_is_host && attendee_ids != [user.id] {
        return Err(ApiError::Forbidden(
            "only hosts may add other attendees".to_string(),
        ));
    }

    let backend = choose_backend_type(body.backend_type.as_deref(), &queue, &state.registry)?;

    if let Some(assignee_id) = body.assignee_id {
        if !requester_is_host {
            return Err(ApiError::Forbidden("only hosts may assign meetings".to_string()));
        }
        if !queues::is_host(&mut conn, queue.id, assignee_id)? {
            return Err(ApiError::Validation(
                "the assignee must be a host of this queue".to_string(),
            ));
        }
    }

    let mut attendee_users_new = Vec::with_capacity(attendee_ids.len());
    for attendee_id in &attendee_ids {
        attendee_users_new.push(crate::users::load_user(&mut conn, *attendee_id)?);
    }

    // One active meeting per attendee, across every queue. Meetings of
    // soft-deleted queues no longer count.
    {
        use schema::{attendees, meetings, queues as queues_table};
        let busy: Vec<Uuid> = attendees::table
            .inner_join(meetings::table.inner_join(queues_table::table))
            .filter(attendees::user_id.eq_any(&attendee_ids))
            .filter(queues_table::deleted_at.is_null())
            .select(attendees::user_id)
            .load::<Uuid>(&mut conn)?;
        if let Some(taken) = busy.first() {
            let username = attendee_users_new
                .iter()
                .find(|u| u.id == *taken)
                .map(|u| u.username.clone())
                .unwrap_or_default();
            return Err(ApiError::Validation(format!(
                "{username} is already attending another meeting"
            )));
        }
    }

    let first_in_line = line_length(&mut conn, queue.id)? == 0;

    let meeting: Meeting = conn.transaction(|conn| {
        let meeting: Meeting = diesel::insert_into(schema::meetings::table)
            .values(NewMeeting {
                queue_id: queue.id,
                assignee_id: body.assignee_id,
                backend_type: backend,
                backend_metadata: serde_json::json!({}),
                agenda: body.agenda,
            })
            .get_result(conn)?;
        for attendee_id in &attendee_ids {
            diesel::insert_into(schema::attendees::table)
                .values(NewAttendee {
                    meeting_id: meeting.id,
                    user_id: *attendee_id,
                })
                .execute(conn)?;
        }
        diesel::result::QueryResult::Ok(meeting)
    })?;

    let payload = meeting_payload(&mut conn, &meeting)?;
    drop(conn);
    dispatch(
        &state,
        &queue,
        &meeting,
        &attendee_users_new,
        MeetingEvent::Created { first_in_line },
    )
    .await;
    Ok(Json(payload))
}

fn load_meeting(conn: &mut PgConnection, meeting_id: i64) -> Result<Meeting, ApiError> {
    use schema::meetings::dsl::*;
    meetings
        .find(meeting_id)
        .first::<Meeting>(conn)
        .optional()?
        .ok_or_else(|| ApiError::NotFound("meeting not found".to_string()))
}

fn require_participant(
    conn: &mut PgConnection,
    meeting: &Meeting,
    user: &User,
) -> Result<bool, ApiError> {
    let is_host = queues::is_host(conn, meeting.queue_id, user.id)?;
    if is_host {
        return Ok(true);
    }
    let attends = attendee_users(conn, meeting.id)?
        .iter()
        .any(|a| a.id == user.id);
    if attends {
        Ok(false)
    } else {
        Err(ApiError::Forbidden(
            "you are not part of this meeting".to_string(),
        ))
    }
}

async fn list_my_meetings(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
) -> Result<Json<Vec<MeetingPayload>>, ApiError> {
    let mut conn = state.conn.get()?;
    Ok(Json(meetings_for_attendee(&mut conn, user.id)?))
}

async fn get_meeting(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Path(meeting_id): Path<i64>,
) -> Result<Json<MeetingPayload>, ApiError> {
    let mut conn = state.conn.get()?;
    let meeting = load_meeting(&mut conn, meeting_id)?;
    require_participant(&mut conn, &meeting, &user)?;
    Ok(Json(meeting_payload(&mut conn, &meeting)?))
}

// Missing means "leave alone", explicit null means "unassign".
fn double_option<'de, D>(de: D) -> Result<Option<Option<Uuid>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<Uuid>::deserialize(de).map(Some)
}

#[derive(Debug, Deserialize)]
struct MeetingUpdate {
    #[serde(default, deserialize_with = "double_option")]
    assignee_id: Option<Option<Uuid>>,
    backend_type: Option<String>,
    agenda: Option<String>,
}

async fn update_meeting(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Path(meeting_id): Path<i64>,
    Json(body): Json<MeetingUpdate>,
) -> Result<Json<MeetingPayload>, ApiError> {
    let mut conn = state.conn.get()?;

    let (updated, queue) = conn.transaction::<_, ApiError, _>(|conn| {
        use schema::meetings::dsl::*;
        let meeting: Meeting = meetings
            .find(meeting_id)
            .for_update()
            .first::<Meeting>(conn)
            .optional()?
            .ok_or_else(|| ApiError::NotFound("meeting not found".to_string()))?;
        let queue = load_queue(conn, meeting.queue_id)?;
        let requester_is_host = require_participant(conn, &meeting, &user)?;

        let new_assignee = match body.assignee_id {
            Some(change) => {
                if !requester_is_host {
                    return Err(ApiError::Forbidden(
                        "only hosts may assign meetings".to_string(),
                    ));
                }
                if let Some(assignee) = change {
                    if !queues::is_host(conn, queue.id, assignee)? {
                        return Err(ApiError::Validation(
                            "the assignee must be a host of this queue".to_string(),
                        ));
                    }
                }
                change
            }
            None => meeting.assignee_id,
        };
        let new_backend = match &body.backend_type {
            Some(requested) => {
                choose_backend_type(Some(requested.as_str()), &queue, &state.registry)?
            }
            None => meeting.backend_type.clone(),
        };
        guard_mutation(&meeting, new_assignee, &new_backend)?;

        let updated: Meeting = diesel::update(meetings.find(meeting.id))
            .set((
                assignee_id.eq(new_assignee),
                backend_type.eq(&new_backend),
                agenda.eq(body.agenda.clone().unwrap_or_else(|| meeting.agenda.clone())),
            ))
            .get_result(conn)?;
        Ok((updated, queue))
    })?;

    let attendees = attendee_users(&mut conn, updated.id)?;
    let payload = meeting_payload(&mut conn, &updated)?;
    drop(conn);
    dispatch(&state, &queue, &updated, &attendees, MeetingEvent::Updated).await;
    Ok(Json(payload))
}

async fn start_locked(
    state: &AppState,
    conn: &mut PgConnection,
    meeting_id: i64,
) -> Result<(Meeting, bool), ApiError> {
    use schema::meetings::dsl::*;
    let current: Meeting = meetings
        .find(meeting_id)
        .first::<Meeting>(conn)
        .optional()?
        .ok_or_else(|| ApiError::NotFound("meeting not found".to_string()))?;
    if current.is_started() {
        tracing::debug!(meeting = current.id, "meeting was started concurrently");
        return Ok((current, false));
    }

    // Unassigned start is a caller bug, not user input.
    let assignee = current.assignee_id.ok_or_else(|| {
        ApiError::Internal(format!("meeting {} started without an assignee", current.id))
    })?;
    let backend = state.registry.get(&current.backend_type)?;
    let assignee = crate::users::load_user(conn, assignee)?;

    let new_metadata = backend
        .save_user_meeting(current.backend_metadata.clone(), &assignee)
        .await
        .map_err(|err| {
            tracing::error!(meeting = current.id, backend = %current.backend_type, error = %err,
                "backend failed to create the meeting");
            ApiError::backend_failure(&current.backend_type)
        })?;

    let updated: Meeting = diesel::update(meetings.find(current.id))
        .set(backend_metadata.eq(&new_metadata))
        .get_result(conn)?;
    Ok((updated, true))
}

async fn start_meeting(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Path(meeting_id): Path<i64>,
) -> Result<Json<MeetingPayload>, ApiError> {
    let mut conn = state.conn.get()?;
    let meeting = load_meeting(&mut conn, meeting_id)?;
    let queue = load_queue(&mut conn, meeting.queue_id)?;
    require_assignee(&meeting, &user)?;

    // Re-running start on a live meeting is a no-op, not an error.
    if meeting.is_started() {
        return Ok(Json(meeting_payload(&mut conn, &meeting)?));
    }

    // Session advisory lock keyed by meeting id: at most one first-time
    // start reaches the provider. Held on this connection across the call;
    // no row lock is taken.
    diesel::sql_query("SELECT pg_advisory_lock($1)")
        .bind::<diesel::sql_types::BigInt, _>(meeting.id)
        .execute(&mut conn)?;
    let outcome = start_locked(&state, &mut conn, meeting.id).await;
    if let Err(err) = diesel::sql_query("SELECT pg_advisory_unlock($1)")
        .bind::<diesel::sql_types::BigInt, _>(meeting.id)
        .execute(&mut conn)
    {
        tracing::warn!(meeting = meeting.id, error = %err, "failed to release advisory lock");
    }
    let (persisted, fresh_transition) = outcome?;

    let attendees = attendee_users(&mut conn, persisted.id)?;
    let payload = meeting_payload(&mut conn, &persisted)?;
    drop(conn);
    if fresh_transition {
        dispatch(&state, &queue, &persisted, &attendees, MeetingEvent::Started).await;
    }
    Ok(Json(payload))
}

async fn delete_meeting(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Path(meeting_id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut conn = state.conn.get()?;
    let meeting = load_meeting(&mut conn, meeting_id)?;
    let queue = load_queue(&mut conn, meeting.queue_id)?;
    require_participant(&mut conn, &meeting, &user)?;

    let departed = attendee_users(&mut conn, meeting.id)?;
    conn.transaction::<_, ApiError, _>(|conn| {
        // Attendees detach one by one before the row goes; each detachment
        // is its own observable event.
        for attendee in &departed {
            use schema::attendees::dsl::*;
            diesel::delete(
                attendees
                    .filter(schema::attendees::meeting_id.eq(meeting.id))
                    .filter(user_id.eq(attendee.id)),
            )
            .execute(conn)?;
        }
        use schema::meetings::dsl::*;
        diesel::delete(meetings.find(meeting.id)).execute(conn)?;
        Ok(())
    })?;
    drop(conn);

    for attendee in &departed {
        state
            .publisher
            .publish(&user_topic(attendee.id), ChangeEvent::deleted("meeting", meeting.id));
    }
    dispatch(&state, &queue, &meeting, &[], MeetingEvent::Deleted).await;
    Ok(Json(serde_json::json!({ "detail": "meeting deleted" })))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/queues/:queue_id/meetings", post(create_meeting))
        .route("/api/meetings", get(list_my_meetings))
        .route(
            "/api/meetings/:meeting_id",
            get(get_meeting)
                .patch(update_meeting)
                .delete(delete_meeting),
        )
        .route("/api/meetings/:meeting_id/start", post(start_meeting))
}

#[cfg(test)]
pub fn test_meeting(id: i64, queue_id: i64) -> Meeting {
    Meeting {
        id,
        queue_id,
        assignee_id: None,
        backend_type: "inperson".to_string(),
        backend_metadata: serde_json::json!({}),
        agenda: String::new(),
        created_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::inperson::InPersonBackend;
    use crate::backends::{BackendError, BackendPublicData, MeetingBackend};
    use crate::shared::models::QUEUE_STATUS_OPEN;
    use crate::users::test_user;
    use async_trait::async_trait;

    struct FakeZoom;

    #[async_trait]
    impl MeetingBackend for FakeZoom {
        fn name(&self) -> &'static str {
            "zoom"
        }

        fn public_data(&self) -> BackendPublicData {
            BackendPublicData {
                name: "zoom",
                friendly_name: "Zoom",
                enabled: true,
                docs_url: None,
                profile_url: None,
                telephone_num: None,
                intl_telephone_url: None,
            }
        }

        async fn is_authorized(&self, _user: &User) -> bool {
            true
        }

        async fn save_user_meeting(
            &self,
            metadata: serde_json::Value,
            _assignee: &User,
        ) -> Result<serde_json::Value, BackendError> {
            Ok(metadata)
        }
    }

    fn registry() -> BackendRegistry {
        BackendRegistry::from_instances(
            vec![Arc::new(InPersonBackend), Arc::new(FakeZoom)],
            "inperson",
        )
        .unwrap()
    }

    fn queue_allowing(allowed: &[&str]) -> Queue {
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
    fn status_is_derived_from_assignee_and_metadata() {
        let mut meeting = test_meeting(1, 1);
        assert_eq!(meeting.status(), MeetingStatus::Unassigned);

        meeting.assignee_id = Some(Uuid::new_v4());
        assert_eq!(meeting.status(), MeetingStatus::Assigned);

        meeting.backend_metadata = serde_json::json!({"meeting_id": "abc"});
        assert_eq!(meeting.status(), MeetingStatus::Started);
    }

    #[test]
    fn status_ordering_follows_the_lifecycle() {
        assert!(MeetingStatus::Unassigned < MeetingStatus::Assigned);
        assert!(MeetingStatus::Assigned < MeetingStatus::Started);
    }

    #[test]
    fn started_meeting_rejects_assignee_change() {
        let mut meeting = test_meeting(1, 1);
        meeting.assignee_id = Some(Uuid::new_v4());
        meeting.backend_metadata = serde_json::json!({"meeting_id": "abc"});

        let err = guard_mutation(&meeting, Some(Uuid::new_v4()), "inperson").unwrap_err();
        assert!(matches!(err, ApiError::MeetingStarted(_)));
    }

    #[test]
    fn started_meeting_rejects_backend_change() {
        let mut meeting = test_meeting(1, 1);
        let assignee = Uuid::new_v4();
        meeting.assignee_id = Some(assignee);
        meeting.backend_metadata = serde_json::json!({"meeting_id": "abc"});

        let err = guard_mutation(&meeting, Some(assignee), "zoom").unwrap_err();
        assert!(matches!(err, ApiError::MeetingStarted(_)));
    }

    #[test]
    fn started_meeting_accepts_identical_values() {
        let mut meeting = test_meeting(1, 1);
        let assignee = Uuid::new_v4();
        meeting.assignee_id = Some(assignee);
        meeting.backend_metadata = serde_json::json!({"meeting_id": "abc"});

        assert!(guard_mutation(&meeting, Some(assignee), "inperson").is_ok());
    }

    #[test]
    fn only_the_assignee_may_start() {
        let assignee = test_user("assignee");
        let other_host = test_user("other_host");
        let mut meeting = test_meeting(1, 1);
        meeting.assignee_id = Some(assignee.id);

        assert!(require_assignee(&meeting, &assignee).is_ok());
        let err = require_assignee(&meeting, &other_host).unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));
    }

    #[test]
    fn unassigned_meeting_cannot_be_started() {
        let meeting = test_meeting(1, 1);
        let err = require_assignee(&meeting, &test_user("hostie")).unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));
    }

    #[test]
    fn unstarted_meeting_accepts_any_change() {
        let mut meeting = test_meeting(1, 1);
        meeting.assignee_id = Some(Uuid::new_v4());
        assert!(guard_mutation(&meeting, None, "zoom").is_ok());
    }

    #[test]
    fn requested_backend_must_be_enabled() {
        let err = choose_backend_type(Some("bluejeans"), &queue_allowing(&["bluejeans"]), &registry())
            .unwrap_err();
        assert!(matches!(err, ApiError::DisabledBackend(name) if name == "bluejeans"));
    }

    #[test]
    fn requested_backend_must_be_allowed_by_queue() {
        let err =
            choose_backend_type(Some("zoom"), &queue_allowing(&["inperson"]), &registry())
                .unwrap_err();
        assert!(matches!(err, ApiError::NotAllowedBackend(name) if name == "zoom"));
    }

    #[test]
    fn default_backend_wins_when_allowed() {
        let chosen =
            choose_backend_type(None, &queue_allowing(&["zoom", "inperson"]), &registry()).unwrap();
        assert_eq!(chosen, "inperson");
    }

    #[test]
    fn first_allowed_backend_wins_when_default_is_not() {
        let chosen = choose_backend_type(None, &queue_allowing(&["zoom"]), &registry()).unwrap();
        assert_eq!(chosen, "zoom");
    }

    #[test]
    fn no_enabled_allowed_backend_is_an_error() {
        let err =
            choose_backend_type(None, &queue_allowing(&["bluejeans"]), &registry()).unwrap_err();
        assert!(matches!(err, ApiError::DisabledBackend(_)));
    }

    fn unreachable_state() -> AppState {
        use diesel::r2d2::ConnectionManager;
        let manager = ConnectionManager::<PgConnection>::new("postgres://localhost/void");
        let pool = diesel::r2d2::Pool::builder()
            .max_size(1)
            .connection_timeout(std::time::Duration::from_millis(10))
            .build_unchecked(manager);
        AppState {
            conn: pool,
            config: crate::config::AppConfig {
                server: crate::config::ServerConfig {
                    host: "127.0.0.1".to_string(),
                    port: 0,
                },
                database_url: String::new(),
                public_base_url: "http://localhost".to_string(),
                default_backend: "inperson".to_string(),
                twilio: None,
                zoom: None,
                bluejeans: None,
            },
            registry: Arc::new(registry()),
            publisher: Arc::new(crate::realtime::UpdatePublisher::new()),
            notifier: Arc::new(crate::notify::NotificationDispatcher::new(
                None,
                "http://localhost".to_string(),
            )),
        }
    }

    // The meeting row is committed before fan-out runs; a lookup failure in
    // the notification path must not surface as a failed mutation.
    #[tokio::test]
    async fn dispatch_survives_a_failed_host_lookup() {
        let state = unreachable_state();
        let queue = queue_allowing(&["inperson"]);
        let meeting = test_meeting(1, 1);
        dispatch(
            &state,
            &queue,
            &meeting,
            &[],
            MeetingEvent::Created { first_in_line: true },
        )
        .await;
        dispatch(&state, &queue, &meeting, &[], MeetingEvent::Started).await;
    }

    #[test]
    fn line_place_counts_only_unstarted_meetings() {
        let mut started = test_meeting(1, 1);
        started.assignee_id = Some(Uuid::new_v4());
        started.backend_metadata = serde_json::json!({"meeting_id": "abc"});
        let waiting_first = test_meeting(2, 1);
        let waiting_second = test_meeting(3, 1);
        let all = vec![started.clone(), waiting_first, waiting_second];

        assert_eq!(line_place_of(&all, 2), Some(0));
        assert_eq!(line_place_of(&all, 3), Some(1));
        assert_eq!(line_place_of(&all, 1), None);
    }

    #[test]
    fn line_place_orders_by_id_regardless_of_input_order() {
        let all = vec![test_meeting(9, 1), test_meeting(3, 1), test_meeting(5, 1)];
        assert_eq!(line_place_of(&all, 3), Some(0));
        assert_eq!(line_place_of(&all, 5), Some(1));
        assert_eq!(line_place_of(&all, 9), Some(2));
    }
}
