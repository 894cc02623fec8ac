use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;
use uuid::Uuid;

pub mod schema {
    diesel::table! {
        users (id) {
            id -> Uuid,
            username -> Varchar,
            email -> Varchar,
            api_token -> Nullable<Varchar>,
            phone_number -> Varchar,
            phone_verified -> Bool,
            notify_me_host -> Bool,
            notify_me_attendee -> Bool,
            backend_metadata -> Jsonb,
            otp_token -> Nullable<Varchar>,
            otp_phone_number -> Nullable<Varchar>,
            otp_expiration -> Nullable<Timestamptz>,
            created_at -> Timestamptz,
        }
    }

    diesel::table! {
        queues (id) {
            id -> Int8,
            name -> Varchar,
            description -> Text,
            status -> Varchar,
            allowed_backends -> Array<Text>,
            created_at -> Timestamptz,
            deleted_at -> Nullable<Timestamptz>,
        }
    }

    diesel::table! {
        queue_hosts (id) {
            id -> Int8,
            queue_id -> Int8,
            user_id -> Uuid,
        }
    }

    diesel::table! {
        meetings (id) {
            id -> Int8,
            queue_id -> Int8,
            assignee_id -> Nullable<Uuid>,
            backend_type -> Varchar,
            backend_metadata -> Jsonb,
            agenda -> Varchar,
            created_at -> Timestamptz,
        }
    }

    diesel::table! {
        attendees (id) {
            id -> Int8,
            meeting_id -> Int8,
            user_id -> Uuid,
            created_at -> Timestamptz,
        }
    }

    diesel::joinable!(queue_hosts -> queues (queue_id));
    diesel::joinable!(queue_hosts -> users (user_id));
    diesel::joinable!(meetings -> queues (queue_id));
    diesel::joinable!(attendees -> meetings (meeting_id));
    diesel::joinable!(attendees -> users (user_id));

    diesel::allow_tables_to_appear_in_same_query!(users, queues, queue_hosts, meetings, attendees);
}

// No Serialize on purpose: api_token and OTP columns stay off the wire.
// User-facing DTOs live in crate::users.
#[derive(Debug, Clone, Queryable, Identifiable, Selectable)]
#[diesel(table_name = schema::users)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub api_token: Option<String>,
    pub phone_number: String,
    pub phone_verified: bool,
    pub notify_me_host: bool,
    pub notify_me_attendee: bool,
    pub backend_metadata: serde_json::Value,
    pub otp_token: Option<String>,
    pub otp_phone_number: Option<String>,
    pub otp_expiration: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = schema::users)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub api_token: Option<String>,
}

pub const QUEUE_STATUS_OPEN: &str = "open";
pub const QUEUE_STATUS_CLOSED: &str = "closed";

#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Serialize)]
#[diesel(table_name = schema::queues)]
pub struct Queue {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub status: String,
    pub allowed_backends: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing)]
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = schema::queues)]
pub struct NewQueue {
    pub name: String,
    pub description: String,
    pub status: String,
    pub allowed_backends: Vec<String>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable)]
#[diesel(table_name = schema::queue_hosts)]
pub struct QueueHost {
    pub id: i64,
    pub queue_id: i64,
    pub user_id: Uuid,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = schema::queue_hosts)]
pub struct NewQueueHost {
    pub queue_id: i64,
    pub user_id: Uuid,
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Serialize)]
#[diesel(table_name = schema::meetings)]
pub struct Meeting {
    pub id: i64,
    pub queue_id: i64,
    pub assignee_id: Option<Uuid>,
    pub backend_type: String,
    pub backend_metadata: serde_json::Value,
    pub agenda: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = schema::meetings)]
pub struct NewMeeting {
    pub queue_id: i64,
    pub assignee_id: Option<Uuid>,
    pub backend_type: String,
    pub backend_metadata: serde_json::Value,
    pub agenda: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable)]
#[diesel(table_name = schema::attendees)]
pub struct Attendee {
    pub id: i64,
    pub meeting_id: i64,
    pub user_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = schema::attendees)]
pub struct NewAttendee {
    pub meeting_id: i64,
    pub user_id: Uuid,
}
