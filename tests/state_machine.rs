use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use officeq::backends::inperson::InPersonBackend;
use officeq::backends::{metadata_is_empty, BackendRegistry, MeetingBackend};
use officeq::meetings::{choose_backend_type, guard_mutation, line_place_of, MeetingStatus};
use officeq::shared::error::ApiError;
use officeq::shared::models::{Meeting, Queue, User, QUEUE_STATUS_OPEN};

fn host(username: &str) -> User {
    User {
        id: Uuid::new_v4(),
        username: username.to_string(),
        email: format!("{username}@example.com"),
        api_token: None,
        phone_number: String::new(),
        phone_verified: false,
        notify_me_host: false,
        notify_me_attendee: false,
        backend_metadata: json!({}),
        otp_token: None,
        otp_phone_number: None,
        otp_expiration: None,
        created_at: Utc::now(),
    }
}

fn queue(allowed: &[&str]) -> Queue {
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

fn waiting_meeting(id: i64) -> Meeting {
    Meeting {
        id,
        queue_id: 1,
        assignee_id: None,
        backend_type: "inperson".to_string(),
        backend_metadata: json!({}),
        agenda: String::new(),
        created_at: Utc::now(),
    }
}

fn registry() -> BackendRegistry {
    BackendRegistry::from_instances(vec![Arc::new(InPersonBackend)], "inperson").unwrap()
}

#[tokio::test]
async fn meeting_walks_the_full_lifecycle() {
    let the_host = host("hostie");
    let mut meeting = waiting_meeting(1);
    assert_eq!(meeting.status(), MeetingStatus::Unassigned);

    // Host assigns themselves.
    meeting.assignee_id = Some(the_host.id);
    assert_eq!(meeting.status(), MeetingStatus::Assigned);

    // Start through the provider; metadata populates and status derives.
    let backend = registry().get("inperson").unwrap();
    meeting.backend_metadata = backend
        .save_user_meeting(meeting.backend_metadata.clone(), &the_host)
        .await
        .unwrap();
    assert!(!metadata_is_empty(&meeting.backend_metadata));
    assert_eq!(meeting.status(), MeetingStatus::Started);

    // A live meeting can no longer be rerouted.
    let err = guard_mutation(&meeting, Some(Uuid::new_v4()), "inperson").unwrap_err();
    assert!(matches!(err, ApiError::MeetingStarted(_)));
    let err = guard_mutation(&meeting, meeting.assignee_id, "zoom").unwrap_err();
    assert!(matches!(err, ApiError::MeetingStarted(_)));

    // Identical values pass the guard, so agenda-only edits still work.
    assert!(guard_mutation(&meeting, meeting.assignee_id, "inperson").is_ok());
    assert_eq!(meeting.status(), MeetingStatus::Started);
}

#[tokio::test]
async fn start_is_idempotent_at_the_metadata_level() {
    let the_host = host("hostie");
    let backend = InPersonBackend;

    let first = backend.save_user_meeting(json!({}), &the_host).await.unwrap();
    let second = backend.save_user_meeting(first.clone(), &the_host).await.unwrap();
    assert_eq!(first, second);
}

#[test]
fn line_places_shift_forward_when_a_meeting_leaves() {
    let m1 = waiting_meeting(1);
    let m2 = waiting_meeting(2);
    let m3 = waiting_meeting(3);

    let all = vec![m1, m2.clone(), m3.clone()];
    assert_eq!(line_place_of(&all, 1), Some(0));
    assert_eq!(line_place_of(&all, 2), Some(1));
    assert_eq!(line_place_of(&all, 3), Some(2));

    // Reads are stable without intervening mutation.
    assert_eq!(line_place_of(&all, 2), Some(1));

    let after_delete = vec![m2, m3];
    assert_eq!(line_place_of(&after_delete, 2), Some(0));
    assert_eq!(line_place_of(&after_delete, 3), Some(1));
}

#[test]
fn started_meetings_leave_the_line() {
    let mut started = waiting_meeting(1);
    started.assignee_id = Some(Uuid::new_v4());
    started.backend_metadata = json!({"started": true});
    let waiting = waiting_meeting(2);

    let all = vec![started, waiting];
    assert_eq!(line_place_of(&all, 1), None);
    assert_eq!(line_place_of(&all, 2), Some(0));
}

#[test]
fn allowed_backends_survive_phase_out_substitution() {
    let mut only_choice = queue(&["zoom"]);
    assert!(only_choice.replace_allowed_backend_with_default("zoom", "inperson"));
    assert_eq!(only_choice.allowed_backends, vec!["inperson"]);

    let mut already_has_default = queue(&["zoom", "inperson"]);
    assert!(already_has_default.replace_allowed_backend_with_default("zoom", "inperson"));
    assert_eq!(already_has_default.allowed_backends, vec!["inperson"]);
}

#[test]
fn backend_choice_respects_registry_and_allow_list() {
    let the_registry = registry();

    let err = choose_backend_type(Some("zoom"), &queue(&["zoom", "inperson"]), &the_registry)
        .unwrap_err();
    assert!(matches!(err, ApiError::DisabledBackend(name) if name == "zoom"));

    let chosen = choose_backend_type(None, &queue(&["inperson"]), &the_registry).unwrap();
    assert_eq!(chosen, "inperson");
}
