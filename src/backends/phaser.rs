use diesel::prelude::*;

use super::registry::BackendRegistry;
use crate::meetings::choose_backend_type;
use crate::shared::error::ApiError;
use crate::shared::models::{schema, Meeting, Queue};

/// Administrative batch operation: scrub a backend that is no longer
/// enabled out of every queue's allow-list and off every meeting that still
/// references it. Runs out-of-band, never from the request path, and fires
/// no notifications or realtime updates.
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseOutOptions {
    /// Started meetings on the backend are otherwise left alone; this
    /// destroys them.
    pub delete_started: bool,
    /// Compute and log everything, persist nothing.
    pub dry_run: bool,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct PhaseOutReport {
    pub queues_scrubbed: usize,
    pub meetings_reassigned: usize,
    pub meetings_deleted: usize,
    pub failures: usize,
}

/// Split a queue's meetings into the ones phase-out reassigns (waiting in
/// line on the backend) and the ones it may delete (already started on it).
pub fn partition_affected<'a>(
    meetings: &'a [Meeting],
    backend: &str,
) -> (Vec<&'a Meeting>, Vec<&'a Meeting>) {
    let mut to_reassign = Vec::new();
    let mut started = Vec::new();
    for meeting in meetings {
        if meeting.backend_type != backend {
            continue;
        }
        if meeting.is_started() {
            started.push(meeting);
        } else {
            to_reassign.push(meeting);
        }
    }
    (to_reassign, started)
}

/// Replacement choices for the meetings step 2 moves, computed against the
/// queue's current allow-list. Callers scrub the queue first so the choice
/// reflects the just-removed backend. Meetings with no viable replacement
/// are skipped and counted.
pub fn plan_reassignments(
    queue: &Queue,
    to_reassign: &[&Meeting],
    registry: &BackendRegistry,
) -> (Vec<(i64, String)>, usize) {
    let mut plans = Vec::with_capacity(to_reassign.len());
    let mut failures = 0;
    for meeting in to_reassign {
        match choose_backend_type(None, queue, registry) {
            Ok(replacement) => plans.push((meeting.id, replacement)),
            Err(err) => {
                tracing::error!(meeting = meeting.id, queue = queue.id, error = %err,
                    "no replacement backend available, skipping meeting");
                failures += 1;
            }
        }
    }
    (plans, failures)
}

pub fn phase_out(
    conn: &mut PgConnection,
    registry: &BackendRegistry,
    backend: &str,
    options: PhaseOutOptions,
) -> Result<PhaseOutReport, ApiError> {
    if registry.contains(backend) {
        return Err(ApiError::Validation(format!(
            "{backend} is still enabled; disable it before phasing it out"
        )));
    }
    let mut report = PhaseOutReport::default();

    // Step 1: scrub the allow-lists. Later steps see the post-scrub queues.
    let mut affected: Vec<Queue> = {
        use schema::queues::dsl::*;
        queues
            .filter(deleted_at.is_null())
            .filter(allowed_backends.contains(vec![backend.to_string()]))
            .order(id.asc())
            .load::<Queue>(conn)?
    };
    for queue in &mut affected {
        if !queue.replace_allowed_backend_with_default(backend, registry.default_backend()) {
            continue;
        }
        tracing::info!(queue = queue.id, backend, allowed = ?queue.allowed_backends,
            dry_run = options.dry_run, "removing backend from queue allow-list");
        if !options.dry_run {
            use schema::queues::dsl::*;
            if let Err(err) = diesel::update(queues.find(queue.id))
                .set(allowed_backends.eq(&queue.allowed_backends))
                .execute(conn)
            {
                tracing::error!(queue = queue.id, error = %err,
                    "failed to scrub queue, continuing with the rest");
                report.failures += 1;
                continue;
            }
        }
        report.queues_scrubbed += 1;
    }

    // Step 2: move waiting meetings off the backend, choosing their new
    // type against the just-scrubbed allow-lists.
    for queue in &affected {
        let queue_meetings: Vec<Meeting> = {
            use schema::meetings::dsl::*;
            meetings
                .filter(queue_id.eq(queue.id))
                .order(id.asc())
                .load::<Meeting>(conn)?
        };
        let (to_reassign, _) = partition_affected(&queue_meetings, backend);
        let (plans, failures) = plan_reassignments(queue, &to_reassign, registry);
        report.failures += failures;
        for (target, replacement) in plans {
            tracing::info!(meeting = target, queue = queue.id, from = backend,
                to = %replacement, dry_run = options.dry_run, "reassigning meeting");
            if !options.dry_run {
                use schema::meetings::dsl::*;
                if let Err(err) = diesel::update(meetings.find(target))
                    .set(backend_type.eq(&replacement))
                    .execute(conn)
                {
                    tracing::error!(meeting = target, error = %err,
                        "failed to reassign meeting, continuing with the rest");
                    report.failures += 1;
                    continue;
                }
            }
            report.meetings_reassigned += 1;
        }
    }

    // Step 3: optionally destroy started meetings still on the backend,
    // wherever their queue is. Attendees detach first, as with any delete.
    if options.delete_started {
        let started: Vec<Meeting> = {
            use schema::meetings::dsl::*;
            meetings
                .filter(backend_type.eq(backend))
                .order(id.asc())
                .load::<Meeting>(conn)?
        };
        for meeting in started.iter().filter(|m| m.is_started()) {
            tracing::info!(meeting = meeting.id, backend, dry_run = options.dry_run,
                "deleting started meeting");
            if !options.dry_run {
                let deleted = conn.transaction::<_, diesel::result::Error, _>(|conn| {
                    {
                        use schema::attendees::dsl::*;
                        diesel::delete(attendees.filter(meeting_id.eq(meeting.id)))
                            .execute(conn)?;
                    }
                    use schema::meetings::dsl::*;
                    diesel::delete(meetings.find(meeting.id)).execute(conn)?;
                    Ok(())
                });
                if let Err(err) = deleted {
                    tracing::error!(meeting = meeting.id, error = %err,
                        "failed to delete meeting, continuing with the rest");
                    report.failures += 1;
                    continue;
                }
            }
            report.meetings_deleted += 1;
        }
    }

    tracing::info!(
        backend,
        queues = report.queues_scrubbed,
        reassigned = report.meetings_reassigned,
        deleted = report.meetings_deleted,
        failures = report.failures,
        dry_run = options.dry_run,
        "phase-out complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::inperson::InPersonBackend;
    use crate::backends::{BackendError, BackendPublicData, MeetingBackend};
    use crate::shared::models::{User, QUEUE_STATUS_OPEN};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Arc;
    use uuid::Uuid;

    struct StubBackend(&'static str);

    #[async_trait]
    impl MeetingBackend for StubBackend {
        fn name(&self) -> &'static str {
            self.0
        }

        fn public_data(&self) -> BackendPublicData {
            BackendPublicData {
                name: self.0,
                friendly_name: self.0,
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

    fn meeting(id: i64, backend: &str, started: bool) -> Meeting {
        Meeting {
            id,
            queue_id: 1,
            assignee_id: started.then(Uuid::new_v4),
            backend_type: backend.to_string(),
            backend_metadata: if started {
                serde_json::json!({"meeting_id": "m"})
            } else {
                serde_json::json!({})
            },
            agenda: String::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn partition_splits_waiting_from_started() {
        let all = vec![
            meeting(1, "zoom", false),
            meeting(2, "zoom", true),
            meeting(3, "inperson", false),
            meeting(4, "zoom", false),
        ];
        let (to_reassign, started) = partition_affected(&all, "zoom");
        assert_eq!(to_reassign.iter().map(|m| m.id).collect::<Vec<_>>(), vec![1, 4]);
        assert_eq!(started.iter().map(|m| m.id).collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn partition_ignores_other_backends() {
        let all = vec![meeting(1, "inperson", false), meeting(2, "inperson", true)];
        let (to_reassign, started) = partition_affected(&all, "zoom");
        assert!(to_reassign.is_empty());
        assert!(started.is_empty());
    }

    #[test]
    fn waiting_meetings_move_to_the_default_and_started_ones_stay() {
        let registry =
            BackendRegistry::from_instances(vec![Arc::new(InPersonBackend)], "inperson").unwrap();
        let mut affected = queue(&["inperson", "zoom"]);
        let queue_meetings = vec![meeting(1, "zoom", false), meeting(2, "zoom", true)];

        assert!(affected.replace_allowed_backend_with_default("zoom", registry.default_backend()));
        assert_eq!(affected.allowed_backends, vec!["inperson"]);

        let (to_reassign, started) = partition_affected(&queue_meetings, "zoom");
        let (plans, failures) = plan_reassignments(&affected, &to_reassign, &registry);
        assert_eq!(failures, 0);
        assert_eq!(plans, vec![(1, "inperson".to_string())]);
        assert_eq!(started.iter().map(|m| m.id).collect::<Vec<_>>(), vec![2]);
    }

    // The replacement choice must see the allow-list as it stands after the
    // scrub: before it, the default is not allowed and the fallback would be
    // the first remaining entry instead.
    #[test]
    fn reassignment_chooses_against_the_scrubbed_allow_list() {
        let registry = BackendRegistry::from_instances(
            vec![Arc::new(InPersonBackend), Arc::new(StubBackend("bluejeans"))],
            "inperson",
        )
        .unwrap();
        let mut affected = queue(&["zoom", "bluejeans"]);
        let queue_meetings = vec![meeting(1, "zoom", false)];
        let (to_reassign, _) = partition_affected(&queue_meetings, "zoom");

        let (before, _) = plan_reassignments(&affected, &to_reassign, &registry);
        assert_eq!(before, vec![(1, "bluejeans".to_string())]);

        affected.replace_allowed_backend_with_default("zoom", registry.default_backend());
        let (after, failures) = plan_reassignments(&affected, &to_reassign, &registry);
        assert_eq!(failures, 0);
        assert_eq!(after, vec![(1, "inperson".to_string())]);
    }
}
