use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::meetings;
use crate::queues;
use crate::shared::error::ApiError;
use crate::shared::state::AppState;
use crate::users::AuthedUser;

const TOPIC_CAPACITY: usize = 64;

pub fn queue_topic(queue_id: i64) -> String {
    format!("queue:{queue_id}")
}

pub fn user_topic(user_id: Uuid) -> String {
    format!("user:{user_id}")
}

#[derive(Debug, Clone, Serialize)]
pub struct ChangeEvent {
    pub entity: &'static str,
    pub action: &'static str,
    pub id: i64,
}

impl ChangeEvent {
    pub fn created(entity: &'static str, id: i64) -> Self {
        Self { entity, action: "created", id }
    }

    pub fn updated(entity: &'static str, id: i64) -> Self {
        Self { entity, action: "updated", id }
    }

    pub fn deleted(entity: &'static str, id: i64) -> Self {
        Self { entity, action: "deleted", id }
    }
}

/// One broadcast channel per topic. Publishing to a topic nobody watches is
/// a no-op; subscribers that fall behind are resynced from a fresh snapshot
/// rather than replayed.
pub struct UpdatePublisher {
    topics: RwLock<HashMap<String, broadcast::Sender<ChangeEvent>>>,
}

impl Default for UpdatePublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdatePublisher {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
        }
    }

    pub fn publish(&self, topic: &str, event: ChangeEvent) {
        let topics = match self.topics.read() {
            Ok(topics) => topics,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(sender) = topics.get(topic) {
            // An Err here just means every receiver has hung up.
            let _ = sender.send(event);
        }
    }

    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<ChangeEvent> {
        let mut topics = match self.topics.write() {
            Ok(topics) => topics,
            Err(poisoned) => poisoned.into_inner(),
        };
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe()
    }
}

fn envelope<T: Serialize>(kind: &str, content: &T) -> Message {
    Message::Text(
        serde_json::json!({ "type": kind, "content": content }).to_string(),
    )
}

type WsSink = SplitSink<WebSocket, Message>;

async fn send_queue_snapshot(
    state: &AppState,
    sink: &mut WsSink,
    queue_id: i64,
    kind: &str,
) -> Result<(), ()> {
    let payload = {
        let mut conn = state.conn.get().map_err(|_| ())?;
        let queue = queues::load_queue(&mut conn, queue_id).map_err(|_| ())?;
        queues::queue_payload(&mut conn, queue).map_err(|_| ())?
    };
    sink.send(envelope(kind, &payload)).await.map_err(|_| ())
}

async fn send_user_snapshot(
    state: &AppState,
    sink: &mut WsSink,
    user_id: Uuid,
    kind: &str,
) -> Result<(), ()> {
    let payload = {
        let mut conn = state.conn.get().map_err(|_| ())?;
        meetings::meetings_for_attendee(&mut conn, user_id).map_err(|_| ())?
    };
    sink.send(envelope(kind, &payload)).await.map_err(|_| ())
}

async fn queue_ws(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Path(queue_id): Path<i64>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    {
        let mut conn = state.conn.get()?;
        let queue = queues::load_queue(&mut conn, queue_id)?;
        if !queues::is_host(&mut conn, queue.id, user.id)? {
            return Err(ApiError::Forbidden(
                "you are not a host of this queue".to_string(),
            ));
        }
    }
    let rx = state.publisher.subscribe(&queue_topic(queue_id));
    Ok(ws.on_upgrade(move |socket| queue_ws_loop(state, socket, queue_id, rx)))
}

async fn queue_ws_loop(
    state: Arc<AppState>,
    socket: WebSocket,
    queue_id: i64,
    mut rx: broadcast::Receiver<ChangeEvent>,
) {
    let (mut sink, mut stream) = socket.split();
    if send_queue_snapshot(&state, &mut sink, queue_id, "init")
        .await
        .is_err()
    {
        return;
    }
    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            },
            event = rx.recv() => match event {
                Ok(event) => {
                    if event.entity == "queue" && event.action == "deleted" {
                        let _ = sink
                            .send(Message::Text(
                                serde_json::json!({ "type": "deleted" }).to_string(),
                            ))
                            .await;
                        break;
                    }
                    if send_queue_snapshot(&state, &mut sink, queue_id, "update")
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(queue = queue_id, skipped, "websocket lagged, resyncing");
                    if send_queue_snapshot(&state, &mut sink, queue_id, "update")
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

async fn user_ws(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    ws: WebSocketUpgrade,
) -> Response {
    let rx = state.publisher.subscribe(&user_topic(user.id));
    ws.on_upgrade(move |socket| user_ws_loop(state, socket, user.id, rx))
}

async fn user_ws_loop(
    state: Arc<AppState>,
    socket: WebSocket,
    user_id: Uuid,
    mut rx: broadcast::Receiver<ChangeEvent>,
) {
    let (mut sink, mut stream) = socket.split();
    if send_user_snapshot(&state, &mut sink, user_id, "init")
        .await
        .is_err()
    {
        return;
    }
    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            },
            event = rx.recv() => match event {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                    if send_user_snapshot(&state, &mut sink, user_id, "update")
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/ws/queues/:queue_id", get(queue_ws))
        .route("/ws/user", get(user_ws))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let publisher = UpdatePublisher::new();
        let mut rx = publisher.subscribe(&queue_topic(3));
        publisher.publish(&queue_topic(3), ChangeEvent::updated("meeting", 17));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.entity, "meeting");
        assert_eq!(event.action, "updated");
        assert_eq!(event.id, 17);
    }

    #[tokio::test]
    async fn publishing_to_an_unwatched_topic_is_a_no_op() {
        let publisher = UpdatePublisher::new();
        publisher.publish(&queue_topic(99), ChangeEvent::deleted("queue", 99));
    }

    #[test]
    fn topics_are_namespaced_per_entity() {
        let user = Uuid::new_v4();
        assert_eq!(queue_topic(5), "queue:5");
        assert_eq!(user_topic(user), format!("user:{user}"));
        assert_ne!(queue_topic(5), user_topic(user));
    }
}
