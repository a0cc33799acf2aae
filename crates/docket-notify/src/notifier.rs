//! Session and room registry with filter-matched fan-out.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use docket_types::OutcomeEvent;

/// One connected auditor.
#[derive(Debug)]
pub struct SessionInfo {
    pub created_at: DateTime<Utc>,
    pub rooms: HashSet<String>,
    pub remote_addr: Option<String>,
    pub user_agent: Option<String>,
    /// Outbound frames; the socket task drains this.
    pub sender: mpsc::UnboundedSender<String>,
}

/// One fan-out group, defined by its filter predicate.
#[derive(Debug)]
struct RoomState {
    filters: HashMap<String, Value>,
    members: HashSet<Uuid>,
    last_activity: DateTime<Utc>,
}

/// Reply to a join request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinAck {
    pub room: String,
    pub member_count: usize,
    pub filters: HashMap<String, Value>,
}

/// Checks a room's filter predicate against an event payload.
///
/// Every filter key must match the corresponding event field; an array
/// filter value matches by set membership.
pub fn filters_match(filters: &HashMap<String, Value>, payload: &Value) -> bool {
    filters.iter().all(|(key, expected)| {
        match (payload.get(key), expected) {
            (Some(actual), Value::Array(options)) => options.contains(actual),
            (Some(actual), other) => actual == other,
            (None, _) => false,
        }
    })
}

/// Room-scoped notifier state for one instance.
///
/// Rooms are created on first join and removed on last leave. Delivery is
/// load-shedding: a room over the fan-out cap is skipped for that event, and
/// a session whose channel is gone is torn out of every room it joined.
pub struct Notifier {
    sessions: Arc<RwLock<HashMap<Uuid, SessionInfo>>>,
    rooms: Arc<RwLock<HashMap<String, RoomState>>>,
    max_room_size: usize,
}

impl Notifier {
    pub fn new(max_room_size: usize) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            rooms: Arc::new(RwLock::new(HashMap::new())),
            max_room_size,
        }
    }

    /// Registers a new session. Returns its connection id.
    pub async fn add_session(
        &self,
        remote_addr: Option<String>,
        user_agent: Option<String>,
        sender: mpsc::UnboundedSender<String>,
    ) -> Uuid {
        let session_id = Uuid::new_v4();
        self.sessions.write().await.insert(
            session_id,
            SessionInfo {
                created_at: Utc::now(),
                rooms: HashSet::new(),
                remote_addr,
                user_agent,
                sender,
            },
        );
        session_id
    }

    /// Removes a session and cleans it out of every room it joined.
    pub async fn remove_session(&self, session_id: Uuid) {
        let joined = {
            let mut sessions = self.sessions.write().await;
            match sessions.remove(&session_id) {
                Some(info) => info.rooms,
                None => return,
            }
        };

        let mut rooms = self.rooms.write().await;
        for room_name in joined {
            if let Some(room) = rooms.get_mut(&room_name) {
                room.members.remove(&session_id);
                if room.members.is_empty() {
                    rooms.remove(&room_name);
                }
            }
        }
    }

    /// Joins a session to a room, creating the room on first join.
    ///
    /// The first joiner's filters define the room; later joiners see the
    /// effective filters in the ack.
    pub async fn join_room(
        &self,
        session_id: Uuid,
        room_name: &str,
        filters: HashMap<String, Value>,
    ) -> Option<JoinAck> {
        {
            let mut sessions = self.sessions.write().await;
            sessions.get_mut(&session_id)?.rooms.insert(room_name.to_string());
        }

        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(room_name.to_string()).or_insert_with(|| RoomState {
            filters,
            members: HashSet::new(),
            last_activity: Utc::now(),
        });
        room.members.insert(session_id);
        room.last_activity = Utc::now();

        Some(JoinAck {
            room: room_name.to_string(),
            member_count: room.members.len(),
            filters: room.filters.clone(),
        })
    }

    /// Removes a session from a room; the room is dropped with its last
    /// member.
    pub async fn leave_room(&self, session_id: Uuid, room_name: &str) {
        {
            let mut sessions = self.sessions.write().await;
            if let Some(info) = sessions.get_mut(&session_id) {
                info.rooms.remove(room_name);
            }
        }

        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get_mut(room_name) {
            room.members.remove(&session_id);
            room.last_activity = Utc::now();
            if room.members.is_empty() {
                rooms.remove(room_name);
            }
        }
    }

    /// Fans an outcome event out to every matching room.
    ///
    /// Returns the number of frames delivered.
    pub async fn dispatch(&self, event: &OutcomeEvent) -> usize {
        let payload = match serde_json::to_value(event) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize outcome event");
                return 0;
            }
        };

        let mut delivered = 0usize;
        let mut dead: Vec<Uuid> = Vec::new();

        {
            let rooms = self.rooms.read().await;
            let sessions = self.sessions.read().await;

            for (room_name, room) in rooms.iter() {
                if !filters_match(&room.filters, &payload) {
                    continue;
                }
                if room.members.len() > self.max_room_size {
                    tracing::warn!(
                        room = %room_name,
                        members = room.members.len(),
                        cap = self.max_room_size,
                        "room over fan-out cap, shedding event"
                    );
                    continue;
                }

                let frame = serde_json::json!({
                    "event": event.event_name(),
                    "room": room_name,
                    "timestamp": Utc::now(),
                    "data": payload,
                })
                .to_string();

                for member in &room.members {
                    match sessions.get(member) {
                        Some(session) if session.sender.send(frame.clone()).is_ok() => {
                            delivered += 1;
                        }
                        _ => dead.push(*member),
                    }
                }
            }
        }

        for session_id in dead {
            tracing::debug!(%session_id, "tearing down dead session");
            self.remove_session(session_id).await;
        }

        delivered
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Rooms a session currently belongs to, for the welcome frame.
    pub async fn session_rooms(&self, session_id: Uuid) -> Vec<String> {
        self.sessions
            .read()
            .await
            .get(&session_id)
            .map(|info| info.rooms.iter().cloned().collect())
            .unwrap_or_default()
    }
}
