//! Presence tracking for cursor & selection awareness.
//!
//! ## Data flow
//!
//! ```text
//! { kind: "presence", cursor }
//!       │
//!       ▼
//! PresenceTracker::on_presence()  ── overwrite cursor slot (last value wins)
//!       │
//!       ▼
//! { kind: "presence-update" } → every other member of the session
//!
//! SessionRegistry::join/leave
//!       │  (MembershipListener)
//!       ▼
//! { kind: "participant-joined" } / { kind: "presence-removed" } → other members
//! ```
//!
//! Presence is never sequenced and never persisted. Cursors are opaque JSON.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::RelayError;
use crate::outbox::Outboxes;
use crate::protocol::{ParticipantId, ServerMessage, SessionId};
use crate::registry::{MembershipListener, SessionRegistry};

/// Latest cursor per participant, grouped by session.
type CursorTable = HashMap<SessionId, HashMap<ParticipantId, Value>>;

/// Ephemeral, non-authoritative cursor broadcast.
pub struct PresenceTracker {
    registry: Arc<SessionRegistry>,
    outboxes: Arc<Outboxes>,
    cursors: Mutex<CursorTable>,
}

impl PresenceTracker {
    pub fn new(registry: Arc<SessionRegistry>, outboxes: Arc<Outboxes>) -> Self {
        Self {
            registry,
            outboxes,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    /// Record a participant's cursor and broadcast it to the other members.
    ///
    /// Returns the number of members the update was queued for.
    pub async fn on_presence(
        &self,
        session_id: &SessionId,
        participant_id: ParticipantId,
        cursor: Value,
    ) -> Result<usize, RelayError> {
        self.registry
            .with_peers(session_id, &participant_id, |peers| {
                self.table()
                    .entry(session_id.clone())
                    .or_default()
                    .insert(participant_id, cursor.clone());

                let update = Arc::new(ServerMessage::PresenceUpdate {
                    participant_id,
                    cursor,
                });
                let delivered = self.outboxes.deliver_all(peers, update);
                log::trace!(
                    "Presence: {participant_id} moved in session {session_id}, {delivered} peers notified"
                );
                delivered
            })
            .await
    }

    /// Latest known cursor of one participant.
    pub fn cursor_of(&self, session_id: &SessionId, participant_id: &ParticipantId) -> Option<Value> {
        self.table()
            .get(session_id)
            .and_then(|slots| slots.get(participant_id))
            .cloned()
    }

    /// Cursors of every member except `except`, ordered by participant id.
    pub fn snapshot(&self, session_id: &SessionId, except: &ParticipantId) -> Vec<(ParticipantId, Value)> {
        let table = self.table();
        let mut cursors: Vec<(ParticipantId, Value)> = table
            .get(session_id)
            .map(|slots| {
                slots
                    .iter()
                    .filter(|(id, _)| *id != except)
                    .map(|(id, cursor)| (*id, cursor.clone()))
                    .collect()
            })
            .unwrap_or_default();
        cursors.sort_by_key(|(id, _)| *id);
        cursors
    }

    /// Send the joiner one `presence-update` per existing cursor.
    pub fn send_snapshot(&self, session_id: &SessionId, to: &ParticipantId) -> usize {
        self.snapshot(session_id, to)
            .into_iter()
            .filter(|(participant_id, cursor)| {
                let update = ServerMessage::PresenceUpdate {
                    participant_id: *participant_id,
                    cursor: cursor.clone(),
                };
                self.outboxes.deliver(to, Arc::new(update))
            })
            .count()
    }

    /// Number of sessions with at least one recorded cursor.
    pub fn tracked_sessions(&self) -> usize {
        self.table().len()
    }

    fn table(&self) -> std::sync::MutexGuard<'_, CursorTable> {
        self.cursors.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MembershipListener for PresenceTracker {
    fn participant_joined(
        &self,
        session_id: &SessionId,
        participant_id: &ParticipantId,
        others: &[ParticipantId],
    ) {
        let joined = Arc::new(ServerMessage::ParticipantJoined {
            participant_id: *participant_id,
        });
        self.outboxes.deliver_all(others, joined);
        log::debug!("Presence: {participant_id} joined session {session_id}");
    }

    fn participant_left(
        &self,
        session_id: &SessionId,
        participant_id: &ParticipantId,
        remaining: &[ParticipantId],
    ) {
        {
            let mut table = self.table();
            if let Some(slots) = table.get_mut(session_id) {
                slots.remove(participant_id);
            }
            if remaining.is_empty() {
                table.remove(session_id);
            }
        }

        let removed = Arc::new(ServerMessage::PresenceRemoved {
            participant_id: *participant_id,
        });
        self.outboxes.deliver_all(remaining, removed);
        log::debug!("Presence: {participant_id} left session {session_id}");
    }
}
