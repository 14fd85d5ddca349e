//! Connection gateway: maps transport connections to participants and routes
//! inbound frames to the registry, the change relay, or the presence tracker.
//!
//! Participant lifecycle:
//! ```text
//! Disconnected ──on_connect──▶ Connected ──join──▶ Joined
//!                                  ▲                 │
//!                                  └──── leave ──────┤
//!                                                    ▼
//!                                  on_disconnect ─▶ Disconnected (terminal)
//! ```

use std::sync::Arc;

use crate::error::RelayError;
use crate::outbox::{Inbox, Outboxes};
use crate::presence::PresenceTracker;
use crate::protocol::{ClientMessage, ParticipantId, ServerMessage, SessionId};
use crate::registry::{MembershipListener, SessionRegistry};
use crate::relay::ChangeRelay;

/// A freshly accepted connection: its identity and its outbound message stream.
pub struct Connection {
    pub participant_id: ParticipantId,
    pub inbox: Inbox,
}

pub struct ConnectionGateway {
    registry: Arc<SessionRegistry>,
    outboxes: Arc<Outboxes>,
    presence: Arc<PresenceTracker>,
    relay: ChangeRelay,
}

impl ConnectionGateway {
    /// Wire up a registry, outboxes, presence tracker, and change relay.
    pub fn new(max_participants_per_session: usize) -> Self {
        let registry = Arc::new(SessionRegistry::new(max_participants_per_session));
        let outboxes = Arc::new(Outboxes::new());
        let presence = Arc::new(PresenceTracker::new(registry.clone(), outboxes.clone()));
        let listener: Arc<dyn MembershipListener> = presence.clone();
        registry.subscribe(Arc::downgrade(&listener));
        let relay = ChangeRelay::new(registry.clone(), outboxes.clone());

        Self {
            registry,
            outboxes,
            presence,
            relay,
        }
    }

    /// Allocate an identity for a new transport connection.
    pub fn on_connect(&self) -> Connection {
        let participant_id = ParticipantId::generate();
        let inbox = self.outboxes.open(participant_id);
        log::debug!("Participant {participant_id} connected");
        Connection {
            participant_id,
            inbox,
        }
    }

    /// Join a session and queue the `joined` reply, followed by one
    /// `presence-update` per known cursor. Returns the member list including
    /// the joiner.
    ///
    /// Both are queued before the session lock is released, so the joiner
    /// never sees an update ahead of its `joined` frame.
    pub async fn on_join_request(
        &self,
        participant_id: ParticipantId,
        session_id: &SessionId,
    ) -> Result<Vec<ParticipantId>, RelayError> {
        self.registry
            .join_with(session_id, participant_id, |_, members| {
                self.reply(participant_id, ServerMessage::Joined {
                    session_id: session_id.clone(),
                    members: members.to_vec(),
                });
                self.presence.send_snapshot(session_id, &participant_id);
                members.to_vec()
            })
            .await
    }

    /// Leave whichever session the participant is bound to. Idempotent.
    pub async fn on_leave(&self, participant_id: ParticipantId) -> bool {
        match self.registry.session_of(&participant_id).await {
            Some(session_id) => self.registry.leave(&session_id, &participant_id).await,
            None => false,
        }
    }

    /// Tear down all state of a lost connection.
    pub async fn on_disconnect(&self, participant_id: ParticipantId) {
        self.on_leave(participant_id).await;
        self.outboxes.close(&participant_id);
        log::debug!("Participant {participant_id} disconnected");
    }

    /// Decode a text frame and dispatch it. Malformed frames are dropped.
    pub async fn on_text(&self, participant_id: ParticipantId, text: &str) {
        match ClientMessage::decode(text) {
            Ok(message) => self.on_message(participant_id, message).await,
            Err(e) => log::warn!("Dropping frame from {participant_id}: {e}"),
        }
    }

    /// Dispatch one client message. Rejections are answered with an `error`
    /// frame to the sender only.
    pub async fn on_message(&self, participant_id: ParticipantId, message: ClientMessage) {
        let result = match message {
            ClientMessage::Join { session_id } => self
                .on_join_request(participant_id, &session_id)
                .await
                .map(|_| ()),
            ClientMessage::Leave => {
                self.on_leave(participant_id).await;
                Ok(())
            }
            ClientMessage::Change { payload } => match self.registry.session_of(&participant_id).await {
                Some(session_id) => self
                    .relay
                    .on_change(&session_id, participant_id, payload)
                    .await
                    .map(|_| ()),
                None => Err(RelayError::NotAMember),
            },
            ClientMessage::Presence { cursor } => match self.registry.session_of(&participant_id).await {
                Some(session_id) => self
                    .presence
                    .on_presence(&session_id, participant_id, cursor)
                    .await
                    .map(|_| ()),
                None => Err(RelayError::NotAMember),
            },
            ClientMessage::Ping => {
                self.reply(participant_id, ServerMessage::Pong);
                Ok(())
            }
        };

        if let Err(e) = result {
            log::warn!("Rejected request from {participant_id}: {e}");
            self.reply(participant_id, ServerMessage::Error { reason: e.reason() });
        }
    }

    fn reply(&self, to: ParticipantId, message: ServerMessage) {
        self.outboxes.deliver(&to, Arc::new(message));
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn outboxes(&self) -> &Arc<Outboxes> {
        &self.outboxes
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    pub fn relay(&self) -> &ChangeRelay {
        &self.relay
    }
}
