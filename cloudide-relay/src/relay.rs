//! Change relay: total ordering and fan-out of document edits.
//!
//! ```text
//! { kind: "change", payload } from A
//!       │
//!       ▼
//! SessionRegistry::sequence_change()        ── session lock held ──┐
//!       │  membership check (NotAMember)                          │
//!       │  sequence = counter + 1                                 │
//!       ▼                                                         │
//! { kind: "update", sequence, ... } → outbox of every member ≠ A  │
//!                                                                 ┘
//! ```
//!
//! Sequencing and enumeration of recipients happen under one session lock,
//! and outbox sends never block, so every recipient's outbox receives
//! updates in strictly increasing sequence order.

use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::RelayError;
use crate::outbox::Outboxes;
use crate::protocol::{unix_millis, Change, ParticipantId, SessionId};
use crate::registry::SessionRegistry;

pub struct ChangeRelay {
    registry: Arc<SessionRegistry>,
    outboxes: Arc<Outboxes>,
    changes_relayed: AtomicU64,
}

impl ChangeRelay {
    pub fn new(registry: Arc<SessionRegistry>, outboxes: Arc<Outboxes>) -> Self {
        Self {
            registry,
            outboxes,
            changes_relayed: AtomicU64::new(0),
        }
    }

    /// Sequence a change and fan it out to every member except the origin.
    ///
    /// On error nothing is sequenced and nothing is sent.
    pub async fn on_change(
        &self,
        session_id: &SessionId,
        origin: ParticipantId,
        payload: Value,
    ) -> Result<Change, RelayError> {
        let timestamp = unix_millis();

        let change = self
            .registry
            .sequence_change(session_id, &origin, |sequence, recipients| {
                let change = Change {
                    session_id: session_id.clone(),
                    origin_participant_id: origin,
                    sequence,
                    payload,
                    timestamp,
                };

                let update = Arc::new(change.to_update());
                let mut delivered = 0usize;
                for recipient in recipients {
                    recipient.last_seen_sequence = sequence;
                    if self.outboxes.deliver(&recipient.participant_id, update.clone()) {
                        delivered += 1;
                    }
                }

                log::debug!(
                    "Change {sequence} from {origin} in session {session_id} relayed to {delivered} peers"
                );
                change
            })
            .await?;

        self.changes_relayed.fetch_add(1, Ordering::Relaxed);
        Ok(change)
    }

    /// Total number of changes accepted since startup.
    pub fn changes_relayed(&self) -> u64 {
        self.changes_relayed.load(Ordering::Relaxed)
    }
}
