//! Per-participant delivery channels.
//!
//! Every connected participant owns one unbounded outbox. Fan-out pushes a
//! shared `Arc<ServerMessage>` into each recipient's outbox, so a message is
//! built once no matter how many members receive it. Sends never block and
//! never drop for a live receiver; a participant whose connection task is
//! gone simply stops receiving.
//!
//! Stats are tracked with atomics so the fan-out path takes only the read
//! side of the outbox map.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;

use crate::protocol::{ParticipantId, ServerMessage};

/// Receiving half handed to the connection task.
pub type Inbox = mpsc::UnboundedReceiver<Arc<ServerMessage>>;

/// Statistics for monitoring delivery health.
#[derive(Debug, Clone, Default)]
pub struct DeliveryStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub open_outboxes: usize,
}

struct AtomicDeliveryStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicDeliveryStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// Outbox map: participant → sending half of its channel.
pub struct Outboxes {
    senders: RwLock<HashMap<ParticipantId, mpsc::UnboundedSender<Arc<ServerMessage>>>>,
    atomic_stats: AtomicDeliveryStats,
}

impl Outboxes {
    pub fn new() -> Self {
        Self {
            senders: RwLock::new(HashMap::new()),
            atomic_stats: AtomicDeliveryStats::new(),
        }
    }

    /// Open an outbox for a participant and return its inbox.
    ///
    /// Re-opening replaces the previous channel; the old inbox sees end-of-stream.
    pub fn open(&self, participant_id: ParticipantId) -> Inbox {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(participant_id, tx);
        rx
    }

    /// Close a participant's outbox. Returns `false` if none was open.
    pub fn close(&self, participant_id: &ParticipantId) -> bool {
        self.senders
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(participant_id)
            .is_some()
    }

    /// Queue a message for one participant.
    ///
    /// Returns `true` if the message was queued for a live receiver.
    pub fn deliver(&self, to: &ParticipantId, message: Arc<ServerMessage>) -> bool {
        let senders = self.senders.read().unwrap_or_else(PoisonError::into_inner);
        let delivered = senders
            .get(to)
            .is_some_and(|tx| tx.send(message).is_ok());

        if delivered {
            self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.atomic_stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
            log::debug!("No live outbox for participant {to}, message dropped");
        }
        delivered
    }

    /// Queue a message for each of `recipients`. Returns how many were queued.
    pub fn deliver_all<'a>(
        &self,
        recipients: impl IntoIterator<Item = &'a ParticipantId>,
        message: Arc<ServerMessage>,
    ) -> usize {
        recipients
            .into_iter()
            .filter(|to| self.deliver(to, message.clone()))
            .count()
    }

    pub fn is_open(&self, participant_id: &ParticipantId) -> bool {
        self.senders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(participant_id)
    }

    /// Snapshot of delivery statistics.
    pub fn stats(&self) -> DeliveryStats {
        DeliveryStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            open_outboxes: self
                .senders
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
        }
    }
}

impl Default for Outboxes {
    fn default() -> Self {
        Self::new()
    }
}
