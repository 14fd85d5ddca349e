//! Relay errors. All are scoped to the requesting connection; none is fatal.

use thiserror::Error;

use crate::protocol::{ErrorReason, SessionId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Join while already a member of another session.
    #[error("Already joined session {current}")]
    AlreadyJoined { current: SessionId },
    /// Operation against a session with no registry entry.
    #[error("Unknown session {0}")]
    UnknownSession(SessionId),
    /// Change or presence from a participant outside the target session.
    #[error("Participant is not a member of the session")]
    NotAMember,
    /// Session already holds the configured maximum of participants.
    #[error("Session {0} is full")]
    SessionFull(SessionId),
}

impl RelayError {
    /// Wire reason for the `error` frame sent back to the requester.
    pub fn reason(&self) -> ErrorReason {
        match self {
            Self::AlreadyJoined { .. } => ErrorReason::AlreadyJoined,
            Self::UnknownSession(_) => ErrorReason::UnknownSession,
            Self::NotAMember => ErrorReason::NotAMember,
            Self::SessionFull(_) => ErrorReason::SessionFull,
        }
    }
}
