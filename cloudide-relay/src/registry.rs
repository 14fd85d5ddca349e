//! Session registry: single source of truth for session existence,
//! membership, and per-session sequence numbering.
//!
//! ```text
//! SessionRegistry
//!   RwLock<RegistryState>
//!     sessions: session_id → Arc<Mutex<Session>>   (one lock per session)
//!     bindings: participant_id → session_id        (at most one per participant)
//! ```
//!
//! The registry state lock is never held while waiting for a session lock:
//! lookups clone the session `Arc` and release the state first. Sequencing
//! and fan-out ([`SessionRegistry::sequence_change`]) take only the session
//! lock, so independent sessions proceed in parallel while everything
//! touching one session is serialized.
//!
//! A session is created lazily on first join and dropped when its last
//! participant leaves. A dropped session is marked closed so that callers
//! still holding its `Arc` observe `UnknownSession` instead of writing into
//! a detached session.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, Weak};
use tokio::sync::{Mutex, RwLock};

use crate::error::RelayError;
use crate::protocol::{ParticipantId, SessionId};

/// Observer of membership changes.
///
/// Callbacks run while the affected session is locked, so the member lists
/// passed in are exact. Implementations must not call back into the registry.
pub trait MembershipListener: Send + Sync {
    /// `participant_id` joined; `others` are the members that were already present.
    fn participant_joined(
        &self,
        session_id: &SessionId,
        participant_id: &ParticipantId,
        others: &[ParticipantId],
    );

    /// `participant_id` left; `remaining` is empty when the session was dropped.
    fn participant_left(
        &self,
        session_id: &SessionId,
        participant_id: &ParticipantId,
        remaining: &[ParticipantId],
    );
}

/// One participant bound to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub participant_id: ParticipantId,
    pub session_id: SessionId,
    /// Highest sequence queued for this participant. Advisory.
    pub last_seen_sequence: u64,
}

/// Read-only view of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub sequence_counter: u64,
    pub participants: BTreeSet<ParticipantId>,
}

#[derive(Debug)]
struct Session {
    session_id: SessionId,
    sequence_counter: u64,
    participants: HashMap<ParticipantId, Participant>,
    closed: bool,
}

impl Session {
    fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            sequence_counter: 0,
            participants: HashMap::new(),
            closed: false,
        }
    }

    fn advance(&mut self) -> u64 {
        self.sequence_counter += 1;
        self.sequence_counter
    }

    fn member_ids(&self) -> Vec<ParticipantId> {
        let mut ids: Vec<ParticipantId> = self.participants.keys().copied().collect();
        ids.sort();
        ids
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.session_id.clone(),
            sequence_counter: self.sequence_counter,
            participants: self.participants.keys().copied().collect(),
        }
    }
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<SessionId, Arc<Mutex<Session>>>,
    bindings: HashMap<ParticipantId, SessionId>,
}

pub struct SessionRegistry {
    state: RwLock<RegistryState>,
    max_participants_per_session: usize,
    listeners: std::sync::RwLock<Vec<Weak<dyn MembershipListener>>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new(max_participants_per_session: usize) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            max_participants_per_session,
            listeners: std::sync::RwLock::new(Vec::new()),
        }
    }

    /// Register a membership listener. Dropped listeners are skipped.
    pub fn subscribe(&self, listener: Weak<dyn MembershipListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    fn notify(&self, f: impl Fn(&dyn MembershipListener)) {
        let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
        for listener in listeners.iter().filter_map(Weak::upgrade) {
            f(listener.as_ref());
        }
    }

    /// Return the session, creating an empty one if needed.
    ///
    /// A session created here stays registered with no members until the
    /// next [`SessionRegistry::prune_empty_sessions`] sweep or until someone
    /// joins and leaves it.
    pub async fn create_or_get_session(&self, session_id: &SessionId) -> SessionInfo {
        loop {
            let session = {
                let mut state = self.state.write().await;
                Self::live_entry(&mut state, session_id)
            };
            let session = session.lock().await;
            if !session.closed {
                return session.info();
            }
            drop(session);
            tokio::task::yield_now().await;
        }
    }

    /// Add a participant to a session, creating the session if needed.
    ///
    /// Joining the session the participant is already in is a no-op that
    /// returns the current membership record. Joining any other session fails
    /// with `AlreadyJoined` and leaves every session untouched.
    pub async fn join(
        &self,
        session_id: &SessionId,
        participant_id: ParticipantId,
    ) -> Result<Participant, RelayError> {
        self.join_with(session_id, participant_id, |participant, _| participant.clone())
            .await
    }

    /// [`SessionRegistry::join`], then run `on_joined` with the membership
    /// record and every member (joiner included, sorted) before the session
    /// lock is released.
    ///
    /// Anything queued for the joiner inside `on_joined` lands ahead of every
    /// change or presence update sequenced after the join.
    pub async fn join_with<F, R>(
        &self,
        session_id: &SessionId,
        participant_id: ParticipantId,
        on_joined: F,
    ) -> Result<R, RelayError>
    where
        F: FnOnce(&Participant, &[ParticipantId]) -> R,
    {
        if self.max_participants_per_session == 0 {
            return Err(RelayError::SessionFull(session_id.clone()));
        }

        loop {
            let session = self.reserve(session_id, participant_id).await?;
            let mut session = session.lock().await;
            if session.closed {
                // Collected after the reservation; take a fresh session.
                drop(session);
                tokio::task::yield_now().await;
                continue;
            }

            if let Some(existing) = session.participants.get(&participant_id) {
                let members = session.member_ids();
                return Ok(on_joined(existing, &members));
            }

            if session.participants.len() >= self.max_participants_per_session {
                drop(session);
                self.release(session_id, &participant_id).await;
                return Err(RelayError::SessionFull(session_id.clone()));
            }

            let others = session.member_ids();
            let participant = Participant {
                participant_id,
                session_id: session_id.clone(),
                last_seen_sequence: session.sequence_counter,
            };
            session.participants.insert(participant_id, participant.clone());

            self.notify(|l| l.participant_joined(session_id, &participant_id, &others));
            log::info!(
                "Participant {participant_id} joined session {session_id} ({} members)",
                session.participants.len()
            );
            let members = session.member_ids();
            return Ok(on_joined(&participant, &members));
        }
    }

    /// Bind `participant_id` to `session_id` and return the session to join,
    /// creating it if needed. Only the registry state lock is taken.
    async fn reserve(
        &self,
        session_id: &SessionId,
        participant_id: ParticipantId,
    ) -> Result<Arc<Mutex<Session>>, RelayError> {
        let mut state = self.state.write().await;
        if let Some(current) = state.bindings.get(&participant_id) {
            if current != session_id {
                return Err(RelayError::AlreadyJoined {
                    current: current.clone(),
                });
            }
        }
        let session = Self::live_entry(&mut state, session_id);
        state.bindings.insert(participant_id, session_id.clone());
        Ok(session)
    }

    /// Undo a reservation that did not turn into membership.
    async fn release(&self, session_id: &SessionId, participant_id: &ParticipantId) {
        let mut state = self.state.write().await;
        if state.bindings.get(participant_id) == Some(session_id) {
            state.bindings.remove(participant_id);
        }
    }

    /// The registered session for `session_id`, replacing one that is known
    /// to be closed.
    fn live_entry(state: &mut RegistryState, session_id: &SessionId) -> Arc<Mutex<Session>> {
        if let Some(existing) = state.sessions.get(session_id) {
            let closed = existing.try_lock().is_ok_and(|session| session.closed);
            if !closed {
                return existing.clone();
            }
        }
        let session = Arc::new(Mutex::new(Session::new(session_id.clone())));
        state.sessions.insert(session_id.clone(), session.clone());
        log::info!("Session {session_id} created");
        session
    }

    /// Drop `session` from the map if it is still the registered entry.
    async fn unregister(&self, session_id: &SessionId, session: &Arc<Mutex<Session>>) -> bool {
        let mut state = self.state.write().await;
        let registered = state
            .sessions
            .get(session_id)
            .is_some_and(|current| Arc::ptr_eq(current, session));
        if registered {
            state.sessions.remove(session_id);
        }
        registered
    }

    /// Remove a participant from a session. Idempotent.
    ///
    /// Returns `true` if the participant was a member. Dropping the last
    /// member deletes the session together with its sequence counter.
    pub async fn leave(&self, session_id: &SessionId, participant_id: &ParticipantId) -> bool {
        let session = {
            let mut state = self.state.write().await;
            if state.bindings.get(participant_id) != Some(session_id) {
                return false;
            }
            state.bindings.remove(participant_id);
            let session = state.sessions.get(session_id).cloned();
            match session {
                Some(session) => session,
                None => return false,
            }
        };

        let (removed, emptied) = {
            let mut guard = session.lock().await;
            if guard.closed {
                return false;
            }
            let removed = guard.participants.remove(participant_id).is_some();
            let remaining = guard.member_ids();
            let emptied = remaining.is_empty();
            if emptied {
                guard.closed = true;
                log::info!(
                    "Session {session_id} removed (empty) after {} changes",
                    guard.sequence_counter
                );
            }
            if removed {
                self.notify(|l| l.participant_left(session_id, participant_id, &remaining));
                log::info!("Participant {participant_id} left session {session_id}");
            }
            (removed, emptied)
        };

        if emptied {
            self.unregister(session_id, &session).await;
        }
        removed
    }

    /// Remove every session that has no members. Returns how many were removed.
    pub async fn prune_empty_sessions(&self) -> usize {
        let candidates: Vec<(SessionId, Arc<Mutex<Session>>)> = self
            .state
            .read()
            .await
            .sessions
            .iter()
            .map(|(id, session)| (id.clone(), session.clone()))
            .collect();

        let mut pruned = 0;
        for (session_id, session) in candidates {
            {
                let mut guard = session.lock().await;
                if guard.closed || !guard.participants.is_empty() {
                    continue;
                }
                guard.closed = true;
            }
            if self.unregister(&session_id, &session).await {
                log::debug!("Session {session_id} pruned (no members)");
                pruned += 1;
            }
        }
        pruned
    }

    /// Atomically increment and return the session's sequence counter.
    pub async fn next_sequence(&self, session_id: &SessionId) -> Result<u64, RelayError> {
        let session = self.session(session_id).await?;
        let mut session = session.lock().await;
        if session.closed {
            return Err(RelayError::UnknownSession(session_id.clone()));
        }
        Ok(session.advance())
    }

    /// Validate `origin`, assign the next sequence, and hand the other members
    /// to `fan_out`, all under the session lock.
    ///
    /// Nothing is incremented and `fan_out` is not called when validation fails.
    pub async fn sequence_change<F, R>(
        &self,
        session_id: &SessionId,
        origin: &ParticipantId,
        fan_out: F,
    ) -> Result<R, RelayError>
    where
        F: FnOnce(u64, &mut dyn Iterator<Item = &mut Participant>) -> R,
    {
        let session = self.session(session_id).await?;
        let mut session = session.lock().await;
        if session.closed {
            return Err(RelayError::UnknownSession(session_id.clone()));
        }
        if !session.participants.contains_key(origin) {
            return Err(RelayError::NotAMember);
        }

        let sequence = session.advance();
        let mut recipients = session
            .participants
            .values_mut()
            .filter(|p| p.participant_id != *origin);
        Ok(fan_out(sequence, &mut recipients))
    }

    /// Run `f` with the members other than `participant_id`, under the session lock.
    ///
    /// Fails with `NotAMember` if `participant_id` is not in the session.
    pub async fn with_peers<F, R>(
        &self,
        session_id: &SessionId,
        participant_id: &ParticipantId,
        f: F,
    ) -> Result<R, RelayError>
    where
        F: FnOnce(&[ParticipantId]) -> R,
    {
        let session = self.session(session_id).await?;
        let session = session.lock().await;
        if session.closed {
            return Err(RelayError::UnknownSession(session_id.clone()));
        }
        if !session.participants.contains_key(participant_id) {
            return Err(RelayError::NotAMember);
        }

        let peers: Vec<ParticipantId> = session
            .member_ids()
            .into_iter()
            .filter(|id| id != participant_id)
            .collect();
        Ok(f(&peers))
    }

    /// Snapshot of a session's members. Empty for unknown sessions.
    pub async fn members_of(&self, session_id: &SessionId) -> BTreeSet<ParticipantId> {
        let Ok(session) = self.session(session_id).await else {
            return BTreeSet::new();
        };
        let members = session.lock().await.participants.keys().copied().collect();
        members
    }

    /// Read-only view of a session, if it exists.
    pub async fn session_info(&self, session_id: &SessionId) -> Option<SessionInfo> {
        let session = self.session(session_id).await.ok()?;
        let session = session.lock().await;
        if session.closed {
            return None;
        }
        Some(session.info())
    }

    /// Membership record of a participant, if it is joined anywhere.
    pub async fn participant(&self, participant_id: &ParticipantId) -> Option<Participant> {
        let session_id = self.session_of(participant_id).await?;
        let session = self.session(&session_id).await.ok()?;
        let participant = session.lock().await.participants.get(participant_id).cloned();
        participant
    }

    /// The session a participant is currently bound to.
    pub async fn session_of(&self, participant_id: &ParticipantId) -> Option<SessionId> {
        self.state.read().await.bindings.get(participant_id).cloned()
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        self.state.read().await.sessions.len()
    }

    pub fn max_participants_per_session(&self) -> usize {
        self.max_participants_per_session
    }

    async fn session(&self, session_id: &SessionId) -> Result<Arc<Mutex<Session>>, RelayError> {
        self.state
            .read()
            .await
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| RelayError::UnknownSession(session_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingListener {
        events: std::sync::Mutex<Vec<String>>,
    }

    impl MembershipListener for RecordingListener {
        fn participant_joined(
            &self,
            session_id: &SessionId,
            _participant_id: &ParticipantId,
            others: &[ParticipantId],
        ) {
            self.events
                .lock()
                .unwrap()
                .push(format!("joined {session_id} others={}", others.len()));
        }

        fn participant_left(
            &self,
            session_id: &SessionId,
            _participant_id: &ParticipantId,
            remaining: &[ParticipantId],
        ) {
            self.events
                .lock()
                .unwrap()
                .push(format!("left {session_id} remaining={}", remaining.len()));
        }
    }

    fn doc(id: &str) -> SessionId {
        SessionId::from(id)
    }

    #[tokio::test]
    async fn test_create_or_get_is_idempotent() {
        let registry = SessionRegistry::new(10);
        let first = registry.create_or_get_session(&doc("doc1")).await;
        let second = registry.create_or_get_session(&doc("doc1")).await;

        assert_eq!(first, second);
        assert_eq!(first.sequence_counter, 0);
        assert!(first.participants.is_empty());
        assert_eq!(registry.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_join_creates_session_lazily() {
        let registry = SessionRegistry::new(10);
        let alice = ParticipantId::generate();

        let participant = registry.join(&doc("doc1"), alice).await.unwrap();
        assert_eq!(participant.participant_id, alice);
        assert_eq!(participant.session_id, doc("doc1"));
        assert_eq!(participant.last_seen_sequence, 0);

        assert_eq!(registry.members_of(&doc("doc1")).await, BTreeSet::from([alice]));
        assert_eq!(registry.session_of(&alice).await, Some(doc("doc1")));
    }

    #[tokio::test]
    async fn test_join_same_session_twice_is_noop() {
        let registry = SessionRegistry::new(10);
        let alice = ParticipantId::generate();

        registry.join(&doc("doc1"), alice).await.unwrap();
        registry.next_sequence(&doc("doc1")).await.unwrap();
        let again = registry.join(&doc("doc1"), alice).await.unwrap();

        assert_eq!(again.session_id, doc("doc1"));
        assert_eq!(registry.members_of(&doc("doc1")).await.len(), 1);
    }

    #[tokio::test]
    async fn test_join_other_session_rejected() {
        let registry = SessionRegistry::new(10);
        let alice = ParticipantId::generate();
        registry.join(&doc("doc1"), alice).await.unwrap();

        let err = registry.join(&doc("doc2"), alice).await.unwrap_err();
        assert_eq!(err, RelayError::AlreadyJoined { current: doc("doc1") });

        assert!(registry.members_of(&doc("doc1")).await.contains(&alice));
        assert!(registry.session_info(&doc("doc2")).await.is_none());
        assert_eq!(registry.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_leave_is_idempotent() {
        let registry = SessionRegistry::new(10);
        let alice = ParticipantId::generate();
        let bob = ParticipantId::generate();
        registry.join(&doc("doc1"), alice).await.unwrap();
        registry.join(&doc("doc1"), bob).await.unwrap();

        assert!(registry.leave(&doc("doc1"), &alice).await);
        assert!(!registry.leave(&doc("doc1"), &alice).await);
        assert_eq!(registry.members_of(&doc("doc1")).await, BTreeSet::from([bob]));
        assert!(registry.session_of(&alice).await.is_none());
    }

    #[tokio::test]
    async fn test_leave_wrong_session_is_noop() {
        let registry = SessionRegistry::new(10);
        let alice = ParticipantId::generate();
        registry.join(&doc("doc1"), alice).await.unwrap();

        assert!(!registry.leave(&doc("doc2"), &alice).await);
        assert!(registry.members_of(&doc("doc1")).await.contains(&alice));
    }

    #[tokio::test]
    async fn test_empty_session_is_collected() {
        let registry = SessionRegistry::new(10);
        let alice = ParticipantId::generate();
        registry.join(&doc("doc1"), alice).await.unwrap();
        registry.next_sequence(&doc("doc1")).await.unwrap();
        registry.next_sequence(&doc("doc1")).await.unwrap();

        registry.leave(&doc("doc1"), &alice).await;
        assert_eq!(registry.session_count().await, 0);

        let fresh = registry.create_or_get_session(&doc("doc1")).await;
        assert_eq!(fresh.sequence_counter, 0);
    }

    #[tokio::test]
    async fn test_next_sequence_monotonic() {
        let registry = SessionRegistry::new(10);
        registry.join(&doc("doc1"), ParticipantId::generate()).await.unwrap();

        for expected in 1..=5 {
            assert_eq!(registry.next_sequence(&doc("doc1")).await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_next_sequence_unknown_session() {
        let registry = SessionRegistry::new(10);
        let err = registry.next_sequence(&doc("ghost")).await.unwrap_err();
        assert_eq!(err, RelayError::UnknownSession(doc("ghost")));
    }

    #[tokio::test]
    async fn test_sessions_sequence_independently() {
        let registry = SessionRegistry::new(10);
        registry.join(&doc("doc1"), ParticipantId::generate()).await.unwrap();
        registry.join(&doc("doc2"), ParticipantId::generate()).await.unwrap();

        registry.next_sequence(&doc("doc1")).await.unwrap();
        registry.next_sequence(&doc("doc1")).await.unwrap();
        assert_eq!(registry.next_sequence(&doc("doc2")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_session_capacity() {
        let registry = SessionRegistry::new(2);
        registry.join(&doc("doc1"), ParticipantId::generate()).await.unwrap();
        registry.join(&doc("doc1"), ParticipantId::generate()).await.unwrap();

        let carol = ParticipantId::generate();
        let err = registry.join(&doc("doc1"), carol).await.unwrap_err();
        assert_eq!(err, RelayError::SessionFull(doc("doc1")));
        assert!(registry.session_of(&carol).await.is_none());
        assert_eq!(registry.members_of(&doc("doc1")).await.len(), 2);
    }

    #[tokio::test]
    async fn test_sequence_change_rejects_non_member() {
        let registry = SessionRegistry::new(10);
        registry.join(&doc("doc1"), ParticipantId::generate()).await.unwrap();

        let outsider = ParticipantId::generate();
        let result = registry
            .sequence_change(&doc("doc1"), &outsider, |sequence, _| sequence)
            .await;
        assert_eq!(result, Err(RelayError::NotAMember));

        let info = registry.session_info(&doc("doc1")).await.unwrap();
        assert_eq!(info.sequence_counter, 0);
    }

    #[tokio::test]
    async fn test_sequence_change_excludes_origin() {
        let registry = SessionRegistry::new(10);
        let alice = ParticipantId::generate();
        let bob = ParticipantId::generate();
        let carol = ParticipantId::generate();
        for p in [alice, bob, carol] {
            registry.join(&doc("doc1"), p).await.unwrap();
        }

        let recipients = registry
            .sequence_change(&doc("doc1"), &alice, |sequence, recipients| {
                assert_eq!(sequence, 1);
                recipients
                    .map(|p| {
                        p.last_seen_sequence = sequence;
                        p.participant_id
                    })
                    .collect::<BTreeSet<_>>()
            })
            .await
            .unwrap();

        assert_eq!(recipients, BTreeSet::from([bob, carol]));
        assert_eq!(registry.participant(&bob).await.unwrap().last_seen_sequence, 1);
        assert_eq!(registry.participant(&alice).await.unwrap().last_seen_sequence, 0);
    }

    #[tokio::test]
    async fn test_with_peers() {
        let registry = SessionRegistry::new(10);
        let alice = ParticipantId::generate();
        let bob = ParticipantId::generate();
        registry.join(&doc("doc1"), alice).await.unwrap();
        registry.join(&doc("doc1"), bob).await.unwrap();

        let peers = registry
            .with_peers(&doc("doc1"), &alice, |peers| peers.to_vec())
            .await
            .unwrap();
        assert_eq!(peers, vec![bob]);

        let outsider = ParticipantId::generate();
        let err = registry
            .with_peers(&doc("doc1"), &outsider, |peers| peers.len())
            .await
            .unwrap_err();
        assert_eq!(err, RelayError::NotAMember);
    }

    #[tokio::test]
    async fn test_listener_notified() {
        let registry = SessionRegistry::new(10);
        let listener = Arc::new(RecordingListener::default());
        let as_dyn: Arc<dyn MembershipListener> = listener.clone();
        registry.subscribe(Arc::downgrade(&as_dyn));

        let alice = ParticipantId::generate();
        let bob = ParticipantId::generate();
        registry.join(&doc("doc1"), alice).await.unwrap();
        registry.join(&doc("doc1"), bob).await.unwrap();
        registry.leave(&doc("doc1"), &alice).await;
        registry.leave(&doc("doc1"), &alice).await;
        registry.leave(&doc("doc1"), &bob).await;

        let events = listener.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                "joined doc1 others=0",
                "joined doc1 others=1",
                "left doc1 remaining=1",
                "left doc1 remaining=0",
            ]
        );
    }

    #[tokio::test]
    async fn test_dropped_listener_skipped() {
        let registry = SessionRegistry::new(10);
        {
            let listener: Arc<dyn MembershipListener> = Arc::new(RecordingListener::default());
            registry.subscribe(Arc::downgrade(&listener));
        }
        registry.join(&doc("doc1"), ParticipantId::generate()).await.unwrap();
        assert_eq!(registry.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_join_with_sees_full_membership() {
        let registry = SessionRegistry::new(10);
        let alice = ParticipantId::generate();
        let bob = ParticipantId::generate();
        registry.join(&doc("doc1"), alice).await.unwrap();

        let (participant, members) = registry
            .join_with(&doc("doc1"), bob, |p, members| (p.clone(), members.to_vec()))
            .await
            .unwrap();

        assert_eq!(participant.participant_id, bob);
        let mut expected = vec![alice, bob];
        expected.sort();
        assert_eq!(members, expected);
    }

    #[tokio::test]
    async fn test_prune_removes_only_empty_sessions() {
        let registry = SessionRegistry::new(10);
        registry.create_or_get_session(&doc("idle")).await;
        registry.join(&doc("doc1"), ParticipantId::generate()).await.unwrap();
        assert_eq!(registry.session_count().await, 2);

        assert_eq!(registry.prune_empty_sessions().await, 1);
        assert_eq!(registry.session_count().await, 1);
        assert!(registry.session_info(&doc("idle")).await.is_none());
        assert!(registry.session_info(&doc("doc1")).await.is_some());
        assert_eq!(registry.prune_empty_sessions().await, 0);
    }

    #[tokio::test]
    async fn test_join_replaces_closed_entry() {
        let registry = SessionRegistry::new(10);
        registry.create_or_get_session(&doc("doc1")).await;
        let stale = registry.session(&doc("doc1")).await.unwrap();
        stale.lock().await.closed = true;

        let alice = ParticipantId::generate();
        registry.join(&doc("doc1"), alice).await.unwrap();

        let info = registry.session_info(&doc("doc1")).await.unwrap();
        assert_eq!(info.participants, BTreeSet::from([alice]));
        assert!(stale.lock().await.participants.is_empty());
    }

    #[tokio::test]
    async fn test_busy_session_does_not_stall_other_sessions() {
        let registry = Arc::new(SessionRegistry::new(10));
        let alice = ParticipantId::generate();
        registry.join(&doc("doc1"), alice).await.unwrap();

        let busy = registry.session(&doc("doc1")).await.unwrap();
        let guard = busy.lock().await;

        // Blocks on doc1's session lock.
        let carol = ParticipantId::generate();
        let waiting = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.join(&doc("doc1"), carol).await })
        };
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let bob = ParticipantId::generate();
        let joined = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            registry.join(&doc("doc2"), bob),
        )
        .await;
        assert!(joined.is_ok(), "join on doc2 stalled behind doc1");
        assert_eq!(registry.session_of(&bob).await, Some(doc("doc2")));

        drop(guard);
        waiting.await.unwrap().unwrap();
        assert_eq!(
            registry.members_of(&doc("doc1")).await,
            BTreeSet::from([alice, carol])
        );
    }
}
