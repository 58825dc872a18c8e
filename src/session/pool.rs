use std::{
    collections::VecDeque,
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};

use uuid::Uuid;

use crate::bson::{doc, spec::BinarySubtype, Binary, Bson, Document};

/// A session as the server knows it: an id plus the transaction number counter scoped to it.
#[derive(Clone, Debug)]
pub(crate) struct ServerSession {
    /// The id of the server session to which this corresponds.
    pub(crate) id: Document,

    /// The last time an operation was executed with this session.
    pub(crate) last_use: Instant,

    /// Whether a network error was encountered while using this session.
    pub(crate) dirty: bool,

    /// A monotonically increasing transaction number for this session.
    pub(crate) txn_number: u64,
}

impl ServerSession {
    /// Creates a new session, generating the id client side.
    pub(crate) fn new() -> Self {
        let binary = Bson::Binary(Binary {
            subtype: BinarySubtype::Uuid,
            bytes: Uuid::new_v4().as_bytes().to_vec(),
        });

        Self {
            id: doc! { "id": binary },
            last_use: Instant::now(),
            dirty: false,
            txn_number: 0,
        }
    }

    /// Determines if this server session is about to expire in a short amount of time (1 minute).
    fn is_about_to_expire(&self, logical_session_timeout: Option<Duration>) -> bool {
        let Some(timeout) = logical_session_timeout else {
            return false;
        };
        let expiration_date = self.last_use + timeout;
        expiration_date < Instant::now() + Duration::from_secs(60)
    }
}

/// Server sessions that can be reused by new client sessions. Checking in and out never blocks
/// on I/O, so it is safe to do from `Drop`.
#[derive(Debug, Default)]
pub(crate) struct ServerSessionPool {
    state: Mutex<PoolState>,
}

#[derive(Debug, Default)]
struct PoolState {
    sessions: VecDeque<ServerSession>,

    /// The deployment's session timeout, as last computed by the topology.
    logical_session_timeout: Option<Duration>,
}

impl ServerSessionPool {
    pub(crate) fn new() -> Self {
        Default::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_logical_session_timeout(&self, timeout: Option<Duration>) {
        self.lock().logical_session_timeout = timeout;
    }

    /// Checks out a server session from the pool, skipping any that are about to expire. If
    /// there are none left, a new session is created.
    pub(crate) fn check_out(&self) -> ServerSession {
        let mut state = self.lock();
        let timeout = state.logical_session_timeout;
        while let Some(session) = state.sessions.pop_front() {
            if session.is_about_to_expire(timeout) {
                continue;
            }
            return session;
        }
        ServerSession::new()
    }

    /// Checks in a server session. Dirty sessions and ones about to expire are discarded, as are
    /// any expired sessions at the back of the pool.
    pub(crate) fn check_in(&self, session: ServerSession) {
        let mut state = self.lock();
        let timeout = state.logical_session_timeout;
        while let Some(pooled_session) = state.sessions.pop_back() {
            if pooled_session.is_about_to_expire(timeout) {
                continue;
            }
            state.sessions.push_back(pooled_session);
            break;
        }

        if !session.dirty && !session.is_about_to_expire(timeout) {
            state.sessions.push_front(session);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: &Document) -> bool {
        self.lock().sessions.iter().any(|s| &s.id == id)
    }
}
