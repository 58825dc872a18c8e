//! Sessions: the causal-consistency and transaction state attached to every command.

pub(crate) mod cluster_time;
mod pool;
#[cfg(test)]
mod test;

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Instant,
};

pub use self::cluster_time::ClusterTime;
pub(crate) use self::pool::{ServerSession, ServerSessionPool};
use crate::{
    binding::Channel,
    bson::{Document, Timestamp},
    error::{Error, ErrorKind, Result},
    handle::{RefCounted, Teardown},
    options::{SessionOptions, TransactionOptions},
    selection_criteria::{ReadPreference, SelectionCriteria},
};

/// A logical session: the unit of causally consistent operations, and the scope of transactions
/// and retryable-write transaction numbers.
///
/// A `CoreSession` is a reference-counted handle. [`CoreSession::fork`] returns another handle
/// to the same session, and the session's server session goes back to the pool when the last
/// handle is dropped. Every component that needs the session to outlive its caller (a cursor,
/// an in-flight retry) holds its own fork.
///
/// ```rust
/// # use mongodb_core::{bson::Timestamp, Client, error::Result};
/// # fn run(client: &Client) -> Result<()> {
/// let session = client.start_session(None)?;
/// let cursor_session = session.fork();
/// assert_eq!(session.reference_count(), 2);
///
/// session.advance_operation_time(Timestamp { time: 100, increment: 2 });
/// assert_eq!(
///     cursor_session.operation_time(),
///     Some(Timestamp { time: 100, increment: 2 })
/// );
/// # Ok(())
/// # }
/// ```
pub struct CoreSession {
    handle: RefCounted<SessionShared>,
}

struct SessionShared {
    implicit: bool,
    options: Option<SessionOptions>,
    pool: Arc<ServerSessionPool>,
    state: Mutex<SessionState>,
}

#[derive(Default)]
struct SessionState {
    /// Checked out of the pool on first use.
    server_session: Option<ServerSession>,
    cluster_time: Option<ClusterTime>,
    operation_time: Option<Timestamp>,
    transaction: Transaction,
    pinned: Option<Channel>,
    ended: bool,
}

#[derive(Debug, Default)]
pub(crate) struct Transaction {
    pub(crate) state: TransactionState,
    pub(crate) options: Option<TransactionOptions>,
    pub(crate) recovery_token: Option<Document>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) enum TransactionState {
    #[default]
    None,
    Starting,
    InProgress,
    Committed {
        /// Whether any data was committed when the transaction was first committed. Decides
        /// whether a repeated commit has to go to the server.
        data_committed: bool,
    },
    Aborted,
}

impl CoreSession {
    pub(crate) fn new(
        pool: Arc<ServerSessionPool>,
        options: Option<SessionOptions>,
        implicit: bool,
    ) -> Self {
        Self {
            handle: RefCounted::new(SessionShared {
                implicit,
                options,
                pool,
                state: Mutex::new(SessionState::default()),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.handle
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a new handle to this session.
    pub fn fork(&self) -> CoreSession {
        Self {
            handle: self.handle.fork(),
        }
    }

    /// The number of live handles to this session.
    pub fn reference_count(&self) -> usize {
        self.handle.reference_count()
    }

    /// Whether the session was created by the client for a single operation rather than by the
    /// application.
    pub fn is_implicit(&self) -> bool {
        self.handle.implicit
    }

    /// The session id, or `None` if the session has not been sent to a server yet.
    pub fn id(&self) -> Option<Document> {
        self.lock()
            .server_session
            .as_ref()
            .map(|session| session.id.clone())
    }

    /// The highest cluster time this session has seen.
    pub fn cluster_time(&self) -> Option<ClusterTime> {
        self.lock().cluster_time.clone()
    }

    /// The latest operation time this session has seen.
    pub fn operation_time(&self) -> Option<Timestamp> {
        self.lock().operation_time
    }

    /// Replaces the session's cluster time if `to` is strictly later.
    pub fn advance_cluster_time(&self, to: &ClusterTime) {
        let mut state = self.lock();
        if state.cluster_time.as_ref().is_none_or(|current| current < to) {
            state.cluster_time = Some(to.clone());
        }
    }

    /// Replaces the session's operation time if `to` is later.
    pub fn advance_operation_time(&self, to: Timestamp) {
        let mut state = self.lock();
        let later = state.operation_time.is_none_or(|current| {
            (current.time, current.increment) < (to.time, to.increment)
        });
        if later {
            state.operation_time = Some(to);
        }
    }

    /// Whether a transaction has been started and not yet committed or aborted.
    pub fn in_transaction(&self) -> bool {
        self.lock().transaction.state.is_active()
    }

    /// Starts a multi-statement transaction. Options not given fall back to the session's
    /// default transaction options.
    ///
    /// Fails if a transaction is already in progress or the session has ended.
    pub fn start_transaction(&self, options: impl Into<Option<TransactionOptions>>) -> Result<()> {
        let options = self.merge_transaction_options(options.into());
        if let Some(write_concern) = options.as_ref().and_then(|o| o.write_concern.as_ref()) {
            if !write_concern.is_acknowledged() {
                return Err(ErrorKind::Transaction {
                    message: "transactions do not support unacknowledged write concerns".into(),
                }
                .into());
            }
        }

        let previous_pin = {
            let mut state = self.lock();
            check_usable(&state)?;
            if state.transaction.state.is_active() {
                return Err(ErrorKind::Transaction {
                    message: "transaction already in progress".into(),
                }
                .into());
            }

            server_session(&mut state, &self.handle.pool).txn_number += 1;
            state.transaction = Transaction {
                state: TransactionState::Starting,
                options,
                recovery_token: None,
            };
            state.pinned.take()
        };
        drop(previous_pin);
        Ok(())
    }

    /// Ends the session for every handle: the server session goes back to the pool and any
    /// further use is an error.
    pub fn end(&self) {
        let (server_session, pinned) = {
            let mut state = self.lock();
            if state.ended {
                return;
            }
            state.ended = true;
            (state.server_session.take(), state.pinned.take())
        };
        drop(pinned);
        if let Some(server_session) = server_session {
            self.handle.pool.check_in(server_session);
        }
    }

    /// Materializes the server session on first use and returns its id. Fails if the session
    /// has ended.
    pub(crate) fn was_used(&self) -> Result<Document> {
        let mut state = self.lock();
        check_usable(&state)?;
        let server_session = server_session(&mut state, &self.handle.pool);
        server_session.last_use = Instant::now();
        Ok(server_session.id.clone())
    }

    /// Allocates the transaction number for one retryable write. Called once per logical
    /// operation; every attempt of that operation reuses the number.
    pub(crate) fn next_transaction_number(&self) -> Result<u64> {
        let mut state = self.lock();
        check_usable(&state)?;
        let server_session = server_session(&mut state, &self.handle.pool);
        server_session.txn_number += 1;
        Ok(server_session.txn_number)
    }

    /// The current transaction number.
    pub(crate) fn txn_number(&self) -> u64 {
        self.lock()
            .server_session
            .as_ref()
            .map_or(0, |session| session.txn_number)
    }

    /// Marks the server session as having seen a network error, so it is discarded rather than
    /// reused.
    pub(crate) fn mark_dirty(&self) {
        if let Some(ref mut server_session) = self.lock().server_session {
            server_session.dirty = true;
        }
    }

    pub(crate) fn check_usable(&self) -> Result<()> {
        check_usable(&self.lock())
    }

    /// Whether reads on this session should observe preceding writes. Defaults to true for
    /// explicit sessions.
    pub(crate) fn causal_consistency(&self) -> bool {
        self.handle
            .options
            .as_ref()
            .and_then(|options| options.causal_consistency)
            .unwrap_or(!self.is_implicit())
    }

    pub(crate) fn transaction_state(&self) -> TransactionState {
        self.lock().transaction.state.clone()
    }

    pub(crate) fn transaction_options(&self) -> Option<TransactionOptions> {
        self.lock().transaction.options.clone()
    }

    /// The criteria reads must use while a transaction is active: the transaction's own, or
    /// primary.
    pub(crate) fn transaction_selection_criteria(&self) -> Option<SelectionCriteria> {
        let state = self.lock();
        if !state.transaction.state.is_active() {
            return None;
        }
        Some(
            state
                .transaction
                .options
                .as_ref()
                .and_then(|options| options.selection_criteria.clone())
                .unwrap_or(SelectionCriteria::ReadPreference(ReadPreference::Primary)),
        )
    }

    /// Moves a transaction whose first command has been sent to `InProgress`.
    pub(crate) fn mark_transaction_in_progress(&self) {
        let mut state = self.lock();
        if state.transaction.state == TransactionState::Starting {
            state.transaction.state = TransactionState::InProgress;
        }
    }

    /// Moves the transaction to `new_state`. An aborted transaction keeps its pin until the
    /// `abortTransaction` command itself has run.
    pub(crate) fn set_transaction_state(&self, new_state: TransactionState) {
        let mut state = self.lock();
        if new_state == TransactionState::Aborted {
            state.transaction.options = None;
        }
        state.transaction.state = new_state;
    }

    /// Clears a finished transaction once an operation outside of it runs on the session.
    pub(crate) fn reset_finished_transaction(&self) {
        let pinned = {
            let mut state = self.lock();
            match state.transaction.state {
                TransactionState::Committed { .. } | TransactionState::Aborted => {
                    state.transaction = Transaction::default();
                    state.pinned.take()
                }
                _ => None,
            }
        };
        drop(pinned);
    }

    pub(crate) fn recovery_token(&self) -> Option<Document> {
        self.lock().transaction.recovery_token.clone()
    }

    pub(crate) fn set_recovery_token(&self, token: Document) {
        self.lock().transaction.recovery_token = Some(token);
    }

    /// Pins `channel` to the session. The pin holds its own fork, so the channel survives the
    /// release of the operation that created it.
    pub(crate) fn pin(&self, channel: Channel) {
        let previous = self.lock().pinned.replace(channel);
        drop(previous);
    }

    pub(crate) fn unpin(&self) {
        let previous = self.lock().pinned.take();
        drop(previous);
    }

    /// A fork of the pinned channel, if any.
    pub(crate) fn pinned_channel(&self) -> Option<Channel> {
        self.lock().pinned.as_ref().map(|channel| channel.fork())
    }

    #[cfg(test)]
    pub(crate) fn is_dirty(&self) -> bool {
        self.lock()
            .server_session
            .as_ref()
            .is_some_and(|session| session.dirty)
    }

    fn merge_transaction_options(
        &self,
        options: Option<TransactionOptions>,
    ) -> Option<TransactionOptions> {
        let defaults = self
            .handle
            .options
            .as_ref()
            .and_then(|options| options.default_transaction_options.as_ref());
        match (options, defaults) {
            (Some(mut options), Some(defaults)) => {
                options.read_concern = options.read_concern.or(defaults.read_concern.clone());
                options.write_concern = options.write_concern.or(defaults.write_concern.clone());
                options.selection_criteria = options
                    .selection_criteria
                    .or(defaults.selection_criteria.clone());
                options.max_commit_time = options.max_commit_time.or(defaults.max_commit_time);
                Some(options)
            }
            (options, defaults) => options.or_else(|| defaults.cloned()),
        }
    }
}

impl TransactionState {
    fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::InProgress)
    }
}

fn check_usable(state: &SessionState) -> Result<()> {
    if state.ended {
        return Err(Error::invalid_usage(
            "the session was used after it was ended",
        ));
    }
    Ok(())
}

fn server_session<'a>(
    state: &'a mut SessionState,
    pool: &ServerSessionPool,
) -> &'a mut ServerSession {
    state.server_session.get_or_insert_with(|| pool.check_out())
}

impl fmt::Debug for CoreSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("CoreSession")
            .field(
                "id",
                &state.server_session.as_ref().map(|session| &session.id),
            )
            .field("implicit", &self.handle.implicit)
            .field("transaction", &state.transaction.state)
            .field("references", &self.reference_count())
            .finish()
    }
}

impl Teardown for SessionShared {
    fn teardown(&self) {
        let (server_session, pinned) = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            (state.server_session.take(), state.pinned.take())
        };
        drop(pinned);
        if let Some(server_session) = server_session {
            self.pool.check_in(server_session);
        }
    }
}
