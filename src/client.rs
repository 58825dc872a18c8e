
use std::{fmt, sync::Arc};

use tokio_util::sync::CancellationToken;

use crate::{
    binding::ClusterBinding,
    bson::{self, Document},
    cmap::{StreamConnector, TcpConnector},
    cursor::Cursor,
    error::{Error, ErrorKind, Result},
    executor::OperationExecutor,
    operation::{
        AbortTransaction,
        CommitTransaction,
        Count,
        Delete,
        DeleteRequest,
        Find,
        Insert,
        ListDatabases,
        Operation,
        RunCommand,
        Update,
        UpdateRequest,
    },
    options::{
        ClientOptions,
        CountOptions,
        DeleteOptions,
        FindOptions,
        InsertOptions,
        ListDatabasesOptions,
        SessionOptions,
        UpdateOptions,
    },
    results::{DatabaseSpecification, DeleteResult, InsertResult, UpdateResult},
    sdam::{ServerDescription, Topology},
    selection_criteria::SelectionCriteria,
    session::{CoreSession, TransactionState},
    trace::COMMAND_TRACING_EVENT_TARGET,
    Namespace,
};

/// This is the main entry point for the API. A `Client` executes operations against a MongoDB
/// deployment, retrying them where that is safe and keeping sessions and transactions
/// consistent across attempts.
///
/// The deployment's shape is reported by an external monitor through
/// [`Client::update_server`]; the client selects servers from the latest report.
///
/// `Client` uses [`std::sync::Arc`] internally, so it can safely be shared across threads or
/// async tasks. For example:
///
/// ```rust
/// # use mongodb_core::{bson::doc, Client, Namespace, error::Result};
/// # use tokio_util::sync::CancellationToken;
/// # async fn start_workers(client: Client) -> Result<()> {
/// for i in 0..5 {
///     let client_ref = client.clone();
///
///     tokio::task::spawn(async move {
///         let ns = Namespace::new("items", format!("coll{}", i));
///         let _ = client_ref
///             .insert(ns, vec![doc! { "i": i }], None, None, &CancellationToken::new())
///             .await;
///     });
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    executor: Arc<OperationExecutor>,
    options: ClientOptions,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Creates a client whose connections are opened through `connector`.
    pub fn new(options: ClientOptions, connector: Arc<dyn StreamConnector>) -> Result<Self> {
        options.validate()?;
        let topology = Arc::new(Topology::new(&options, connector));
        Ok(Self {
            inner: Arc::new(ClientInner {
                executor: Arc::new(OperationExecutor::new(&options, topology)),
                options,
            }),
        })
    }

    /// Creates a client that connects over TCP.
    pub fn with_options(options: ClientOptions) -> Result<Self> {
        Self::new(options, Arc::new(TcpConnector))
    }

    /// Records the monitor's latest description of one server.
    pub fn update_server(&self, description: ServerDescription) {
        self.topology().update_server(description);
    }

    /// Starts a new explicit session. Sessions are causally consistent unless `options` says
    /// otherwise.
    pub fn start_session(&self, options: Option<SessionOptions>) -> Result<CoreSession> {
        let unacknowledged_default = options
            .as_ref()
            .and_then(|options| options.default_transaction_options.as_ref())
            .and_then(|options| options.write_concern.as_ref())
            .is_some_and(|write_concern| !write_concern.is_acknowledged());
        if unacknowledged_default {
            return Err(Error::invalid_argument(
                "transactions do not support unacknowledged write concerns",
            ));
        }
        Ok(CoreSession::new(
            self.topology().session_pool().clone(),
            options,
            false,
        ))
    }

    /// Gets information about each database present in the deployment.
    pub async fn list_databases(
        &self,
        filter: impl Into<Option<Document>>,
        options: impl Into<Option<ListDatabasesOptions>>,
        session: Option<&CoreSession>,
        cancel: &CancellationToken,
    ) -> Result<Vec<DatabaseSpecification>> {
        let mut op = ListDatabases::new(filter.into(), None, options.into());
        self.execute_read(&mut op, session, cancel)
            .await?
            .into_iter()
            .map(|database| Ok(bson::from_document(database)?))
            .collect()
    }

    /// Gets the names of the databases present in the deployment.
    pub async fn list_database_names(
        &self,
        filter: impl Into<Option<Document>>,
        options: impl Into<Option<ListDatabasesOptions>>,
        session: Option<&CoreSession>,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let mut op = ListDatabases::new(filter.into(), Some(true), options.into());
        self.execute_read(&mut op, session, cancel)
            .await?
            .into_iter()
            .map(|database| {
                database
                    .get_str("name")
                    .map(str::to_string)
                    .map_err(|_| Error::invalid_response("listDatabases returned a nameless database"))
            })
            .collect()
    }

    /// Finds the documents in `ns` matching `filter`.
    pub async fn find(
        &self,
        ns: Namespace,
        filter: Document,
        options: impl Into<Option<FindOptions>>,
        session: Option<&CoreSession>,
        cancel: &CancellationToken,
    ) -> Result<Cursor> {
        let mut options = options.into().unwrap_or_default();
        if options.read_concern.is_none() {
            options.read_concern = self.inner.options.read_concern.clone();
        }
        let mut op = Find::new(ns, filter, Some(options));
        let spec = self.execute_read(&mut op, session, cancel).await?;
        Ok(Cursor::new(self.inner.executor.clone(), spec))
    }

    /// Counts the documents in `ns` matching `filter` with the `count` command.
    pub async fn count(
        &self,
        ns: Namespace,
        filter: Document,
        options: impl Into<Option<CountOptions>>,
        session: Option<&CoreSession>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let mut options = options.into().unwrap_or_default();
        if options.read_concern.is_none() {
            options.read_concern = self.inner.options.read_concern.clone();
        }
        let mut op = Count::new(ns, filter, Some(options));
        self.execute_read(&mut op, session, cancel).await
    }

    /// Inserts `documents` into `ns`. Documents without an `_id` are given a generated one.
    pub async fn insert(
        &self,
        ns: Namespace,
        documents: Vec<Document>,
        options: impl Into<Option<InsertOptions>>,
        session: Option<&CoreSession>,
        cancel: &CancellationToken,
    ) -> Result<InsertResult> {
        let mut options = options.into().unwrap_or_default();
        if options.write_concern.is_none() {
            options.write_concern = self.inner.options.write_concern.clone();
        }
        let mut op = Insert::new(ns, documents, Some(options));
        self.execute_write(&mut op, session, cancel).await
    }

    /// Applies a batch of update statements to `ns`.
    pub async fn update(
        &self,
        ns: Namespace,
        updates: Vec<UpdateRequest>,
        options: impl Into<Option<UpdateOptions>>,
        session: Option<&CoreSession>,
        cancel: &CancellationToken,
    ) -> Result<UpdateResult> {
        let mut options = options.into().unwrap_or_default();
        if options.write_concern.is_none() {
            options.write_concern = self.inner.options.write_concern.clone();
        }
        let mut op = Update::new(ns, updates, Some(options));
        self.execute_write(&mut op, session, cancel).await
    }

    /// Applies a batch of delete statements to `ns`.
    pub async fn delete(
        &self,
        ns: Namespace,
        deletes: Vec<DeleteRequest>,
        options: impl Into<Option<DeleteOptions>>,
        session: Option<&CoreSession>,
        cancel: &CancellationToken,
    ) -> Result<DeleteResult> {
        let mut options = options.into().unwrap_or_default();
        if options.write_concern.is_none() {
            options.write_concern = self.inner.options.write_concern.clone();
        }
        let mut op = Delete::new(ns, deletes, Some(options));
        self.execute_write(&mut op, session, cancel).await
    }

    /// Runs an arbitrary command against `db`. The command is sent once and never retried.
    pub async fn run_command(
        &self,
        db: impl Into<String>,
        command: Document,
        selection_criteria: impl Into<Option<SelectionCriteria>>,
        session: Option<&CoreSession>,
        cancel: &CancellationToken,
    ) -> Result<Document> {
        let mut op = RunCommand::new(db.into(), command, selection_criteria.into())?;
        self.execute_read(&mut op, session, cancel).await
    }

    /// Commits the transaction running on `session`.
    ///
    /// A transaction that never sent a command commits without contacting the server. Calling
    /// this again after a commit re-sends it with a majority write concern.
    pub async fn commit_transaction(
        &self,
        session: &CoreSession,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let state = session.transaction_state();
        match state {
            TransactionState::None => Err(ErrorKind::Transaction {
                message: "no transaction started".into(),
            }
            .into()),
            TransactionState::Aborted => Err(ErrorKind::Transaction {
                message: "Cannot call commitTransaction after calling abortTransaction".into(),
            }
            .into()),
            TransactionState::Starting => {
                session.set_transaction_state(TransactionState::Committed {
                    data_committed: false,
                });
                Ok(())
            }
            TransactionState::Committed {
                data_committed: false,
            } => Ok(()),
            TransactionState::InProgress
            | TransactionState::Committed {
                data_committed: true,
            } => {
                let mut op = CommitTransaction::new(session.transaction_options());
                if matches!(state, TransactionState::Committed { .. }) {
                    op.update_for_retry();
                }
                session.set_transaction_state(TransactionState::Committed {
                    data_committed: true,
                });
                self.execute_write(&mut op, Some(session), cancel).await
            }
        }
    }

    /// Aborts the transaction running on `session`. Server errors are not reported; the
    /// transaction is considered aborted either way.
    pub async fn abort_transaction(
        &self,
        session: &CoreSession,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match session.transaction_state() {
            TransactionState::None => Err(ErrorKind::Transaction {
                message: "no transaction started".into(),
            }
            .into()),
            TransactionState::Committed { .. } => Err(ErrorKind::Transaction {
                message: "Cannot call abortTransaction after calling commitTransaction".into(),
            }
            .into()),
            TransactionState::Aborted => Err(ErrorKind::Transaction {
                message: "cannot call abortTransaction twice".into(),
            }
            .into()),
            TransactionState::Starting => {
                session.set_transaction_state(TransactionState::Aborted);
                session.unpin();
                Ok(())
            }
            TransactionState::InProgress => {
                let write_concern = session
                    .transaction_options()
                    .and_then(|options| options.write_concern);
                let mut op = AbortTransaction::new(write_concern);
                session.set_transaction_state(TransactionState::Aborted);
                if let Err(error) = self.execute_write(&mut op, Some(session), cancel).await {
                    tracing::debug!(
                        target: COMMAND_TRACING_EVENT_TARGET,
                        error = %error,
                        "Ignoring abortTransaction failure"
                    );
                }
                session.unpin();
                Ok(())
            }
        }
    }

    /// Runs a read with the operation's own selection criteria, falling back to the client's.
    /// Without a session the operation runs on an implicit one.
    pub(crate) async fn execute_read<Op: Operation>(
        &self,
        op: &mut Op,
        session: Option<&CoreSession>,
        cancel: &CancellationToken,
    ) -> Result<Op::O> {
        let criteria = op
            .selection_criteria()
            .cloned()
            .or_else(|| self.inner.options.selection_criteria.clone());
        let binding = ClusterBinding::new(self.topology().clone(), criteria, self.session(session));
        self.inner
            .executor
            .execute_read(op, Box::new(binding), cancel)
            .await
    }

    /// Runs a write against the primary. Without a session the operation runs on an implicit
    /// one.
    pub(crate) async fn execute_write<Op: Operation>(
        &self,
        op: &mut Op,
        session: Option<&CoreSession>,
        cancel: &CancellationToken,
    ) -> Result<Op::O> {
        let binding = ClusterBinding::new(self.topology().clone(), None, self.session(session));
        self.inner
            .executor
            .execute_write(op, Box::new(binding), cancel)
            .await
    }

    fn session(&self, session: Option<&CoreSession>) -> CoreSession {
        match session {
            Some(session) => session.fork(),
            None => CoreSession::new(self.topology().session_pool().clone(), None, true),
        }
    }

    fn topology(&self) -> &Arc<Topology> {
        self.inner.executor.topology()
    }
}
