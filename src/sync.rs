//! Contains the sync API. This is only available when the `sync` feature is enabled.
//!
//! Every call blocks the current thread on a runtime owned by this module, so it must not be
//! made from within an async context.

use std::sync::{Arc, LazyLock};

use tokio_util::sync::CancellationToken;

use crate::{
    bson::Document,
    cmap::StreamConnector,
    error::Result,
    options::{
        ClientOptions,
        CountOptions,
        DeleteOptions,
        DeleteRequest,
        FindOptions,
        InsertOptions,
        ListDatabasesOptions,
        SelectionCriteria,
        SessionOptions,
        UpdateOptions,
        UpdateRequest,
    },
    results::{DatabaseSpecification, DeleteResult, InsertResult, UpdateResult},
    sdam::ServerDescription,
    session::CoreSession,
    Client as AsyncClient,
    Cursor as AsyncCursor,
    Namespace,
};

static TOKIO_RUNTIME: LazyLock<tokio::runtime::Runtime> =
    LazyLock::new(|| match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => panic!(
            "Error occurred when starting the underlying async runtime: {}",
            err
        ),
    });

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    TOKIO_RUNTIME.block_on(future)
}

/// This is the main entry point for the synchronous API. It wraps an async
/// [`Client`](crate::Client) and runs it on an internal tokio runtime.
///
/// `Client` uses [`std::sync::Arc`] internally, so it can safely be shared across threads.
///
/// Operations started through the sync API cannot be cancelled; each one runs until it
/// completes or fails.
#[derive(Clone, Debug)]
pub struct Client {
    async_client: AsyncClient,
}

impl From<AsyncClient> for Client {
    fn from(async_client: AsyncClient) -> Self {
        Self { async_client }
    }
}

impl Client {
    /// Creates a client whose connections are opened through `connector`.
    pub fn new(options: ClientOptions, connector: Arc<dyn StreamConnector>) -> Result<Self> {
        AsyncClient::new(options, connector).map(Self::from)
    }

    /// Creates a client that connects over TCP.
    pub fn with_options(options: ClientOptions) -> Result<Self> {
        AsyncClient::with_options(options).map(Self::from)
    }

    /// Records the monitor's latest description of one server.
    pub fn update_server(&self, description: ServerDescription) {
        self.async_client.update_server(description);
    }

    /// Starts a new explicit session.
    pub fn start_session(&self, options: Option<SessionOptions>) -> Result<CoreSession> {
        self.async_client.start_session(options)
    }

    /// Gets information about each database present in the deployment.
    pub fn list_databases(
        &self,
        filter: impl Into<Option<Document>>,
        options: impl Into<Option<ListDatabasesOptions>>,
        session: Option<&CoreSession>,
    ) -> Result<Vec<DatabaseSpecification>> {
        block_on(
            self.async_client
                .list_databases(filter, options, session, &CancellationToken::new()),
        )
    }

    /// Gets the names of the databases present in the deployment.
    pub fn list_database_names(
        &self,
        filter: impl Into<Option<Document>>,
        options: impl Into<Option<ListDatabasesOptions>>,
        session: Option<&CoreSession>,
    ) -> Result<Vec<String>> {
        block_on(
            self.async_client
                .list_database_names(filter, options, session, &CancellationToken::new()),
        )
    }

    /// Finds the documents in `ns` matching `filter`.
    pub fn find(
        &self,
        ns: Namespace,
        filter: Document,
        options: impl Into<Option<FindOptions>>,
        session: Option<&CoreSession>,
    ) -> Result<Cursor> {
        let async_cursor = block_on(self.async_client.find(
            ns,
            filter,
            options,
            session,
            &CancellationToken::new(),
        ))?;
        Ok(Cursor {
            async_cursor: Some(async_cursor),
        })
    }

    /// Counts the documents in `ns` matching `filter`.
    pub fn count(
        &self,
        ns: Namespace,
        filter: Document,
        options: impl Into<Option<CountOptions>>,
        session: Option<&CoreSession>,
    ) -> Result<u64> {
        block_on(
            self.async_client
                .count(ns, filter, options, session, &CancellationToken::new()),
        )
    }

    /// Inserts `documents` into `ns`.
    pub fn insert(
        &self,
        ns: Namespace,
        documents: Vec<Document>,
        options: impl Into<Option<InsertOptions>>,
        session: Option<&CoreSession>,
    ) -> Result<InsertResult> {
        block_on(
            self.async_client
                .insert(ns, documents, options, session, &CancellationToken::new()),
        )
    }

    /// Applies a batch of update statements to `ns`.
    pub fn update(
        &self,
        ns: Namespace,
        updates: Vec<UpdateRequest>,
        options: impl Into<Option<UpdateOptions>>,
        session: Option<&CoreSession>,
    ) -> Result<UpdateResult> {
        block_on(
            self.async_client
                .update(ns, updates, options, session, &CancellationToken::new()),
        )
    }

    /// Applies a batch of delete statements to `ns`.
    pub fn delete(
        &self,
        ns: Namespace,
        deletes: Vec<DeleteRequest>,
        options: impl Into<Option<DeleteOptions>>,
        session: Option<&CoreSession>,
    ) -> Result<DeleteResult> {
        block_on(
            self.async_client
                .delete(ns, deletes, options, session, &CancellationToken::new()),
        )
    }

    /// Runs an arbitrary command against `db`.
    pub fn run_command(
        &self,
        db: impl Into<String>,
        command: Document,
        selection_criteria: impl Into<Option<SelectionCriteria>>,
        session: Option<&CoreSession>,
    ) -> Result<Document> {
        block_on(self.async_client.run_command(
            db,
            command,
            selection_criteria,
            session,
            &CancellationToken::new(),
        ))
    }

    /// Commits the transaction running on `session`.
    pub fn commit_transaction(&self, session: &CoreSession) -> Result<()> {
        block_on(
            self.async_client
                .commit_transaction(session, &CancellationToken::new()),
        )
    }

    /// Aborts the transaction running on `session`.
    pub fn abort_transaction(&self, session: &CoreSession) -> Result<()> {
        block_on(
            self.async_client
                .abort_transaction(session, &CancellationToken::new()),
        )
    }
}

/// A blocking cursor over the result of a query. Iterating it may fetch further batches from
/// the server, so it yields `Result<Document>` items.
#[derive(Debug)]
pub struct Cursor {
    async_cursor: Option<AsyncCursor>,
}

impl Cursor {
    /// Closes the cursor, killing it on the server if it is still open there.
    pub fn close(mut self) -> Result<()> {
        match self.async_cursor.take() {
            Some(cursor) => block_on(cursor.close(&CancellationToken::new())),
            None => Ok(()),
        }
    }
}

impl Iterator for Cursor {
    type Item = Result<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        let cursor = self.async_cursor.as_mut()?;
        block_on(cursor.next(&CancellationToken::new())).transpose()
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        // The async cursor kills itself on whichever runtime is current when it is dropped.
        let _guard = TOKIO_RUNTIME.enter();
        self.async_cursor.take();
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::Client;
    use crate::{
        bson::doc,
        sdam::ServerType,
        test::util::{address, client_options, server_description, MockServer},
        Namespace,
    };

    #[test]
    fn blocking_find_iterates_every_batch() {
        let mock = MockServer::new();
        let client = Client::new(client_options(&["a:27017"]), Arc::new(mock.clone())).unwrap();
        client.update_server(server_description("a:27017", ServerType::RsPrimary));
        mock.reply(
            &address("a:27017"),
            "find",
            doc! { "ok": 1, "cursor": { "id": 5_i64, "ns": "db.coll", "firstBatch": [{ "x": 1 }] } },
        );
        mock.reply(
            &address("a:27017"),
            "getMore",
            doc! { "ok": 1, "cursor": { "id": 0_i64, "ns": "db.coll", "nextBatch": [{ "x": 2 }] } },
        );

        let cursor = client
            .find(Namespace::new("db", "coll"), doc! {}, None, None)
            .unwrap();
        let documents: Vec<_> = cursor.map(|document| document.unwrap()).collect();
        assert_eq!(documents, vec![doc! { "x": 1 }, doc! { "x": 2 }]);
    }
}
