#[cfg(test)]
mod test;

use std::{collections::VecDeque, fmt, sync::Arc, time::Duration};

use futures_core::Stream;
use tokio_util::sync::CancellationToken;

use crate::{
    binding::{ChannelSource, ChannelSourceBinding},
    bson::Document,
    error::Result,
    executor::OperationExecutor,
    operation::{CursorInfo, GetMore, KillCursors},
    trace::COMMAND_TRACING_EVENT_TARGET,
    Namespace,
};

const CURSOR_NOT_FOUND: i32 = 43;

/// What a cursor-returning operation hands back: the first batch, plus the channel source later
/// batches must be fetched through. The source carries its own fork of the session the cursor
/// was opened under.
#[derive(Debug)]
pub(crate) struct CursorSpecification {
    pub(crate) info: CursorInfo,
    pub(crate) source: ChannelSource,
    pub(crate) batch_size: Option<u32>,
    pub(crate) max_time: Option<Duration>,
}

/// A `Cursor` streams the result of a query. When a query is made, a `Cursor` will be returned
/// with the first batch of results from the server; the documents will be returned as the
/// `Cursor` is iterated. When the batch is exhausted and if there are more results, the `Cursor`
/// will fetch the next batch of documents from the same server, and so forth until the results
/// are exhausted.
///
/// The cursor holds its own fork of the channel source it was opened on, which in turn holds a
/// fork of the session, so it stays usable after the operation that created it has finished. The
/// fork is released as soon as the server reports the cursor exhausted, or when the cursor is
/// closed or dropped.
///
/// ```rust
/// # use mongodb_core::{bson::doc, error::Result, Client, Namespace};
/// # use tokio_util::sync::CancellationToken;
/// # async fn run(client: &Client) -> Result<()> {
/// let cancel = CancellationToken::new();
/// let mut cursor = client
///     .find(Namespace::new("db", "books"), doc! { "author": "Orwell" }, None, None, &cancel)
///     .await?;
/// while let Some(book) = cursor.next(&cancel).await? {
///     println!("{}", book);
/// }
/// # Ok(())
/// # }
/// ```
///
/// Dropping a cursor that the server still holds open sends `killCursors` in the background when
/// a tokio runtime is available; [`Cursor::close`] does the same and waits for it.
pub struct Cursor {
    executor: Arc<OperationExecutor>,
    ns: Namespace,
    id: i64,
    buffer: VecDeque<Document>,
    batch_size: Option<u32>,
    max_time: Option<Duration>,
    source: Option<ChannelSource>,
}

impl Cursor {
    pub(crate) fn new(executor: Arc<OperationExecutor>, spec: CursorSpecification) -> Self {
        let source = (spec.info.id != 0).then_some(spec.source);
        Self {
            executor,
            ns: spec.info.ns,
            id: spec.info.id,
            buffer: spec.info.first_batch,
            batch_size: spec.batch_size,
            max_time: spec.max_time,
            source,
        }
    }

    /// The server-side id of this cursor, or 0 once the server has exhausted it.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// The namespace the cursor iterates over.
    pub fn namespace(&self) -> &Namespace {
        &self.ns
    }

    /// Whether every result has been returned.
    pub fn is_exhausted(&self) -> bool {
        self.id == 0 && self.buffer.is_empty()
    }

    /// Returns the next document, fetching another batch from the server when the current one
    /// is used up. Returns `None` once the cursor is exhausted.
    pub async fn next(&mut self, cancel: &CancellationToken) -> Result<Option<Document>> {
        loop {
            if let Some(document) = self.buffer.pop_front() {
                return Ok(Some(document));
            }
            if self.id == 0 {
                return Ok(None);
            }
            self.get_more(cancel).await?;
        }
    }

    async fn get_more(&mut self, cancel: &CancellationToken) -> Result<()> {
        let Some(ref source) = self.source else {
            self.id = 0;
            return Ok(());
        };
        let binding = ChannelSourceBinding::new(source.fork());
        let mut get_more = GetMore::new(self.ns.clone(), self.id, self.batch_size, self.max_time);

        match self
            .executor
            .execute_read(&mut get_more, Box::new(binding), cancel)
            .await
        {
            Ok(result) => {
                self.buffer = result.batch;
                self.id = result.id;
                if self.id == 0 {
                    self.source = None;
                }
                Ok(())
            }
            Err(error) => {
                // The server side of the cursor is gone; there is nothing left to kill.
                if error.is_network_error() || error.code() == Some(CURSOR_NOT_FOUND) {
                    self.id = 0;
                    self.source = None;
                }
                Err(error)
            }
        }
    }

    /// Closes the cursor, killing it on the server if it is still open there.
    pub async fn close(mut self, cancel: &CancellationToken) -> Result<()> {
        let Some(source) = self.source.take() else {
            return Ok(());
        };
        let id = std::mem::take(&mut self.id);
        kill_cursor(&self.executor, self.ns.clone(), id, source, cancel).await
    }

    /// Converts the cursor into a [`Stream`] of documents.
    pub fn into_stream(self) -> impl Stream<Item = Result<Document>> + Send {
        futures_util::stream::try_unfold(self, |mut cursor| async move {
            let cancel = CancellationToken::new();
            let next = cursor.next(&cancel).await?;
            Ok(next.map(|document| (document, cursor)))
        })
    }
}

async fn kill_cursor(
    executor: &OperationExecutor,
    ns: Namespace,
    id: i64,
    source: ChannelSource,
    cancel: &CancellationToken,
) -> Result<()> {
    let binding = ChannelSourceBinding::new(source);
    executor
        .execute_write(&mut KillCursors::new(ns, id), Box::new(binding), cancel)
        .await
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if self.id == 0 {
            return;
        }
        let Some(source) = self.source.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let executor = self.executor.clone();
        let ns = self.ns.clone();
        let id = self.id;
        runtime.spawn(async move {
            if let Err(error) =
                kill_cursor(&executor, ns, id, source, &CancellationToken::new()).await
            {
                tracing::debug!(
                    target: COMMAND_TRACING_EVENT_TARGET,
                    cursorId = id,
                    error = %error,
                    "Failed to kill dropped cursor"
                );
            }
        });
    }
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("ns", &self.ns)
            .field("id", &self.id)
            .field("buffered", &self.buffer.len())
            .finish()
    }
}
