mod abort_transaction;
mod commit_transaction;
mod count;
mod delete;
mod find;
mod get_more;
mod insert;
mod kill_cursors;
mod list_databases;
mod run_command;
mod update;

use std::{collections::VecDeque, fmt::Debug};

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    binding::{Channel, ChannelSource},
    bson::{self, Document, RawDocumentBuf},
    cmap::{Command, RawCommandResponse, StreamDescription},
    concern::WriteConcern,
    error::{Error, ErrorKind, IndexedWriteError, Result, WriteConcernError},
    selection_criteria::SelectionCriteria,
    session::CoreSession,
    Namespace,
};

pub(crate) use self::{
    abort_transaction::AbortTransaction,
    commit_transaction::CommitTransaction,
    count::Count,
    delete::Delete,
    find::Find,
    get_more::GetMore,
    insert::Insert,
    kill_cursors::KillCursors,
    list_databases::ListDatabases,
    run_command::RunCommand,
    update::Update,
};

/// What an operation's response handler can see of the attempt that produced the response.
#[derive(Clone, Copy)]
pub(crate) struct ExecutionContext<'a> {
    pub(crate) channel: &'a Channel,
    pub(crate) channel_source: &'a ChannelSource,
    pub(crate) session: &'a CoreSession,
    /// The read preference the binding selected the server with, if the attempt is a read.
    pub(crate) read_preference: Option<&'a SelectionCriteria>,
}

/// A trait modeling the behavior of a server side operation.
///
/// No methods in this trait should have default behaviors to ensure that wrapper operations
/// replicate all behavior.  Default behavior is provided by the `OperationWithDefaults` trait.
pub(crate) trait Operation: Send + Sync {
    /// The output type of this operation.
    type O: Send;

    /// The name of the server side command associated with this operation.
    const NAME: &'static str;

    /// Returns the command that should be sent to the server as part of this operation.
    /// The operation may store some additional state that is required for handling the response.
    fn build(&mut self, description: &StreamDescription) -> Result<Command>;

    /// Interprets the server response to the command.
    fn handle_response(
        &self,
        response: RawCommandResponse,
        context: ExecutionContext<'_>,
    ) -> Result<Self::O>;

    /// Interpret an error encountered while sending the built command to the server, potentially
    /// recovering.
    fn handle_error(&self, error: Error) -> Result<Self::O>;

    /// Criteria to use for selecting the server that this operation will be executed on.
    fn selection_criteria(&self) -> Option<&SelectionCriteria>;

    /// Whether or not this operation will request acknowledgment from the server.
    fn is_acknowledged(&self) -> bool;

    /// The write concern to use for this operation, if any.
    fn write_concern(&self) -> Option<&WriteConcern>;

    /// Returns whether or not this command supports the `readConcern` field.
    fn supports_read_concern(&self, description: &StreamDescription) -> bool;

    /// Whether this operation supports sessions or not.
    fn supports_sessions(&self) -> bool;

    /// The level of retryability the operation supports.
    fn retryability(&self) -> Retryability;

    /// The individual writes a batched write operation is made of.
    fn write_requests(&self) -> &[WriteRequest];

    /// Updates this operation as needed for a retry.
    fn update_for_retry(&mut self);

    fn name(&self) -> &str;
}

// A mirror of the `Operation` trait, with default behavior where appropriate. Should only be
// implemented by operation types that do not delegate to other operations.
pub(crate) trait OperationWithDefaults: Send + Sync {
    /// The output type of this operation.
    type O: Send;

    /// The name of the server side command associated with this operation.
    const NAME: &'static str;

    /// Returns the command that should be sent to the server as part of this operation.
    /// The operation may store some additional state that is required for handling the response.
    fn build(&mut self, description: &StreamDescription) -> Result<Command>;

    /// Interprets the server response to the command.
    fn handle_response(
        &self,
        response: RawCommandResponse,
        context: ExecutionContext<'_>,
    ) -> Result<Self::O>;

    /// Interpret an error encountered while sending the built command to the server, potentially
    /// recovering.
    fn handle_error(&self, error: Error) -> Result<Self::O> {
        Err(error)
    }

    /// Criteria to use for selecting the server that this operation will be executed on.
    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        None
    }

    /// Whether or not this operation will request acknowledgment from the server.
    fn is_acknowledged(&self) -> bool {
        self.write_concern()
            .map(WriteConcern::is_acknowledged)
            .unwrap_or(true)
    }

    /// The write concern to use for this operation, if any.
    fn write_concern(&self) -> Option<&WriteConcern> {
        None
    }

    /// Returns whether or not this command supports the `readConcern` field.
    fn supports_read_concern(&self, _description: &StreamDescription) -> bool {
        false
    }

    /// Whether this operation supports sessions or not.
    fn supports_sessions(&self) -> bool {
        true
    }

    /// The level of retryability the operation supports.
    fn retryability(&self) -> Retryability {
        Retryability::None
    }

    fn write_requests(&self) -> &[WriteRequest] {
        &[]
    }

    /// Updates this operation as needed for a retry.
    fn update_for_retry(&mut self) {}

    fn name(&self) -> &str {
        Self::NAME
    }
}

impl<T: OperationWithDefaults> Operation for T {
    type O = T::O;
    const NAME: &'static str = T::NAME;
    fn build(&mut self, description: &StreamDescription) -> Result<Command> {
        self.build(description)
    }
    fn handle_response(
        &self,
        response: RawCommandResponse,
        context: ExecutionContext<'_>,
    ) -> Result<Self::O> {
        self.handle_response(response, context)
    }
    fn handle_error(&self, error: Error) -> Result<Self::O> {
        self.handle_error(error)
    }
    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.selection_criteria()
    }
    fn is_acknowledged(&self) -> bool {
        self.is_acknowledged()
    }
    fn write_concern(&self) -> Option<&WriteConcern> {
        self.write_concern()
    }
    fn supports_read_concern(&self, description: &StreamDescription) -> bool {
        self.supports_read_concern(description)
    }
    fn supports_sessions(&self) -> bool {
        self.supports_sessions()
    }
    fn retryability(&self) -> Retryability {
        self.retryability()
    }
    fn write_requests(&self) -> &[WriteRequest] {
        self.write_requests()
    }
    fn update_for_retry(&mut self) {
        self.update_for_retry()
    }
    fn name(&self) -> &str {
        self.name()
    }
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub(crate) enum Retryability {
    Write,
    Read,
    None,
}

/// One update statement of an [`update`](crate::Client::update) batch.
#[derive(Clone, Debug, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
#[non_exhaustive]
pub struct UpdateRequest {
    /// Selects the documents to update.
    pub filter: Document,

    /// The modifications to apply.
    pub update: Document,

    /// Whether every matching document is updated rather than just the first. Multi-document
    /// updates are never retried.
    #[builder(default)]
    pub multi: bool,

    /// Whether to insert a document when none match.
    #[builder(default)]
    pub upsert: Option<bool>,
}

/// One delete statement of a [`delete`](crate::Client::delete) batch.
#[derive(Clone, Debug, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
#[non_exhaustive]
pub struct DeleteRequest {
    /// Selects the documents to delete.
    pub filter: Document,

    /// Whether every matching document is deleted rather than just the first. Multi-document
    /// deletes are never retried.
    #[builder(default)]
    pub multi: bool,
}

/// One member of a batched write.
#[derive(Clone, Debug)]
pub(crate) enum WriteRequest {
    Insert(Document),
    Update(UpdateRequest),
    Delete(DeleteRequest),
}

impl WriteRequest {
    /// Whether this write can safely be applied a second time on a connection with the given
    /// description.
    pub(crate) fn is_retryable(&self, description: &StreamDescription) -> bool {
        if !description.supports_retryable_writes() {
            return false;
        }
        match self {
            Self::Insert(_) => true,
            Self::Update(update) => !update.multi,
            Self::Delete(delete) => !delete.multi,
        }
    }

    fn to_statement(&self) -> Result<RawDocumentBuf> {
        let statement = match self {
            Self::Insert(document) => document.clone(),
            Self::Update(update) => {
                let mut statement = bson::doc! {
                    "q": update.filter.clone(),
                    "u": update.update.clone(),
                    "multi": update.multi,
                };
                if let Some(upsert) = update.upsert {
                    statement.insert("upsert", upsert);
                }
                statement
            }
            Self::Delete(delete) => bson::doc! {
                "q": delete.filter.clone(),
                "limit": if delete.multi { 0 } else { 1 },
            },
        };
        Ok(RawDocumentBuf::from_document(&statement)?)
    }
}

/// Builds the document sequence of a batched write: `documents`, `updates` or `deletes`.
pub(crate) fn write_statements(requests: &[WriteRequest]) -> Result<Vec<RawDocumentBuf>> {
    requests.iter().map(WriteRequest::to_statement).collect()
}

/// Appends a serializable struct to the input document. The serializable struct MUST serialize to a
/// Document; otherwise, an error will be thrown.
pub(crate) fn append_options<T: Serialize + Debug>(
    doc: &mut Document,
    options: Option<&T>,
) -> Result<()> {
    if let Some(options) = options {
        let options_doc = bson::to_document(options)?;
        doc.extend(options_doc);
    }
    Ok(())
}

/// Drops a write concern with no fields set, so the server default applies.
pub(crate) fn non_empty_write_concern(write_concern: Option<&WriteConcern>) -> Option<&WriteConcern> {
    write_concern.filter(|write_concern| !write_concern.is_empty())
}

#[derive(Deserialize, Debug)]
pub(crate) struct EmptyBody {}

/// Body of a write response that could possibly have a write concern error but not write errors.
#[derive(Debug, Deserialize, Default, Clone)]
pub(crate) struct WriteConcernOnlyBody {
    #[serde(rename = "writeConcernError")]
    write_concern_error: Option<WriteConcernError>,

    #[serde(rename = "errorLabels")]
    labels: Option<Vec<String>>,
}

impl WriteConcernOnlyBody {
    pub(crate) fn validate(&self) -> Result<()> {
        match self.write_concern_error {
            Some(ref wc_error) => Err(Error::new(
                ErrorKind::WriteConcern(wc_error.clone()),
                self.labels.clone(),
            )),
            None => Ok(()),
        }
    }
}

#[derive(Deserialize, Debug)]
pub(crate) struct WriteResponseBody<T = EmptyBody> {
    #[serde(flatten)]
    pub(crate) body: T,

    #[serde(default)]
    pub(crate) n: u64,

    #[serde(rename = "writeErrors")]
    write_errors: Option<Vec<IndexedWriteError>>,

    #[serde(rename = "writeConcernError")]
    write_concern_error: Option<WriteConcernError>,

    #[serde(rename = "errorLabels")]
    labels: Option<Vec<String>>,
}

impl<T> WriteResponseBody<T> {
    /// Individual write errors take precedence over a write concern error.
    pub(crate) fn validate(&self) -> Result<()> {
        if let Some(ref write_errors) = self.write_errors {
            return Err(Error::new(
                ErrorKind::Write(write_errors.clone()),
                self.labels.clone(),
            ));
        }
        if let Some(ref wc_error) = self.write_concern_error {
            return Err(Error::new(
                ErrorKind::WriteConcern(wc_error.clone()),
                self.labels.clone(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct CursorBody {
    pub(crate) cursor: CursorInfo,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CursorInfo {
    pub(crate) id: i64,

    pub(crate) ns: Namespace,

    #[serde(alias = "nextBatch")]
    pub(crate) first_batch: VecDeque<Document>,
}
