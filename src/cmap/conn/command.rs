use serde::{Deserialize, Serialize};

use super::wire::{DocumentSequence, Message};
use crate::{
    bson::{Document, RawBsonRef, RawDocument, RawDocumentBuf, Timestamp},
    concern::{ReadConcern, ReadConcernInternal, WriteConcern},
    error::{Error, ErrorKind, Result},
    options::{ServerAddress, ServerApi},
    selection_criteria::ReadPreference,
    session::ClusterTime,
};

/// Commands whose bodies and replies are never surfaced in events or traces.
pub(crate) const REDACTED_COMMANDS: [&str; 9] = [
    "authenticate",
    "saslstart",
    "saslcontinue",
    "getnonce",
    "createuser",
    "updateuser",
    "copydbgetnonce",
    "copydbsaslstart",
    "copydb",
];

/// Client-side model of a database command.
#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Command {
    #[serde(skip)]
    pub(crate) name: String,

    #[serde(skip)]
    pub(crate) exhaust_allowed: bool,

    /// Sent with `moreToCome`; the server will not reply.
    #[serde(skip)]
    pub(crate) unacknowledged: bool,

    #[serde(flatten)]
    pub(crate) body: Document,

    #[serde(skip)]
    pub(crate) document_sequences: Vec<DocumentSequence>,

    #[serde(rename = "$db")]
    pub(crate) target_db: String,

    pub(crate) lsid: Option<Document>,

    #[serde(rename = "$clusterTime")]
    pub(crate) cluster_time: Option<ClusterTime>,

    #[serde(flatten)]
    pub(crate) server_api: Option<ServerApi>,

    #[serde(rename = "$readPreference")]
    pub(crate) read_preference: Option<ReadPreference>,

    pub(crate) txn_number: Option<i64>,

    pub(crate) start_transaction: Option<bool>,

    pub(crate) autocommit: Option<bool>,

    pub(crate) read_concern: Option<ReadConcernInternal>,

    #[serde(skip_serializing_if = "write_concern_is_empty")]
    pub(crate) write_concern: Option<WriteConcern>,

    pub(crate) recovery_token: Option<Document>,
}

fn write_concern_is_empty(write_concern: &Option<WriteConcern>) -> bool {
    write_concern
        .as_ref()
        .is_none_or(|write_concern| write_concern.is_empty())
}

impl Command {
    /// Constructs a new command. The first key of `body` must be the command name.
    pub(crate) fn new(name: impl ToString, target_db: impl ToString, body: Document) -> Self {
        Self {
            name: name.to_string(),
            target_db: target_db.to_string(),
            body,
            ..Default::default()
        }
    }

    pub(crate) fn add_document_sequence(
        &mut self,
        identifier: impl ToString,
        documents: Vec<RawDocumentBuf>,
    ) {
        self.document_sequences.push(DocumentSequence {
            identifier: identifier.to_string(),
            documents,
        });
    }

    pub(crate) fn set_session_id(&mut self, lsid: Document) {
        self.lsid = Some(lsid);
    }

    pub(crate) fn set_cluster_time(&mut self, cluster_time: &ClusterTime) {
        self.cluster_time = Some(cluster_time.clone());
    }

    pub(crate) fn set_recovery_token(&mut self, recovery_token: &Document) {
        self.recovery_token = Some(recovery_token.clone());
    }

    pub(crate) fn set_txn_number(&mut self, txn_number: u64) {
        // the server stores transaction numbers as signed 64 bit integers
        self.txn_number = Some(txn_number as i64);
    }

    pub(crate) fn set_server_api(&mut self, server_api: &ServerApi) {
        self.server_api = Some(server_api.clone());
    }

    pub(crate) fn set_read_preference(&mut self, read_preference: ReadPreference) {
        self.read_preference = Some(read_preference);
    }

    pub(crate) fn set_start_transaction(&mut self) {
        self.start_transaction = Some(true);
    }

    pub(crate) fn set_autocommit(&mut self) {
        self.autocommit = Some(false);
    }

    pub(crate) fn set_read_concern(&mut self, read_concern: &ReadConcern) {
        self.read_concern = Some(read_concern.clone().into());
    }

    pub(crate) fn set_write_concern(&mut self, write_concern: &WriteConcern) {
        self.write_concern = Some(write_concern.clone());
    }

    pub(crate) fn clear_concerns(&mut self) {
        self.read_concern = None;
        self.write_concern = None;
    }

    pub(crate) fn set_after_cluster_time(&mut self, operation_time: Timestamp) {
        let inner = self.read_concern.get_or_insert(ReadConcernInternal {
            level: None,
            after_cluster_time: None,
        });
        inner.after_cluster_time = Some(operation_time);
    }

    pub(crate) fn should_redact(&self) -> bool {
        let name = self.name.to_lowercase();
        REDACTED_COMMANDS.contains(&name.as_str())
    }

    pub(crate) fn into_message(self) -> Result<Message> {
        Message::from_command(self, None)
    }
}

/// The single reply document of a command, along with where it came from.
#[derive(Debug, Clone)]
pub(crate) struct RawCommandResponse {
    pub(crate) source: ServerAddress,
    raw: RawDocumentBuf,

    /// Set when the reply was a legacy OP_REPLY with the `QueryFailure` flag.
    pub(crate) query_failure: bool,
}

impl RawCommandResponse {
    pub(crate) fn new_raw(source: ServerAddress, raw: RawDocumentBuf) -> Self {
        Self {
            source,
            raw,
            query_failure: false,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_document_and_address(source: ServerAddress, doc: Document) -> Result<Self> {
        Ok(Self::new_raw(source, RawDocumentBuf::from_document(&doc)?))
    }

    /// Whether the `ok` field of the reply is set to a truthy value.
    pub(crate) fn is_success(&self) -> bool {
        match self.raw.get("ok") {
            Ok(Some(RawBsonRef::Double(ok))) => ok == 1.0,
            Ok(Some(RawBsonRef::Int32(ok))) => ok == 1,
            Ok(Some(RawBsonRef::Int64(ok))) => ok == 1,
            Ok(Some(RawBsonRef::Boolean(ok))) => ok,
            _ => false,
        }
    }

    pub(crate) fn body<'a, T: Deserialize<'a>>(&'a self) -> Result<T> {
        crate::bson::from_slice(self.raw.as_bytes()).map_err(|e| {
            Error::from(ErrorKind::InvalidResponse {
                message: format!("{e}"),
            })
        })
    }

    pub(crate) fn raw_body(&self) -> &RawDocument {
        &self.raw
    }

    pub(crate) fn into_raw_document_buf(self) -> RawDocumentBuf {
        self.raw
    }
}
