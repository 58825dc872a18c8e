
use std::collections::HashMap;

use serde::Deserialize;

use crate::{
    bson::{doc, Bson},
    cmap::{Command, RawCommandResponse, StreamDescription},
    concern::WriteConcern,
    error::{Error, Result},
    operation::{
        append_options,
        non_empty_write_concern,
        write_statements,
        ExecutionContext,
        OperationWithDefaults,
        Retryability,
        UpdateRequest,
        WriteRequest,
        WriteResponseBody,
    },
    options::UpdateOptions,
    results::UpdateResult,
    Namespace,
};

#[derive(Debug)]
pub(crate) struct Update {
    ns: Namespace,
    requests: Vec<WriteRequest>,
    options: UpdateOptions,
}

impl Update {
    pub(crate) fn new(
        ns: Namespace,
        updates: Vec<UpdateRequest>,
        options: Option<UpdateOptions>,
    ) -> Self {
        let mut options = options.unwrap_or_default();
        if options.ordered.is_none() {
            options.ordered = Some(true);
        }
        Self {
            ns,
            requests: updates.into_iter().map(WriteRequest::Update).collect(),
            options,
        }
    }
}

impl OperationWithDefaults for Update {
    type O = UpdateResult;

    const NAME: &'static str = "update";

    fn build(&mut self, description: &StreamDescription) -> Result<Command> {
        if self.requests.is_empty() {
            return Err(Error::invalid_argument("no update statements provided"));
        }
        if self.requests.len() as i64 > description.max_write_batch_size {
            return Err(Error::invalid_argument(format!(
                "cannot send {} update statements in one batch; the server accepts at most {}",
                self.requests.len(),
                description.max_write_batch_size
            )));
        }

        let mut body = doc! {
            Self::NAME: self.ns.coll.clone(),
        };
        append_options(&mut body, Some(&self.options))?;

        let mut command = Command::new(Self::NAME, &self.ns.db, body);
        command.add_document_sequence("updates", write_statements(&self.requests)?);
        if let Some(write_concern) = non_empty_write_concern(self.write_concern()) {
            command.set_write_concern(write_concern);
        }
        Ok(command)
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _context: ExecutionContext<'_>,
    ) -> Result<Self::O> {
        let response: WriteResponseBody<UpdateBody> = response.body()?;
        response.validate()?;

        let upserted = response.body.upserted.unwrap_or_default();
        // `n` counts upserted documents as matched.
        let matched_count = response.n.saturating_sub(upserted.len() as u64);
        let upserted_ids = upserted
            .into_iter()
            .map(|upserted| (upserted.index, upserted.id))
            .collect::<HashMap<_, _>>();

        Ok(UpdateResult {
            matched_count,
            modified_count: response.body.n_modified,
            upserted_ids,
        })
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        self.options.write_concern.as_ref()
    }

    fn retryability(&self) -> Retryability {
        Retryability::Write
    }

    fn write_requests(&self) -> &[WriteRequest] {
        &self.requests
    }
}

#[derive(Debug, Deserialize)]
struct UpdateBody {
    #[serde(rename = "nModified", default)]
    n_modified: u64,

    upserted: Option<Vec<Upserted>>,
}

#[derive(Debug, Deserialize)]
struct Upserted {
    index: usize,

    #[serde(rename = "_id")]
    id: Bson,
}
