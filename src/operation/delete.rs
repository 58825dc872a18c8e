#[cfg(test)]
mod test;

use crate::{
    bson::doc,
    cmap::{Command, RawCommandResponse, StreamDescription},
    concern::WriteConcern,
    error::{Error, Result},
    operation::{
        append_options,
        non_empty_write_concern,
        write_statements,
        DeleteRequest,
        ExecutionContext,
        OperationWithDefaults,
        Retryability,
        WriteRequest,
        WriteResponseBody,
    },
    options::DeleteOptions,
    results::DeleteResult,
    Namespace,
};

#[derive(Debug)]
pub(crate) struct Delete {
    ns: Namespace,
    requests: Vec<WriteRequest>,
    options: DeleteOptions,
}

impl Delete {
    pub(crate) fn new(
        ns: Namespace,
        deletes: Vec<DeleteRequest>,
        options: Option<DeleteOptions>,
    ) -> Self {
        let mut options = options.unwrap_or_default();
        if options.ordered.is_none() {
            options.ordered = Some(true);
        }
        Self {
            ns,
            requests: deletes.into_iter().map(WriteRequest::Delete).collect(),
            options,
        }
    }
}

impl OperationWithDefaults for Delete {
    type O = DeleteResult;

    const NAME: &'static str = "delete";

    fn build(&mut self, description: &StreamDescription) -> Result<Command> {
        if self.requests.is_empty() {
            return Err(Error::invalid_argument("no delete statements provided"));
        }
        if self.requests.len() as i64 > description.max_write_batch_size {
            return Err(Error::invalid_argument(format!(
                "cannot send {} delete statements in one batch; the server accepts at most {}",
                self.requests.len(),
                description.max_write_batch_size
            )));
        }

        let mut body = doc! {
            Self::NAME: self.ns.coll.clone(),
        };
        append_options(&mut body, Some(&self.options))?;

        let mut command = Command::new(Self::NAME, &self.ns.db, body);
        command.add_document_sequence("deletes", write_statements(&self.requests)?);
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
        let response: WriteResponseBody = response.body()?;
        response.validate()?;
        Ok(DeleteResult {
            deleted_count: response.n,
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
