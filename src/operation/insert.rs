#[cfg(test)]
mod test;

use std::collections::HashMap;

use crate::{
    bson::{doc, oid::ObjectId, Bson, Document},
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
        WriteRequest,
        WriteResponseBody,
    },
    options::InsertOptions,
    results::InsertResult,
    Namespace,
};

#[derive(Debug)]
pub(crate) struct Insert {
    ns: Namespace,
    requests: Vec<WriteRequest>,
    inserted_ids: Vec<Bson>,
    options: InsertOptions,
}

impl Insert {
    /// Documents without an `_id` get a generated `ObjectId` prepended, so the ids are known
    /// before the first attempt and stay the same on a retry.
    pub(crate) fn new(
        ns: Namespace,
        documents: Vec<Document>,
        options: Option<InsertOptions>,
    ) -> Self {
        let mut options = options.unwrap_or_default();
        if options.ordered.is_none() {
            options.ordered = Some(true);
        }

        let mut inserted_ids = Vec::with_capacity(documents.len());
        let requests = documents
            .into_iter()
            .map(|document| {
                let document = match document.get("_id") {
                    Some(id) => {
                        inserted_ids.push(id.clone());
                        document
                    }
                    None => {
                        let id = ObjectId::new();
                        inserted_ids.push(Bson::ObjectId(id));
                        let mut with_id = doc! { "_id": id };
                        with_id.extend(document);
                        with_id
                    }
                };
                WriteRequest::Insert(document)
            })
            .collect();

        Self {
            ns,
            requests,
            inserted_ids,
            options,
        }
    }
}

impl OperationWithDefaults for Insert {
    type O = InsertResult;

    const NAME: &'static str = "insert";

    fn build(&mut self, description: &StreamDescription) -> Result<Command> {
        if self.requests.is_empty() {
            return Err(Error::invalid_argument("no documents provided to insert"));
        }
        if self.requests.len() as i64 > description.max_write_batch_size {
            return Err(Error::invalid_argument(format!(
                "cannot insert {} documents in one batch; the server accepts at most {}",
                self.requests.len(),
                description.max_write_batch_size
            )));
        }

        let mut body = doc! {
            Self::NAME: self.ns.coll.clone(),
        };
        append_options(&mut body, Some(&self.options))?;

        let mut command = Command::new(Self::NAME, &self.ns.db, body);
        command.add_document_sequence("documents", write_statements(&self.requests)?);
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

        let inserted_ids = self
            .inserted_ids
            .iter()
            .cloned()
            .enumerate()
            .collect::<HashMap<_, _>>();
        Ok(InsertResult { inserted_ids })
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
