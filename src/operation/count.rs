#[cfg(test)]
mod test;

use serde::Deserialize;

use crate::{
    bson::{doc, Document},
    cmap::{Command, RawCommandResponse, StreamDescription},
    error::{Error, Result},
    operation::{append_options, ExecutionContext, OperationWithDefaults, Retryability},
    options::CountOptions,
    selection_criteria::SelectionCriteria,
    Namespace,
};

const NAMESPACE_NOT_FOUND: i32 = 26;

pub(crate) struct Count {
    ns: Namespace,
    filter: Document,
    options: Option<CountOptions>,
}

impl Count {
    pub(crate) fn new(ns: Namespace, filter: Document, options: Option<CountOptions>) -> Self {
        Count {
            ns,
            filter,
            options,
        }
    }
}

impl OperationWithDefaults for Count {
    type O = u64;

    const NAME: &'static str = "count";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut body = doc! {
            Self::NAME: self.ns.coll.clone(),
            "query": self.filter.clone(),
        };

        append_options(&mut body, self.options.as_ref())?;

        let mut command = Command::new(Self::NAME, &self.ns.db, body);
        if let Some(read_concern) = self.options.as_ref().and_then(|o| o.read_concern.as_ref()) {
            command.set_read_concern(read_concern);
        }
        Ok(command)
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _context: ExecutionContext<'_>,
    ) -> Result<Self::O> {
        let response_body: ResponseBody = response.body()?;
        Ok(response_body.n)
    }

    /// A collection that does not exist has no documents.
    fn handle_error(&self, error: Error) -> Result<Self::O> {
        if error.code() == Some(NAMESPACE_NOT_FOUND) {
            Ok(0)
        } else {
            Err(error)
        }
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.options
            .as_ref()
            .and_then(|options| options.selection_criteria.as_ref())
    }

    fn supports_read_concern(&self, _description: &StreamDescription) -> bool {
        true
    }

    fn retryability(&self) -> Retryability {
        Retryability::Read
    }
}

#[derive(Debug, Deserialize)]
struct ResponseBody {
    n: u64,
}
