#[cfg(test)]
mod test;

use serde::Deserialize;

use crate::{
    bson::{doc, Document},
    cmap::{Command, RawCommandResponse, StreamDescription},
    error::Result,
    operation::{append_options, ExecutionContext, OperationWithDefaults, Retryability},
    options::ListDatabasesOptions,
    selection_criteria::{ReadPreference, SelectionCriteria},
};

#[derive(Debug)]
pub(crate) struct ListDatabases {
    filter: Option<Document>,
    name_only: Option<bool>,
    options: Option<ListDatabasesOptions>,
    selection_criteria: SelectionCriteria,
}

impl ListDatabases {
    pub(crate) fn new(
        filter: Option<Document>,
        name_only: Option<bool>,
        options: Option<ListDatabasesOptions>,
    ) -> Self {
        ListDatabases {
            filter,
            name_only,
            options,
            selection_criteria: SelectionCriteria::ReadPreference(ReadPreference::Primary),
        }
    }
}

impl OperationWithDefaults for ListDatabases {
    type O = Vec<Document>;

    const NAME: &'static str = "listDatabases";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut body = doc! {
            Self::NAME: 1,
        };
        if let Some(ref filter) = self.filter {
            body.insert("filter", filter.clone());
        }
        if let Some(name_only) = self.name_only {
            body.insert("nameOnly", name_only);
        }

        append_options(&mut body, self.options.as_ref())?;

        Ok(Command::new(Self::NAME, "admin", body))
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _context: ExecutionContext<'_>,
    ) -> Result<Self::O> {
        let response: Response = response.body()?;
        Ok(response.databases)
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        Some(&self.selection_criteria)
    }

    fn retryability(&self) -> Retryability {
        Retryability::Read
    }
}

#[derive(Debug, Deserialize)]
struct Response {
    databases: Vec<Document>,
}
