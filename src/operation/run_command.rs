#[cfg(test)]
mod test;

use crate::{
    bson::Document,
    cmap::{Command, RawCommandResponse, StreamDescription},
    error::{Error, Result},
    operation::{ExecutionContext, OperationWithDefaults},
    selection_criteria::SelectionCriteria,
};

/// Runs an arbitrary command. The command is never retried, since nothing is known about
/// whether it is safe to apply twice.
#[derive(Debug)]
pub(crate) struct RunCommand {
    db: String,
    command: Document,
    selection_criteria: Option<SelectionCriteria>,
}

impl RunCommand {
    pub(crate) fn new(
        db: String,
        command: Document,
        selection_criteria: Option<SelectionCriteria>,
    ) -> Result<Self> {
        if command.is_empty() {
            return Err(Error::invalid_argument("an empty document cannot be run as a command"));
        }
        Ok(Self {
            db,
            command,
            selection_criteria,
        })
    }

    fn command_name(&self) -> &str {
        self.command
            .keys()
            .next()
            .map(String::as_str)
            .unwrap_or_default()
    }
}

impl OperationWithDefaults for RunCommand {
    type O = Document;

    // Since we can't actually specify a string statically here, we just put a descriptive string
    // that should fail loudly if accidentally passed to the server.
    const NAME: &'static str = "$genericRunCommand";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        Ok(Command::new(
            self.command_name(),
            &self.db,
            self.command.clone(),
        ))
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _context: ExecutionContext<'_>,
    ) -> Result<Self::O> {
        response.body()
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.selection_criteria.as_ref()
    }

    fn supports_sessions(&self) -> bool {
        !matches!(self.command_name(), "hello" | "isMaster" | "ismaster")
    }

    fn name(&self) -> &str {
        self.command_name()
    }
}
