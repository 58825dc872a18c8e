
use std::time::Duration;

use crate::{
    bson::doc,
    cmap::{Command, RawCommandResponse, StreamDescription},
    concern::{Acknowledgment, WriteConcern},
    error::Result,
    operation::{
        append_options,
        ExecutionContext,
        OperationWithDefaults,
        Retryability,
        WriteConcernOnlyBody,
    },
    options::TransactionOptions,
};

#[derive(Debug)]
pub(crate) struct CommitTransaction {
    options: Option<TransactionOptions>,
}

impl CommitTransaction {
    pub(crate) fn new(options: Option<TransactionOptions>) -> Self {
        Self { options }
    }
}

impl OperationWithDefaults for CommitTransaction {
    type O = ();

    const NAME: &'static str = "commitTransaction";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut body = doc! {
            Self::NAME: 1,
        };

        if let Some(ref mut options) = self.options {
            if options
                .write_concern
                .as_ref()
                .is_some_and(WriteConcern::is_empty)
            {
                options.write_concern = None;
            }
        }
        append_options(&mut body, self.options.as_ref())?;

        Ok(Command::new(Self::NAME, "admin", body))
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _context: ExecutionContext<'_>,
    ) -> Result<Self::O> {
        let response: WriteConcernOnlyBody = response.body()?;
        response.validate()
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        self.options
            .as_ref()
            .and_then(|opts| opts.write_concern.as_ref())
    }

    fn retryability(&self) -> Retryability {
        Retryability::Write
    }

    // A commit that is retried waits for a majority, with a default wtimeout of 10 seconds.
    fn update_for_retry(&mut self) {
        let options = self.options.get_or_insert_with(Default::default);
        match options.write_concern {
            Some(ref mut write_concern) => {
                write_concern.w = Some(Acknowledgment::Majority);
                if write_concern.w_timeout.is_none() {
                    write_concern.w_timeout = Some(Duration::from_millis(10000));
                }
            }
            None => {
                options.write_concern = Some(
                    WriteConcern::builder()
                        .w(Acknowledgment::Majority)
                        .w_timeout(Duration::from_millis(10000))
                        .build(),
                );
            }
        }
    }
}
