
use crate::{
    binding::ChannelSourceShared,
    bson::{doc, Bson, Document},
    cmap::{Command, RawCommandResponse, StreamDescription},
    cursor::CursorSpecification,
    error::{Error, Result},
    operation::{append_options, CursorBody, ExecutionContext, OperationWithDefaults, Retryability},
    options::{FindOptions, SelectionCriteria},
    sdam::TopologyType,
    Namespace,
};

#[derive(Debug)]
pub(crate) struct Find {
    ns: Namespace,
    filter: Document,
    options: Option<Box<FindOptions>>,
}

impl Find {
    pub(crate) fn new(ns: Namespace, filter: Document, options: Option<FindOptions>) -> Self {
        Self {
            ns,
            filter,
            options: options.map(Box::new),
        }
    }
}

impl OperationWithDefaults for Find {
    type O = CursorSpecification;

    const NAME: &'static str = "find";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut body = doc! {
            Self::NAME: self.ns.coll.clone(),
            "filter": self.filter.clone(),
        };

        if let Some(ref options) = self.options {
            if options
                .batch_size
                .is_some_and(|batch_size| batch_size > i32::MAX as u32)
            {
                return Err(Error::invalid_argument(
                    "The batch size must fit into a signed 32-bit integer",
                ));
            }

            append_options(&mut body, Some(options))?;

            // A negative limit asks for a single batch of at most that many documents.
            if let Some(limit) = options.limit.filter(|limit| *limit < 0) {
                body.insert("limit", Bson::Int64(limit.saturating_abs()));
                body.insert("singleBatch", true);
            }
        }

        let mut command = Command::new(Self::NAME, &self.ns.db, body);
        if let Some(read_concern) = self.options.as_ref().and_then(|o| o.read_concern.as_ref()) {
            command.set_read_concern(read_concern);
        }
        Ok(command)
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        context: ExecutionContext<'_>,
    ) -> Result<Self::O> {
        let response: CursorBody = response.body()?;

        // Behind a load balancer a cursor lives on one backend connection, so later getMores must
        // reuse the channel rather than the balancer address.
        let source = if context.channel.topology_type() == TopologyType::LoadBalanced {
            ChannelSourceShared::for_channel(context.channel.fork(), context.session.fork())
        } else {
            context.channel_source.fork()
        };

        Ok(CursorSpecification {
            info: response.cursor,
            source,
            batch_size: self.options.as_ref().and_then(|opts| opts.batch_size),
            max_time: None,
        })
    }

    fn supports_read_concern(&self, _description: &StreamDescription) -> bool {
        true
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.options
            .as_ref()
            .and_then(|opts| opts.selection_criteria.as_ref())
    }

    fn retryability(&self) -> Retryability {
        Retryability::Read
    }
}
