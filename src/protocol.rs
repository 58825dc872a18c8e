//! Turns an operation's command into a wire message carrying the session, transaction and
//! cluster-time metadata it needs, and turns the reply back into the operation's result.


use std::{sync::Arc, time::Instant};

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::{
    bson::{self, Document},
    cmap::{conn::wire::{next_request_id, Message}, ConnectionInfo, RawCommandResponse},
    error::{
        CommandError,
        DefaultErrorMapper,
        Error,
        ErrorKind,
        ErrorMapper,
        Result,
        WriteConcernError,
        TRANSIENT_TRANSACTION_ERROR,
    },
    event::{
        command::{CommandEvent, CommandFailedEvent, CommandStartedEvent, CommandSucceededEvent},
        EventHandler,
    },
    operation::{AbortTransaction, CommitTransaction, ExecutionContext, Operation},
    options::{ClientOptions, ServerApi},
    sdam::{update_command_with_read_pref, ServerType, Topology, TopologyType},
    session::{ClusterTime, TransactionState},
    trace::command::CommandTracingEventEmitter,
};

/// The fields read from a successful reply besides the operation's own result.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReplyMetadata {
    recovery_token: Option<Document>,

    write_concern_error: Option<WriteConcernError>,

    write_errors: Option<bson::Bson>,

    error_labels: Option<Vec<String>>,
}

pub(crate) struct WireProtocol {
    topology: Arc<Topology>,
    server_api: Option<ServerApi>,
    error_mapper: Arc<dyn ErrorMapper>,
    command_event_handler: Option<EventHandler<CommandEvent>>,
    tracing_emitter: CommandTracingEventEmitter,
}

impl WireProtocol {
    pub(crate) fn new(options: &ClientOptions, topology: Arc<Topology>) -> Self {
        Self {
            server_api: options.server_api.clone(),
            error_mapper: options
                .error_mapper
                .clone()
                .unwrap_or_else(|| Arc::new(DefaultErrorMapper)),
            command_event_handler: options.command_event_handler.clone(),
            tracing_emitter: CommandTracingEventEmitter::new(
                options.tracing_max_document_length_bytes,
                topology.id,
            ),
            topology,
        }
    }

    pub(crate) fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    /// Runs one attempt of `op` on the context's channel.
    ///
    /// `txn_number` is the retryable-write number fixed for the whole retry group; operations
    /// inside a transaction use the transaction's number instead.
    pub(crate) async fn execute<Op: Operation>(
        &self,
        op: &mut Op,
        context: ExecutionContext<'_>,
        txn_number: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<Op::O> {
        let channel = context.channel;
        let session = context.session;
        let description = channel.description();

        let server_supports_sessions = description.supports_sessions();
        if op.supports_sessions() && !server_supports_sessions && !session.is_implicit() {
            return Err(ErrorKind::SessionsNotSupported.into());
        }

        let mut command = op.build(description)?;

        let is_transaction_end = matches!(
            op.name(),
            CommitTransaction::NAME | AbortTransaction::NAME
        );
        let transaction_state = session.transaction_state();
        let in_transaction = match transaction_state {
            TransactionState::Starting | TransactionState::InProgress => true,
            TransactionState::Committed { .. } | TransactionState::Aborted => is_transaction_end,
            TransactionState::None => false,
        };
        let starting_transaction = transaction_state == TransactionState::Starting;

        if in_transaction && !is_transaction_end {
            command.clear_concerns();
            if starting_transaction {
                let read_concern = session
                    .transaction_options()
                    .and_then(|options| options.read_concern);
                if let Some(ref read_concern) = read_concern {
                    command.set_read_concern(read_concern);
                }
            }
        }

        if !in_transaction {
            update_command_with_read_pref(
                channel.topology_type(),
                channel.server_type(),
                &mut command,
                op.selection_criteria().or(context.read_preference),
            );
        }

        // Implicit sessions are only worth tracking when the server answers.
        let sends_session = op.supports_sessions()
            && server_supports_sessions
            && (op.is_acknowledged() || !session.is_implicit());
        if sends_session {
            command.set_session_id(session.was_used()?);

            if in_transaction {
                command.set_txn_number(session.txn_number());
                if starting_transaction {
                    command.set_start_transaction();
                }
                command.set_autocommit();
                if is_transaction_end && channel.topology_type() == TopologyType::Sharded {
                    if let Some(ref token) = session.recovery_token() {
                        command.set_recovery_token(token);
                    }
                }
            } else if let Some(txn_number) = txn_number {
                command.set_txn_number(txn_number);
            }
        }

        let reads_after_cluster_time = session.causal_consistency()
            && op.supports_read_concern(description)
            && (!in_transaction || starting_transaction);
        if reads_after_cluster_time {
            if let Some(operation_time) = session.operation_time() {
                command.set_after_cluster_time(operation_time);
            }
        }

        let cluster_time = match (session.cluster_time(), self.topology.cluster_time()) {
            (Some(session_time), Some(topology_time)) => Some(session_time.max(topology_time)),
            (session_time, topology_time) => session_time.or(topology_time),
        };
        if let Some(ref cluster_time) = cluster_time {
            command.set_cluster_time(cluster_time);
        }

        if let Some(ref server_api) = self.server_api {
            command.set_server_api(server_api);
        }

        if !op.is_acknowledged() && !in_transaction {
            command.unacknowledged = true;
        }

        if in_transaction
            && session.pinned_channel().is_none()
            && (channel.topology_type() == TopologyType::LoadBalanced
                || channel.server_type() == ServerType::Mongos)
        {
            session.pin(channel.fork());
        }

        let should_redact = command.should_redact();
        let command_name = command.name.clone();
        let target_db = command.target_db.clone();
        let request_id = next_request_id();
        let message = Message::from_command(command, Some(request_id))?;
        let connection_info = channel.info().clone();

        self.emit_command_event(|| {
            let command = if should_redact {
                Document::new()
            } else {
                message.get_command_document()
            };
            CommandEvent::Started(CommandStartedEvent {
                command,
                db: target_db,
                command_name: command_name.clone(),
                request_id,
                connection: connection_info.clone(),
            })
        });

        let start_time = Instant::now();
        let sent = channel.send_message(message, cancel).await;
        if starting_transaction {
            session.mark_transaction_in_progress();
        }

        let result = match sent {
            Ok(response) => self.process_reply(
                response,
                context,
                &connection_info,
                in_transaction && is_transaction_end,
            ),
            Err(error) => Err(error),
        };
        let duration = start_time.elapsed();

        match result {
            Ok(response) => {
                self.emit_command_event(|| {
                    let reply = if should_redact {
                        Document::new()
                    } else {
                        response.body().unwrap_or_default()
                    };
                    CommandEvent::Succeeded(CommandSucceededEvent {
                        duration,
                        reply,
                        command_name: command_name.clone(),
                        request_id,
                        connection: connection_info.clone(),
                    })
                });
                op.handle_response(response, context)
            }
            Err(mut error) => {
                error = error.with_wire_version(description.max_wire_version);
                if in_transaction
                    && (error.is_network_error() || error.is_server_selection_error())
                {
                    error.add_label(TRANSIENT_TRANSACTION_ERROR);
                }

                self.emit_command_event(|| {
                    let mut failure = error.clone();
                    if should_redact {
                        failure.redact();
                    }
                    CommandEvent::Failed(CommandFailedEvent {
                        duration,
                        command_name: command_name.clone(),
                        failure,
                        request_id,
                        connection: connection_info.clone(),
                    })
                });

                if error.is_network_error() {
                    session.mark_dirty();
                }
                self.topology.handle_application_error(
                    channel.address(),
                    channel.generation(),
                    &error,
                );
                op.handle_error(error)
            }
        }
    }

    /// Advances the session and topology clocks from `response`, then checks it for failure.
    fn process_reply(
        &self,
        response: RawCommandResponse,
        context: ExecutionContext<'_>,
        connection: &ConnectionInfo,
        ends_transaction: bool,
    ) -> Result<RawCommandResponse> {
        let session = context.session;

        // Failed replies still carry authoritative clocks, and each clock is read on its own so
        // a malformed field elsewhere cannot hold them back.
        let raw = response.raw_body();
        if let Some(cluster_time) = raw
            .get_document("$clusterTime")
            .ok()
            .and_then(|document| bson::from_slice::<ClusterTime>(document.as_bytes()).ok())
        {
            session.advance_cluster_time(&cluster_time);
            self.topology.advance_cluster_time(&cluster_time);
        }
        if let Ok(operation_time) = raw.get_timestamp("operationTime") {
            session.advance_operation_time(operation_time);
        }

        if response.query_failure || !response.is_success() {
            let error = self.map_failure(&response, connection)?;
            return Err(error.with_server_response(&response.into_raw_document_buf()));
        }

        let metadata: ReplyMetadata = match response.body() {
            Ok(metadata) => metadata,
            Err(error) => {
                return Err(error.with_server_response(&response.into_raw_document_buf()));
            }
        };

        if let Some(token) = metadata.recovery_token {
            if context.channel.topology_type() == TopologyType::Sharded
                && (session.in_transaction() || ends_transaction)
            {
                session.set_recovery_token(token);
            }
        }

        // Operations reporting per-statement write errors surface those first.
        if let (Some(wc_error), None) = (metadata.write_concern_error, metadata.write_errors) {
            return Err(
                Error::new(ErrorKind::WriteConcern(wc_error), metadata.error_labels)
                    .with_server_response(&response.into_raw_document_buf()),
            );
        }

        Ok(response)
    }

    fn map_failure(&self, response: &RawCommandResponse, connection: &ConnectionInfo) -> Result<Error> {
        let document: Document = response.body()?;
        if let Some(error) = self.error_mapper.map(connection, &document) {
            return Ok(error);
        }

        let code = document.get_i32("code").unwrap_or_default();
        let code_name = document.get_str("codeName").unwrap_or_default();
        let message = document
            .get_str("errmsg")
            .or_else(|_| document.get_str("$err"))
            .unwrap_or("command failed");
        Ok(ErrorKind::Command(CommandError::new(code, code_name, message)).into())
    }

    fn emit_command_event(&self, generate_event: impl FnOnce() -> CommandEvent) {
        let event = generate_event();
        if let Some(ref handler) = self.command_event_handler {
            handler.handle(event.clone());
        }
        self.tracing_emitter.handle(event);
    }
}
