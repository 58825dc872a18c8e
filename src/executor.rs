//! The retry state machine: one attempt, and at most one more on a freshly selected channel.

#[cfg(test)]
mod test;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::{
    binding::{ReadBinding, WriteBinding},
    cmap::StreamDescription,
    context::{ContextBinding, RetryableContext},
    error::{
        Error,
        ErrorClass,
        Result,
        NO_WRITES_PERFORMED,
        RETRYABLE_WRITE_ERROR,
        TRANSIENT_TRANSACTION_ERROR,
        UNKNOWN_TRANSACTION_COMMIT_RESULT,
    },
    operation::{AbortTransaction, CommitTransaction, ExecutionContext, Operation, Retryability},
    options::ClientOptions,
    protocol::WireProtocol,
    sdam::Topology,
    session::{CoreSession, TransactionState},
    trace::RETRY_TRACING_EVENT_TARGET,
};

pub(crate) struct OperationExecutor {
    protocol: WireProtocol,
    retry_reads: bool,
    retry_writes: bool,
}

impl OperationExecutor {
    pub(crate) fn new(options: &ClientOptions, topology: Arc<Topology>) -> Self {
        Self {
            protocol: WireProtocol::new(options, topology),
            retry_reads: options.retry_reads(),
            retry_writes: options.retry_writes(),
        }
    }

    pub(crate) fn topology(&self) -> &Arc<Topology> {
        self.protocol.topology()
    }

    /// Runs a read through `binding`, retrying it once if the operation and the client allow.
    pub(crate) async fn execute_read<Op: Operation>(
        &self,
        op: &mut Op,
        binding: Box<dyn ReadBinding>,
        cancel: &CancellationToken,
    ) -> Result<Op::O> {
        let retry_enabled = self.retry_reads && op.retryability() == Retryability::Read;
        self.execute_with_retry(op, binding, retry_enabled, cancel)
            .await
    }

    /// Runs a write through `binding`, retrying it once if the operation and the client allow.
    pub(crate) async fn execute_write<Op: Operation>(
        &self,
        op: &mut Op,
        binding: Box<dyn WriteBinding>,
        cancel: &CancellationToken,
    ) -> Result<Op::O> {
        let retry_enabled = self.retry_writes && op.retryability() == Retryability::Write;
        self.execute_with_retry(op, binding, retry_enabled, cancel)
            .await
    }

    async fn execute_with_retry<Op, B>(
        &self,
        op: &mut Op,
        binding: Box<B>,
        retry_enabled: bool,
        cancel: &CancellationToken,
    ) -> Result<Op::O>
    where
        Op: Operation,
        B: ?Sized + ContextBinding,
    {
        let session = binding.session().fork();
        let ends_transaction = matches!(
            op.name(),
            CommitTransaction::NAME | AbortTransaction::NAME
        );
        if !ends_transaction {
            session.reset_finished_transaction();
        }
        session.check_usable()?;

        // Statements inside a transaction are never retried on their own; the transaction is
        // retried as a whole by the application.
        let in_transaction = session.in_transaction();
        let retry_requested = retry_enabled && (!in_transaction || ends_transaction);

        let mut context = match RetryableContext::create(binding, retry_requested, cancel).await {
            Ok(context) => context,
            Err(mut error) => {
                add_labels_and_update_pin(&mut error, None, &session, Retryability::None);
                return Err(error);
            }
        };

        let supports_retryable_writes = context
            .channel()?
            .description()
            .supports_retryable_writes();
        if !op.is_acknowledged()
            || (op.retryability() == Retryability::Write && !supports_retryable_writes)
        {
            context.disable_retries();
        }
        context.disable_retries_if_any_write_request_is_not_retryable(op.write_requests());

        let retryability = if context.retry_requested() {
            op.retryability()
        } else {
            Retryability::None
        };

        // Fixed for the whole retry group so the server can recognize a re-applied write.
        let txn_number =
            if retryability == Retryability::Write && !in_transaction && !ends_transaction {
                Some(session.next_transaction_number()?)
            } else {
                None
            };

        let mut first_error: Option<Error> = None;
        loop {
            let mut error = match self.attempt(op, &context, txn_number, cancel).await {
                Ok(output) => return Ok(output),
                Err(error) => error,
            };
            add_labels_and_update_pin(
                &mut error,
                Some(context.channel()?.description()),
                &session,
                retryability,
            );

            if let Some(first_error) = first_error {
                return Err(more_diagnostic(first_error, error));
            }

            // The write may already be applied when its concern could not be satisfied.
            let can_retry = !cancel.is_cancelled()
                && !error.is_cancelled()
                && !error.is_write_concern_error()
                && match retryability {
                    Retryability::Read => error.is_read_retryable(),
                    Retryability::Write => error.is_write_retryable(),
                    Retryability::None => false,
                };
            if !can_retry {
                return Err(error);
            }

            tracing::debug!(
                target: RETRY_TRACING_EVENT_TARGET,
                commandName = op.name(),
                txnNumber = txn_number,
                error = %error,
                "Retrying operation"
            );

            op.update_for_retry();
            if let Err(reselect_error) = context.reselect(cancel).await {
                tracing::debug!(
                    target: RETRY_TRACING_EVENT_TARGET,
                    commandName = op.name(),
                    error = %reselect_error,
                    "Could not acquire a channel for the retry"
                );
                return Err(error);
            }
            if retryability == Retryability::Write
                && !context.channel()?.description().supports_retryable_writes()
            {
                tracing::debug!(
                    target: RETRY_TRACING_EVENT_TARGET,
                    commandName = op.name(),
                    "Retry server does not support retryable writes"
                );
                return Err(error);
            }
            first_error = Some(error);
        }
    }

    async fn attempt<Op, B>(
        &self,
        op: &mut Op,
        context: &RetryableContext<B>,
        txn_number: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<Op::O>
    where
        Op: Operation,
        B: ?Sized + ContextBinding,
    {
        let execution = ExecutionContext {
            channel: context.channel()?,
            channel_source: context.channel_source()?,
            session: context.session(),
            read_preference: context.binding().read_preference(),
        };
        self.protocol
            .execute(op, execution, txn_number, cancel)
            .await
    }
}

/// Adds the labels the retry loop and the application act on, and unpins the session when a
/// transaction label says its pinned server can no longer be trusted.
fn add_labels_and_update_pin(
    error: &mut Error,
    description: Option<&StreamDescription>,
    session: &CoreSession,
    retryability: Retryability,
) {
    let max_wire_version = description.and_then(|description| description.max_wire_version);
    let add_retryable_write_label = |error: &mut Error| {
        if let Some(max_wire_version) = max_wire_version {
            if error.should_add_retryable_write_label(max_wire_version) {
                error.add_label(RETRYABLE_WRITE_ERROR);
            }
        }
    };

    match session.transaction_state() {
        TransactionState::Starting | TransactionState::InProgress => {
            if error.is_network_error() || error.is_server_selection_error() {
                error.add_label(TRANSIENT_TRANSACTION_ERROR);
            }
        }
        TransactionState::Committed { .. } => {
            add_retryable_write_label(error);
            if error.should_add_unknown_transaction_commit_result_label() {
                error.add_label(UNKNOWN_TRANSACTION_COMMIT_RESULT);
            }
        }
        TransactionState::Aborted => add_retryable_write_label(error),
        TransactionState::None => {
            if retryability == Retryability::Write {
                add_retryable_write_label(error);
            }
        }
    }

    if error.contains_label(TRANSIENT_TRANSACTION_ERROR)
        || error.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT)
    {
        session.unpin();
    }
}

/// Picks the error to report after both attempts failed. The retry's error wins unless it says
/// nothing was written or carries no more information than the first.
fn more_diagnostic(first: Error, second: Error) -> Error {
    let informative =
        !matches!(second.classify(), ErrorClass::Fatal) || second.is_write_retryable();
    if informative && !second.contains_label(NO_WRITES_PERFORMED) {
        second
    } else {
        first
    }
}
