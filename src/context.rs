//! The channel and channel source one operation runs on, held across its attempts.


use futures_core::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::{
    binding::{Channel, ChannelSource, ReadBinding, WriteBinding},
    error::{Error, ErrorClass, Result},
    operation::WriteRequest,
    options::ServerAddress,
    selection_criteria::SelectionCriteria,
    session::CoreSession,
    trace::RETRY_TRACING_EVENT_TARGET,
};

/// The part of a binding a context needs: somewhere to get channel sources from, and the session
/// they run under.
pub(crate) trait ContextBinding: Send + Sync {
    fn session(&self) -> &CoreSession;

    /// The read preference servers are selected with. Writes always go to a primary and have
    /// none.
    fn read_preference(&self) -> Option<&SelectionCriteria>;

    fn channel_source<'a>(
        &'a self,
        deprioritized: Option<&'a ServerAddress>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<ChannelSource>>;
}

impl ContextBinding for dyn ReadBinding {
    fn session(&self) -> &CoreSession {
        ReadBinding::session(self)
    }

    fn read_preference(&self) -> Option<&SelectionCriteria> {
        Some(ReadBinding::read_preference(self))
    }

    fn channel_source<'a>(
        &'a self,
        deprioritized: Option<&'a ServerAddress>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<ChannelSource>> {
        self.read_channel_source(deprioritized, cancel)
    }
}

impl ContextBinding for dyn WriteBinding {
    fn session(&self) -> &CoreSession {
        WriteBinding::session(self)
    }

    fn read_preference(&self) -> Option<&SelectionCriteria> {
        None
    }

    fn channel_source<'a>(
        &'a self,
        deprioritized: Option<&'a ServerAddress>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<ChannelSource>> {
        self.write_channel_source(deprioritized, cancel)
    }
}

/// Owns the current channel source and channel of one operation. Replacing either releases the
/// handle it replaces; disposing the context, explicitly or by dropping it, releases whatever it
/// holds at that point.
pub(crate) struct RetryableContext<B: ?Sized + ContextBinding> {
    binding: Box<B>,
    session: CoreSession,
    channel_source: Option<ChannelSource>,
    channel: Option<Channel>,
    retry_requested: bool,
    disposed: bool,
}

impl<B: ?Sized + ContextBinding> RetryableContext<B> {
    /// Selects a channel source from `binding` and checks a channel out of it.
    ///
    /// A checkout that fails with a connection-level error is attempted once more against a
    /// freshly selected source when retries are requested and the session is not in a
    /// transaction. Anything acquired before a failure is released before the error is returned.
    pub(crate) async fn create(
        binding: Box<B>,
        retry_requested: bool,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let session = binding.session().fork();
        let mut context = Self {
            binding,
            session,
            channel_source: None,
            channel: None,
            retry_requested,
            disposed: false,
        };
        context.acquire(cancel).await?;
        Ok(context)
    }

    async fn acquire(&mut self, cancel: &CancellationToken) -> Result<()> {
        let source = self.binding.channel_source(None, cancel).await?;
        let checkout = source.get_channel(cancel).await;
        let failed_address = source.address().clone();
        self.replace_channel_source(source);

        match checkout {
            Ok(channel) => {
                self.replace_channel(channel);
                Ok(())
            }
            Err(error) if self.can_retry_checkout(&error) => {
                tracing::debug!(
                    target: RETRY_TRACING_EVENT_TARGET,
                    serverHost = failed_address.host(),
                    serverPort = failed_address.port(),
                    error = %error,
                    "Retrying connection checkout"
                );
                self.reselect_avoiding(Some(&failed_address), cancel).await
            }
            Err(error) => Err(error),
        }
    }

    fn can_retry_checkout(&self, error: &Error) -> bool {
        self.retry_requested
            && !self.session.in_transaction()
            && matches!(error.classify(), ErrorClass::Retryable(_))
    }

    /// Selects a new channel source, avoiding the current server when an alternative exists,
    /// and checks a channel out of it.
    pub(crate) async fn reselect(&mut self, cancel: &CancellationToken) -> Result<()> {
        let current = self
            .channel_source
            .as_ref()
            .map(|source| source.address().clone());
        self.reselect_avoiding(current.as_ref(), cancel).await
    }

    async fn reselect_avoiding(
        &mut self,
        deprioritized: Option<&ServerAddress>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let source = self.binding.channel_source(deprioritized, cancel).await?;
        self.replace_channel_source(source);
        let channel = self.channel_source()?.get_channel(cancel).await?;
        self.replace_channel(channel);
        Ok(())
    }

    /// Installs `channel`, releasing the previous one.
    pub(crate) fn replace_channel(&mut self, channel: Channel) {
        if let Some(previous) = self.channel.replace(channel) {
            previous.release();
        }
    }

    /// Installs `source` with no channel checked out of it yet, releasing the previous channel
    /// and source.
    pub(crate) fn replace_channel_source(&mut self, source: ChannelSource) {
        if let Some(channel) = self.channel.take() {
            channel.release();
        }
        if let Some(previous) = self.channel_source.replace(source) {
            previous.release();
        }
    }

    pub(crate) fn channel(&self) -> Result<&Channel> {
        self.channel
            .as_ref()
            .ok_or_else(|| Error::internal("no channel is checked out for this operation"))
    }

    pub(crate) fn channel_source(&self) -> Result<&ChannelSource> {
        self.channel_source
            .as_ref()
            .ok_or_else(|| Error::internal("no channel source is selected for this operation"))
    }

    pub(crate) fn session(&self) -> &CoreSession {
        &self.session
    }

    pub(crate) fn binding(&self) -> &B {
        &self.binding
    }

    pub(crate) fn retry_requested(&self) -> bool {
        self.retry_requested
    }

    pub(crate) fn disable_retries(&mut self) {
        self.retry_requested = false;
    }

    /// Turns retries off for the whole batch if any one of `requests` cannot safely be applied
    /// twice on the current channel.
    pub(crate) fn disable_retries_if_any_write_request_is_not_retryable(
        &mut self,
        requests: &[WriteRequest],
    ) {
        let Some(ref channel) = self.channel else {
            return;
        };
        let description = channel.description();
        if requests
            .iter()
            .any(|request| !request.is_retryable(description))
        {
            self.retry_requested = false;
        }
    }

    /// Releases the channel, then the channel source. Calling this more than once has no further
    /// effect.
    pub(crate) fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        if let Some(channel) = self.channel.take() {
            channel.release();
        }
        if let Some(source) = self.channel_source.take() {
            source.release();
        }
    }

    #[cfg(test)]
    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed
    }
}

impl<B: ?Sized + ContextBinding> Drop for RetryableContext<B> {
    fn drop(&mut self) {
        self.dispose();
    }
}
