//! Reference-counted access to servers and connections, and the bindings that hand them out to
//! operations.


use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use futures_core::future::BoxFuture;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::{
    cmap::{
        conn::wire::Message,
        ConnectionInfo,
        PooledConnection,
        RawCommandResponse,
        StreamDescription,
    },
    error::{Error, Result},
    handle::{RefCounted, Teardown},
    options::ServerAddress,
    sdam::{SelectedServer, Server, ServerDescription, ServerType, Topology, TopologyType},
    selection_criteria::{ReadPreference, SelectionCriteria},
    session::CoreSession,
};

/// One logical connection to one server. Forks share the underlying connection, which is
/// checked back into its pool when the last fork is released.
pub(crate) type Channel = RefCounted<ChannelShared>;

/// A resolved server, from which channels are obtained. Holds a fork of the session the
/// operation runs under.
pub(crate) type ChannelSource = RefCounted<ChannelSourceShared>;

enum Slot {
    Idle(PooledConnection),
    InUse,
    Closed,
}

pub(crate) struct ChannelShared {
    slot: Mutex<Slot>,
    available: Notify,
    description: StreamDescription,
    info: ConnectionInfo,
    generation: u32,
    server_type: ServerType,
    topology_type: TopologyType,
}

impl fmt::Debug for ChannelShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("connection", &self.info)
            .field("generation", &self.generation)
            .finish()
    }
}

impl ChannelShared {
    pub(crate) fn new(
        connection: PooledConnection,
        server_type: ServerType,
        topology_type: TopologyType,
    ) -> Result<Channel> {
        let description = connection.stream_description()?.clone();
        Ok(RefCounted::new(Self {
            info: connection.info(),
            generation: connection.generation(),
            slot: Mutex::new(Slot::Idle(connection)),
            available: Notify::new(),
            description,
            server_type,
            topology_type,
        }))
    }

    /// The capabilities negotiated during the connection's handshake.
    pub(crate) fn description(&self) -> &StreamDescription {
        &self.description
    }

    pub(crate) fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub(crate) fn address(&self) -> &ServerAddress {
        &self.info.address
    }

    /// The pool generation the underlying connection was established in.
    pub(crate) fn generation(&self) -> u32 {
        self.generation
    }

    pub(crate) fn server_type(&self) -> ServerType {
        self.server_type
    }

    pub(crate) fn topology_type(&self) -> TopologyType {
        self.topology_type
    }

    /// Sends `message` and waits for its reply. Exchanges on forks of the same channel are
    /// serialized.
    ///
    /// If `cancel` fires mid-exchange the connection is abandoned: it is closed rather than
    /// returned to its pool, and the channel becomes unusable.
    pub(crate) async fn send_message(
        &self,
        message: Message,
        cancel: &CancellationToken,
    ) -> Result<RawCommandResponse> {
        let mut connection = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::cancelled()),
            connection = self.take_connection() => connection?,
        };

        let exchange = async move {
            let result = connection.send_message(message).await;
            (connection, result)
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                // The exchange future, and the connection it owns, are dropped here mid-flight.
                *self.lock_slot() = Slot::Closed;
                self.available.notify_waiters();
                Err(Error::cancelled())
            }
            (connection, result) = exchange => {
                *self.lock_slot() = Slot::Idle(connection);
                self.available.notify_waiters();
                result
            }
        }
    }

    async fn take_connection(&self) -> Result<PooledConnection> {
        loop {
            let notified = self.available.notified();
            {
                let mut slot = self.lock_slot();
                match std::mem::replace(&mut *slot, Slot::InUse) {
                    Slot::Idle(connection) => return Ok(connection),
                    Slot::InUse => {}
                    Slot::Closed => {
                        *slot = Slot::Closed;
                        return Err(Error::internal(format!(
                            "connection {} was closed after a cancelled operation",
                            self.info.id
                        )));
                    }
                }
            }
            notified.await;
        }
    }

    fn lock_slot(&self) -> std::sync::MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Teardown for ChannelShared {
    fn teardown(&self) {
        let previous = std::mem::replace(&mut *self.lock_slot(), Slot::Closed);
        // Dropping the connection outside the lock checks it back into its pool.
        drop(previous);
    }
}

enum SourceKind {
    Server(Arc<Server>),
    Channel(Channel),
}

pub(crate) struct ChannelSourceShared {
    kind: SourceKind,
    server_description: ServerDescription,
    topology_type: TopologyType,
    session: CoreSession,
}

impl fmt::Debug for ChannelSourceShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSource")
            .field("address", &self.server_description.address)
            .field("server_type", &self.server_description.server_type)
            .field("fixed_channel", &matches!(self.kind, SourceKind::Channel(_)))
            .finish()
    }
}

impl ChannelSourceShared {
    /// A source that checks connections out of the selected server's pool.
    pub(crate) fn for_server(selected: SelectedServer, session: CoreSession) -> ChannelSource {
        RefCounted::new(Self {
            kind: SourceKind::Server(selected.server),
            server_description: selected.description,
            topology_type: selected.topology_type,
            session,
        })
    }

    /// A source that always yields forks of `channel`.
    pub(crate) fn for_channel(channel: Channel, session: CoreSession) -> ChannelSource {
        let server_description = ServerDescription::builder()
            .address(channel.address().clone())
            .server_type(channel.server_type())
            .build();
        RefCounted::new(Self {
            server_description,
            topology_type: channel.topology_type(),
            kind: SourceKind::Channel(channel),
            session,
        })
    }

    pub(crate) fn address(&self) -> &ServerAddress {
        &self.server_description.address
    }

    #[cfg(test)]
    pub(crate) fn server_description(&self) -> &ServerDescription {
        &self.server_description
    }

    /// The session fork this source was resolved under.
    pub(crate) fn session(&self) -> &CoreSession {
        &self.session
    }

    /// Gets a channel to this source's server, checking a connection out of its pool unless the
    /// source is bound to a fixed channel.
    pub(crate) async fn get_channel(&self, cancel: &CancellationToken) -> Result<Channel> {
        match self.kind {
            SourceKind::Server(ref server) => {
                let connection = server.pool.check_out(cancel).await?;
                ChannelShared::new(
                    connection,
                    self.server_description.server_type,
                    self.topology_type,
                )
            }
            SourceKind::Channel(ref channel) => Ok(channel.fork()),
        }
    }
}

impl Teardown for ChannelSourceShared {
    fn teardown(&self) {}
}

/// Hands out channel sources for reads, along with the read preference and session they run
/// under.
pub(crate) trait ReadBinding: Send + Sync {
    fn read_preference(&self) -> &SelectionCriteria;

    fn session(&self) -> &CoreSession;

    /// Selects a server for a read. `deprioritized` is avoided when an alternative exists.
    fn read_channel_source<'a>(
        &'a self,
        deprioritized: Option<&'a ServerAddress>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<ChannelSource>>;
}

/// Hands out channel sources for writes, along with the session they run under.
pub(crate) trait WriteBinding: Send + Sync {
    fn session(&self) -> &CoreSession;

    /// Selects a server for a write. `deprioritized` is avoided when an alternative exists.
    fn write_channel_source<'a>(
        &'a self,
        deprioritized: Option<&'a ServerAddress>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<ChannelSource>>;
}

/// Binds operations to servers chosen by server selection against the live topology. A session
/// with a pinned channel routes every operation to that channel instead.
pub(crate) struct ClusterBinding {
    topology: Arc<Topology>,
    criteria: SelectionCriteria,
    session: CoreSession,
}

impl ClusterBinding {
    pub(crate) fn new(
        topology: Arc<Topology>,
        criteria: impl Into<Option<SelectionCriteria>>,
        session: CoreSession,
    ) -> Self {
        Self {
            topology,
            criteria: criteria
                .into()
                .unwrap_or(SelectionCriteria::ReadPreference(ReadPreference::Primary)),
            session,
        }
    }

    async fn channel_source(
        &self,
        criteria: &SelectionCriteria,
        deprioritized: Option<&ServerAddress>,
        cancel: &CancellationToken,
    ) -> Result<ChannelSource> {
        if let Some(pinned) = self.session.pinned_channel() {
            return Ok(ChannelSourceShared::for_channel(pinned, self.session.fork()));
        }
        let selected = self
            .topology
            .select_server(criteria, deprioritized, cancel)
            .await?;
        Ok(ChannelSourceShared::for_server(selected, self.session.fork()))
    }
}

impl ReadBinding for ClusterBinding {
    fn read_preference(&self) -> &SelectionCriteria {
        &self.criteria
    }

    fn session(&self) -> &CoreSession {
        &self.session
    }

    fn read_channel_source<'a>(
        &'a self,
        deprioritized: Option<&'a ServerAddress>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<ChannelSource>> {
        Box::pin(async move {
            // Reads in a transaction go where the transaction says, primary by default.
            let transaction_criteria = self.session.transaction_selection_criteria();
            let criteria = transaction_criteria.as_ref().unwrap_or(&self.criteria);
            self.channel_source(criteria, deprioritized, cancel).await
        })
    }
}

impl WriteBinding for ClusterBinding {
    fn session(&self) -> &CoreSession {
        &self.session
    }

    fn write_channel_source<'a>(
        &'a self,
        deprioritized: Option<&'a ServerAddress>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<ChannelSource>> {
        Box::pin(async move {
            let primary = SelectionCriteria::ReadPreference(ReadPreference::Primary);
            self.channel_source(&primary, deprioritized, cancel).await
        })
    }
}

/// Binds operations to one already-resolved channel source, e.g. the server a cursor was opened
/// on. Operations run under the session the source was resolved with.
pub(crate) struct ChannelSourceBinding {
    criteria: SelectionCriteria,
    session: CoreSession,
    source: ChannelSource,
}

impl ChannelSourceBinding {
    pub(crate) fn new(source: ChannelSource) -> Self {
        Self {
            criteria: SelectionCriteria::from_address(source.address().clone()),
            session: source.session().fork(),
            source,
        }
    }
}

impl ReadBinding for ChannelSourceBinding {
    fn read_preference(&self) -> &SelectionCriteria {
        &self.criteria
    }

    fn session(&self) -> &CoreSession {
        &self.session
    }

    fn read_channel_source<'a>(
        &'a self,
        _deprioritized: Option<&'a ServerAddress>,
        _cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<ChannelSource>> {
        Box::pin(async move { Ok(self.source.fork()) })
    }
}

impl WriteBinding for ChannelSourceBinding {
    fn session(&self) -> &CoreSession {
        &self.session
    }

    fn write_channel_source<'a>(
        &'a self,
        _deprioritized: Option<&'a ServerAddress>,
        _cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<ChannelSource>> {
        Box::pin(async move { Ok(self.source.fork()) })
    }
}
