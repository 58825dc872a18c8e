
pub(crate) mod conn;
pub(crate) mod establish;

use std::{
    ops::{Deref, DerefMut},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
        Mutex,
        PoisonError,
    },
};

use derive_where::derive_where;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

pub use self::conn::{AsyncReadWrite, AsyncStream, ConnectionInfo, StreamConnector, TcpConnector};
use self::establish::ConnectionEstablisher;
pub(crate) use self::conn::{Command, Connection, RawCommandResponse, StreamDescription};
use crate::{
    error::{ConnectionPhase, Error, Result},
    options::ServerAddress,
    trace::CONNECTION_TRACING_EVENT_TARGET,
};

/// A bounded pool of established connections to a single server.
///
/// This type is a handle to shared state and is cheap to clone and pass around.
#[derive(Clone)]
#[derive_where(Debug)]
pub(crate) struct ConnectionPool {
    #[derive_where(skip)]
    inner: Arc<PoolInner>,
    address: ServerAddress,
}

struct PoolInner {
    /// Bounds the number of connections checked out or being established.
    permits: Arc<Semaphore>,

    /// Connections ready for reuse. The most recently checked in is reused first.
    idle: Mutex<Vec<Connection>>,

    generation: AtomicU32,
    next_connection_id: AtomicU32,
    establisher: ConnectionEstablisher,
}

impl ConnectionPool {
    pub(crate) fn new(
        address: ServerAddress,
        establisher: ConnectionEstablisher,
        max_pool_size: u32,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                permits: Arc::new(Semaphore::new(max_pool_size as usize)),
                idle: Mutex::new(Vec::new()),
                generation: AtomicU32::new(0),
                next_connection_id: AtomicU32::new(1),
                establisher,
            }),
            address,
        }
    }

    pub(crate) fn generation(&self) -> u32 {
        self.inner.generation.load(Ordering::Acquire)
    }

    /// Checks out a connection from the pool, reusing an idle one if possible and establishing a
    /// new one otherwise. Waits for capacity when `max_pool_size` connections are checked out.
    pub(crate) async fn check_out(&self, cancel: &CancellationToken) -> Result<PooledConnection> {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::cancelled()),
            permit = self.inner.permits.clone().acquire_owned() => {
                permit.map_err(|_| Error::internal("connection pool closed"))?
            }
        };

        let generation = self.generation();
        while let Some(connection) = self.pop_idle() {
            if connection.is_stale(generation) || connection.is_broken() {
                self.close(connection, "stale");
                continue;
            }
            tracing::trace!(
                target: CONNECTION_TRACING_EVENT_TARGET,
                driverConnectionId = connection.id,
                serverHost = self.address.host(),
                serverPort = self.address.port(),
                "Connection checked out"
            );
            return Ok(PooledConnection::new(connection, permit, self.clone()));
        }

        let id = self.inner.next_connection_id.fetch_add(1, Ordering::AcqRel);
        let establish =
            self.inner
                .establisher
                .establish_connection(id, self.address.clone(), generation);
        let connection = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::cancelled()),
            result = establish => result?,
        };

        if connection.is_stale(self.generation()) {
            return Err(Error::pool_cleared_error(&self.address, generation)
                .with_phase(ConnectionPhase::Checkout));
        }

        Ok(PooledConnection::new(connection, permit, self.clone()))
    }

    /// Invalidates every connection created before this call. Idle connections are closed now;
    /// checked-out ones are closed when they come back.
    pub(crate) fn clear(&self, cause: &Error) {
        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let idle = std::mem::take(&mut *self.lock_idle());
        tracing::debug!(
            target: CONNECTION_TRACING_EVENT_TARGET,
            serverHost = self.address.host(),
            serverPort = self.address.port(),
            generation,
            closed = idle.len(),
            error = %cause,
            "Connection pool cleared"
        );
    }

    fn check_in(&self, connection: Connection) {
        if connection.is_broken() {
            self.close(connection, "error");
        } else if connection.is_stale(self.generation()) {
            self.close(connection, "stale");
        } else {
            tracing::trace!(
                target: CONNECTION_TRACING_EVENT_TARGET,
                driverConnectionId = connection.id,
                serverHost = self.address.host(),
                serverPort = self.address.port(),
                "Connection checked in"
            );
            self.lock_idle().push(connection);
        }
    }

    fn close(&self, connection: Connection, reason: &'static str) {
        tracing::debug!(
            target: CONNECTION_TRACING_EVENT_TARGET,
            driverConnectionId = connection.id,
            serverHost = self.address.host(),
            serverPort = self.address.port(),
            reason,
            "Connection closed"
        );
    }

    fn pop_idle(&self) -> Option<Connection> {
        self.lock_idle().pop()
    }

    fn lock_idle(&self) -> std::sync::MutexGuard<'_, Vec<Connection>> {
        self.inner.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub(crate) fn idle_count(&self) -> usize {
        self.lock_idle().len()
    }

    #[cfg(test)]
    pub(crate) fn available_permits(&self) -> usize {
        self.inner.permits.available_permits()
    }
}

/// A connection checked out of a [`ConnectionPool`]. Returned to the pool when dropped; the pool
/// discards it instead if it is broken or predates a clear.
#[derive(Debug)]
pub(crate) struct PooledConnection {
    connection: Option<Connection>,
    pool: ConnectionPool,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    fn new(connection: Connection, permit: OwnedSemaphorePermit, pool: ConnectionPool) -> Self {
        Self {
            connection: Some(connection),
            pool,
            _permit: permit,
        }
    }

    /// The pool generation this connection was established in.
    pub(crate) fn generation(&self) -> u32 {
        self.connection.as_ref().map_or(0, |c| c.generation)
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // Only taken in drop.
        match self.connection {
            Some(ref connection) => connection,
            None => unreachable!("pooled connection accessed after check-in"),
        }
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        match self.connection {
            Some(ref mut connection) => connection,
            None => unreachable!("pooled connection accessed after check-in"),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.pool.check_in(connection);
        }
    }
}
