use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use rand::seq::IndexedRandom;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::{ServerDescription, TopologyDescription, TopologyType};
use crate::{
    bson::oid::ObjectId,
    cmap::{establish::ConnectionEstablisher, ConnectionPool, StreamConnector},
    error::{Error, ErrorKind, Result},
    options::{
        ClientOptions,
        ServerAddress,
        DEFAULT_MAX_POOL_SIZE,
        DEFAULT_SERVER_SELECTION_TIMEOUT,
    },
    selection_criteria::SelectionCriteria,
    session::{ClusterTime, ServerSessionPool},
    trace::{TracingRepresentation, SERVER_SELECTION_TRACING_EVENT_TARGET},
};

/// A server known to the topology, along with its connection pool.
#[derive(Debug)]
pub(crate) struct Server {
    pub(crate) address: ServerAddress,
    pub(crate) pool: ConnectionPool,
}

/// The result of server selection: the server, and the descriptions it was selected from.
#[derive(Debug)]
pub(crate) struct SelectedServer {
    pub(crate) server: Arc<Server>,
    pub(crate) description: ServerDescription,
    pub(crate) topology_type: TopologyType,
}

#[derive(Clone, Debug)]
struct TopologyState {
    description: TopologyDescription,
    servers: HashMap<ServerAddress, Arc<Server>>,
}

/// The deployment as last reported by the external monitor, plus the state shared by every
/// operation against it: connection pools, the cluster clock, and the server session pool.
pub(crate) struct Topology {
    pub(crate) id: ObjectId,
    state: watch::Sender<TopologyState>,
    establisher: ConnectionEstablisher,
    max_pool_size: u32,
    server_selection_timeout: Duration,
    cluster_time: Mutex<Option<ClusterTime>>,
    session_pool: Arc<ServerSessionPool>,
}

impl fmt::Debug for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topology")
            .field("id", &self.id)
            .field("description", &self.state.borrow().description)
            .finish()
    }
}

impl Topology {
    pub(crate) fn new(options: &ClientOptions, connector: Arc<dyn StreamConnector>) -> Self {
        let establisher = ConnectionEstablisher::new(options, connector);
        let max_pool_size = options.max_pool_size.unwrap_or(DEFAULT_MAX_POOL_SIZE);
        let description = TopologyDescription::new(
            &options.hosts,
            options.is_load_balanced(),
            options.local_threshold,
        );
        let servers = options
            .hosts
            .iter()
            .map(|address| {
                let server = Arc::new(Server {
                    address: address.clone(),
                    pool: ConnectionPool::new(address.clone(), establisher.clone(), max_pool_size),
                });
                (address.clone(), server)
            })
            .collect();
        let (state, _) = watch::channel(TopologyState {
            description,
            servers,
        });

        Self {
            id: ObjectId::new(),
            state,
            establisher,
            max_pool_size,
            server_selection_timeout: options
                .server_selection_timeout
                .unwrap_or(DEFAULT_SERVER_SELECTION_TIMEOUT),
            cluster_time: Mutex::new(None),
            session_pool: Arc::new(ServerSessionPool::new()),
        }
    }

    /// Records a new description of one server, waking any operation waiting in server
    /// selection. Servers not seen before get a connection pool.
    pub(crate) fn update_server(&self, server_description: ServerDescription) {
        let mut logical_session_timeout = None;
        self.state.send_modify(|state| {
            let address = server_description.address.clone();
            state.servers.entry(address.clone()).or_insert_with(|| {
                Arc::new(Server {
                    pool: ConnectionPool::new(
                        address.clone(),
                        self.establisher.clone(),
                        self.max_pool_size,
                    ),
                    address,
                })
            });
            state.description.update(server_description);
            logical_session_timeout = state.description.logical_session_timeout;
            tracing::debug!(
                target: SERVER_SELECTION_TRACING_EVENT_TARGET,
                topologyId = self.id.tracing_representation(),
                topologyDescription = %state.description,
                "Topology description changed"
            );
        });
        self.session_pool
            .set_logical_session_timeout(logical_session_timeout);
    }

    pub(crate) fn description(&self) -> TopologyDescription {
        self.state.borrow().description.clone()
    }

    pub(crate) fn topology_type(&self) -> TopologyType {
        self.state.borrow().description.topology_type
    }

    pub(crate) fn session_pool(&self) -> &Arc<ServerSessionPool> {
        &self.session_pool
    }

    /// The highest cluster time seen from any server.
    pub(crate) fn cluster_time(&self) -> Option<ClusterTime> {
        self.lock_cluster_time().clone()
    }

    pub(crate) fn advance_cluster_time(&self, to: &ClusterTime) {
        let mut current = self.lock_cluster_time();
        if current.as_ref().is_none_or(|current| current < to) {
            *current = Some(to.clone());
        }
    }

    fn lock_cluster_time(&self) -> std::sync::MutexGuard<'_, Option<ClusterTime>> {
        self.cluster_time
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Selects a server matching `criteria`, waiting for topology updates until the server
    /// selection timeout elapses.
    ///
    /// In a sharded deployment, `deprioritized` is passed over as long as another suitable
    /// server exists.
    pub(crate) async fn select_server(
        &self,
        criteria: &SelectionCriteria,
        deprioritized: Option<&ServerAddress>,
        cancel: &CancellationToken,
    ) -> Result<SelectedServer> {
        let deadline = tokio::time::Instant::now() + self.server_selection_timeout;
        let mut watcher = self.state.subscribe();
        let mut emitted_waiting_message = false;

        tracing::debug!(
            target: SERVER_SELECTION_TRACING_EVENT_TARGET,
            topologyId = self.id.tracing_representation(),
            selector = criteria.tracing_representation(),
            "Server selection started"
        );

        loop {
            let timeout_message = {
                let state = watcher.borrow_and_update();
                if let Some(selected) = attempt_to_select_server(criteria, &state, deprioritized) {
                    tracing::debug!(
                        target: SERVER_SELECTION_TRACING_EVENT_TARGET,
                        topologyId = self.id.tracing_representation(),
                        selector = criteria.tracing_representation(),
                        serverHost = selected.server.address.host(),
                        serverPort = selected.server.address.port(),
                        "Server selection succeeded"
                    );
                    return Ok(selected);
                }
                state
                    .description
                    .server_selection_timeout_error_message(criteria)
            };

            if !emitted_waiting_message {
                tracing::debug!(
                    target: SERVER_SELECTION_TRACING_EVENT_TARGET,
                    topologyId = self.id.tracing_representation(),
                    selector = criteria.tracing_representation(),
                    remainingTimeMS = deadline
                        .saturating_duration_since(tokio::time::Instant::now())
                        .as_millis(),
                    "Waiting for suitable server to become available"
                );
                emitted_waiting_message = true;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::cancelled()),
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::debug!(
                        target: SERVER_SELECTION_TRACING_EVENT_TARGET,
                        topologyId = self.id.tracing_representation(),
                        selector = criteria.tracing_representation(),
                        failure = timeout_message.as_str(),
                        "Server selection failed"
                    );
                    return Err(ErrorKind::ServerSelection {
                        message: timeout_message,
                    }
                    .into());
                }
                changed = watcher.changed() => {
                    if changed.is_err() {
                        return Err(Error::internal("topology was dropped during server selection"));
                    }
                }
            }
        }
    }

    /// Reacts to an error seen on a connection to `address` established in pool generation
    /// `generation`: network errors, and state-change errors from servers that drop
    /// connections on stepdown, clear that server's pool. Errors from connections that predate
    /// the current generation, or that report an outdated topology version, are ignored.
    pub(crate) fn handle_application_error(
        &self,
        address: &ServerAddress,
        generation: u32,
        error: &Error,
    ) {
        let state = self.state.borrow();
        let Some(server) = state.servers.get(address) else {
            return;
        };
        if server.pool.generation() != generation {
            return;
        }

        let is_io_error = matches!(error.kind.as_ref(), ErrorKind::Io(_));
        let clears_pool = if is_io_error {
            true
        } else if error.is_state_change_error() {
            let is_stale = state
                .description
                .get_server_description(address)
                .is_some_and(|description| is_stale_error(description, error));
            !is_stale
                && (error.is_shutting_down() || error.wire_version.is_none_or(|version| version < 8))
        } else {
            false
        };

        if clears_pool {
            server.pool.clear(error);
        }
    }

    #[cfg(test)]
    pub(crate) fn pool(&self, address: &ServerAddress) -> Option<ConnectionPool> {
        self.state
            .borrow()
            .servers
            .get(address)
            .map(|server| server.pool.clone())
    }
}

fn is_stale_error(description: &ServerDescription, error: &Error) -> bool {
    match (description.topology_version, error.topology_version()) {
        (Some(current), Some(reported)) => {
            current.process_id == reported.process_id && reported.counter < current.counter
        }
        _ => false,
    }
}

fn attempt_to_select_server(
    criteria: &SelectionCriteria,
    state: &TopologyState,
    deprioritized: Option<&ServerAddress>,
) -> Option<SelectedServer> {
    let mut in_window = state
        .description
        .suitable_servers_in_latency_window(criteria);
    if let Some(address) = deprioritized {
        if state.description.topology_type == TopologyType::Sharded && in_window.len() > 1 {
            in_window.retain(|description| &description.address != address);
        }
    }

    let description = in_window.choose(&mut rand::rng())?;
    let server = state.servers.get(&description.address)?;
    Some(SelectedServer {
        server: server.clone(),
        description: (*description).clone(),
        topology_type: state.description.topology_type,
    })
}
