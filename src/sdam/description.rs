use std::{collections::HashMap, fmt, time::Duration};

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    bson::oid::ObjectId,
    cmap::Command,
    hello::HelloReply,
    options::{ServerAddress, DEFAULT_LOCAL_THRESHOLD},
    selection_criteria::{ReadPreference, SelectionCriteria, TagSet},
};

/// The possible types for a server.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, derive_more::Display)]
#[non_exhaustive]
pub enum ServerType {
    /// A single, non-replica set mongod.
    Standalone,

    /// A router used in sharded deployments.
    Mongos,

    /// The primary node in a replica set.
    #[display("RSPrimary")]
    RsPrimary,

    /// A secondary node in a replica set.
    #[display("RSSecondary")]
    RsSecondary,

    /// A non-data bearing node in a replica set which can participate in elections.
    #[display("RSArbiter")]
    RsArbiter,

    /// Hidden, starting up, or recovering nodes in a replica set.
    #[display("RSOther")]
    RsOther,

    /// A member of an uninitialized replica set or a member that has been removed from the
    /// replica set config.
    #[display("RSGhost")]
    RsGhost,

    /// A load-balancing proxy between the client and the deployment.
    LoadBalancer,

    /// A server that the client hasn't yet communicated with or can't connect to.
    #[default]
    Unknown,
}

impl ServerType {
    pub(crate) fn is_data_bearing(self) -> bool {
        matches!(
            self,
            ServerType::Standalone
                | ServerType::RsPrimary
                | ServerType::RsSecondary
                | ServerType::Mongos
                | ServerType::LoadBalancer
        )
    }

    pub(crate) fn is_available(self) -> bool {
        !matches!(self, ServerType::Unknown)
    }
}

/// Enum representing the possible types of topology.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, derive_more::Display)]
#[non_exhaustive]
pub enum TopologyType {
    /// A single mongod server.
    Single,

    /// A replica set with no primary.
    ReplicaSetNoPrimary,

    /// A replica set with a primary.
    ReplicaSetWithPrimary,

    /// A sharded topology.
    Sharded,

    /// A load balanced topology.
    LoadBalanced,

    /// A topology whose type is not known.
    #[default]
    Unknown,
}

/// The server's position in its process's lifetime, reported with state-change errors so stale
/// errors can be told apart from current ones.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TopologyVersion {
    /// Identifies the server process.
    pub process_id: ObjectId,

    /// Incremented on every state change within the process.
    pub counter: i64,
}

/// A description of the most up-to-date information known about a server. Produced by the
/// external monitor and fed to the client through
/// [`Client::update_server`](crate::Client::update_server).
#[derive(Debug, Clone, PartialEq, TypedBuilder)]
#[non_exhaustive]
pub struct ServerDescription {
    /// The address of the server.
    pub address: ServerAddress,

    /// The type of the server.
    #[builder(default)]
    pub server_type: ServerType,

    /// The maximum wire version the server supports.
    #[builder(default, setter(strip_option))]
    pub max_wire_version: Option<i32>,

    /// How long the server keeps an idle session alive. `None` means the server does not
    /// support sessions.
    #[builder(default, setter(strip_option))]
    pub logical_session_timeout: Option<Duration>,

    /// The average round trip time of the monitor's heartbeats.
    #[builder(default, setter(strip_option))]
    pub round_trip_time: Option<Duration>,

    /// The replica set member tags of the server.
    #[builder(default, setter(strip_option))]
    pub tags: Option<TagSet>,

    /// The topology version the server reported.
    #[builder(default, setter(strip_option))]
    pub topology_version: Option<TopologyVersion>,
}

impl ServerDescription {
    /// A description of a server that has not been heard from.
    pub fn new_unknown(address: ServerAddress) -> Self {
        Self::builder().address(address).build()
    }

    pub(crate) fn from_hello_reply(reply: &HelloReply, round_trip_time: Option<Duration>) -> Self {
        let response = &reply.command_response;
        Self {
            address: reply.server_address.clone(),
            server_type: response.server_type(),
            max_wire_version: response.max_wire_version,
            logical_session_timeout: response
                .logical_session_timeout_minutes
                .map(|mins| Duration::from_secs(mins.max(0) as u64 * 60)),
            round_trip_time,
            tags: response.tags.clone(),
            topology_version: response.topology_version,
        }
    }

    pub(crate) fn is_available(&self) -> bool {
        self.server_type.is_available()
    }

    pub(crate) fn matches_tag_set(&self, tag_set: &TagSet) -> bool {
        let server_tags = match self.tags {
            Some(ref tags) => tags,
            None => return tag_set.is_empty(),
        };

        tag_set
            .iter()
            .all(|(key, val)| server_tags.get(key) == Some(val))
    }
}

/// A description of the most up-to-date information known about a topology.
#[derive(Debug, Clone, Default)]
pub(crate) struct TopologyDescription {
    pub(crate) topology_type: TopologyType,
    pub(crate) servers: HashMap<ServerAddress, ServerDescription>,
    pub(crate) local_threshold: Option<Duration>,

    /// The smallest session timeout across data-bearing servers, or `None` if any of them does
    /// not support sessions.
    pub(crate) logical_session_timeout: Option<Duration>,
}

impl TopologyDescription {
    pub(crate) fn new(
        hosts: &[ServerAddress],
        load_balanced: bool,
        local_threshold: Option<Duration>,
    ) -> Self {
        let servers = hosts
            .iter()
            .map(|address| {
                let mut description = ServerDescription::new_unknown(address.clone());
                if load_balanced {
                    description.server_type = ServerType::LoadBalancer;
                }
                (address.clone(), description)
            })
            .collect();

        let mut description = Self {
            topology_type: if load_balanced {
                TopologyType::LoadBalanced
            } else {
                TopologyType::Unknown
            },
            servers,
            local_threshold,
            logical_session_timeout: None,
        };
        description.recompute();
        description
    }

    pub(crate) fn get_server_description(&self, address: &ServerAddress) -> Option<&ServerDescription> {
        self.servers.get(address)
    }

    /// Records `server_description`, replacing any previous description of the same address.
    pub(crate) fn update(&mut self, server_description: ServerDescription) {
        self.servers
            .insert(server_description.address.clone(), server_description);
        self.recompute();
    }

    fn recompute(&mut self) {
        if self.topology_type != TopologyType::LoadBalanced {
            self.topology_type = self.infer_topology_type();
        }

        let mut data_bearing = self
            .servers
            .values()
            .filter(|server| server.server_type.is_data_bearing())
            .peekable();
        self.logical_session_timeout = if data_bearing.peek().is_none() {
            None
        } else {
            data_bearing
                .map(|server| server.logical_session_timeout)
                .try_fold(Duration::MAX, |min, timeout| timeout.map(|t| min.min(t)))
        };
    }

    fn infer_topology_type(&self) -> TopologyType {
        let has = |server_type: ServerType| {
            self.servers
                .values()
                .any(|server| server.server_type == server_type)
        };

        if has(ServerType::Mongos) {
            TopologyType::Sharded
        } else if has(ServerType::RsPrimary) {
            TopologyType::ReplicaSetWithPrimary
        } else if has(ServerType::RsSecondary)
            || has(ServerType::RsArbiter)
            || has(ServerType::RsOther)
            || has(ServerType::RsGhost)
        {
            TopologyType::ReplicaSetNoPrimary
        } else if has(ServerType::Standalone) {
            TopologyType::Single
        } else {
            TopologyType::Unknown
        }
    }

    pub(crate) fn has_available_servers(&self) -> bool {
        self.servers.values().any(|server| server.is_available())
    }

    pub(crate) fn server_selection_timeout_error_message(
        &self,
        criteria: &SelectionCriteria,
    ) -> String {
        if self.has_available_servers() {
            format!(
                "Server selection timeout: None of the available servers suitable for criteria \
                 {criteria:?}. Topology: {self}"
            )
        } else {
            format!("Server selection timeout: No available servers. Topology: {self}")
        }
    }

    /// The servers matching `criteria` whose round trip time is within the local threshold of
    /// the fastest one.
    pub(crate) fn suitable_servers_in_latency_window<'a>(
        &'a self,
        criteria: &'a SelectionCriteria,
    ) -> Vec<&'a ServerDescription> {
        let mut suitable_servers = match criteria {
            SelectionCriteria::ReadPreference(ref read_pref) => self.suitable_servers(read_pref),
            SelectionCriteria::Predicate(ref filter) => self
                .servers
                .values()
                .filter(|s| {
                    (self.topology_type == TopologyType::Single || s.server_type.is_data_bearing())
                        && filter(s)
                })
                .collect(),
        };

        self.retain_servers_within_latency_window(&mut suitable_servers);

        suitable_servers
    }

    fn suitable_servers(&self, read_preference: &ReadPreference) -> Vec<&ServerDescription> {
        match self.topology_type {
            TopologyType::Unknown => Vec::new(),
            TopologyType::Single | TopologyType::LoadBalanced => self
                .servers
                .values()
                .filter(|server| server.is_available())
                .collect(),
            TopologyType::Sharded => self.servers_with_type(&[ServerType::Mongos]).collect(),
            TopologyType::ReplicaSetWithPrimary | TopologyType::ReplicaSetNoPrimary => {
                self.suitable_servers_in_replica_set(read_preference)
            }
        }
    }

    fn retain_servers_within_latency_window(&self, suitable_servers: &mut Vec<&ServerDescription>) {
        let shortest_rtt = suitable_servers
            .iter()
            .filter_map(|server_desc| server_desc.round_trip_time)
            .min();

        let local_threshold = self.local_threshold.unwrap_or(DEFAULT_LOCAL_THRESHOLD);

        let max_rtt_within_window =
            shortest_rtt.map(|rtt| rtt.checked_add(local_threshold).unwrap_or(Duration::MAX));

        suitable_servers.retain(move |server_desc| {
            match (server_desc.round_trip_time, max_rtt_within_window) {
                (Some(server_rtt), Some(max_rtt)) => server_rtt <= max_rtt,
                // Servers the monitor has not timed yet (e.g. load balancers) stay eligible.
                _ => true,
            }
        });
    }

    pub(crate) fn servers_with_type<'a>(
        &'a self,
        types: &'a [ServerType],
    ) -> impl Iterator<Item = &'a ServerDescription> {
        self.servers
            .values()
            .filter(move |server| types.contains(&server.server_type))
    }

    fn suitable_servers_in_replica_set(
        &self,
        read_preference: &ReadPreference,
    ) -> Vec<&ServerDescription> {
        let tag_sets = read_preference.tag_sets();

        match read_preference {
            ReadPreference::Primary => self.servers_with_type(&[ServerType::RsPrimary]).collect(),
            ReadPreference::Secondary { .. } => {
                self.suitable_servers_with_tags(&[ServerType::RsSecondary], tag_sets)
            }
            ReadPreference::PrimaryPreferred { .. } => {
                match self.servers_with_type(&[ServerType::RsPrimary]).next() {
                    Some(primary) => vec![primary],
                    None => self.suitable_servers_with_tags(&[ServerType::RsSecondary], tag_sets),
                }
            }
            ReadPreference::SecondaryPreferred { .. } => {
                let suitable_servers =
                    self.suitable_servers_with_tags(&[ServerType::RsSecondary], tag_sets);

                if suitable_servers.is_empty() {
                    self.servers_with_type(&[ServerType::RsPrimary]).collect()
                } else {
                    suitable_servers
                }
            }
            ReadPreference::Nearest { .. } => self.suitable_servers_with_tags(
                &[ServerType::RsPrimary, ServerType::RsSecondary],
                tag_sets,
            ),
        }
    }

    fn suitable_servers_with_tags(
        &self,
        types: &'static [ServerType],
        tag_sets: Option<&Vec<TagSet>>,
    ) -> Vec<&ServerDescription> {
        let mut servers = self.servers_with_type(types).collect();

        if let Some(tag_sets) = tag_sets {
            filter_servers_by_tag_sets(&mut servers, tag_sets);
        }

        servers
    }
}

impl fmt::Display for TopologyDescription {
    fn fmt(&self, f: &mut fmt::Formatter) -> std::result::Result<(), fmt::Error> {
        write!(f, "{{ Type: {}", self.topology_type)?;

        if !self.servers.is_empty() {
            write!(f, ", Servers: [ ")?;
            let mut first = true;
            for server in self.servers.values() {
                if !first {
                    write!(f, ", ")?;
                }
                first = false;
                write!(
                    f,
                    "{{ Address: {}, Type: {} }}",
                    server.address, server.server_type
                )?;
            }
            write!(f, " ]")?;
        }

        write!(f, " }}")
    }
}

fn filter_servers_by_tag_sets(servers: &mut Vec<&ServerDescription>, tag_sets: &[TagSet]) {
    if tag_sets.is_empty() {
        return;
    }

    for tag_set in tag_sets {
        let matches_tag_set = |server: &&ServerDescription| server.matches_tag_set(tag_set);

        if servers.iter().any(matches_tag_set) {
            servers.retain(matches_tag_set);

            return;
        }
    }

    servers.clear();
}

/// Applies the rules for sending a read preference to a server of `server_type` in a topology of
/// `topology_type`.
pub(crate) fn update_command_with_read_pref(
    topology_type: TopologyType,
    server_type: ServerType,
    command: &mut Command,
    criteria: Option<&SelectionCriteria>,
) {
    match (topology_type, server_type) {
        (TopologyType::Sharded, ServerType::Mongos)
        | (TopologyType::Single, ServerType::Mongos)
        | (TopologyType::LoadBalanced, _) => update_command_read_pref_for_mongos(command, criteria),
        (TopologyType::Single, ServerType::Standalone) => {}
        (TopologyType::Single, _) => {
            let specified_read_pref = criteria.and_then(SelectionCriteria::as_read_pref).cloned();

            let resolved_read_pref = match specified_read_pref {
                Some(ReadPreference::Primary) | None => ReadPreference::PrimaryPreferred {
                    options: Default::default(),
                },
                Some(other) => other,
            };
            command.set_read_preference(resolved_read_pref)
        }
        _ => {
            let read_pref = match criteria {
                Some(SelectionCriteria::ReadPreference(rp)) => rp.clone(),
                Some(SelectionCriteria::Predicate(_)) => ReadPreference::PrimaryPreferred {
                    options: Default::default(),
                },
                None => ReadPreference::Primary,
            };
            if read_pref != ReadPreference::Primary {
                command.set_read_preference(read_pref)
            }
        }
    }
}

fn update_command_read_pref_for_mongos(command: &mut Command, criteria: Option<&SelectionCriteria>) {
    let read_preference = match criteria {
        Some(SelectionCriteria::ReadPreference(rp)) => rp,
        _ => return,
    };
    match read_preference {
        ReadPreference::Secondary { .. }
        | ReadPreference::PrimaryPreferred { .. }
        | ReadPreference::Nearest { .. } => command.set_read_preference(read_preference.clone()),
        ReadPreference::SecondaryPreferred { ref options } => {
            // secondaryPreferred without options is the default mongos behavior.
            if options.as_ref().is_some_and(|o| !o.is_default()) {
                command.set_read_preference(read_preference.clone())
            }
        }
        ReadPreference::Primary => {}
    }
}
