use std::{sync::Arc, time::Duration};

use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use super::{update_command_with_read_pref, ServerDescription, ServerType, Topology, TopologyType};
use crate::{
    bson::doc,
    cmap::{Command, TcpConnector},
    error::{Error, ErrorKind},
    options::{ClientOptions, ServerAddress},
    selection_criteria::{ReadPreference, ReadPreferenceOptions, SelectionCriteria},
};

fn address(host: &str) -> ServerAddress {
    ServerAddress::parse(host).unwrap()
}

fn topology(hosts: &[&str]) -> Topology {
    let options = ClientOptions::builder()
        .hosts(hosts.iter().map(|host| address(host)).collect::<Vec<_>>())
        .server_selection_timeout(Duration::from_millis(100))
        .build();
    Topology::new(&options, Arc::new(TcpConnector))
}

fn server(host: &str, server_type: ServerType) -> ServerDescription {
    ServerDescription::builder()
        .address(address(host))
        .server_type(server_type)
        .max_wire_version(21)
        .logical_session_timeout(Duration::from_secs(30 * 60))
        .round_trip_time(Duration::from_millis(1))
        .build()
}

fn primary() -> SelectionCriteria {
    SelectionCriteria::ReadPreference(ReadPreference::Primary)
}

#[tokio::test]
async fn selects_primary_in_replica_set() {
    let topology = topology(&["a:27017", "b:27017"]);
    topology.update_server(server("a:27017", ServerType::RsSecondary));
    topology.update_server(server("b:27017", ServerType::RsPrimary));
    assert_eq!(
        topology.topology_type(),
        TopologyType::ReplicaSetWithPrimary
    );

    let selected = topology
        .select_server(&primary(), None, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(selected.server.address, address("b:27017"));
    assert_eq!(selected.description.server_type, ServerType::RsPrimary);
}

#[tokio::test]
async fn deprioritized_mongos_is_avoided() {
    let topology = topology(&["a:27017", "b:27017"]);
    topology.update_server(server("a:27017", ServerType::Mongos));
    topology.update_server(server("b:27017", ServerType::Mongos));

    let failed = address("a:27017");
    for _ in 0..10 {
        let selected = topology
            .select_server(&primary(), Some(&failed), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(selected.server.address, address("b:27017"));
    }
}

#[tokio::test]
async fn deprioritized_server_is_used_when_it_is_the_only_one() {
    let topology = topology(&["a:27017"]);
    topology.update_server(server("a:27017", ServerType::Mongos));

    let failed = address("a:27017");
    let selected = topology
        .select_server(&primary(), Some(&failed), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(selected.server.address, failed);
}

#[tokio::test]
async fn selection_waits_for_topology_update() {
    let topology = Arc::new(topology(&["a:27017"]));

    let updater = topology.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        updater.update_server(server("a:27017", ServerType::Standalone));
    });

    let selected = topology
        .select_server(&primary(), None, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(selected.topology_type, TopologyType::Single);
}

#[tokio::test]
async fn selection_times_out() {
    let topology = topology(&["a:27017"]);
    topology.update_server(server("a:27017", ServerType::RsSecondary));

    let error = topology
        .select_server(&primary(), None, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::ServerSelection { .. }));
    assert!(error.is_server_selection_error());
}

#[tokio::test]
async fn selection_honors_cancellation() {
    let topology = topology(&["a:27017"]);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let error = topology
        .select_server(&primary(), None, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::Cancelled));
}

#[test]
fn logical_session_timeout_is_minimum_across_data_bearing_servers() {
    let topology = topology(&["a:27017", "b:27017", "c:27017"]);
    topology.update_server(server("a:27017", ServerType::RsPrimary));
    let mut secondary = server("b:27017", ServerType::RsSecondary);
    secondary.logical_session_timeout = Some(Duration::from_secs(10 * 60));
    topology.update_server(secondary);
    let mut arbiter = server("c:27017", ServerType::RsArbiter);
    arbiter.logical_session_timeout = None;
    topology.update_server(arbiter);

    assert_eq!(
        topology.description().logical_session_timeout,
        Some(Duration::from_secs(10 * 60))
    );

    let mut no_sessions = server("b:27017", ServerType::RsSecondary);
    no_sessions.logical_session_timeout = None;
    topology.update_server(no_sessions);
    assert_eq!(topology.description().logical_session_timeout, None);
}

#[test]
fn new_servers_get_pools() {
    let topology = topology(&["a:27017"]);
    assert!(topology.pool(&address("b:27017")).is_none());

    topology.update_server(server("b:27017", ServerType::Mongos));
    assert!(topology.pool(&address("b:27017")).is_some());
}

#[test]
fn network_error_clears_pool_of_current_generation_only() {
    let topology = topology(&["a:27017"]);
    let a = address("a:27017");
    let pool = topology.pool(&a).unwrap();
    let error = Error::from(std::io::ErrorKind::ConnectionReset);

    topology.handle_application_error(&a, 0, &error);
    assert_eq!(pool.generation(), 1);

    // A connection from the generation that was just cleared reports the same failure.
    topology.handle_application_error(&a, 0, &error);
    assert_eq!(pool.generation(), 1);
}

#[test]
fn command_errors_do_not_clear_pool() {
    let topology = topology(&["a:27017"]);
    let a = address("a:27017");
    let pool = topology.pool(&a).unwrap();

    let not_primary = Error::from(ErrorKind::Command(crate::error::CommandError::new(
        10107,
        "NotWritablePrimary",
        "not primary",
    )))
    .with_wire_version(Some(21));
    topology.handle_application_error(&a, 0, &not_primary);
    assert_eq!(pool.generation(), 0);

    let duplicate_key = Error::from(ErrorKind::Command(crate::error::CommandError::new(
        11000,
        "DuplicateKey",
        "duplicate key",
    )));
    topology.handle_application_error(&a, 0, &duplicate_key);
    assert_eq!(pool.generation(), 0);

    let shutting_down = Error::from(ErrorKind::Command(crate::error::CommandError::new(
        91,
        "ShutdownInProgress",
        "shutting down",
    )))
    .with_wire_version(Some(21));
    topology.handle_application_error(&a, 0, &shutting_down);
    assert_eq!(pool.generation(), 1);
}

fn command() -> Command {
    Command::new("find", "db", doc! { "find": "coll" })
}

#[test]
fn standalone_never_gets_read_preference() {
    let mut command = command();
    let secondary = SelectionCriteria::ReadPreference(ReadPreference::Secondary {
        options: None,
    });
    update_command_with_read_pref(
        TopologyType::Single,
        ServerType::Standalone,
        &mut command,
        Some(&secondary),
    );
    assert_eq!(command.read_preference, None);
}

#[test]
fn direct_connection_to_replica_set_member_uses_primary_preferred() {
    let mut command = command();
    update_command_with_read_pref(
        TopologyType::Single,
        ServerType::RsSecondary,
        &mut command,
        Some(&primary()),
    );
    assert_eq!(
        command.read_preference,
        Some(ReadPreference::PrimaryPreferred { options: None })
    );
}

#[test]
fn mongos_gets_only_non_default_read_preferences() {
    let mut command = command();
    let secondary_preferred =
        SelectionCriteria::ReadPreference(ReadPreference::SecondaryPreferred { options: None });
    update_command_with_read_pref(
        TopologyType::Sharded,
        ServerType::Mongos,
        &mut command,
        Some(&secondary_preferred),
    );
    assert_eq!(command.read_preference, None);

    let tagged = ReadPreference::SecondaryPreferred {
        options: Some(
            ReadPreferenceOptions::builder()
                .tag_sets(vec![[("dc".to_string(), "east".to_string())]
                    .into_iter()
                    .collect()])
                .build(),
        ),
    };
    update_command_with_read_pref(
        TopologyType::Sharded,
        ServerType::Mongos,
        &mut command,
        Some(&SelectionCriteria::ReadPreference(tagged.clone())),
    );
    assert_eq!(command.read_preference, Some(tagged));
}
