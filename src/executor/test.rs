use std::{sync::Arc, time::Duration};

use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use super::OperationExecutor;
use crate::{
    binding::{ClusterBinding, ReadBinding, WriteBinding},
    bson::{doc, Bson},
    error::{ErrorKind, RETRYABLE_WRITE_ERROR, TRANSIENT_TRANSACTION_ERROR},
    operation::{Count, Insert, RunCommand, Update, UpdateRequest},
    options::ClientOptions,
    sdam::{ServerType, Topology},
    session::CoreSession,
    test::util::{
        address,
        client_options,
        command_error_reply,
        hello_reply,
        server_description,
        MockReply,
        MockServer,
    },
    Namespace,
};

struct Harness {
    mock: MockServer,
    topology: Arc<Topology>,
    executor: OperationExecutor,
}

impl Harness {
    fn with_options(options: ClientOptions, servers: &[(&str, ServerType)]) -> Self {
        let mock = MockServer::new();
        let topology = Arc::new(Topology::new(&options, Arc::new(mock.clone())));
        for (host, server_type) in servers {
            topology.update_server(server_description(host, *server_type));
            mock.set_hello(&address(host), hello_reply(*server_type));
        }
        Self {
            executor: OperationExecutor::new(&options, topology.clone()),
            mock,
            topology,
        }
    }

    fn new(servers: &[(&str, ServerType)]) -> Self {
        let hosts: Vec<_> = servers.iter().map(|(host, _)| *host).collect();
        Self::with_options(client_options(&hosts), servers)
    }

    fn primary() -> Self {
        Self::new(&[("a:27017", ServerType::RsPrimary)])
    }

    fn session(&self, implicit: bool) -> CoreSession {
        CoreSession::new(self.topology.session_pool().clone(), None, implicit)
    }

    fn read_binding(&self, session: &CoreSession) -> Box<dyn ReadBinding> {
        Box::new(ClusterBinding::new(
            self.topology.clone(),
            None,
            session.fork(),
        ))
    }

    fn write_binding(&self, session: &CoreSession) -> Box<dyn WriteBinding> {
        Box::new(ClusterBinding::new(
            self.topology.clone(),
            None,
            session.fork(),
        ))
    }
}

fn ns() -> Namespace {
    Namespace::new("db", "coll")
}

fn insert() -> Insert {
    Insert::new(ns(), vec![doc! { "x": 1 }], None)
}

#[tokio::test]
async fn retried_write_reuses_transaction_number() {
    let harness = Harness::primary();
    harness
        .mock
        .reply(&address("a:27017"), "insert", MockReply::CloseConnection);
    harness
        .mock
        .reply(&address("a:27017"), "insert", doc! { "ok": 1, "n": 1 });

    let session = harness.session(true);
    let result = harness
        .executor
        .execute_write(
            &mut insert(),
            harness.write_binding(&session),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(result.inserted_ids.len(), 1);

    let sent = harness.mock.received_named("insert");
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].body.get("txnNumber"), Some(&Bson::Int64(1)));
    assert_eq!(sent[1].body.get("txnNumber"), Some(&Bson::Int64(1)));
    assert_eq!(
        sent[0].body.get_document("lsid").unwrap(),
        sent[1].body.get_document("lsid").unwrap()
    );
    // The same document, generated `_id` included, is sent both times.
    assert_eq!(
        sent[0].body.get_array("documents").unwrap(),
        sent[1].body.get_array("documents").unwrap()
    );
    assert_ne!(sent[0].connection, sent[1].connection);
}

#[tokio::test]
async fn each_write_gets_a_new_transaction_number() {
    let harness = Harness::primary();
    let session = harness.session(true);
    for _ in 0..2 {
        harness
            .executor
            .execute_write(
                &mut insert(),
                harness.write_binding(&session),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
    }

    let sent = harness.mock.received_named("insert");
    assert_eq!(sent[0].body.get("txnNumber"), Some(&Bson::Int64(1)));
    assert_eq!(sent[1].body.get("txnNumber"), Some(&Bson::Int64(2)));
}

#[tokio::test]
async fn persistent_failure_is_attempted_exactly_twice() {
    let harness = Harness::primary();
    for _ in 0..3 {
        harness
            .mock
            .reply(&address("a:27017"), "insert", MockReply::CloseConnection);
    }

    let error = harness
        .executor
        .execute_write(
            &mut insert(),
            harness.write_binding(&harness.session(true)),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(error.is_network_error());
    assert!(error.contains_label(RETRYABLE_WRITE_ERROR));
    assert_eq!(harness.mock.received_named("insert").len(), 2);
}

#[tokio::test]
async fn one_multi_update_poisons_the_batch() {
    let harness = Harness::primary();
    harness
        .mock
        .reply(&address("a:27017"), "update", MockReply::CloseConnection);

    let mut update = Update::new(
        ns(),
        vec![
            UpdateRequest::builder()
                .filter(doc! { "x": 1 })
                .update(doc! { "$inc": { "x": 1 } })
                .build(),
            UpdateRequest::builder()
                .filter(doc! {})
                .update(doc! { "$set": { "y": 1 } })
                .multi(true)
                .build(),
        ],
        None,
    );
    let error = harness
        .executor
        .execute_write(
            &mut update,
            harness.write_binding(&harness.session(true)),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(error.is_network_error());
    let sent = harness.mock.received_named("update");
    assert_eq!(sent.len(), 1);
    assert!(!sent[0].body.contains_key("txnNumber"));
}

#[tokio::test]
async fn writes_retry_only_on_labelled_server_errors() {
    let harness = Harness::primary();
    let mut labelled = command_error_reply(91, "ShutdownInProgress");
    labelled.insert("errorLabels", vec![RETRYABLE_WRITE_ERROR]);
    harness.mock.reply(&address("a:27017"), "insert", labelled);
    harness
        .mock
        .reply(&address("a:27017"), "insert", command_error_reply(2, "BadValue"));

    let session = harness.session(true);
    let error = harness
        .executor
        .execute_write(
            &mut insert(),
            harness.write_binding(&session),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    // The second error is a plain command error, and it is what the caller sees.
    assert_eq!(error.code(), Some(2));
    assert_eq!(harness.mock.received_named("insert").len(), 2);

    harness
        .mock
        .reply(&address("a:27017"), "insert", command_error_reply(2, "BadValue"));
    let error = harness
        .executor
        .execute_write(
            &mut insert(),
            harness.write_binding(&session),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(error.code(), Some(2));
    assert_eq!(harness.mock.received_named("insert").len(), 3);
}

#[tokio::test]
async fn no_writes_performed_on_retry_reports_first_error() {
    let harness = Harness::primary();
    let mut first = command_error_reply(91, "ShutdownInProgress");
    first.insert("errorLabels", vec![RETRYABLE_WRITE_ERROR]);
    let mut second = command_error_reply(10107, "NotWritablePrimary");
    second.insert(
        "errorLabels",
        vec![RETRYABLE_WRITE_ERROR, crate::error::NO_WRITES_PERFORMED],
    );
    harness.mock.reply(&address("a:27017"), "insert", first);
    harness.mock.reply(&address("a:27017"), "insert", second);

    let error = harness
        .executor
        .execute_write(
            &mut insert(),
            harness.write_binding(&harness.session(true)),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(error.code(), Some(91));
}

#[tokio::test]
async fn retryable_reads_follow_server_codes() {
    let harness = Harness::primary();
    harness.mock.reply(
        &address("a:27017"),
        "count",
        command_error_reply(11600, "InterruptedAtShutdown"),
    );
    harness
        .mock
        .reply(&address("a:27017"), "count", doc! { "ok": 1, "n": 3 });

    let session = harness.session(true);
    let count = harness
        .executor
        .execute_read(
            &mut Count::new(ns(), doc! {}, None),
            harness.read_binding(&session),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(count, 3);
    assert_eq!(harness.mock.received_named("count").len(), 2);
}

#[tokio::test]
async fn retry_reads_can_be_turned_off() {
    let mut options = client_options(&["a:27017"]);
    options.retry_reads = Some(false);
    let harness = Harness::with_options(options, &[("a:27017", ServerType::RsPrimary)]);
    harness
        .mock
        .reply(&address("a:27017"), "count", MockReply::CloseConnection);

    let error = harness
        .executor
        .execute_read(
            &mut Count::new(ns(), doc! {}, None),
            harness.read_binding(&harness.session(true)),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(error.is_network_error());
    assert_eq!(harness.mock.received_named("count").len(), 1);
}

#[tokio::test]
async fn retried_read_moves_to_another_mongos() {
    let harness = Harness::new(&[
        ("a:27017", ServerType::Mongos),
        ("b:27017", ServerType::Mongos),
    ]);
    for host in ["a:27017", "b:27017"] {
        harness
            .mock
            .reply(&address(host), "count", MockReply::CloseConnection);
    }

    let error = harness
        .executor
        .execute_read(
            &mut Count::new(ns(), doc! {}, None),
            harness.read_binding(&harness.session(true)),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(error.is_network_error());
    let sent = harness.mock.received_named("count");
    assert_eq!(sent.len(), 2);
    assert_ne!(sent[0].address, sent[1].address);
}

#[tokio::test]
async fn commands_without_retry_support_run_once() {
    let harness = Harness::primary();
    harness
        .mock
        .reply(&address("a:27017"), "ping", MockReply::CloseConnection);

    let mut ping = RunCommand::new("admin".into(), doc! { "ping": 1 }, None).unwrap();
    let error = harness
        .executor
        .execute_read(
            &mut ping,
            harness.read_binding(&harness.session(true)),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(error.is_network_error());
    assert_eq!(harness.mock.received_named("ping").len(), 1);
}

#[tokio::test]
async fn cancelled_operation_is_not_retried() {
    let harness = Harness::primary();
    harness
        .mock
        .reply(&address("a:27017"), "count", MockReply::Hang);

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let error = harness
        .executor
        .execute_read(
            &mut Count::new(ns(), doc! {}, None),
            harness.read_binding(&harness.session(true)),
            &cancel,
        )
        .await
        .unwrap_err();

    assert!(matches!(*error.kind, ErrorKind::Cancelled));
    assert_eq!(harness.mock.received_named("count").len(), 1);
}

#[tokio::test]
async fn statements_in_a_transaction_are_not_retried() {
    let harness = Harness::primary();
    harness
        .mock
        .reply(&address("a:27017"), "insert", MockReply::CloseConnection);

    let session = harness.session(false);
    session.start_transaction(None).unwrap();
    let error = harness
        .executor
        .execute_write(
            &mut insert(),
            harness.write_binding(&session),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(error.contains_label(TRANSIENT_TRANSACTION_ERROR));
    assert!(!error.contains_label(RETRYABLE_WRITE_ERROR));
    let sent = harness.mock.received_named("insert");
    assert_eq!(sent.len(), 1);
    // The transaction's own number, not a retryable-write number.
    assert_eq!(sent[0].body.get("txnNumber"), Some(&Bson::Int64(1)));
    assert_eq!(sent[0].body.get_bool("startTransaction").ok(), Some(true));
}

#[tokio::test]
async fn standalone_writes_carry_no_transaction_number() {
    let harness = Harness::new(&[("a:27017", ServerType::Standalone)]);
    harness
        .mock
        .reply(&address("a:27017"), "insert", MockReply::CloseConnection);

    let error = harness
        .executor
        .execute_write(
            &mut insert(),
            harness.write_binding(&harness.session(true)),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(error.is_network_error());
    let sent = harness.mock.received_named("insert");
    assert_eq!(sent.len(), 1);
    assert!(!sent[0].body.contains_key("txnNumber"));
}

#[tokio::test]
async fn write_concern_errors_are_never_retried() {
    let harness = Harness::primary();
    harness.mock.reply(
        &address("a:27017"),
        "insert",
        doc! {
            "ok": 1,
            "n": 1,
            "writeConcernError": {
                "code": 91,
                "codeName": "ShutdownInProgress",
                "errmsg": "Replication is being shut down",
            },
            "errorLabels": [RETRYABLE_WRITE_ERROR],
        },
    );
    harness
        .mock
        .reply(&address("a:27017"), "insert", doc! { "ok": 1, "n": 1 });

    let error = harness
        .executor
        .execute_write(
            &mut insert(),
            harness.write_binding(&harness.session(true)),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    // The write was applied; only its durability is in doubt.
    assert!(error.is_write_concern_error());
    assert!(error.contains_label(RETRYABLE_WRITE_ERROR));
    assert_eq!(error.code(), Some(91));
    assert_eq!(harness.mock.received_named("insert").len(), 1);
}

#[tokio::test]
async fn retry_on_server_without_retryable_writes_reports_first_error() {
    let harness = Harness::primary();
    let mut without_sessions = hello_reply(ServerType::RsPrimary);
    without_sessions.remove("logicalSessionTimeoutMinutes");
    // The first connection handshakes normally; the one opened for the retry does not.
    harness.mock.reply(
        &address("a:27017"),
        "hello",
        hello_reply(ServerType::RsPrimary),
    );
    harness
        .mock
        .reply(&address("a:27017"), "hello", without_sessions);
    harness
        .mock
        .reply(&address("a:27017"), "insert", MockReply::CloseConnection);
    harness
        .mock
        .reply(&address("a:27017"), "insert", doc! { "ok": 1, "n": 1 });

    let error = harness
        .executor
        .execute_write(
            &mut insert(),
            harness.write_binding(&harness.session(true)),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(error.is_network_error());
    assert!(error.contains_label(RETRYABLE_WRITE_ERROR));
    let sent = harness.mock.received_named("insert");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].body.get("txnNumber"), Some(&Bson::Int64(1)));
    assert_eq!(harness.mock.connections_opened(), 2);
}
