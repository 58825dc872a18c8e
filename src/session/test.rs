use std::sync::Arc;

use pretty_assertions::assert_eq;

use super::{ClusterTime, CoreSession, ServerSessionPool, TransactionState};
use crate::{
    bson::{doc, Timestamp},
    concern::{Acknowledgment, WriteConcern},
    error::ErrorKind,
    options::{SessionOptions, TransactionOptions},
};

fn cluster_time(time: u32, increment: u32) -> ClusterTime {
    ClusterTime {
        cluster_time: Timestamp { time, increment },
        signature: doc! { "keyId": 1 },
    }
}

fn explicit_session(pool: &Arc<ServerSessionPool>) -> CoreSession {
    CoreSession::new(pool.clone(), None, false)
}

#[test]
fn cluster_time_is_max_regardless_of_order() {
    let pool = Arc::new(ServerSessionPool::new());
    let earlier = cluster_time(10, 1);
    let later = cluster_time(10, 2);

    let session = explicit_session(&pool);
    session.advance_cluster_time(&earlier);
    session.advance_cluster_time(&later);
    assert_eq!(session.cluster_time(), Some(later.clone()));

    let session = explicit_session(&pool);
    session.advance_cluster_time(&later);
    session.advance_cluster_time(&earlier);
    assert_eq!(session.cluster_time(), Some(later));
}

#[test]
fn equal_cluster_time_keeps_original_signature() {
    let pool = Arc::new(ServerSessionPool::new());
    let session = explicit_session(&pool);
    session.advance_cluster_time(&cluster_time(5, 5));

    let mut same_time = cluster_time(5, 5);
    same_time.signature = doc! { "keyId": 2 };
    session.advance_cluster_time(&same_time);

    assert_eq!(
        session.cluster_time().map(|ct| ct.signature),
        Some(doc! { "keyId": 1 })
    );
}

#[tokio::test]
async fn out_of_order_operation_times_keep_latest() {
    let pool = Arc::new(ServerSessionPool::new());
    let session = explicit_session(&pool);
    let first = session.fork();
    let second = session.fork();

    // The operation that observed (100, 2) completes before the one that observed (100, 1).
    let a = tokio::spawn(async move {
        second.advance_operation_time(Timestamp {
            time: 100,
            increment: 2,
        });
    });
    a.await.unwrap();
    let b = tokio::spawn(async move {
        first.advance_operation_time(Timestamp {
            time: 100,
            increment: 1,
        });
    });
    b.await.unwrap();

    assert_eq!(
        session.operation_time(),
        Some(Timestamp {
            time: 100,
            increment: 2
        })
    );
    assert_eq!(session.reference_count(), 1);
}

#[test]
fn fork_and_release_restore_reference_count() {
    let pool = Arc::new(ServerSessionPool::new());
    let session = explicit_session(&pool);
    let before = session.reference_count();

    let forks: Vec<_> = (0..4).map(|_| session.fork()).collect();
    assert_eq!(session.reference_count(), before + 4);
    drop(forks);

    assert_eq!(session.reference_count(), before);
}

#[test]
fn id_is_assigned_lazily_and_stable() {
    let pool = Arc::new(ServerSessionPool::new());
    let session = explicit_session(&pool);
    assert!(session.id().is_none());

    let id = session.was_used().unwrap();
    assert_eq!(session.was_used().unwrap(), id);
    assert_eq!(session.id(), Some(id));
}

#[test]
fn last_release_returns_server_session_to_pool() {
    let pool = Arc::new(ServerSessionPool::new());
    let session = explicit_session(&pool);
    let id = session.was_used().unwrap();
    let fork = session.fork();

    drop(session);
    assert_eq!(pool.len(), 0);

    drop(fork);
    assert!(pool.contains(&id));

    // The next session reuses it.
    let session = explicit_session(&pool);
    assert_eq!(session.was_used().unwrap(), id);
}

#[test]
fn dirty_server_session_is_discarded() {
    let pool = Arc::new(ServerSessionPool::new());
    let session = explicit_session(&pool);
    session.was_used().unwrap();
    session.mark_dirty();
    assert!(session.is_dirty());

    drop(session);
    assert_eq!(pool.len(), 0);
}

#[test]
fn use_after_end_is_invalid_usage() {
    let pool = Arc::new(ServerSessionPool::new());
    let session = explicit_session(&pool);
    let fork = session.fork();
    session.was_used().unwrap();
    session.end();
    assert_eq!(pool.len(), 1);

    let error = fork.was_used().unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::InvalidUsage { .. }));
    assert!(fork.next_transaction_number().is_err());
    assert!(fork.start_transaction(None).is_err());
}

#[test]
fn transaction_numbers_increase() {
    let pool = Arc::new(ServerSessionPool::new());
    let session = explicit_session(&pool);
    assert_eq!(session.next_transaction_number().unwrap(), 1);
    assert_eq!(session.next_transaction_number().unwrap(), 2);
    assert_eq!(session.txn_number(), 2);

    session.start_transaction(None).unwrap();
    assert_eq!(session.txn_number(), 3);
}

#[test]
fn start_transaction_rejects_nested_transaction() {
    let pool = Arc::new(ServerSessionPool::new());
    let session = explicit_session(&pool);
    session.start_transaction(None).unwrap();
    assert!(session.in_transaction());

    let error = session.start_transaction(None).unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::Transaction { .. }));

    session.set_transaction_state(TransactionState::Committed {
        data_committed: true,
    });
    assert!(!session.in_transaction());
    session.start_transaction(None).unwrap();
}

#[test]
fn start_transaction_rejects_unacknowledged_write_concern() {
    let pool = Arc::new(ServerSessionPool::new());
    let session = explicit_session(&pool);
    let options = TransactionOptions::builder()
        .write_concern(WriteConcern::builder().w(Acknowledgment::Nodes(0)).build())
        .build();

    let error = session.start_transaction(options).unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::Transaction { .. }));
    assert_eq!(session.transaction_state(), TransactionState::None);
}

#[test]
fn default_transaction_options_fill_in_missing_fields() {
    let pool = Arc::new(ServerSessionPool::new());
    let defaults = TransactionOptions::builder()
        .write_concern(WriteConcern::majority())
        .build();
    let options = SessionOptions::builder()
        .default_transaction_options(defaults)
        .build();
    let session = CoreSession::new(pool, Some(options), false);

    session.start_transaction(None).unwrap();
    let options = session.transaction_options().unwrap();
    assert_eq!(options.write_concern, Some(WriteConcern::majority()));
}

#[test]
fn causal_consistency_defaults() {
    let pool = Arc::new(ServerSessionPool::new());
    assert!(explicit_session(&pool).causal_consistency());
    assert!(!CoreSession::new(pool.clone(), None, true).causal_consistency());

    let options = SessionOptions::builder().causal_consistency(false).build();
    assert!(!CoreSession::new(pool, Some(options), false).causal_consistency());
}
