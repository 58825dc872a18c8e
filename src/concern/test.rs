use std::time::Duration;

use pretty_assertions::assert_eq;

use crate::{
    bson::{doc, Timestamp},
    concern::{Acknowledgment, ReadConcern, ReadConcernInternal, WriteConcern},
    error::ErrorKind,
};

#[test]
fn write_concern_is_acknowledged() {
    let w_1 = WriteConcern::builder()
        .w(Acknowledgment::Nodes(1))
        .journal(false)
        .build();
    assert!(w_1.is_acknowledged());

    let w_majority = WriteConcern::builder()
        .w(Acknowledgment::Majority)
        .journal(false)
        .build();
    assert!(w_majority.is_acknowledged());

    let w_0 = WriteConcern::builder()
        .w(Acknowledgment::Nodes(0))
        .journal(false)
        .build();
    assert!(!w_0.is_acknowledged());

    let w_0 = WriteConcern::builder().w(Acknowledgment::Nodes(0)).build();
    assert!(!w_0.is_acknowledged());

    let empty = WriteConcern::builder().build();
    assert!(empty.is_acknowledged());
    assert!(empty.is_empty());

    let w_0_journal = WriteConcern::builder()
        .w(Acknowledgment::Nodes(0))
        .journal(true)
        .build();
    assert!(w_0_journal.is_acknowledged());
    assert!(matches!(
        *w_0_journal.validate().unwrap_err().kind,
        ErrorKind::InvalidArgument { .. }
    ));
}

#[test]
fn write_concern_serialize() {
    let wc = WriteConcern::builder()
        .w(Acknowledgment::Majority)
        .w_timeout(Duration::from_millis(100))
        .journal(true)
        .build();
    assert_eq!(
        crate::bson::to_document(&wc).unwrap(),
        doc! { "w": "majority", "wtimeout": 100, "j": true }
    );

    let wc = WriteConcern::nodes(0);
    assert_eq!(crate::bson::to_document(&wc).unwrap(), doc! { "w": 0 });
}

#[test]
fn write_concern_deserialize() {
    let wc: WriteConcern =
        crate::bson::from_document(doc! { "w": "tagged", "wtimeoutMS": 25 }).unwrap();
    assert_eq!(wc.w, Some(Acknowledgment::Custom("tagged".to_string())));
    assert_eq!(wc.w_timeout, Some(Duration::from_millis(25)));
}

#[test]
fn read_concern_with_after_cluster_time() {
    let mut internal: ReadConcernInternal = ReadConcern::majority().into();
    internal.after_cluster_time = Some(Timestamp {
        time: 100,
        increment: 2,
    });
    assert_eq!(
        crate::bson::to_document(&internal).unwrap(),
        doc! {
            "level": "majority",
            "afterClusterTime": Timestamp { time: 100, increment: 2 },
        }
    );
}
