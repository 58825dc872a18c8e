use pretty_assertions::assert_eq;

use super::Insert;
use crate::{
    bson::{doc, Bson},
    cmap::StreamDescription,
    concern::WriteConcern,
    error::ErrorKind,
    operation::{Operation, WriteRequest},
    options::InsertOptions,
    Namespace,
};

fn documents(command: &crate::cmap::Command) -> Vec<crate::bson::Document> {
    command.document_sequences[0]
        .documents
        .iter()
        .map(|document| document.to_document().unwrap())
        .collect()
}

#[test]
fn build() {
    let options = InsertOptions::builder()
        .ordered(false)
        .write_concern(WriteConcern::majority())
        .build();
    let mut op = Insert::new(
        Namespace::new("db", "coll"),
        vec![doc! { "_id": 1, "x": 1 }, doc! { "_id": 2, "x": 2 }],
        Some(options),
    );
    let command = op.build(&StreamDescription::new_testing()).unwrap();

    assert_eq!(command.name, "insert");
    assert_eq!(command.target_db, "db");
    assert_eq!(command.body, doc! { "insert": "coll", "ordered": false });
    assert_eq!(command.document_sequences[0].identifier, "documents");
    assert_eq!(
        documents(&command),
        vec![doc! { "_id": 1, "x": 1 }, doc! { "_id": 2, "x": 2 }]
    );
    assert_eq!(command.write_concern, Some(WriteConcern::majority()));
}

#[test]
fn ordered_by_default() {
    let mut op = Insert::new(Namespace::new("db", "coll"), vec![doc! { "_id": 1 }], None);
    let command = op.build(&StreamDescription::new_testing()).unwrap();

    assert_eq!(command.body, doc! { "insert": "coll", "ordered": true });
    assert_eq!(command.write_concern, None);
}

#[test]
fn generated_ids_come_first_and_survive_rebuilds() {
    let mut op = Insert::new(Namespace::new("db", "coll"), vec![doc! { "x": 1 }], None);

    let first = documents(&op.build(&StreamDescription::new_testing()).unwrap());
    let second = documents(&op.build(&StreamDescription::new_testing()).unwrap());

    assert_eq!(first, second);
    assert_eq!(first[0].keys().collect::<Vec<_>>(), vec!["_id", "x"]);
    assert!(matches!(first[0].get("_id"), Some(Bson::ObjectId(_))));
    assert!(matches!(op.write_requests(), [WriteRequest::Insert(_)]));
}

#[test]
fn empty_batch_is_rejected() {
    let mut op = Insert::new(Namespace::new("db", "coll"), Vec::new(), None);
    let error = op.build(&StreamDescription::new_testing()).unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::InvalidArgument { .. }));
}

#[test]
fn oversized_batch_is_rejected() {
    let mut description = StreamDescription::new_testing();
    description.max_write_batch_size = 1;
    let mut op = Insert::new(
        Namespace::new("db", "coll"),
        vec![doc! { "_id": 1 }, doc! { "_id": 2 }],
        None,
    );
    assert!(op.build(&description).is_err());
}
