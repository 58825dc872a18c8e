use pretty_assertions::assert_eq;

use super::Delete;
use crate::{
    bson::doc,
    cmap::StreamDescription,
    concern::WriteConcern,
    operation::{DeleteRequest, Operation},
    options::DeleteOptions,
    Namespace,
};

#[test]
fn build() {
    let options = DeleteOptions::builder()
        .write_concern(WriteConcern::nodes(0))
        .build();
    let mut op = Delete::new(
        Namespace::new("db", "coll"),
        vec![
            DeleteRequest::builder().filter(doc! { "x": 1 }).build(),
            DeleteRequest::builder()
                .filter(doc! { "y": 1 })
                .multi(true)
                .build(),
        ],
        Some(options),
    );
    let command = op.build(&StreamDescription::new_testing()).unwrap();

    assert_eq!(command.body, doc! { "delete": "coll", "ordered": true });
    let statements: Vec<_> = command.document_sequences[0]
        .documents
        .iter()
        .map(|statement| statement.to_document().unwrap())
        .collect();
    assert_eq!(
        statements,
        vec![
            doc! { "q": { "x": 1 }, "limit": 1 },
            doc! { "q": { "y": 1 }, "limit": 0 },
        ]
    );
    assert!(!op.is_acknowledged());
}
