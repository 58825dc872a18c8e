use pretty_assertions::assert_eq;

use super::GetMore;
use crate::{
    bson::doc,
    cmap::StreamDescription,
    operation::{Operation, Retryability},
    Namespace,
};

#[test]
fn build() {
    let mut op = GetMore::new(
        Namespace::new("db", "coll"),
        123,
        Some(5),
        Some(std::time::Duration::from_millis(300)),
    );
    let command = op.build(&StreamDescription::new_testing()).unwrap();

    assert_eq!(
        command.body,
        doc! {
            "getMore": 123_i64,
            "collection": "coll",
            "batchSize": 5,
            "maxTimeMS": 300,
        }
    );
    assert_eq!(op.retryability(), Retryability::None);
}

#[test]
fn zero_batch_size_is_omitted() {
    let mut op = GetMore::new(Namespace::new("db", "coll"), 1, Some(0), None);
    let command = op.build(&StreamDescription::new_testing()).unwrap();
    assert!(!command.body.contains_key("batchSize"));
}
