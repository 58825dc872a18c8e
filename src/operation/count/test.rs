use std::time::Duration;

use pretty_assertions::assert_eq;

use super::Count;
use crate::{
    bson::doc,
    cmap::StreamDescription,
    error::{CommandError, Error, ErrorKind},
    operation::Operation,
    options::CountOptions,
    Namespace,
};

#[test]
fn build() {
    let options = CountOptions::builder()
        .skip(2u64)
        .max_time(Duration::from_millis(50))
        .build();
    let mut op = Count::new(
        Namespace::new("db", "coll"),
        doc! { "x": 1 },
        Some(options),
    );
    let command = op.build(&StreamDescription::new_testing()).unwrap();

    assert_eq!(
        command.body,
        doc! {
            "count": "coll",
            "query": { "x": 1 },
            "maxTimeMS": 50,
            "skip": 2_i64,
        }
    );
}

#[test]
fn missing_namespace_counts_zero() {
    let op = Count::new(Namespace::new("db", "coll"), doc! {}, None);
    let error = Error::from(ErrorKind::Command(CommandError::new(
        26,
        "NamespaceNotFound",
        "ns not found",
    )));
    assert_eq!(op.handle_error(error).unwrap(), 0);

    let error = Error::from(ErrorKind::Command(CommandError::new(
        2,
        "BadValue",
        "bad",
    )));
    assert!(op.handle_error(error).is_err());
}
