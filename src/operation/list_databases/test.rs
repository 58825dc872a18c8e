use pretty_assertions::assert_eq;

use crate::{
    bson::doc,
    cmap::StreamDescription,
    operation::{ListDatabases, Operation},
    options::ListDatabasesOptions,
};

#[test]
fn build_with_filter_and_name_only() {
    let mut op = ListDatabases::new(Some(doc! { "name": "test" }), Some(true), None);
    let command = op.build(&StreamDescription::new_testing()).unwrap();

    assert_eq!(command.target_db, "admin");
    assert_eq!(
        command.body,
        doc! {
            "listDatabases": 1,
            "filter": { "name": "test" },
            "nameOnly": true,
        }
    );
    // Document equality ignores key order.
    assert_eq!(
        command.body.keys().collect::<Vec<_>>(),
        ["listDatabases", "filter", "nameOnly"]
    );
}

#[test]
fn build_without_arguments() {
    let mut op = ListDatabases::new(None, None, None);
    let command = op.build(&StreamDescription::new_testing()).unwrap();

    assert_eq!(command.body, doc! { "listDatabases": 1 });
    assert_eq!(command.name, "listDatabases");
}

#[test]
fn options_follow_arguments() {
    let options = ListDatabasesOptions::builder()
        .authorized_databases(true)
        .build();
    let mut op = ListDatabases::new(None, Some(false), Some(options));
    let command = op.build(&StreamDescription::new_testing()).unwrap();

    assert_eq!(
        command.body.keys().collect::<Vec<_>>(),
        ["listDatabases", "nameOnly", "authorizedDatabases"]
    );
    assert!(command.body.get_bool("authorizedDatabases").unwrap());
}
