use super::RunCommand;
use crate::{
    bson::doc,
    cmap::StreamDescription,
    operation::{Operation, Retryability},
};

#[test]
fn named_after_first_key() {
    let mut op = RunCommand::new("admin".into(), doc! { "ping": 1, "comment": "x" }, None)
        .unwrap();
    let command = op.build(&StreamDescription::new_testing()).unwrap();

    assert_eq!(command.name, "ping");
    assert_eq!(command.target_db, "admin");
    assert_eq!(op.name(), "ping");
    assert_eq!(op.retryability(), Retryability::None);
}

#[test]
fn empty_command_is_rejected() {
    assert!(RunCommand::new("admin".into(), doc! {}, None).is_err());
}
