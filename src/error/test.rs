use pretty_assertions::assert_eq;

use crate::{
    bson::doc,
    cmap::conn::ConnectionInfo,
    error::{
        ConnectionPhase,
        DefaultErrorMapper,
        Error,
        ErrorClass,
        ErrorKind,
        ErrorMapper,
        RETRYABLE_WRITE_ERROR,
        TRANSIENT_TRANSACTION_ERROR,
    },
};

fn command_error(code: i32) -> Error {
    ErrorKind::Command(crate::error::CommandError::new(code, "Err", "failed")).into()
}

#[test]
fn network_errors_classify_by_phase() {
    let error = Error::network(std::io::ErrorKind::ConnectionReset.into(), ConnectionPhase::Send);
    assert_eq!(error.classify(), ErrorClass::Retryable(ConnectionPhase::Send));

    let error: Error = std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into();
    assert_eq!(
        error.classify(),
        ErrorClass::Retryable(ConnectionPhase::Receive)
    );

    let error = Error::pool_cleared_error("localhost:27017", 3);
    assert_eq!(
        error.classify(),
        ErrorClass::Retryable(ConnectionPhase::Checkout)
    );
}

#[test]
fn phase_is_only_set_once() {
    let error = Error::network(std::io::ErrorKind::BrokenPipe.into(), ConnectionPhase::Send)
        .with_phase(ConnectionPhase::Receive);
    assert_eq!(error.phase(), Some(ConnectionPhase::Send));

    let error = Error::invalid_argument("bad").with_phase(ConnectionPhase::Send);
    assert_eq!(error.phase(), None);
}

#[test]
fn server_errors_classify_by_code() {
    assert_eq!(command_error(10107).classify(), ErrorClass::ServerReported(10107));
    assert!(command_error(10107).is_notwritableprimary());
    assert!(command_error(11602).is_recovering());
    assert!(command_error(91).is_shutting_down());
    assert!(!command_error(2).is_state_change_error());
}

#[test]
fn fatal_kinds() {
    for error in [
        Error::cancelled(),
        Error::invalid_response("zero documents"),
        Error::authentication_error("SCRAM-SHA-256", "bad password"),
        ErrorKind::SessionsNotSupported.into(),
    ] {
        assert_eq!(error.classify(), ErrorClass::Fatal, "{error}");
        assert!(!error.is_read_retryable());
    }
}

#[test]
fn read_retryable_codes() {
    assert!(command_error(134).is_read_retryable());
    assert!(command_error(262).is_read_retryable());
    assert!(!command_error(11000).is_read_retryable());
}

#[test]
fn retryable_write_label_depends_on_wire_version() {
    // ReadConcernMajorityNotAvailableYet is read-only
    assert!(!command_error(134).should_add_retryable_write_label(8));
    assert!(command_error(189).should_add_retryable_write_label(8));
    // 4.4+ servers label errors themselves
    assert!(!command_error(189).should_add_retryable_write_label(9));

    let network: Error = std::io::Error::from(std::io::ErrorKind::ConnectionReset).into();
    assert!(network.should_add_retryable_write_label(21));
}

#[test]
fn labels_are_inherited_from_source() {
    let mut source = command_error(112);
    source.add_label(TRANSIENT_TRANSACTION_ERROR);
    let error = Error::internal("wrapper").with_source(source);
    assert!(error.contains_label(TRANSIENT_TRANSACTION_ERROR));
    assert!(!error.contains_label(RETRYABLE_WRITE_ERROR));
    assert_eq!(error.code(), Some(112));
}

#[test]
fn write_concern_error_labels_are_copied() {
    let wc_error: crate::error::WriteConcernError = crate::bson::from_document(doc! {
        "code": 64,
        "codeName": "WriteConcernFailed",
        "errmsg": "waiting for replication timed out",
        "errorLabels": [RETRYABLE_WRITE_ERROR],
    })
    .unwrap();
    let error: Error = ErrorKind::WriteConcern(wc_error).into();
    assert!(error.is_write_retryable());
    assert_eq!(error.classify(), ErrorClass::Fatal);
}

#[test]
fn default_mapper() {
    let connection = ConnectionInfo {
        id: 1,
        server_id: None,
        address: "localhost:27017".parse().unwrap(),
    };
    let mapped = DefaultErrorMapper
        .map(
            &connection,
            &doc! {
                "ok": 0,
                "errmsg": "not primary",
                "code": 10107,
                "codeName": "NotWritablePrimary",
                "errorLabels": [RETRYABLE_WRITE_ERROR],
            },
        )
        .unwrap();
    assert!(mapped.is_notwritableprimary());
    assert!(mapped.contains_label(RETRYABLE_WRITE_ERROR));

    // legacy query failure documents use `$err`
    let mapped = DefaultErrorMapper
        .map(&connection, &doc! { "$err": "bad query", "code": 2 })
        .unwrap();
    match *mapped.kind {
        ErrorKind::Command(ref e) => assert_eq!(e.message, "bad query"),
        ref other => panic!("expected command error, got {other:?}"),
    }

    assert!(DefaultErrorMapper
        .map(&connection, &doc! { "ok": 0, "errmsg": "no code" })
        .is_none());
}

#[test]
fn redaction() {
    let mut error = command_error(18);
    error.redact();
    match *error.kind {
        ErrorKind::Command(ref e) => {
            assert_eq!(e.code, 18);
            assert_eq!(e.message, "REDACTED");
        }
        ref other => panic!("expected command error, got {other:?}"),
    }
}
