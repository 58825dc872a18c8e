mod event_buffer;
mod mock_server;

use std::{sync::Arc, time::Duration};

pub(crate) use self::{
    event_buffer::EventBuffer,
    mock_server::{MockReply, MockServer, ReceivedCommand},
};
use crate::{
    bson::{doc, Document},
    options::{ClientOptions, ServerAddress},
    sdam::{ServerDescription, ServerType},
    Client,
};

pub(crate) fn address(host: &str) -> ServerAddress {
    ServerAddress::parse(host).unwrap()
}

/// The description the external monitor would report for a healthy server of `server_type`.
pub(crate) fn server_description(host: &str, server_type: ServerType) -> ServerDescription {
    ServerDescription::builder()
        .address(address(host))
        .server_type(server_type)
        .max_wire_version(21)
        .logical_session_timeout(Duration::from_secs(30 * 60))
        .round_trip_time(Duration::from_millis(1))
        .build()
}

/// Options for a client against `hosts` with a short server selection timeout.
pub(crate) fn client_options(hosts: &[&str]) -> ClientOptions {
    ClientOptions::builder()
        .hosts(hosts.iter().map(|host| address(host)).collect::<Vec<_>>())
        .server_selection_timeout(Duration::from_millis(200))
        .build()
}

/// A client connected to `mock`, with every server in `servers` already reported by the monitor.
pub(crate) fn mock_client(
    mock: &MockServer,
    options: ClientOptions,
    servers: &[(&str, ServerType)],
) -> Client {
    let client = Client::new(options, Arc::new(mock.clone())).unwrap();
    for (host, server_type) in servers {
        client.update_server(server_description(host, *server_type));
        mock.set_hello(&address(host), hello_reply(*server_type));
    }
    client
}

/// The handshake reply a server of `server_type` sends.
pub(crate) fn hello_reply(server_type: ServerType) -> Document {
    let mut reply = doc! {
        "ok": 1,
        "helloOk": true,
        "maxWireVersion": 21,
        "minWireVersion": 0,
        "logicalSessionTimeoutMinutes": 30,
        "maxBsonObjectSize": 16 * 1024 * 1024,
        "maxMessageSizeBytes": 48_000_000,
        "maxWriteBatchSize": 100_000,
    };
    match server_type {
        ServerType::Standalone => {
            reply.insert("isWritablePrimary", true);
        }
        ServerType::Mongos => {
            reply.insert("isWritablePrimary", true);
            reply.insert("msg", "isdbgrid");
        }
        ServerType::RsSecondary => {
            reply.insert("isWritablePrimary", false);
            reply.insert("secondary", true);
            reply.insert("setName", "rs");
        }
        ServerType::LoadBalancer => {
            reply.insert("isWritablePrimary", true);
            reply.insert("msg", "isdbgrid");
            reply.insert("serviceId", crate::bson::oid::ObjectId::new());
        }
        _ => {
            reply.insert("isWritablePrimary", true);
            reply.insert("setName", "rs");
        }
    }
    reply
}

/// A successful reply carrying the given cluster time and operation time.
pub(crate) fn reply_with_clock(time: u32, increment: u32) -> Document {
    let timestamp = crate::bson::Timestamp { time, increment };
    doc! {
        "ok": 1,
        "$clusterTime": { "clusterTime": timestamp, "signature": { "keyId": 1_i64 } },
        "operationTime": timestamp,
    }
}

/// A failed reply with the given server error code.
pub(crate) fn command_error_reply(code: i32, code_name: &str) -> Document {
    doc! {
        "ok": 0,
        "code": code,
        "codeName": code_name,
        "errmsg": format!("{code_name} (injected)"),
    }
}
