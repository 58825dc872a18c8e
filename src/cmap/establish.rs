use std::{
    fmt::Debug,
    sync::{Arc, LazyLock},
    time::Duration,
};

use futures_core::future::BoxFuture;

use super::conn::{Connection, StreamConnector, StreamDescription};
use crate::{
    bson::{doc, Document},
    error::{ConnectionPhase, Error, ErrorKind, Result},
    hello::{hello_command, run_hello},
    options::{ClientOptions, ServerAddress, ServerApi},
    trace::CONNECTION_TRACING_EVENT_TARGET,
};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// The client metadata that can be statically determined. The application name, if any, is
/// added per client.
static BASE_CLIENT_METADATA: LazyLock<Document> = LazyLock::new(|| {
    doc! {
        "driver": {
            "name": "mongodb-core",
            "version": env!("CARGO_PKG_VERSION"),
        },
        "os": {
            "type": std::env::consts::OS,
            "architecture": std::env::consts::ARCH,
        },
    }
});

/// Authenticates new connections. Invoked exactly once per connection, after the handshake and
/// before the connection is used for any operation.
///
/// Any error returned here is surfaced as an [`ErrorKind::Authentication`] error, which is never
/// retried.
pub trait Authenticator: Send + Sync + Debug {
    /// The mechanism name used in error messages.
    fn mechanism(&self) -> &str {
        "custom"
    }

    /// Run the authentication conversation on `connection`.
    fn authenticate<'a>(&'a self, connection: &'a mut Connection) -> BoxFuture<'a, Result<()>>;
}

/// Contains the logic to establish a connection, including handshaking and authenticating.
#[derive(Clone, Debug)]
pub(crate) struct ConnectionEstablisher {
    connector: Arc<dyn StreamConnector>,
    authenticator: Option<Arc<dyn Authenticator>>,
    server_api: Option<ServerApi>,
    load_balanced: bool,
    client_metadata: Document,
    connect_timeout: Duration,
}

impl ConnectionEstablisher {
    pub(crate) fn new(options: &ClientOptions, connector: Arc<dyn StreamConnector>) -> Self {
        let mut client_metadata = BASE_CLIENT_METADATA.clone();
        if let Some(ref app_name) = options.app_name {
            client_metadata.insert("application", doc! { "name": app_name });
        }

        let connect_timeout = match options.connect_timeout {
            Some(d) if d.is_zero() => Duration::MAX,
            Some(d) => d,
            None => DEFAULT_CONNECT_TIMEOUT,
        };

        Self {
            connector,
            authenticator: options.authenticator.clone(),
            server_api: options.server_api.clone(),
            load_balanced: options.is_load_balanced(),
            client_metadata,
            connect_timeout,
        }
    }

    /// Opens a stream to `address`, handshakes it, and authenticates it.
    ///
    /// Network failures are tagged with [`ConnectionPhase::Checkout`] so the caller may retry
    /// them. A server that rejects the handshake, and any authentication failure, produce a
    /// fatal [`ErrorKind::Authentication`] error.
    pub(crate) async fn establish_connection(
        &self,
        id: u32,
        address: ServerAddress,
        generation: u32,
    ) -> Result<Connection> {
        let stream = match tokio::time::timeout(
            self.connect_timeout,
            self.connector.connect(&address),
        )
        .await
        {
            Ok(result) => result.map_err(|e| e.with_phase(ConnectionPhase::Checkout))?,
            Err(_) => {
                return Err(Error::network(
                    std::io::ErrorKind::TimedOut.into(),
                    ConnectionPhase::Checkout,
                ))
            }
        };

        let mut connection = Connection::new(id, address, generation, stream);
        connection.server_api = self.server_api.clone();

        let command = hello_command(
            self.server_api.as_ref(),
            self.load_balanced,
            self.client_metadata.clone(),
        );
        let hello_reply = run_hello(&mut connection, command)
            .await
            .map_err(|e| e.with_phase(ConnectionPhase::Checkout))?;

        if self.load_balanced && hello_reply.command_response.service_id.is_none() {
            return Err(ErrorKind::IncompatibleServer {
                message: "Driver attempted to initialize in load balancing mode, but the server \
                          does not support this mode"
                    .to_string(),
            }
            .into());
        }

        connection.server_id = hello_reply.command_response.connection_id;
        connection.stream_description = Some(StreamDescription::from_hello_reply(&hello_reply));

        if let Some(ref authenticator) = self.authenticator {
            if let Err(error) = authenticator.authenticate(&mut connection).await {
                tracing::debug!(
                    target: CONNECTION_TRACING_EVENT_TARGET,
                    driverConnectionId = id,
                    error = %error,
                    "Connection authentication failed"
                );
                return Err(if error.is_auth_error() {
                    error
                } else {
                    Error::authentication_error(authenticator.mechanism(), &error.to_string())
                });
            }
        }

        tracing::debug!(
            target: CONNECTION_TRACING_EVENT_TARGET,
            driverConnectionId = id,
            serverConnectionId = connection.server_id,
            serverHost = connection.address.host(),
            serverPort = connection.address.port(),
            "Connection ready"
        );

        Ok(connection)
    }
}
