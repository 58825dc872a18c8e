pub(crate) mod command;
mod stream_description;
pub(crate) mod wire;

use std::fmt::Debug;

use futures_core::future::BoxFuture;
use tokio::{
    io::{AsyncRead, AsyncWrite, BufStream},
    net::TcpStream,
};

use self::wire::{Message, WireMessage};
use crate::{
    bson::{Document, RawDocumentBuf},
    error::{CommandErrorBody, ConnectionPhase, Error, ErrorKind, Result},
    options::{ServerAddress, ServerApi},
    trace::CONNECTION_TRACING_EVENT_TARGET,
};
pub(crate) use command::{Command, RawCommandResponse};
pub(crate) use stream_description::StreamDescription;

/// A bidirectional byte stream to a server.
pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncReadWrite for T {}

/// The stream type produced by a [`StreamConnector`].
pub type AsyncStream = Box<dyn AsyncReadWrite>;

/// Opens the byte streams that connections run over.
pub trait StreamConnector: Send + Sync + Debug {
    /// Open a stream to the server at `address`.
    fn connect<'a>(&'a self, address: &'a ServerAddress) -> BoxFuture<'a, Result<AsyncStream>>;
}

/// Connects over plain TCP.
#[derive(Clone, Copy, Debug, Default)]
#[non_exhaustive]
pub struct TcpConnector;

impl StreamConnector for TcpConnector {
    fn connect<'a>(&'a self, address: &'a ServerAddress) -> BoxFuture<'a, Result<AsyncStream>> {
        Box::pin(async move {
            let stream = TcpStream::connect((address.host(), address.port())).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as AsyncStream)
        })
    }
}

/// User-facing information about a connection to the database.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct ConnectionInfo {
    /// A client-generated identifier that uniquely identifies the connection within its pool.
    pub id: u32,

    /// A server-generated identifier that uniquely identifies the connection. Available when the
    /// server reports it during the handshake.
    pub server_id: Option<i64>,

    /// The address that the connection is connected to.
    pub address: ServerAddress,
}

/// A wrapper around a stream that contains all the information needed to maintain a connection.
pub struct Connection {
    pub(crate) id: u32,
    pub(crate) server_id: Option<i64>,
    pub(crate) address: ServerAddress,
    pub(crate) generation: u32,

    /// The cached StreamDescription from the connection's handshake.
    pub(crate) stream_description: Option<StreamDescription>,

    /// Declared on commands run through [`Connection::run_command`].
    pub(crate) server_api: Option<ServerApi>,

    /// Set while a message is being written or its reply read. A connection dropped in that
    /// state has an unknown amount of data left on the wire and cannot be reused.
    in_flight: bool,

    /// The first error seen while exchanging messages. Once set, the connection is unusable.
    error: Option<Error>,

    stream: BufStream<AsyncStream>,
}

impl Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("generation", &self.generation)
            .field("broken", &self.is_broken())
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(id: u32, address: ServerAddress, generation: u32, stream: AsyncStream) -> Self {
        Self {
            id,
            server_id: None,
            address,
            generation,
            stream_description: None,
            server_api: None,
            in_flight: false,
            error: None,
            stream: BufStream::new(stream),
        }
    }

    /// Information about this connection for events and error mapping.
    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            server_id: self.server_id,
            address: self.address.clone(),
        }
    }

    /// The address of the server this connection is connected to.
    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// The highest wire version the server reported during the handshake.
    pub fn max_wire_version(&self) -> Option<i32> {
        self.stream_description
            .as_ref()
            .and_then(|description| description.max_wire_version)
    }

    /// Get the StreamDescription for this connection.
    pub(crate) fn stream_description(&self) -> Result<&StreamDescription> {
        self.stream_description.as_ref().ok_or_else(|| {
            ErrorKind::Internal {
                message: "Stream checked out but not handshaked".to_string(),
            }
            .into()
        })
    }

    /// Whether this connection saw a network error or was abandoned mid-exchange.
    pub(crate) fn is_broken(&self) -> bool {
        self.error.is_some() || self.in_flight
    }

    pub(crate) fn is_stale(&self, current_generation: u32) -> bool {
        self.generation != current_generation
    }

    /// Writes `message` and reads the single reply document. Messages sent with `moreToCome`
    /// get a synthesized `{ ok: 1 }` reply.
    pub(crate) async fn send_message(&mut self, message: Message) -> Result<RawCommandResponse> {
        if let Some(ref error) = self.error {
            return Err(Error::internal(format!(
                "Connection {} to {} is no longer usable after a failed exchange",
                self.id, self.address
            ))
            .with_source(error.clone()));
        }

        self.in_flight = true;
        let result = self.exchange(message).await;
        self.in_flight = false;

        // Any failure mid-exchange leaves the stream at an unknown position.
        if let Err(ref error) = result {
            tracing::debug!(
                target: CONNECTION_TRACING_EVENT_TARGET,
                driverConnectionId = self.id,
                serverHost = self.address.host(),
                serverPort = self.address.port(),
                error = %error,
                "Connection broken"
            );
            self.error = Some(error.clone());
        }
        result
    }

    async fn exchange(&mut self, message: Message) -> Result<RawCommandResponse> {
        let max_message_size = self
            .stream_description
            .as_ref()
            .map(|description| description.max_message_size_bytes);
        let more_to_come = message.is_more_to_come();

        let request_id = message
            .write_to(&mut self.stream)
            .await
            .map_err(|e| e.with_phase(ConnectionPhase::Send))?;

        if more_to_come {
            return Ok(RawCommandResponse::new_raw(
                self.address.clone(),
                crate::bson::rawdoc! { "ok": 1 },
            ));
        }

        let reply = WireMessage::read_from(&mut self.stream, max_message_size)
            .await
            .map_err(|e| e.with_phase(ConnectionPhase::Receive))?;

        if reply.response_to() != request_id {
            // The stream is out of sync; nothing else read from it can be trusted.
            let error = Error::network(
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!(
                        "expected a reply to request {request_id}, got a reply to {}",
                        reply.response_to()
                    ),
                ),
                ConnectionPhase::Receive,
            );
            return Err(error);
        }

        match reply {
            WireMessage::Message(message) => Ok(RawCommandResponse::new_raw(
                self.address.clone(),
                message.document_payload,
            )),
            WireMessage::Reply(reply) => {
                let query_failure = reply.is_query_failure();
                let mut documents = reply.documents;
                if documents.len() != 1 {
                    return Err(Error::invalid_response(format!(
                        "expected exactly one reply document, got {}",
                        documents.len()
                    )));
                }
                let document = documents.pop().unwrap_or_else(RawDocumentBuf::new);
                let mut response = RawCommandResponse::new_raw(self.address.clone(), document);
                response.query_failure = query_failure;
                Ok(response)
            }
        }
    }

    /// Sends a command without any session or cluster time handling.
    pub(crate) async fn send_raw_command(&mut self, command: Command) -> Result<RawCommandResponse> {
        let message = command.into_message()?;
        self.send_message(message).await
    }

    /// Runs `body` against `db` on this connection and returns the reply, failing if the server
    /// reports an error. Intended for authentication conversations, which run before the
    /// connection is handed to the pool.
    pub async fn run_command(&mut self, db: &str, body: Document) -> Result<Document> {
        let name = body
            .keys()
            .next()
            .cloned()
            .ok_or_else(|| Error::invalid_argument("command body must not be empty"))?;
        let mut command = Command::new(name, db, body);
        if let Some(server_api) = self.server_api.as_ref() {
            command.set_server_api(server_api);
        }
        let response = self.send_raw_command(command).await?;
        if !response.is_success() {
            let error = response
                .body::<CommandErrorBody>()
                .map(Error::from)
                .unwrap_or_else(|e| e);
            return Err(error.with_wire_version(self.max_wire_version()));
        }
        response.body()
    }
}
