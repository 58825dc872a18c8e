use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};

use futures_core::future::BoxFuture;
use tokio::io::DuplexStream;

use super::hello_reply;
use crate::{
    bson::{Document, RawDocumentBuf},
    cmap::{
        conn::wire::{Message, Reply, ResponseFlags, WireMessage},
        AsyncStream,
        StreamConnector,
    },
    error::Result,
    options::ServerAddress,
    sdam::ServerType,
};

/// How the in-memory server answers one command.
#[derive(Clone, Debug)]
pub(crate) enum MockReply {
    /// An OP_MSG reply carrying this document.
    Document(Document),
    /// A legacy OP_REPLY carrying these documents.
    Legacy {
        documents: Vec<Document>,
        query_failure: bool,
    },
    /// Close the connection instead of replying.
    CloseConnection,
    /// Never reply.
    Hang,
}

impl From<Document> for MockReply {
    fn from(document: Document) -> Self {
        Self::Document(document)
    }
}

/// A command as the server received it, with document sequences folded into the body.
#[derive(Clone, Debug)]
pub(crate) struct ReceivedCommand {
    pub(crate) address: ServerAddress,
    /// Which of the server's connections the command arrived on, counting from 1.
    pub(crate) connection: u32,
    pub(crate) name: String,
    pub(crate) body: Document,
}

/// An in-memory deployment speaking OP_MSG over `tokio::io::duplex` streams.
///
/// Replies are scripted per address and command name and consumed in order; unscripted commands
/// get `{ ok: 1 }`. Handshakes are answered from the per-address hello reply and are not
/// recorded.
#[derive(Clone, Debug, Default)]
pub(crate) struct MockServer {
    state: Arc<Mutex<State>>,
}

#[derive(Debug, Default)]
struct State {
    hello: HashMap<ServerAddress, Document>,
    replies: HashMap<(ServerAddress, String), VecDeque<MockReply>>,
    refused_connections: HashMap<ServerAddress, usize>,
    received: Vec<ReceivedCommand>,
    connections: u32,
}

impl MockServer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub(crate) fn set_hello(&self, address: &ServerAddress, reply: Document) {
        self.lock().hello.insert(address.clone(), reply);
    }

    /// Queues `reply` as the answer to the next `command_name` sent to `address`.
    pub(crate) fn reply(
        &self,
        address: &ServerAddress,
        command_name: &str,
        reply: impl Into<MockReply>,
    ) {
        self.lock()
            .replies
            .entry((address.clone(), command_name.to_string()))
            .or_default()
            .push_back(reply.into());
    }

    /// Makes the next `count` connection attempts to `address` fail.
    pub(crate) fn refuse_connections(&self, address: &ServerAddress, count: usize) {
        self.lock()
            .refused_connections
            .insert(address.clone(), count);
    }

    pub(crate) fn received(&self) -> Vec<ReceivedCommand> {
        self.lock().received.clone()
    }

    pub(crate) fn received_named(&self, name: &str) -> Vec<ReceivedCommand> {
        self.received()
            .into_iter()
            .filter(|command| command.name == name)
            .collect()
    }

    pub(crate) fn connections_opened(&self) -> u32 {
        self.lock().connections
    }

    fn next_reply(&self, address: &ServerAddress, name: &str) -> MockReply {
        self.lock()
            .replies
            .get_mut(&(address.clone(), name.to_string()))
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| MockReply::Document(crate::bson::doc! { "ok": 1 }))
    }

    /// Answers a handshake with the next scripted `hello` reply for `address`, falling back to
    /// the one set with [`MockServer::set_hello`].
    fn hello(&self, address: &ServerAddress, connection: u32) -> MockReply {
        let mut state = self.lock();
        let scripted = state
            .replies
            .get_mut(&(address.clone(), "hello".to_string()))
            .and_then(VecDeque::pop_front);
        let mut reply = match scripted {
            Some(MockReply::Document(document)) => document,
            Some(other) => return other,
            None => state
                .hello
                .get(address)
                .cloned()
                .unwrap_or_else(|| hello_reply(ServerType::RsPrimary)),
        };
        reply.insert("connectionId", connection as i64);
        MockReply::Document(reply)
    }

    async fn serve(self, address: ServerAddress, connection: u32, mut stream: DuplexStream) {
        loop {
            let message = match WireMessage::read_from(&mut stream, None).await {
                Ok(WireMessage::Message(message)) => message,
                _ => return,
            };
            let request_id = message.request_id.unwrap_or_default();
            let body = message.get_command_document();
            let name = body.keys().next().cloned().unwrap_or_default();

            let reply = if name == "hello" || name == "isMaster" {
                self.hello(&address, connection)
            } else {
                self.lock().received.push(ReceivedCommand {
                    address: address.clone(),
                    connection,
                    name: name.clone(),
                    body,
                });
                self.next_reply(&address, &name)
            };
            if message.is_more_to_come() {
                continue;
            }

            let written = match reply {
                MockReply::Document(document) => {
                    let raw = RawDocumentBuf::from_document(&document).unwrap();
                    Message::reply(raw, request_id)
                        .write_to(&mut stream)
                        .await
                        .map(|_| ())
                }
                MockReply::Legacy {
                    documents,
                    query_failure,
                } => {
                    let documents: Vec<_> = documents
                        .iter()
                        .map(|document| RawDocumentBuf::from_document(document).unwrap())
                        .collect();
                    let reply = Reply {
                        response_to: request_id,
                        response_flags: if query_failure {
                            ResponseFlags::QUERY_FAILURE
                        } else {
                            ResponseFlags::empty()
                        },
                        documents,
                    };
                    reply.write_to(&mut stream).await
                }
                MockReply::CloseConnection => return,
                MockReply::Hang => {
                    std::future::pending::<()>().await;
                    return;
                }
            };
            if written.is_err() {
                return;
            }
        }
    }
}

impl StreamConnector for MockServer {
    fn connect<'a>(&'a self, address: &'a ServerAddress) -> BoxFuture<'a, Result<AsyncStream>> {
        Box::pin(async move {
            let connection = {
                let mut state = self.lock();
                if let Some(remaining) = state.refused_connections.get_mut(address) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return Err(std::io::Error::from(std::io::ErrorKind::ConnectionRefused).into());
                    }
                }
                state.connections += 1;
                state.connections
            };
            let (client, server) = tokio::io::duplex(1 << 20);
            tokio::spawn(self.clone().serve(address.clone(), connection, server));
            Ok(Box::new(client) as AsyncStream)
        })
    }
}
