//! Contains the options that configure a [`Client`](crate::Client), its sessions and its
//! transactions.

mod crud;

use std::{
    fmt::{self, Display, Formatter},
    hash::{Hash, Hasher},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use derive_where::derive_where;
use serde::{de::Error as SerdeError, de::Unexpected, Deserialize, Deserializer, Serialize};
use serde_with::skip_serializing_none;
use typed_builder::TypedBuilder;

pub use self::crud::{
    CountOptions,
    DeleteOptions,
    FindOptions,
    InsertOptions,
    ListDatabasesOptions,
    UpdateOptions,
};
pub use crate::{
    concern::{Acknowledgment, ReadConcern, ReadConcernLevel, WriteConcern},
    operation::{DeleteRequest, UpdateRequest},
    selection_criteria::{ReadPreference, ReadPreferenceOptions, SelectionCriteria, TagSet},
};
use crate::{
    cmap::establish::Authenticator,
    error::{Error, ErrorKind, ErrorMapper, Result},
    event::{command::CommandEvent, EventHandler},
    serde_util,
};

pub(crate) const DEFAULT_PORT: u16 = 27017;
pub(crate) const DEFAULT_MAX_POOL_SIZE: u32 = 10;
pub(crate) const DEFAULT_SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_LOCAL_THRESHOLD: Duration = Duration::from_millis(15);

/// A hostname:port address pair.
#[derive(Clone, Debug, Eq)]
#[non_exhaustive]
pub enum ServerAddress {
    /// A TCP/IP host and port combination.
    Tcp {
        /// The hostname or IP address where the MongoDB server can be found.
        host: String,

        /// The TCP port that the MongoDB server is listening on.
        ///
        /// The default is 27017.
        port: Option<u16>,
    },
}

impl<'de> Deserialize<'de> for ServerAddress {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        Self::parse(s.as_str()).map_err(|e| D::Error::custom(format!("{e}")))
    }
}

impl Serialize for ServerAddress {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl Default for ServerAddress {
    fn default() -> Self {
        Self::Tcp {
            host: "localhost".into(),
            port: None,
        }
    }
}

impl PartialEq for ServerAddress {
    fn eq(&self, other: &Self) -> bool {
        self.host() == other.host() && self.port() == other.port()
    }
}

impl Hash for ServerAddress {
    fn hash<H>(&self, state: &mut H)
    where
        H: Hasher,
    {
        self.host().hash(state);
        self.port().hash(state);
    }
}

impl FromStr for ServerAddress {
    type Err = Error;

    fn from_str(address: &str) -> Result<Self> {
        Self::parse(address)
    }
}

impl ServerAddress {
    /// Parses an address string into a `ServerAddress`.
    pub fn parse(address: impl AsRef<str>) -> Result<Self> {
        let address = address.as_ref();
        let mut parts = address.split(':');

        let host = match parts.next() {
            Some(part) if !part.is_empty() => part,
            _ => {
                return Err(Error::invalid_argument(format!(
                    "invalid server address: \"{address}\"; hostname cannot be empty"
                )))
            }
        };

        let port = match parts.next() {
            Some(part) => {
                let port = u16::from_str(part).map_err(|_| {
                    Error::invalid_argument(format!(
                        "port must be valid 16-bit unsigned integer, instead got: {part}"
                    ))
                })?;

                if port == 0 || parts.next().is_some() {
                    return Err(Error::invalid_argument(format!(
                        "invalid server address: \"{address}\""
                    )));
                }

                Some(port)
            }
            None => None,
        };

        Ok(ServerAddress::Tcp {
            host: host.to_lowercase(),
            port,
        })
    }

    /// The hostname or IP address of this address.
    pub fn host(&self) -> &str {
        match self {
            Self::Tcp { host, .. } => host.as_str(),
        }
    }

    /// The port of this address, defaulting to 27017.
    pub fn port(&self) -> u16 {
        match self {
            Self::Tcp { port, .. } => port.unwrap_or(DEFAULT_PORT),
        }
    }
}

impl Display for ServerAddress {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        write!(fmt, "{}:{}", self.host(), self.port())
    }
}

/// Specifies the server API version to declare
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum ServerApiVersion {
    /// Use API version 1.
    V1,
}

impl FromStr for ServerApiVersion {
    type Err = Error;

    fn from_str(str: &str) -> Result<Self> {
        match str {
            "1" => Ok(Self::V1),
            _ => Err(ErrorKind::InvalidArgument {
                message: format!("invalid server api version string: {str}"),
            }
            .into()),
        }
    }
}

impl Display for ServerApiVersion {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::V1 => write!(f, "1"),
        }
    }
}

impl Serialize for ServerApiVersion {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ServerApiVersion {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        ServerApiVersion::from_str(&s)
            .map_err(|_| D::Error::invalid_value(Unexpected::Str(&s), &"a valid version number"))
    }
}

/// Options used to declare a versioned server API. These are attached to every command.
#[skip_serializing_none]
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ServerApi {
    /// The declared API version.
    #[serde(rename = "apiVersion")]
    pub version: ServerApiVersion,

    /// Whether the MongoDB server should reject all commands that are not part of the
    /// declared API version.
    #[builder(default, setter(strip_option))]
    #[serde(rename = "apiStrict")]
    pub strict: Option<bool>,

    /// Whether the MongoDB server should return command failures when functionality that is
    /// deprecated from the declared API version is used.
    #[builder(default, setter(strip_option))]
    #[serde(rename = "apiDeprecationErrors")]
    pub deprecation_errors: Option<bool>,
}

/// Contains the options that can be used to create a new [`Client`](crate::Client).
#[derive(Clone, Deserialize, TypedBuilder)]
#[derive_where(Debug)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ClientOptions {
    /// The initial list of seeds that the Client should connect to. The topology itself is
    /// reported by the external monitor through [`Client::update_server`](crate::Client).
    #[builder(default = vec![ServerAddress::default()])]
    #[serde(default = "default_hosts")]
    pub hosts: Vec<ServerAddress>,

    /// The application name that the Client will send to the server as part of the handshake.
    pub app_name: Option<String>,

    /// Whether or not the client should retry a read operation if the operation fails.
    ///
    /// The default value is true.
    pub retry_reads: Option<bool>,

    /// Whether or not the client should retry a write operation if the operation fails.
    ///
    /// The default value is true.
    pub retry_writes: Option<bool>,

    /// The declared API version for this client. Attached to every command.
    pub server_api: Option<ServerApi>,

    /// The maximum amount of connections that the Client should allow to be created in a
    /// connection pool for a given server.
    ///
    /// The default value is 10.
    pub max_pool_size: Option<u32>,

    /// The amount of time the Client should attempt to select a server for an operation before
    /// timing out.
    ///
    /// The default value is 30 seconds.
    #[serde(
        rename = "serverSelectionTimeoutMS",
        default,
        deserialize_with = "serde_util::deserialize_duration_option_from_u64_millis"
    )]
    pub server_selection_timeout: Option<Duration>,

    /// The connect timeout passed to each underlying TcpStream when attempting to connect to the
    /// server.
    #[serde(
        rename = "connectTimeoutMS",
        default,
        deserialize_with = "serde_util::deserialize_duration_option_from_u64_millis"
    )]
    pub connect_timeout: Option<Duration>,

    /// The amount of latency beyond the fastest suitable server that is tolerated when picking
    /// a server. The default value is 15 milliseconds.
    #[serde(
        rename = "localThresholdMS",
        default,
        deserialize_with = "serde_util::deserialize_duration_option_from_u64_millis"
    )]
    pub local_threshold: Option<Duration>,

    /// Whether the client is connecting to a load balancer. Connections are then pinned to
    /// cursors and transactions.
    pub load_balanced: Option<bool>,

    /// The default read preference for read operations.
    #[serde(rename = "readPreference", default)]
    pub selection_criteria: Option<SelectionCriteria>,

    /// The default read concern for operations that support it.
    pub read_concern: Option<ReadConcern>,

    /// The default write concern for write operations.
    pub write_concern: Option<WriteConcern>,

    /// The handler that should process all command-related events.
    #[derive_where(skip)]
    #[serde(skip)]
    pub command_event_handler: Option<EventHandler<CommandEvent>>,

    /// Translates server error documents into typed errors. Defaults to
    /// [`DefaultErrorMapper`](crate::error::DefaultErrorMapper).
    #[derive_where(skip)]
    #[serde(skip)]
    pub error_mapper: Option<Arc<dyn ErrorMapper>>,

    /// Invoked once on every new connection after the handshake.
    #[derive_where(skip)]
    #[serde(skip)]
    pub authenticator: Option<Arc<dyn Authenticator>>,

    /// The maximum length of documents emitted in tracing events.
    pub tracing_max_document_length_bytes: Option<usize>,
}

fn default_hosts() -> Vec<ServerAddress> {
    vec![ServerAddress::default()]
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ClientOptions {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(Error::invalid_argument("at least one host must be specified"));
        }
        if let Some(0) = self.max_pool_size {
            return Err(Error::invalid_argument("cannot specify maxPoolSize=0"));
        }
        if let Some(ref write_concern) = self.write_concern {
            write_concern.validate()?;
        }
        if self.load_balanced == Some(true) && self.hosts.len() > 1 {
            return Err(Error::invalid_argument(
                "cannot specify multiple seeds with loadBalanced=true",
            ));
        }
        Ok(())
    }

    pub(crate) fn retry_reads(&self) -> bool {
        self.retry_reads != Some(false)
    }

    pub(crate) fn retry_writes(&self) -> bool {
        self.retry_writes != Some(false)
    }

    pub(crate) fn is_load_balanced(&self) -> bool {
        self.load_balanced == Some(true)
    }
}

/// Contains the options that can be used to create a new
/// [`CoreSession`](crate::session::CoreSession).
#[derive(Clone, Debug, Default, Deserialize, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct SessionOptions {
    /// The default options to use for transactions started on this session.
    pub default_transaction_options: Option<TransactionOptions>,

    /// If true, all read operations performed using this session will be read from the same
    /// snapshot of data that the previous operations observed. Defaults to true for explicit
    /// sessions.
    pub causal_consistency: Option<bool>,
}

/// Contains the options that can be used for a transaction.
#[skip_serializing_none]
#[derive(Debug, Default, Serialize, Deserialize, TypedBuilder, Clone)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct TransactionOptions {
    /// The read concern to use for the transaction.
    #[serde(skip_serializing)]
    pub read_concern: Option<ReadConcern>,

    /// The write concern to use when committing or aborting a transaction.
    pub write_concern: Option<WriteConcern>,

    /// The selection criteria to use for all read operations in a transaction.
    #[serde(skip_serializing, rename = "readPreference", default)]
    pub selection_criteria: Option<SelectionCriteria>,

    /// The maximum amount of time to allow a single commitTransaction to run.
    #[serde(
        serialize_with = "serde_util::serialize_duration_option_as_int_millis",
        deserialize_with = "serde_util::deserialize_duration_option_from_u64_millis",
        rename(serialize = "maxTimeMS", deserialize = "maxCommitTimeMS"),
        default
    )]
    pub max_commit_time: Option<Duration>,
}
