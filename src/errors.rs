//! Errors which can cross the pool boundary.
//!
//! Three families matter to the pool itself:
//! - transient connect failures, absorbed by the reconnect loop,
//! - critical connect failures, which terminate the pool
//!   (see [`ConnectionError::is_critical`]),
//! - broken-connection conditions, which remove a single connection.

use std::sync::Arc;

use thiserror::Error;

/// An error that occurred when opening a connection or setting it up
/// on the CQL level.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionError {
    /// Connecting did not finish within the configured time limit.
    #[error("Connect timeout elapsed")]
    ConnectTimeout,

    /// Input/output error - connection refused, network unreachable etc.
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    /// The connection broke while a setup request was in flight.
    #[error(transparent)]
    BrokenConnection(#[from] BrokenConnectionError),

    /// Failed to serialize a setup request.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// Received a response, but failed to parse its body.
    #[error("Failed to parse response body: {0}")]
    ResponseParse(#[from] TypeParseError),

    /// The server rejected a setup request with an ERROR response.
    #[error("Database returned an error: {0}, message: {1}")]
    Db(DbError, String),

    /// The server responded with something else than the setup request
    /// allows for.
    #[error("Received unexpected response to {0} request")]
    UnexpectedResponse(&'static str),

    /// The server demands authentication, but no credentials were configured.
    #[error("Server requires authentication with {0}, but no credentials were configured")]
    MissingCredentials(String),

    /// All stream ids were taken by outstanding requests.
    #[error("Unable to allocate stream id")]
    UnableToAllocStreamId,
}

impl From<std::io::Error> for ConnectionError {
    fn from(err: std::io::Error) -> Self {
        ConnectionError::Io(Arc::new(err))
    }
}

impl From<RequestError> for ConnectionError {
    fn from(err: RequestError) -> Self {
        match err {
            RequestError::Frame(e) => ConnectionError::Frame(e),
            RequestError::BrokenConnection(e) => ConnectionError::BrokenConnection(e),
            RequestError::UnableToAllocStreamId => ConnectionError::UnableToAllocStreamId,
        }
    }
}

impl ConnectionError {
    /// Whether reconnecting can be expected to help.
    ///
    /// Critical errors mean the server actively refuses this client as
    /// configured - the pool gives up and reports the error upwards instead
    /// of hammering the node with doomed attempts. Exactly three rejections
    /// qualify: protocol version, authentication, and keyspace validity.
    /// Everything else is considered transient.
    pub fn is_critical(&self) -> bool {
        match self {
            ConnectionError::Db(db_error, _) => matches!(
                db_error,
                DbError::ProtocolError | DbError::AuthenticationError | DbError::Invalid
            ),
            ConnectionError::MissingCredentials(_) => true,
            _ => false,
        }
    }
}

/// An error that invalidated a single established connection.
/// The connection can no longer be used and gets dropped from its pool.
#[derive(Error, Debug, Clone)]
#[error("Connection broken: {0}")]
pub struct BrokenConnectionError(Arc<BrokenConnectionErrorKind>);

impl BrokenConnectionError {
    pub fn kind(&self) -> &BrokenConnectionErrorKind {
        &self.0
    }
}

impl From<BrokenConnectionErrorKind> for BrokenConnectionError {
    fn from(kind: BrokenConnectionErrorKind) -> Self {
        BrokenConnectionError(Arc::new(kind))
    }
}

/// A reason why a connection broke.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BrokenConnectionErrorKind {
    /// Failed to read a frame from the socket.
    #[error("Failed to read a response frame: {0}")]
    FrameError(#[from] FrameError),

    /// Failed to write a frame to the socket.
    #[error("Failed to write a request frame: {0}")]
    WriteError(std::io::Error),

    /// The server did not answer a keepalive request in time.
    #[error("Timed out while waiting for response to keepalive request")]
    KeepaliveTimeout,

    /// A keepalive request failed.
    #[error("Failed to execute keepalive request: {0}")]
    KeepaliveRequestError(Box<RequestError>),

    /// Nothing arrived from the server for longer than the idle timeout;
    /// the connection is considered defunct.
    #[error("No server traffic within the idle timeout of {0:?}")]
    IdleTimeout(std::time::Duration),

    /// The driver closed the connection on purpose.
    #[error("Connection closed on request")]
    ClosedOnRequest,

    /// An internal channel of the connection was dropped.
    #[error("Internal channel closed")]
    ChannelClosed,

    /// The server sent a response with a stream id no request was using.
    #[error("Received response with unexpected stream id {0}")]
    UnexpectedStreamId(i16),
}

/// An error of a single request-response exchange on a connection.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum RequestError {
    /// The request could not be serialized.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// The connection broke before the response arrived.
    #[error(transparent)]
    BrokenConnection(#[from] BrokenConnectionError),

    /// All 2^15 stream ids of the connection are taken by outstanding
    /// requests.
    #[error("Unable to allocate stream id")]
    UnableToAllocStreamId,
}

/// An error at the frame level: either the framing on the wire is invalid,
/// or a frame could not be produced.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum FrameError {
    #[error("Frame is from a client")]
    FrameFromClient,

    #[error("Frame protocol version {0:#04x} is not supported")]
    VersionNotSupported(u8),

    #[error("Connection was closed before the whole frame arrived: missing {0} out of {1} bytes")]
    ConnectionClosed(usize, usize),

    #[error("Frame is compressed, but no compression was negotiated")]
    UnexpectedCompressionFlag,

    #[error("Unknown response opcode: {0:#04x}")]
    UnknownResponseOpcode(u8),

    #[error("Request body could not be serialized: value too long")]
    ValueTooLong,

    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for FrameError {
    fn from(err: std::io::Error) -> Self {
        FrameError::Io(Arc::new(err))
    }
}

impl From<std::num::TryFromIntError> for FrameError {
    fn from(_: std::num::TryFromIntError) -> Self {
        FrameError::ValueTooLong
    }
}

/// An error of parsing a CQL primitive out of a response body.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum TypeParseError {
    #[error("Not enough bytes in buffer: expected {expected}, {available} available")]
    TooFewBytes { expected: usize, available: usize },

    #[error("Length {0} is negative")]
    NegativeLength(i32),

    #[error("Invalid UTF-8 string: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
}

/// An error the database reported in an ERROR response, reduced to the
/// error codes the connection setup path needs to distinguish.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DbError {
    #[error("Internal server error")]
    ServerError,

    /// A protocol-level violation, e.g. an unsupported protocol version.
    #[error("Protocol error")]
    ProtocolError,

    /// Authentication failed - bad credentials.
    #[error("Authentication error")]
    AuthenticationError,

    #[error("The node is overloaded")]
    Overloaded,

    #[error("The node is still bootstrapping")]
    IsBootstrapping,

    #[error("The submitted request has a syntax error")]
    SyntaxError,

    #[error("The logged user does not have the right to perform the request")]
    Unauthorized,

    #[error("The request is syntactically correct but invalid")]
    Invalid,

    #[error("The request is invalid because of a configuration issue")]
    ConfigError,

    #[error("Unrecognized error code: {0:#06x}")]
    Other(i32),
}

impl DbError {
    pub fn from_code(code: i32) -> Self {
        match code {
            0x0000 => DbError::ServerError,
            0x000A => DbError::ProtocolError,
            0x0100 => DbError::AuthenticationError,
            0x1001 => DbError::Overloaded,
            0x1002 => DbError::IsBootstrapping,
            0x2000 => DbError::SyntaxError,
            0x2100 => DbError::Unauthorized,
            0x2200 => DbError::Invalid,
            0x2300 => DbError::ConfigError,
            other => DbError::Other(other),
        }
    }
}

/// Diagnoses why the sharding parameters of a SUPPORTED frame did not yield
/// a usable descriptor. None of these is fatal for the connection: the node
/// is then simply treated as un-sharded.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ShardingError {
    /// This indicates that we are most likely connected to a Cassandra
    /// cluster, which has no concept of shards.
    #[error("Server did not provide any sharding information")]
    NoShardInfo,

    #[error("Missing some sharding info parameters")]
    MissingSomeShardInfoParameters,

    #[error("Missing some sharding info parameter values")]
    MissingShardInfoParameterValues,

    #[error("Unsupported partitioner: {0}")]
    UnsupportedPartitioner(String),

    #[error("Unsupported sharding algorithm: {0}")]
    UnsupportedShardingAlgorithm(String),

    #[error("Sharding info contains an invalid number of shards (0)")]
    ZeroShards,

    #[error("Sharding info parameter {0} is out of range")]
    ShardInfoParameterOutOfRange(&'static str),
}

/// An error returned by [`ShardAwarePortRange::new()`](crate::routing::ShardAwarePortRange::new).
#[derive(Debug, Error)]
#[error("Invalid shard-aware local port range")]
pub struct InvalidShardAwarePortRange;

/// A keyspace name that cannot be used in a `USE` statement.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum BadKeyspaceName {
    /// Keyspace name is empty.
    #[error("Keyspace name is empty")]
    Empty,

    /// Keyspace name too long, must be up to 48 characters.
    #[error("Keyspace name too long, must be up to 48 characters, found {1} characters. Bad keyspace name: '{0}'")]
    TooLong(String, usize),

    /// Illegal character - only alphanumeric and underscores allowed.
    #[error("Illegal character found: '{1}', only alphanumeric and underscores allowed. Bad keyspace name: '{0}'")]
    IllegalCharacter(String, char),
}
