//! Error types for MAPI driver operations.

use std::fmt;

/// The primary error type for all driver operations.
#[derive(Debug)]
pub enum Error {
    /// Transport-level connect or handshake failures
    Connection(ConnectionError),
    /// Application-level errors reported by the server
    Server(ServerError),
    /// Malformed framing, unexpected end of stream, unrecognized line shape
    Protocol(ProtocolError),
    /// Malformed row literal
    Lex(LexError),
    /// Pool bookkeeping errors
    Pool(PoolError),
    /// Version or feature gaps
    Unsupported(UnsupportedError),
    /// Type conversion errors
    Type(TypeError),
    /// Configuration errors
    Config(ConfigError),
    /// I/O errors
    Io(std::io::Error),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Connection refused
    Refused,
    /// Server rejected the credentials
    Authentication,
    /// Connection lost during the handshake
    Disconnected,
    /// Redirect could not be followed
    Redirect,
}

#[derive(Debug)]
pub struct ServerError {
    pub message: String,
    pub sqlstate: Option<String>,
    pub sql: Option<String>,
}

#[derive(Debug)]
pub struct ProtocolError {
    pub message: String,
    pub line: Option<String>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug)]
pub struct LexError {
    pub message: String,
    pub input: String,
    pub position: usize,
}

#[derive(Debug)]
pub struct PoolError {
    pub kind: PoolErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolErrorKind {
    /// No idle session left after topping up
    Exhausted,
    /// Release of a session this pool does not track as busy
    InvalidState,
    /// Invalid min/max bounds
    Config,
}

#[derive(Debug)]
pub struct UnsupportedError {
    pub kind: UnsupportedKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsupportedKind {
    /// Handshake announced a protocol version with no registered strategy
    ProtocolVersion,
    /// Operation the stream or transport cannot perform
    Operation,
    /// Feature disabled by configuration
    NotSupported,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Is this a retryable error? Only pool exhaustion qualifies.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Pool(p) if p.kind == PoolErrorKind::Exhausted)
    }

    /// Is this a connection error that likely requires reconnection?
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Error::Connection(_) | Error::Protocol(_) | Error::Io(_)
        )
    }

    /// Does this error leave the session's stream out of sync?
    ///
    /// Sessions that fail this way must be removed from their pool, not
    /// released. Server errors leave the session usable.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            Error::Connection(_) | Error::Protocol(_) | Error::Lex(_) | Error::Io(_)
        )
    }

    /// Get SQLSTATE if the server reported one.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Server(e) => e.sqlstate.as_deref(),
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Server(e) => e.sql.as_deref(),
            _ => None,
        }
    }
}

impl ServerError {
    /// Build a server error from the text of one or more `!` lines.
    ///
    /// MonetDB prefixes SQL errors with a five character SQLSTATE followed
    /// by `!`, e.g. `42000!syntax error`.
    pub fn from_server_text(text: impl Into<String>) -> Self {
        let text = text.into();
        match text.split_once('!') {
            Some((state, rest))
                if state.len() == 5 && state.bytes().all(|b| b.is_ascii_alphanumeric()) =>
            {
                Self {
                    sqlstate: Some(state.to_string()),
                    message: rest.to_string(),
                    sql: None,
                }
            }
            _ => Self {
                message: text,
                sqlstate: None,
                sql: None,
            },
        }
    }

    /// Attach the statement text that produced this error.
    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = Some(sql.into());
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Server(e) => {
                if let Some(sqlstate) = &e.sqlstate {
                    write!(f, "Server error (SQLSTATE {}): {}", sqlstate, e.message)
                } else {
                    write!(f, "Server error: {}", e.message)
                }
            }
            Error::Protocol(e) => write!(f, "Protocol error: {}", e.message),
            Error::Lex(e) => write!(f, "Lex error: {}", e),
            Error::Pool(e) => write!(f, "Pool error: {}", e.message),
            Error::Unsupported(e) => write!(f, "Unsupported: {}", e.message),
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Protocol(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Pool(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sqlstate) = &self.sqlstate {
            write!(f, "{} (SQLSTATE {})", self.message, sqlstate)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} at position {} in {:?}",
            self.message, self.position, self.input
        )
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "column '{}': expected {}, found {}",
                col, self.expected, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<ServerError> for Error {
    fn from(err: ServerError) -> Self {
        Error::Server(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<LexError> for Error {
    fn from(err: LexError) -> Self {
        Error::Lex(err)
    }
}

impl From<PoolError> for Error {
    fn from(err: PoolError) -> Self {
        Error::Pool(err)
    }
}

impl From<UnsupportedError> for Error {
    fn from(err: UnsupportedError) -> Self {
        Error::Unsupported(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

/// Result type alias for driver operations.
pub type Result<T> = std::result::Result<T, Error>;
