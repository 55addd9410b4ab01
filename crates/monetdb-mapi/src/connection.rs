//! MAPI session implementation.
//!
//! A [`MapiSession`] owns one authenticated connection to a MonetDB server.
//! Connecting performs the challenge-response login and follows redirects
//! handed out by the server or by the `merovingian` proxy. Once ready, the
//! session executes SQL and control commands strictly one at a time.

use std::io::{self, BufRead, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use monetdb_core::error::{
    ConfigError, ConnectionError, ConnectionErrorKind, ProtocolError, ServerError,
};
use monetdb_core::{Error, Result};
use monetdb_pool::ManageConnection;
use regex::Regex;

use crate::auth::{Challenge, Credentials, HandshakeStrategies};
use crate::config::MapiConfig;
use crate::protocol::response::{LineSource, QueryResult, ResultStream};
use crate::protocol::{BlockReader, BlockWriter, LineType, MAX_QUERY_CHUNK, PROMPT};

/// Byte transport under a session.
#[derive(Debug)]
enum Transport {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixStream),
}

impl Transport {
    fn try_clone(&self) -> io::Result<Self> {
        match self {
            Transport::Tcp(s) => s.try_clone().map(Transport::Tcp),
            #[cfg(unix)]
            Transport::Unix(s) => s.try_clone().map(Transport::Unix),
        }
    }

    fn shutdown(&self) -> io::Result<()> {
        match self {
            Transport::Tcp(s) => s.shutdown(Shutdown::Both),
            #[cfg(unix)]
            Transport::Unix(s) => s.shutdown(Shutdown::Both),
        }
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            Transport::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            Transport::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Tcp(s) => s.flush(),
            #[cfg(unix)]
            Transport::Unix(s) => s.flush(),
        }
    }
}

/// Framed read and write halves of one transport plus per-statement state.
#[derive(Debug)]
pub struct Channel {
    reader: BlockReader<Transport>,
    writer: BlockWriter<Transport>,
    needs_continuation: bool,
    process_id: Option<i64>,
    /// A failed read or write left the stream out of sync with the server.
    broken: bool,
}

impl Channel {
    fn new(transport: Transport) -> Result<Self> {
        let reader = BlockReader::new(transport.try_clone()?);
        Ok(Self {
            reader,
            writer: BlockWriter::new(transport),
            needs_continuation: false,
            process_id: None,
            broken: false,
        })
    }

    /// Send one complete message.
    fn send(&mut self, message: &str) -> Result<()> {
        tracing::trace!(message = %message, "sending message");
        self.writer.write_all(message.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    /// Read up to the prompt; an error line on the way fails the call.
    ///
    /// The rest of the reply is still consumed so the channel stays usable.
    fn wait_for_prompt(&mut self) -> Result<()> {
        let mut error: Option<String> = None;
        loop {
            let line = self.read_line()?.ok_or_else(|| {
                protocol_error("connection closed while waiting for prompt", None)
            })?;
            if line == PROMPT {
                break;
            }
            if LineType::from_line(&line) == LineType::Error {
                match &mut error {
                    Some(message) => {
                        message.push('\n');
                        message.push_str(&line[1..]);
                    }
                    None => error = Some(line[1..].to_string()),
                }
            }
        }
        match error {
            Some(message) => Err(Error::Server(ServerError::from_server_text(message))),
            None => Ok(()),
        }
    }

    fn shutdown(&self) {
        if let Err(e) = self.writer.get_ref().shutdown() {
            tracing::debug!(error = %e, "socket shutdown failed");
        }
    }
}

impl LineSource for Channel {
    fn read_line(&mut self) -> Result<Option<String>> {
        let mut buf = Vec::new();
        match self.reader.read_until(b'\n', &mut buf) {
            Ok(0) => return Ok(None),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(Error::Io(e)),
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
        }
        String::from_utf8(buf).map(Some).map_err(|e| {
            Error::Protocol(ProtocolError {
                message: "server sent a line that is not valid UTF-8".to_string(),
                line: Some(String::from_utf8_lossy(e.as_bytes()).into_owned()),
                source: Some(Box::new(e)),
            })
        })
    }

    fn set_needs_continuation(&mut self) {
        self.needs_continuation = true;
    }

    fn set_process_id(&mut self, id: i64) {
        self.process_id = Some(id);
    }

    fn set_broken(&mut self) {
        if !self.broken {
            tracing::debug!("channel out of sync with the server");
        }
        self.broken = true;
    }
}

/// Write one SQL statement as a MAPI query message.
///
/// The `s` marker is omitted when the server is waiting for the rest of a
/// previous statement. Text longer than [`MAX_QUERY_CHUNK`] bytes is sent as
/// non-final blocks cut on character boundaries.
fn write_query<W: Write>(
    writer: &mut BlockWriter<W>,
    needs_continuation: &mut bool,
    sql: &str,
) -> Result<()> {
    if !std::mem::take(needs_continuation) {
        writer.write_all(b"s")?;
    }

    let mut rest = sql;
    while rest.len() > MAX_QUERY_CHUNK {
        let mut cut = MAX_QUERY_CHUNK;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        let (chunk, tail) = rest.split_at(cut);
        writer.write_all(chunk.as_bytes())?;
        writer.set_more_data(true);
        writer.flush()?;
        rest = tail;
    }

    writer.write_all(rest.trim_end_matches(';').as_bytes())?;
    writer.write_all(b";\n")?;
    writer.flush()?;
    Ok(())
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Logged in and ready for statements
    Ready,
    /// A protocol, lexing or I/O failure left the stream out of sync
    Broken,
    /// Socket closed
    Closed,
}

/// Where a login was redirected to.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Redirect {
    /// Reconnect over TCP
    Tcp {
        host: String,
        port: Option<u16>,
        database: Option<String>,
    },
    /// Log in again on the same socket (merovingian proxy)
    Proxy { database: Option<String> },
    /// Reconnect over a Unix domain socket
    Unix {
        path: String,
        database: Option<String>,
    },
}

fn redirect_pattern() -> Result<&'static Regex> {
    static PATTERN: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r"^mapi:(monetdb|merovingian)://([^/:?]*)(?::(\d+))?(/[^?]*)?(?:\?(.*))?$",
            )
        })
        .as_ref()
        .map_err(|e| {
            Error::Config(ConfigError {
                message: format!("invalid redirect pattern: {e}"),
                source: None,
            })
        })
}

impl Redirect {
    fn parse(url: &str) -> Result<Self> {
        let captures = redirect_pattern()?.captures(url.trim()).ok_or_else(|| {
            connection_error(
                ConnectionErrorKind::Redirect,
                format!("unrecognized redirect {url:?}"),
            )
        })?;
        let group = |i: usize| captures.get(i).map_or("", |m| m.as_str());

        let path = group(4);
        let from_query = group(5)
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == "database")
            .map(|(_, value)| value.to_string());

        if group(1) == "merovingian" {
            let database = Some(path.trim_start_matches('/'))
                .filter(|db| !db.is_empty())
                .map(str::to_string)
                .or(from_query);
            return Ok(Redirect::Proxy { database });
        }

        let host = group(2);
        if host.is_empty() {
            if path.is_empty() {
                return Err(connection_error(
                    ConnectionErrorKind::Redirect,
                    format!("redirect without host or socket path {url:?}"),
                ));
            }
            return Ok(Redirect::Unix {
                path: path.to_string(),
                database: from_query,
            });
        }

        let port = match captures.get(3) {
            Some(m) => Some(m.as_str().parse().map_err(|_| {
                connection_error(
                    ConnectionErrorKind::Redirect,
                    format!("invalid port in redirect {url:?}"),
                )
            })?),
            None => None,
        };
        let database = Some(path.trim_start_matches('/'))
            .filter(|db| !db.is_empty())
            .map(str::to_string)
            .or(from_query);
        Ok(Redirect::Tcp {
            host: host.to_string(),
            port,
            database,
        })
    }
}

/// Result of one login exchange.
enum Login {
    Ready(Vec<String>),
    Redirect(String),
}

/// One authenticated MonetDB session.
pub struct MapiSession {
    channel: Channel,
    config: MapiConfig,
    host: String,
    port: u16,
    database: String,
    warnings: Vec<String>,
    reply_size: Option<i64>,
    state: SessionState,
    created: Instant,
}

impl std::fmt::Debug for MapiSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapiSession")
            .field("state", &self.state)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("process_id", &self.channel.process_id)
            .finish_non_exhaustive()
    }
}

impl MapiSession {
    /// Connect and log in with the built-in handshake strategies.
    pub fn connect(config: &MapiConfig) -> Result<Self> {
        Self::connect_with(config, &HandshakeStrategies::default())
    }

    /// Connect and log in, following redirects.
    ///
    /// 1. Open the transport to the configured host
    /// 2. Answer the server challenge
    /// 3. On a redirect, reconnect (or re-login through the proxy) and repeat
    /// 4. Apply the configured reply size
    pub fn connect_with(config: &MapiConfig, strategies: &HandshakeStrategies) -> Result<Self> {
        let mut host = config.host.clone();
        let mut port = config.port;
        let mut credentials = config.credentials();
        let mut channel = Channel::new(open_tcp(&host, port, config)?)?;
        let mut hops = 0usize;

        let warnings = loop {
            let url = match login(&mut channel, &credentials, strategies)? {
                Login::Ready(warnings) => break warnings,
                Login::Redirect(url) => url,
            };

            hops += 1;
            if hops > config.max_redirects {
                return Err(connection_error(
                    ConnectionErrorKind::Redirect,
                    format!("too many redirects (limit {})", config.max_redirects),
                ));
            }
            tracing::debug!(url = %url, hop = hops, "following redirect");

            match Redirect::parse(&url)? {
                Redirect::Tcp {
                    host: new_host,
                    port: new_port,
                    database,
                } => {
                    channel.shutdown();
                    host = new_host;
                    port = new_port.unwrap_or(port);
                    if let Some(database) = database {
                        credentials.database = database;
                    }
                    channel = Channel::new(open_tcp(&host, port, config)?)?;
                }
                Redirect::Proxy { database } => {
                    if let Some(database) = database {
                        credentials.database = database;
                    }
                }
                Redirect::Unix { path, database } => {
                    channel.shutdown();
                    if let Some(database) = database {
                        credentials.database = database;
                    }
                    channel = Channel::new(open_unix(&path, config)?)?;
                    host = path;
                }
            }
        };

        for warning in &warnings {
            tracing::warn!(warning = %warning, "server warning during login");
        }
        tracing::debug!(host = %host, port, database = %credentials.database, "session ready");

        let mut session = Self {
            channel,
            config: config.clone(),
            host,
            port,
            database: credentials.database,
            warnings,
            reply_size: None,
            state: SessionState::Ready,
            created: Instant::now(),
        };
        if let Some(rows) = config.reply_size {
            session.set_reply_size(rows)?;
        }
        Ok(session)
    }

    pub fn state(&self) -> SessionState {
        match self.state {
            SessionState::Ready if self.channel.broken => SessionState::Broken,
            state => state,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    /// Warnings the server sent while logging in.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Host (or socket path) the session ended up on after redirects.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn config(&self) -> &MapiConfig {
        &self.config
    }

    /// Id the server assigned to the last query, if it reported one.
    pub fn process_id(&self) -> Option<i64> {
        self.channel.process_id
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Send a statement and return its lazily decoded results.
    ///
    /// The returned stream borrows the session; it must be dropped (which
    /// drains any unread rows) before the next statement can be sent.
    pub fn execute_sql(&mut self, sql: &str) -> Result<ResultStream<&mut Channel>> {
        self.ensure_ready()?;
        tracing::debug!(sql = %sql, "executing statement");
        let channel = &mut self.channel;
        let sent = write_query(&mut channel.writer, &mut channel.needs_continuation, sql);
        track(channel, sent)?;
        channel.process_id = None;
        Ok(ResultStream::new(channel).with_sql(sql))
    }

    /// Run a statement and read every result set into memory.
    pub fn query(&mut self, sql: &str) -> Result<Vec<QueryResult>> {
        self.execute_sql(sql)?.collect_all()
    }

    /// Run a statement and return the number of affected rows.
    pub fn execute(&mut self, sql: &str) -> Result<i64> {
        Ok(self
            .query(sql)?
            .iter()
            .map(|result| result.info.affected_rows)
            .filter(|&rows| rows >= 0)
            .sum())
    }

    /// Send an `X` control command and wait for its prompt.
    pub fn execute_control(&mut self, command: &str) -> Result<()> {
        self.ensure_ready()?;
        tracing::debug!(command = %command, "control command");
        let sent = self.channel.send(&format!("X{command}"));
        track(&mut self.channel, sent)?;
        let reply = self.channel.wait_for_prompt();
        track(&mut self.channel, reply)
    }

    /// Set how many rows the server sends per reply.
    ///
    /// The command is only sent when the value changes.
    pub fn set_reply_size(&mut self, rows: i64) -> Result<()> {
        if self.reply_size == Some(rows) {
            return Ok(());
        }
        self.execute_control(&format!("reply_size {rows}"))?;
        self.reply_size = Some(rows);
        Ok(())
    }

    pub fn reply_size(&self) -> Option<i64> {
        self.reply_size
    }

    /// Close the socket.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.channel.shutdown();
        self.state = SessionState::Closed;
        tracing::debug!(host = %self.host, port = self.port, "session closed");
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state() {
            SessionState::Ready => Ok(()),
            SessionState::Broken => Err(disconnected(
                "session is out of sync with the server after a failed statement",
            )),
            SessionState::Closed => Err(disconnected("session is closed")),
        }
    }
}

/// Mark the channel broken when `result` failed in a way that desyncs it.
fn track<T>(channel: &mut Channel, result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
        if e.is_fatal_to_session() {
            channel.set_broken();
        }
    }
    result
}

/// Read the challenge, answer it and collect the server's verdict.
fn login(
    channel: &mut Channel,
    credentials: &Credentials,
    strategies: &HandshakeStrategies,
) -> Result<Login> {
    let line = channel
        .read_line()?
        .ok_or_else(|| disconnected("connection closed before the server challenge"))?;
    let challenge = Challenge::parse(&line)?;
    tracing::debug!(
        server_type = %challenge.server_type,
        version = challenge.version,
        "received challenge"
    );
    channel.wait_for_prompt()?;

    let response = strategies.respond(credentials, &challenge)?;
    channel.send(&response)?;

    let mut warnings = Vec::new();
    let mut redirects = Vec::new();
    loop {
        let line = channel
            .read_line()?
            .ok_or_else(|| disconnected("connection closed during login"))?;
        if line == PROMPT {
            break;
        }
        match LineType::from_line(&line) {
            LineType::Error => {
                return Err(Error::Server(ServerError::from_server_text(&line[1..])));
            }
            LineType::Redirect => redirects.push(line[1..].to_string()),
            LineType::Info => warnings.push(line[1..].trim_start().to_string()),
            _ if !line.is_empty() => warnings.push(line),
            _ => {}
        }
    }

    if redirects.len() > 1 {
        tracing::debug!(count = redirects.len(), "following the first of several redirects");
    }
    Ok(match redirects.into_iter().next() {
        Some(url) => Login::Redirect(url),
        None => Login::Ready(warnings),
    })
}

fn open_tcp(host: &str, port: u16, config: &MapiConfig) -> Result<Transport> {
    let target = format!("{host}:{port}");
    let addrs = (host, port).to_socket_addrs().map_err(|e| {
        Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Connect,
            message: format!("Invalid socket address {target}: {e}"),
            source: Some(Box::new(e)),
        })
    })?;

    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, config.connect_timeout) {
            Ok(stream) => {
                stream.set_nodelay(true).ok();
                stream.set_read_timeout(config.receive_timeout)?;
                tracing::debug!(%addr, "connected");
                return Ok(Transport::Tcp(stream));
            }
            Err(e) => last_error = Some(e),
        }
    }

    Err(match last_error {
        Some(e) => {
            let kind = if e.kind() == io::ErrorKind::ConnectionRefused {
                ConnectionErrorKind::Refused
            } else {
                ConnectionErrorKind::Connect
            };
            Error::Connection(ConnectionError {
                kind,
                message: format!("Failed to connect to {target}: {e}"),
                source: Some(Box::new(e)),
            })
        }
        None => connection_error(
            ConnectionErrorKind::Connect,
            format!("{target} did not resolve to any address"),
        ),
    })
}

#[cfg(unix)]
fn open_unix(path: &str, config: &MapiConfig) -> Result<Transport> {
    let mut stream = std::os::unix::net::UnixStream::connect(path).map_err(|e| {
        Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Connect,
            message: format!("Failed to connect to socket {path}: {e}"),
            source: Some(Box::new(e)),
        })
    })?;
    stream.set_read_timeout(config.receive_timeout)?;
    // The server expects one raw byte before the framed handshake.
    stream.write_all(b"0")?;
    tracing::debug!(path = %path, "connected over unix socket");
    Ok(Transport::Unix(stream))
}

#[cfg(not(unix))]
fn open_unix(path: &str, _config: &MapiConfig) -> Result<Transport> {
    Err(Error::Unsupported(monetdb_core::UnsupportedError {
        kind: monetdb_core::UnsupportedKind::Operation,
        message: format!("unix socket redirect to {path} is not supported on this platform"),
    }))
}

fn connection_error(kind: ConnectionErrorKind, message: impl Into<String>) -> Error {
    Error::Connection(ConnectionError {
        kind,
        message: message.into(),
        source: None,
    })
}

fn disconnected(message: &str) -> Error {
    connection_error(ConnectionErrorKind::Disconnected, message)
}

fn protocol_error(message: &str, line: Option<String>) -> Error {
    Error::Protocol(ProtocolError {
        message: message.to_string(),
        line,
        source: None,
    })
}

/// Opens sessions for a [`monetdb_pool::Pool`].
#[derive(Debug, Clone)]
pub struct MapiConnector {
    config: MapiConfig,
}

impl MapiConnector {
    pub fn new(config: MapiConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MapiConfig {
        &self.config
    }
}

impl ManageConnection for MapiConnector {
    type Connection = MapiSession;

    fn connect(&self) -> Result<MapiSession> {
        MapiSession::connect(&self.config)
    }

    fn close(&self, mut conn: MapiSession) {
        conn.close();
    }

    fn has_broken(&self, conn: &mut MapiSession) -> bool {
        !conn.is_ready()
    }
}
