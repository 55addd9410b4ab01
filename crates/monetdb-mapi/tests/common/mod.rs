//! In-process fake MAPI server for integration tests.
//!
//! The server speaks the block protocol through the crate's own
//! `BlockReader`/`BlockWriter`, sends a protocol 9 challenge, checks the
//! login line against the expected hash and then answers every query
//! message with the text returned by a handler closure.

#![allow(dead_code)]

use std::io::{self, BufRead, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use monetdb_mapi::MapiConfig;
use monetdb_mapi::auth::hex_digest;
use monetdb_mapi::protocol::{BlockReader, BlockWriter};

pub const SALT: &str = "wt0JmpCGK";
pub const CHALLENGE: &str = "wt0JmpCGK:mserver:9:RIPEMD160,SHA256,SHA1,MD5:LIT:SHA512:";
pub const USER: &str = "monetdb";
pub const PASSWORD: &str = "monetdb";
pub const DATABASE: &str = "demo";
/// How long the server waits before answering `SLOW`.
pub const SLOW_REPLY_DELAY: Duration = Duration::from_millis(600);

/// Reply to a login line; `None` closes the connection without answering.
pub type LoginHandler = dyn Fn(&str) -> Option<String> + Send + Sync;
/// Reply to a query; `None` closes the connection without answering.
pub type QueryHandler = dyn Fn(&str) -> Option<String> + Send + Sync;

#[derive(Default)]
pub struct Stats {
    pub connections: AtomicUsize,
    pub logins: Mutex<Vec<String>>,
    pub messages: Mutex<Vec<String>>,
}

impl Stats {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

pub struct FakeServer {
    pub addr: SocketAddr,
    pub stats: Arc<Stats>,
}

impl FakeServer {
    /// A server that accepts the standard credentials and answers queries
    /// with [`demo_reply`].
    pub fn start() -> Self {
        Self::with_handlers(Arc::new(standard_login), Arc::new(demo_reply))
    }

    pub fn with_query_handler(
        handler: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        Self::with_handlers(Arc::new(standard_login), Arc::new(handler))
    }

    pub fn with_login_handler(
        login: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        Self::with_handlers(Arc::new(login), Arc::new(demo_reply))
    }

    pub fn with_handlers(login: Arc<LoginHandler>, query: Arc<QueryHandler>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let stats = Arc::new(Stats::default());

        let server_stats = Arc::clone(&stats);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                server_stats.connections.fetch_add(1, Ordering::SeqCst);
                let login = Arc::clone(&login);
                let query = Arc::clone(&query);
                let stats = Arc::clone(&server_stats);
                thread::spawn(move || {
                    let _ = serve(stream, &*login, &*query, &stats);
                });
            }
        });

        Self { addr, stats }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn config(&self) -> MapiConfig {
        MapiConfig::new()
            .host("127.0.0.1")
            .port(self.port())
            .user(USER)
            .password(PASSWORD)
            .database(DATABASE)
            .connect_timeout(Duration::from_secs(5))
            .receive_timeout(Some(Duration::from_secs(5)))
    }
}

/// The login line a client with the standard credentials must send.
pub fn expected_login(database: &str) -> String {
    let prehashed = hex_digest("SHA512", PASSWORD.as_bytes()).unwrap();
    let digest = hex_digest("SHA256", format!("{prehashed}{SALT}").as_bytes()).unwrap();
    format!("BIG:{USER}:{{SHA256}}{digest}:sql:{database}:")
}

pub fn standard_login(line: &str) -> Option<String> {
    if line == expected_login(DATABASE) {
        Some(String::new())
    } else {
        Some(format!(
            "!InvalidCredentialsException:checkCredentials:invalid credentials for user '{USER}'"
        ))
    }
}

/// Canned replies for the statements the tests send.
pub fn demo_reply(sql: &str) -> Option<String> {
    let reply = match sql {
        "SELECT 1 as n" => select_one(),
        "CREATE TABLE t (i int)" => "&3".to_string(),
        "INSERT INTO t VALUES (1), (2), (3)" => "&2 3 -1".to_string(),
        "SELECT * FROM people" => people(),
        "SELECT 1 as n; SELECT * FROM people" => format!("{}\n{}", select_one(), people()),
        "SELECT pid" => "&1 0 1 1 1 42 10 5\n% .L # table_name\n% pid # name\n% int # type\n% 2 # length\n[ 42\t]".to_string(),
        "CRASH" => return None,
        "SLOW" => {
            thread::sleep(SLOW_REPLY_DELAY);
            "&2 111 -1".to_string()
        }
        "BAD ROW" => "&1 0 1 1 1\n% n # name\n% int # type\n[ 1.2.3\t]".to_string(),
        _ if sql.starts_with("ECHO ") => format!("&2 {} -1", sql.len()),
        _ => format!("!42000!syntax error, unexpected IDENT in: \"{sql}\""),
    };
    Some(reply)
}

fn select_one() -> String {
    "&1 0 1 1 1\n% .L2 # table_name\n% n # name\n% tinyint # type\n% 1 # length\n[ 1\t]"
        .to_string()
}

fn people() -> String {
    [
        "&1 1 3 2 3",
        "% sys.people,\tsys.people # table_name",
        "% id,\tname # name",
        "% int,\tvarchar # type",
        "% 1,\t5 # length",
        "[ 1,\t\"ada\"\t]",
        "[ 2,\t\"grace\"\t]",
        "[ 3,\tNULL\t]",
    ]
    .join("\n")
}

fn serve(
    stream: TcpStream,
    login: &LoginHandler,
    query: &QueryHandler,
    stats: &Stats,
) -> io::Result<()> {
    let mut reader = BlockReader::new(stream.try_clone()?);
    let mut writer = BlockWriter::new(stream);

    loop {
        send(&mut writer, CHALLENGE)?;
        let line = read_message(&mut reader)?;
        stats.logins.lock().unwrap().push(line.clone());
        let Some(reply) = login(&line) else {
            return Ok(());
        };
        send(&mut writer, &reply)?;
        if reply.starts_with("^mapi:merovingian:") {
            // Proxy redirect: the client logs in again on this socket.
            continue;
        }
        if reply.starts_with('!') || reply.starts_with('^') {
            return Ok(());
        }
        break;
    }

    loop {
        let message = read_message(&mut reader)?;
        stats.messages.lock().unwrap().push(message.clone());
        let reply = if let Some(command) = message.strip_prefix('X') {
            if command.starts_with("fail") {
                Some("!42000!control command failed".to_string())
            } else {
                Some(String::new())
            }
        } else if let Some(sql) = message.strip_prefix('s') {
            query(sql.trim_end_matches(';'))
        } else {
            Some(format!("!unexpected message {message:?}"))
        };
        match reply {
            Some(reply) => send(&mut writer, &reply)?,
            None => return Ok(()),
        }
    }
}

/// Read one client message; its lines are joined with `\n`.
fn read_message(reader: &mut BlockReader<TcpStream>) -> io::Result<String> {
    let mut lines = Vec::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line)?;
        let line = line.trim_end_matches('\n').to_string();
        if line == "." {
            return Ok(lines.join("\n"));
        }
        lines.push(line);
    }
}

fn send(writer: &mut BlockWriter<TcpStream>, text: &str) -> io::Result<()> {
    if !text.is_empty() {
        writer.write_all(text.as_bytes())?;
        writer.write_all(b"\n")?;
    }
    writer.flush()
}
