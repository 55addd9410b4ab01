//! MAPI connection configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::Credentials;

/// Connection parameters for one MonetDB session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapiConfig {
    /// Hostname or IP address
    pub host: String,
    /// Port number (default: 50000)
    pub port: u16,
    pub user: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub database: String,
    /// Query language (default: sql)
    pub language: String,
    pub connect_timeout: Duration,
    /// Read timeout on the socket; a read that times out is fatal to the session
    pub receive_timeout: Option<Duration>,
    /// Rows per reply; `-1` asks for the whole result at once
    pub reply_size: Option<i64>,
    /// Redirect hops followed during the handshake before giving up (default 1)
    pub max_redirects: usize,
}

impl Default for MapiConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 50000,
            user: "monetdb".to_string(),
            password: "monetdb".to_string(),
            database: String::new(),
            language: "sql".to_string(),
            connect_timeout: Duration::from_secs(30),
            receive_timeout: Some(Duration::from_secs(120)),
            reply_size: Some(-1),
            max_redirects: 1,
        }
    }
}

impl MapiConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the hostname.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the username.
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Set the password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    /// Set the database.
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Set the query language.
    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    /// Set the connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the receive timeout; `None` blocks indefinitely.
    pub fn receive_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.receive_timeout = timeout;
        self
    }

    /// Set the reply size applied after login; `None` keeps the server default.
    pub fn reply_size(mut self, rows: Option<i64>) -> Self {
        self.reply_size = rows;
        self
    }

    /// Set the maximum number of redirects followed during login.
    pub fn max_redirects(mut self, hops: usize) -> Self {
        self.max_redirects = hops;
        self
    }

    /// Get the socket address string for connection.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Identity under which sessions for this configuration are pooled.
    pub fn pool_key(&self) -> PoolKey {
        PoolKey {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            database: self.database.clone(),
        }
    }

    pub(crate) fn credentials(&self) -> Credentials {
        Credentials {
            user: self.user.clone(),
            password: self.password.clone(),
            database: self.database.clone(),
            language: self.language.clone(),
        }
    }
}

/// Pool identity: sessions are interchangeable when all four fields match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub database: String,
}

impl std::fmt::Display for PoolKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}/{}", self.user, self.host, self.port, self.database)
    }
}
