//! MonetDB MAPI driver.
//!
//! This crate speaks MonetDB's line-oriented MAPI protocol over TCP. It
//! provides:
//!
//! - Block framing of the byte stream (`protocol::block`)
//! - The bracketed row tokenizer (`protocol::lexer`)
//! - A lazy, pull-based response decoder (`protocol::response`)
//! - Challenge-response authentication with redirect following
//! - Sessions that execute SQL and control commands
//! - A process-wide registry of session pools with idle eviction
//!
//! # Example
//!
//! ```rust,ignore
//! use monetdb_mapi::{MapiConfig, MapiSession};
//!
//! let config = MapiConfig::new()
//!     .host("localhost")
//!     .port(50000)
//!     .user("monetdb")
//!     .password("monetdb")
//!     .database("demo");
//!
//! let mut session = MapiSession::connect(&config)?;
//! let mut results = session.execute_sql("SELECT 1 AS n")?;
//! while let Some(mut set) = results.next_result()? {
//!     for row in &mut set {
//!         println!("{:?}", row?.fields().collect::<Vec<_>>());
//!     }
//! }
//! ```

pub mod auth;
pub mod config;
pub mod connection;
pub mod protocol;
pub mod registry;
pub mod settings;
pub mod types;

pub use config::MapiConfig;
pub use connection::{MapiConnector, MapiSession, SessionState};
pub use protocol::response::{Column, QueryResult, RawRow, ResultInfo, ResultSet, ResultStream};
pub use registry::PooledSession;
pub use settings::{CancelStrategy, Settings};
