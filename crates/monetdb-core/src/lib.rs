//! Core types shared by the MonetDB MAPI driver crates.
//!
//! - `Error` and its per-category payloads, with session-fatality helpers
//! - `Value` for dynamically typed column values
//! - `Row` with shared column metadata and typed accessors

pub mod error;
pub mod row;
pub mod value;

pub use error::{
    ConfigError, ConnectionError, ConnectionErrorKind, Error, LexError, PoolError, PoolErrorKind,
    ProtocolError, Result, ServerError, TypeError, UnsupportedError, UnsupportedKind,
};
pub use row::{ColumnInfo, FromValue, Row};
pub use value::Value;
