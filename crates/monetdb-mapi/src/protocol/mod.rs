//! MAPI wire protocol implementation.
//!
//! The byte stream is cut into blocks with a 2-byte header:
//! - bits 1..16: payload length (at most 32767)
//! - bit 0: set on the last block of a logical message
//!
//! Inside a message the server speaks lines, each classified by its first
//! character (see [`LineType`]).

pub mod block;
pub mod lexer;
pub mod response;

pub use block::{BlockReader, BlockWriter};
pub use lexer::parse_row;

/// Maximum payload of a single block.
pub const BLOCK_SIZE: usize = 0x7FFF;

/// Largest SQL fragment written before an intra-message continuation.
pub const MAX_QUERY_CHUNK: usize = 1020;

/// Line the block reader appends after the last block of a message.
pub const PROMPT: &str = ".";

/// Line the server sends when it expects more input for a statement.
pub const CONTINUATION_MARKER: &str = "\x01\x02";

/// Block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Payload length
    pub length: u16,
    /// Last block of a logical message
    pub last: bool,
}

impl BlockHeader {
    /// Total header size in bytes.
    pub const SIZE: usize = 2;

    pub fn from_bytes(bytes: [u8; 2]) -> Self {
        let length = (u16::from(bytes[0]) >> 1) | (u16::from(bytes[1]) << 7);
        Self {
            length,
            last: bytes[0] & 1 == 1,
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn to_bytes(self) -> [u8; 2] {
        [
            ((self.length << 1) & 0xFF) as u8 | u8::from(self.last),
            (self.length >> 7) as u8,
        ]
    }
}

/// Classification of a protocol line by its leading characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineType {
    /// `!` server error
    Error,
    /// `#` informational line
    Info,
    /// `%` result-set header (column metadata)
    Header,
    /// `&` result-set envelope
    Envelope,
    /// `[` data row
    Data,
    /// `^` redirect
    Redirect,
    /// `.` prompt
    Prompt,
    /// `\x01\x02` server wants more input
    Continuation,
    /// Anything else, including an empty line
    Other,
}

impl LineType {
    pub fn from_line(line: &str) -> Self {
        if line.starts_with(CONTINUATION_MARKER) {
            return LineType::Continuation;
        }
        match line.as_bytes().first() {
            Some(b'!') => LineType::Error,
            Some(b'#') => LineType::Info,
            Some(b'%') => LineType::Header,
            Some(b'&') => LineType::Envelope,
            Some(b'[') => LineType::Data,
            Some(b'^') => LineType::Redirect,
            Some(b'.') => LineType::Prompt,
            _ => LineType::Other,
        }
    }
}

/// Kind of result announced by an `&` envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    /// `&1` tabular result
    Table,
    /// `&2` row count of an INSERT/UPDATE/DELETE
    Update,
    /// `&3` schema change
    Schema,
    /// `&4` transaction state change
    Transaction,
    /// `&5` prepared statement description
    Prepare,
    /// `&6` continuation block of an earlier table
    Block,
}

impl QueryKind {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            b'1' => QueryKind::Table,
            b'2' => QueryKind::Update,
            b'3' => QueryKind::Schema,
            b'4' => QueryKind::Transaction,
            b'5' => QueryKind::Prepare,
            b'6' => QueryKind::Block,
            _ => return None,
        })
    }

    /// Does an envelope of this kind precede header and data lines?
    pub fn has_rows(self) -> bool {
        matches!(self, QueryKind::Table | QueryKind::Prepare | QueryKind::Block)
    }
}
