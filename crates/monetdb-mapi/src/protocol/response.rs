//! Decoding of the server's response to one SQL message.
//!
//! A response is a run of lines ending with the prompt:
//!
//! ```text
//! &1 0 3 2 3                      envelope: id, tuples, columns, rows
//! % sys.t,\tsys.t # table_name    one header line per column attribute
//! % id,\tname # name
//! % int,\tvarchar # type
//! % 1,\t3 # length
//! [ 1,\t"ada"\t]                  data rows
//! .                               prompt
//! ```
//!
//! [`ResultStream`] walks these lines lazily. Each call to
//! [`ResultStream::next_result`] yields a [`ResultSet`] that borrows the
//! stream and yields its rows on demand, so the stream cannot advance to
//! the next result set while a row iterator is alive. Rows left unread are
//! skipped when the next result set is requested, and dropping the stream
//! drains the rest of the response so the session stays in sync.

use std::sync::Arc;

use monetdb_core::error::{ProtocolError, ServerError, TypeError};
use monetdb_core::{ColumnInfo, Error, Result, Row};

use super::{LineType, PROMPT, QueryKind, lexer};
use crate::types;

/// A source of protocol lines, with the session hooks the decoder drives.
pub trait LineSource {
    /// Read the next line without its terminator; `None` at end of stream.
    fn read_line(&mut self) -> Result<Option<String>>;

    /// The server asked for more input before it can answer.
    fn set_needs_continuation(&mut self) {}

    /// The server reported the id it assigned to the running query.
    fn set_process_id(&mut self, _id: i64) {}

    /// Decoding failed in a way that leaves the line stream out of sync.
    fn set_broken(&mut self) {}
}

impl<T: LineSource + ?Sized> LineSource for &mut T {
    fn read_line(&mut self) -> Result<Option<String>> {
        (**self).read_line()
    }

    fn set_needs_continuation(&mut self) {
        (**self).set_needs_continuation();
    }

    fn set_process_id(&mut self, id: i64) {
        (**self).set_process_id(id);
    }

    fn set_broken(&mut self) {
        (**self).set_broken();
    }
}

/// Column metadata assembled from `%` header lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Column {
    pub table_name: String,
    pub name: String,
    pub type_name: String,
    pub length: u32,
}

/// Descriptor of one result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultInfo {
    pub id: i64,
    pub kind: QueryKind,
    /// Total tuples in the result, as announced by the envelope
    pub tuple_count: i64,
    /// Columns announced by the envelope, or the header column count
    pub column_count: usize,
    /// Rows carried by this reply
    pub row_count: i64,
    /// Rows changed by the statement; -1 for tabular results
    pub affected_rows: i64,
    /// Last generated id reported by an `&2` envelope
    pub last_id: Option<i64>,
    pub columns: Vec<Column>,
}

impl ResultInfo {
    fn empty(kind: QueryKind, affected_rows: i64, last_id: Option<i64>) -> Self {
        Self {
            id: -1,
            kind,
            tuple_count: 0,
            column_count: 0,
            row_count: 0,
            affected_rows,
            last_id,
            columns: Vec::new(),
        }
    }

    fn table(id: i64) -> Self {
        Self {
            id,
            ..Self::empty(QueryKind::Table, -1, None)
        }
    }

    /// Column names shared by decoded rows.
    pub fn column_info(&self) -> Arc<ColumnInfo> {
        Arc::new(ColumnInfo::new(
            self.columns.iter().map(|c| c.name.clone()).collect(),
        ))
    }
}

/// One data row as raw tokens.
///
/// Tokens keep their wire form: strings are still quoted and escaped, and
/// SQL NULL is the unquoted `NULL` or `null` token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow {
    tokens: Vec<String>,
}

impl RawRow {
    pub fn new(tokens: Vec<String>) -> Self {
        Self { tokens }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Raw token at `index`.
    pub fn get(&self, index: usize) -> Option<&str> {
        self.tokens.get(index).map(String::as_str)
    }

    pub fn is_null(&self, index: usize) -> bool {
        self.get(index).is_some_and(types::is_null_token)
    }

    /// Tokens with SQL NULL mapped to `None`.
    pub fn fields(&self) -> impl Iterator<Item = Option<&str>> {
        self.tokens
            .iter()
            .map(|t| (!types::is_null_token(t)).then_some(t.as_str()))
    }

    /// Token at `index` with quotes and escapes removed.
    pub fn text(&self, index: usize) -> Result<Option<String>> {
        match self.get(index) {
            None => Ok(None),
            Some(t) if types::is_null_token(t) => Ok(None),
            Some(t) => types::unescape_string(t).map(Some),
        }
    }

    pub fn into_tokens(self) -> Vec<String> {
        self.tokens
    }

    /// Decode every token by its column's declared type.
    pub fn decode(&self, columns: &[Column], info: &Arc<ColumnInfo>) -> Result<Row> {
        let values = self
            .tokens
            .iter()
            .enumerate()
            .map(|(i, token)| {
                let column = columns.get(i);
                let type_name = column.map_or("varchar", |c| c.type_name.as_str());
                types::decode_token(type_name, token).map_err(|e| match e {
                    Error::Type(te) => Error::Type(TypeError {
                        column: column.map(|c| c.name.clone()),
                        ..te
                    }),
                    e => e,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Row::with_columns(Arc::clone(info), values))
    }
}

/// A fully read result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResult {
    pub info: ResultInfo,
    pub rows: Vec<RawRow>,
}

impl QueryResult {
    /// Decode all rows into typed values.
    pub fn decoded_rows(&self) -> Result<Vec<Row>> {
        let info = self.info.column_info();
        self.rows
            .iter()
            .map(|row| row.decode(&self.info.columns, &info))
            .collect()
    }
}

/// Lazy sequence of result sets over one response.
pub struct ResultStream<S: LineSource> {
    source: S,
    lookahead: Option<String>,
    headers: Vec<String>,
    pending: Option<ResultInfo>,
    last_kind: Option<QueryKind>,
    affected_rows: i64,
    last_id: Option<i64>,
    produced: usize,
    first: bool,
    in_rows: bool,
    done: bool,
    /// The prompt ending the response has been consumed, or the stream is dead.
    synced: bool,
    sql: Option<String>,
}

impl<S: LineSource> ResultStream<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            lookahead: None,
            headers: Vec::new(),
            pending: None,
            last_kind: None,
            affected_rows: 0,
            last_id: None,
            produced: 0,
            first: true,
            in_rows: false,
            done: false,
            synced: false,
            sql: None,
        }
    }

    /// Attach the statement text to server errors raised by this stream.
    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = Some(sql.into());
        self
    }

    /// Advance to the next result set.
    ///
    /// Unread rows of the previous result set are skipped. Returns
    /// `Ok(None)` once the response is exhausted.
    pub fn next_result(&mut self) -> Result<Option<ResultSet<'_, S>>> {
        if self.done {
            return Ok(None);
        }
        if self.in_rows {
            self.skip_rows()?;
        }

        loop {
            let line = self.next_line()?;
            let first = std::mem::replace(&mut self.first, false);
            let line_type = LineType::from_line(&line);

            if self.pending.is_some()
                && !matches!(line_type, LineType::Header | LineType::Info | LineType::Data)
            {
                // Header block ended without data: a table with no rows.
                self.lookahead = Some(line);
                return Ok(Some(self.open_set(None)));
            }

            match line_type {
                LineType::Error => return Err(self.read_error(line)),
                LineType::Header | LineType::Info => self.headers.push(line),
                LineType::Envelope => {
                    if let Err(e) = self.read_envelope(&line) {
                        return Err(self.fail(e));
                    }
                }
                LineType::Data => return Ok(Some(self.open_set(Some(line)))),
                LineType::Continuation => self.source.set_needs_continuation(),
                LineType::Prompt => return Ok(self.finish(true)),
                LineType::Redirect | LineType::Other => {
                    if !first {
                        return Ok(self.finish(false));
                    }
                    tracing::trace!(line = %line, "ignoring leading line");
                }
            }
        }
    }

    /// Read every remaining result set into memory.
    pub fn collect_all(mut self) -> Result<Vec<QueryResult>> {
        let mut results = Vec::new();
        while let Some(set) = self.next_result()? {
            let info = set.info().clone();
            let rows = set.collect::<Result<Vec<_>>>()?;
            results.push(QueryResult { info, rows });
        }
        Ok(results)
    }

    fn next_line(&mut self) -> Result<String> {
        if let Some(line) = self.lookahead.take() {
            return Ok(line);
        }
        match self.source.read_line() {
            Ok(Some(line)) => {
                tracing::trace!(line = %line, "response line");
                Ok(line)
            }
            Ok(None) => Err(self.fail(Error::Protocol(ProtocolError {
                message: "unexpected end of stream".to_string(),
                line: None,
                source: None,
            }))),
            Err(e) => {
                self.done = true;
                self.synced = true;
                Err(self.fail(e))
            }
        }
    }

    /// Stop the stream on an error that leaves the source out of sync.
    fn fail(&mut self, error: Error) -> Error {
        if error.is_fatal_to_session() {
            self.done = true;
            self.synced = true;
            self.in_rows = false;
            self.source.set_broken();
        }
        error
    }

    fn skip_rows(&mut self) -> Result<()> {
        while self.in_rows {
            let line = self.next_line()?;
            if !line.starts_with('[') {
                self.lookahead = Some(line);
                self.in_rows = false;
            }
        }
        Ok(())
    }

    /// End the batch; synthesize one empty result if nothing was produced.
    fn finish(&mut self, at_prompt: bool) -> Option<ResultSet<'_, S>> {
        self.done = true;
        self.synced = at_prompt;
        if self.produced > 0 {
            return None;
        }
        self.produced += 1;
        let info = ResultInfo::empty(
            self.last_kind.unwrap_or(QueryKind::Schema),
            self.affected_rows,
            self.last_id,
        );
        Some(ResultSet::new(self, info, None))
    }

    fn open_set(&mut self, first_row: Option<String>) -> ResultSet<'_, S> {
        let mut info = self.pending.take().unwrap_or_else(|| ResultInfo::table(-1));
        info.columns = parse_columns(&self.headers);
        self.headers.clear();
        if info.column_count == 0 {
            info.column_count = info.columns.len();
        }
        self.in_rows = first_row.is_some();
        self.produced += 1;
        ResultSet::new(self, info, first_row)
    }

    fn read_envelope(&mut self, line: &str) -> Result<()> {
        let malformed = || {
            Error::Protocol(ProtocolError {
                message: "malformed result envelope".to_string(),
                line: Some(line.to_string()),
                source: None,
            })
        };
        let kind = line
            .as_bytes()
            .get(1)
            .and_then(|&code| QueryKind::from_code(code))
            .ok_or_else(malformed)?;
        let fields: Vec<&str> = line[2..].split_whitespace().collect();
        let field = |i: usize| -> Result<i64> {
            fields
                .get(i)
                .and_then(|f| f.parse().ok())
                .ok_or_else(malformed)
        };
        self.last_kind = Some(kind);

        match kind {
            QueryKind::Table | QueryKind::Prepare => {
                let column_count = usize::try_from(field(2)?).map_err(|_| malformed())?;
                self.pending = Some(ResultInfo {
                    kind,
                    tuple_count: field(1)?,
                    column_count,
                    row_count: field(3)?,
                    ..ResultInfo::table(field(0)?)
                });
                if let Ok(process_id) = field(4) {
                    self.source.set_process_id(process_id);
                }
            }
            QueryKind::Block => {
                let column_count = usize::try_from(field(1)?).map_err(|_| malformed())?;
                self.pending = Some(ResultInfo {
                    kind,
                    column_count,
                    row_count: field(2)?,
                    ..ResultInfo::table(field(0)?)
                });
            }
            QueryKind::Update => {
                self.affected_rows += field(0)?;
                self.last_id = field(1).ok().filter(|&id| id >= 0);
            }
            QueryKind::Schema | QueryKind::Transaction => {}
        }
        Ok(())
    }

    /// Gather an error block into one server error.
    fn read_error(&mut self, first: String) -> Error {
        let mut message = first[1..].to_string();
        let mut previous = first;
        loop {
            let line = match self.next_line() {
                Ok(line) => line,
                Err(e) => return e,
            };
            if line == PROMPT {
                self.synced = true;
                break;
            }
            // A repeated line means the server is looping; stop here.
            if line == previous {
                break;
            }
            message.push('\n');
            message.push_str(line.strip_prefix('!').unwrap_or(&line));
            previous = line;
        }
        self.done = true;

        let mut error = ServerError::from_server_text(message);
        if let Some(sql) = &self.sql {
            error = error.with_sql(sql.clone());
        }
        tracing::debug!(message = %error.message, sqlstate = ?error.sqlstate, "server error");
        Error::Server(error)
    }
}

impl<S: LineSource> Drop for ResultStream<S> {
    fn drop(&mut self) {
        if self.synced {
            return;
        }
        // Read the rest of the response so the next statement starts clean.
        loop {
            match self.next_line() {
                Ok(line) if line == PROMPT => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "failed to drain response");
                    break;
                }
            }
        }
        self.synced = true;
    }
}

impl<S: LineSource> std::fmt::Debug for ResultStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultStream")
            .field("produced", &self.produced)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

/// One result set, yielding its rows lazily from the underlying stream.
pub struct ResultSet<'a, S: LineSource> {
    stream: &'a mut ResultStream<S>,
    info: ResultInfo,
    first_row: Option<String>,
    column_info: Option<Arc<ColumnInfo>>,
}

impl<'a, S: LineSource> ResultSet<'a, S> {
    fn new(stream: &'a mut ResultStream<S>, info: ResultInfo, first_row: Option<String>) -> Self {
        Self {
            stream,
            info,
            first_row,
            column_info: None,
        }
    }

    pub fn info(&self) -> &ResultInfo {
        &self.info
    }

    pub fn columns(&self) -> &[Column] {
        &self.info.columns
    }

    pub fn affected_rows(&self) -> i64 {
        self.info.affected_rows
    }

    /// Next row decoded into typed values.
    pub fn next_decoded(&mut self) -> Option<Result<Row>> {
        let raw = match self.next()? {
            Ok(raw) => raw,
            Err(e) => return Some(Err(e)),
        };
        let info = self
            .column_info
            .get_or_insert_with(|| self.info.column_info());
        Some(raw.decode(&self.info.columns, info))
    }
}

impl<S: LineSource> Iterator for ResultSet<'_, S> {
    type Item = Result<RawRow>;

    fn next(&mut self) -> Option<Self::Item> {
        let line = match self.first_row.take() {
            Some(line) => line,
            None => {
                if !self.stream.in_rows {
                    return None;
                }
                match self.stream.next_line() {
                    Ok(line) if line.starts_with('[') => line,
                    Ok(line) => {
                        self.stream.lookahead = Some(line);
                        self.stream.in_rows = false;
                        return None;
                    }
                    Err(e) => {
                        self.stream.in_rows = false;
                        return Some(Err(e));
                    }
                }
            }
        };
        Some(
            lexer::parse_row(&line, '[', ']')
                .map(RawRow::new)
                .map_err(|e| self.stream.fail(e)),
        )
    }
}

impl<S: LineSource> std::fmt::Debug for ResultSet<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultSet")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

/// Build the column list from buffered header lines.
///
/// Each line carries one attribute for every column:
/// `% value,\tvalue # key`. Unknown keys and malformed lines are ignored.
fn parse_columns(headers: &[String]) -> Vec<Column> {
    let mut columns: Vec<Column> = Vec::new();
    for line in headers {
        let Some((values, key)) = line[1..].rsplit_once('#') else {
            continue;
        };
        let values: Vec<&str> = values.split(",\t").map(str::trim).collect();
        if columns.is_empty() {
            columns.resize_with(values.len(), Column::default);
        }
        for (column, value) in columns.iter_mut().zip(values) {
            match key.trim() {
                "table_name" => column.table_name = value.to_string(),
                "name" => column.name = value.to_string(),
                "type" => column.type_name = value.to_string(),
                "length" => column.length = value.parse().unwrap_or(0),
                _ => {}
            }
        }
    }
    columns
}
