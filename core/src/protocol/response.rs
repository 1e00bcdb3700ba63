//! Response decoding
//!
//! A server response is a block of text lines. The first character of each
//! line tells what it is:
//!
//! * `&1`/`&5` result set header, followed by `%` column metadata lines and
//!   the first batch of tuples
//! * `&2` affected row count, `&3` schema change, `&4` transaction status
//! * `&6` continuation block of a result set, answered to `Xexport`
//! * `!` error, `#` informational, `^` redirect
//! * `[`/`=` tuple lines

use log::debug;

use crate::error::{to_protocol_error, MapiError, Result};
use crate::protocol::tuple::{parse_tuple, RawRow};
use crate::value::Column;

/// Kind of result set header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    /// Rows of a query (`&1`)
    Query,

    /// Description of a prepared statement (`&5`)
    Prepare,
}

/// Header of a result set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultHeader {
    /// Server-side result id, used to request further blocks
    pub id: i64,

    /// Kind of result
    pub kind: ResultKind,

    /// Total number of rows in the result
    pub row_count: usize,

    /// Number of columns
    pub column_count: usize,

    /// Number of rows carried by the first block
    pub tuple_count: usize,

    /// Column metadata
    pub columns: Vec<Column>,
}

impl ResultHeader {
    /// Whether the server still holds rows that were not sent yet
    pub fn is_paginated(&self) -> bool {
        self.tuple_count < self.row_count
    }
}

/// A decoded server message
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseMessage {
    /// Result set header plus the rows of its first block
    RowSet {
        /// Header
        header: ResultHeader,

        /// Rows received so far
        rows: Vec<RawRow>,
    },

    /// Further rows of a result set
    RowBlock {
        /// Result id
        id: i64,

        /// Position of the first row of this block
        offset: usize,

        /// Rows
        rows: Vec<RawRow>,
    },

    /// Number of rows affected by a data modification
    AffectedCount {
        /// Affected rows
        count: i64,

        /// Last generated identity value, if any
        last_id: Option<i64>,
    },

    /// Schema change acknowledged
    SchemaChange,

    /// Transaction status report
    Transaction {
        /// Whether the server is now in auto-commit mode
        auto_commit: bool,
    },

    /// Error reported by the server
    Error {
        /// SQLSTATE (empty when the server did not send one)
        code: String,

        /// Message, one line per error line received
        message: String,
    },

    /// Informational line
    Info(String),

    /// Redirect issued during login
    Redirect(String),

    /// Plain prompt: the response carried nothing else
    EndOfResults,
}

/// Decode a complete response message
pub fn decode_response(payload: &[u8]) -> Result<Vec<ResponseMessage>> {
    let text = std::str::from_utf8(payload).map_err(to_protocol_error)?;
    ResponseParser::new(text).parse()
}

struct ResponseParser<'a> {
    lines: std::iter::Peekable<std::str::Lines<'a>>,
    messages: Vec<ResponseMessage>,
}

impl<'a> ResponseParser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            lines: text.lines().peekable(),
            messages: Vec::new(),
        }
    }

    fn parse(mut self) -> Result<Vec<ResponseMessage>> {
        while let Some(line) = self.lines.next() {
            if line.is_empty() {
                continue;
            }

            match line.as_bytes()[0] {
                b'!' => self.parse_error(line),
                b'#' => {
                    debug!("server info: {}", line);
                    self.messages.push(ResponseMessage::Info(line[1..].trim().to_string()));
                }
                b'^' => self.messages.push(ResponseMessage::Redirect(line[1..].to_string())),
                b'&' => self.parse_header(line)?,
                b'[' | b'=' => {
                    return Err(MapiError::Protocol(
                        "tuple received outside of a result set".to_string(),
                    ))
                }
                _ => {
                    return Err(MapiError::Protocol(format!("unexpected response line: {}", line)));
                }
            }
        }

        if self.messages.is_empty() {
            self.messages.push(ResponseMessage::EndOfResults);
        }
        Ok(self.messages)
    }

    fn parse_error(&mut self, first: &str) {
        let (code, first_message) = split_error_code(&first[1..]);
        let mut message = first_message.to_string();

        // Consecutive error lines belong to the same error
        while let Some(&next) = self.lines.peek() {
            match next.strip_prefix('!') {
                Some(rest) => {
                    let (_, text) = split_error_code(rest);
                    message.push('\n');
                    message.push_str(text);
                    self.lines.next();
                }
                None => break,
            }
        }

        self.messages.push(ResponseMessage::Error {
            code: code.to_string(),
            message,
        });
    }

    fn parse_header(&mut self, line: &str) -> Result<()> {
        let mut fields = line.split_whitespace();
        let tag = fields.next().unwrap_or_default();
        let numbers: Vec<&str> = fields.collect();

        match tag {
            "&1" | "&5" => {
                let kind = if tag == "&1" { ResultKind::Query } else { ResultKind::Prepare };
                let id = parse_field(&numbers, 0, line)?;
                let row_count = parse_count(&numbers, 1, line)?;
                let column_count = parse_count(&numbers, 2, line)?;
                let tuple_count = parse_count(&numbers, 3, line)?;

                let columns = self.parse_columns(column_count)?;
                let rows = self.parse_tuples(column_count, tuple_count)?;

                self.messages.push(ResponseMessage::RowSet {
                    header: ResultHeader {
                        id,
                        kind,
                        row_count,
                        column_count,
                        tuple_count,
                        columns,
                    },
                    rows,
                });
            }
            "&2" => {
                let count = parse_field(&numbers, 0, line)?;
                let last_id = match numbers.get(1) {
                    Some(raw) => {
                        let value: i64 = raw.parse().map_err(|_| malformed(line))?;
                        (value >= 0).then_some(value)
                    }
                    None => None,
                };
                self.messages.push(ResponseMessage::AffectedCount { count, last_id });
            }
            "&3" => self.messages.push(ResponseMessage::SchemaChange),
            "&4" => {
                let auto_commit = match numbers.first().copied() {
                    Some("t") => true,
                    Some("f") => false,
                    _ => return Err(malformed(line)),
                };
                self.messages.push(ResponseMessage::Transaction { auto_commit });
            }
            "&6" => {
                let id = parse_field(&numbers, 0, line)?;
                let column_count = parse_count(&numbers, 1, line)?;
                let tuple_count = parse_count(&numbers, 2, line)?;
                let offset = parse_count(&numbers, 3, line)?;
                let rows = self.parse_tuples(column_count, tuple_count)?;
                self.messages.push(ResponseMessage::RowBlock { id, offset, rows });
            }
            _ => return Err(MapiError::Protocol(format!("unknown response header: {}", line))),
        }
        Ok(())
    }

    fn parse_columns(&mut self, column_count: usize) -> Result<Vec<Column>> {
        let mut tables = Vec::new();
        let mut names = Vec::new();
        let mut types = Vec::new();
        let mut lengths = Vec::new();

        while let Some(&line) = self.lines.peek() {
            let Some(body) = line.strip_prefix('%') else {
                break;
            };
            self.lines.next();

            let (values, tag) = body
                .rsplit_once('#')
                .ok_or_else(|| MapiError::Protocol(format!("malformed header line: {}", line)))?;
            let values: Vec<String> = values
                .trim()
                .split(",\t")
                .map(|v| v.trim().to_string())
                .collect();

            match tag.trim() {
                "table_name" => tables = values,
                "name" => names = values,
                "type" => types = values,
                "length" => lengths = values,
                other => debug!("ignoring header line tagged {}", other),
            }
        }

        if names.len() != column_count || types.len() != column_count {
            return Err(MapiError::Protocol(format!(
                "result header describes {} names and {} types for {} columns",
                names.len(),
                types.len(),
                column_count
            )));
        }

        let columns = names
            .iter()
            .zip(types.iter())
            .enumerate()
            .map(|(i, (name, type_name))| {
                let mut column = Column::new(name, type_name);
                column.table = tables.get(i).cloned().unwrap_or_default();
                column.length = lengths.get(i).and_then(|l| l.parse().ok());
                column
            })
            .collect();
        Ok(columns)
    }

    fn parse_tuples(&mut self, column_count: usize, tuple_count: usize) -> Result<Vec<RawRow>> {
        let mut rows = Vec::with_capacity(tuple_count);
        while let Some(&line) = self.lines.peek() {
            if !(line.starts_with('[') || line.starts_with('=')) {
                break;
            }
            rows.push(parse_tuple(line, column_count)?);
            self.lines.next();
        }

        if rows.len() != tuple_count {
            return Err(MapiError::Protocol(format!(
                "expected {} tuples in block, received {}",
                tuple_count,
                rows.len()
            )));
        }
        Ok(rows)
    }
}

/// Split `SQLSTATE!message` into its parts.
fn split_error_code(text: &str) -> (&str, &str) {
    match text.split_once('!') {
        Some((code, message))
            if code.len() == 5 && code.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            (code, message)
        }
        _ => ("", text),
    }
}

fn parse_field(fields: &[&str], index: usize, line: &str) -> Result<i64> {
    fields
        .get(index)
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| malformed(line))
}

fn parse_count(fields: &[&str], index: usize, line: &str) -> Result<usize> {
    fields
        .get(index)
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| malformed(line))
}

fn malformed(line: &str) -> MapiError {
    MapiError::Protocol(format!("malformed response header: {}", line))
}
