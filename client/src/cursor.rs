//! Result cursor
//!
//! A cursor hands out the rows of one result set. The server sends the first
//! block together with the header; the remaining blocks are requested with
//! `Xexport` as the caller fetches past what has been received.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use log::debug;
use mapi_core::error::{MapiError, Result};
use mapi_core::protocol::{Command, RawRow, ResponseMessage, ResultHeader, ResultKind};
use mapi_core::{Column, Row, Value};

use crate::channel::Channel;

/// Cursor state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// Rows can be fetched
    Open,

    /// Freed by the caller
    Freed,
}

/// Streaming handle over the rows of a query
pub struct ResultCursor {
    channel: Channel,
    token: u64,
    header: ResultHeader,
    columns: Arc<[Column]>,
    buffer: VecDeque<RawRow>,
    /// Rows received from the server so far
    received: usize,
    /// Rows handed to the caller so far
    position: usize,
    reply_size: i64,
    type_cast: bool,
    state: CursorState,
}

impl fmt::Debug for ResultCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultCursor")
            .field("query_id", &self.header.id)
            .field("num_rows", &self.header.row_count)
            .field("num_fields", &self.header.column_count)
            .field("received", &self.received)
            .field("position", &self.position)
            .field("state", &self.state)
            .finish()
    }
}

impl ResultCursor {
    pub(crate) fn new(
        channel: Channel,
        token: u64,
        header: ResultHeader,
        rows: Vec<RawRow>,
        reply_size: i64,
        type_cast: bool,
    ) -> Self {
        let columns: Arc<[Column]> = header.columns.clone().into();
        Self {
            channel,
            token,
            columns,
            received: rows.len(),
            buffer: rows.into(),
            header,
            position: 0,
            reply_size,
            type_cast,
            state: CursorState::Open,
        }
    }

    /// Next row, or `None` once every row has been fetched
    pub async fn fetch(&mut self) -> Result<Option<Row>> {
        self.check_usable()?;

        if self.buffer.is_empty() && self.received < self.header.row_count {
            self.fetch_block().await?;
        }

        match self.buffer.pop_front() {
            Some(raw) => {
                self.position += 1;
                self.convert(raw).map(Some)
            }
            None => Ok(None),
        }
    }

    /// All remaining rows
    pub async fn fetch_all(&mut self) -> Result<Vec<Row>> {
        let mut rows = Vec::with_capacity(self.header.row_count.saturating_sub(self.position));
        while let Some(row) = self.fetch().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Next row as a column name to value mapping.
    ///
    /// When two columns share a name the first one wins.
    pub async fn fetch_hash(&mut self) -> Result<Option<HashMap<String, Value>>> {
        Ok(self.fetch().await?.map(|row| row.to_map()))
    }

    /// All remaining rows, grouped by column name.
    ///
    /// Values keep row order. When two columns share a name the first one
    /// wins, as with [`Row::get_by_name`].
    pub async fn fetch_all_hash(&mut self) -> Result<HashMap<String, Vec<Value>>> {
        let mut first_index: Vec<(String, usize)> = Vec::new();
        for (i, column) in self.columns.iter().enumerate() {
            if !first_index.iter().any(|(name, _)| *name == column.name) {
                first_index.push((column.name.clone(), i));
            }
        }

        let rows = self.fetch_all().await?;
        let mut hash: HashMap<String, Vec<Value>> = first_index
            .iter()
            .map(|(name, _)| (name.clone(), Vec::with_capacity(rows.len())))
            .collect();
        for row in rows {
            let mut values = row.into_values();
            for (name, i) in &first_index {
                let value = std::mem::replace(&mut values[*i], Value::Null);
                if let Some(column) = hash.get_mut(name) {
                    column.push(value);
                }
            }
        }
        Ok(hash)
    }

    /// Release the result. Calling this again has no effect.
    ///
    /// Sends `Xclose` when the server still holds undelivered rows.
    pub async fn free(&mut self) -> Result<()> {
        if self.state == CursorState::Freed {
            return Ok(());
        }
        self.state = CursorState::Freed;
        self.buffer.clear();
        let incomplete = self.is_incomplete();
        self.channel.release_cursor(self.token, None);

        if incomplete && !self.channel.is_closed() {
            debug!("Closing result {}", self.header.id);
            let messages = self.channel.request(Command::Close(self.header.id).encode()).await?;
            check_errors(messages)?;
        }
        Ok(())
    }

    /// Column names
    pub fn name_fields(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Column type names as reported by the server
    pub fn type_fields(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.type_name.as_str()).collect()
    }

    /// Column metadata
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Number of columns
    pub fn num_fields(&self) -> usize {
        self.header.column_count
    }

    /// Total number of rows in the result
    pub fn num_rows(&self) -> usize {
        self.header.row_count
    }

    /// Server-side result id
    pub fn query_id(&self) -> i64 {
        self.header.id
    }

    /// Whether this is a prepared statement description
    pub fn kind(&self) -> ResultKind {
        self.header.kind
    }

    /// Rows handed out so far
    pub fn position(&self) -> usize {
        self.position
    }

    /// Current state
    pub fn state(&self) -> CursorState {
        self.state
    }

    fn check_usable(&self) -> Result<()> {
        if self.state == CursorState::Freed {
            return Err(MapiError::State("result cursor has been freed".to_string()));
        }
        if self.channel.is_closed() {
            return Err(MapiError::ConnectionClosed);
        }
        Ok(())
    }

    fn is_incomplete(&self) -> bool {
        self.received < self.header.row_count
    }

    async fn fetch_block(&mut self) -> Result<()> {
        let remaining = self.header.row_count - self.received;
        let count = if self.reply_size > 0 {
            remaining.min(self.reply_size as usize)
        } else {
            remaining
        };
        debug!(
            "Requesting rows {}..{} of result {}",
            self.received,
            self.received + count,
            self.header.id
        );

        let command = Command::Export {
            id: self.header.id,
            offset: self.received,
            count,
        };
        let messages = self.channel.request(command.encode()).await?;

        let mut got_rows = false;
        for message in messages {
            match message {
                ResponseMessage::RowBlock { id, offset, rows } => {
                    if id != self.header.id || offset != self.received {
                        return Err(self.invalidate(format!(
                            "expected rows of result {} at {}, got result {} at {}",
                            self.header.id, self.received, id, offset
                        )).await);
                    }
                    if rows.is_empty() {
                        return Err(self.invalidate(format!(
                            "empty block for result {} at {}",
                            id, offset
                        )).await);
                    }
                    if let Some(row) = rows.iter().find(|row| row.len() != self.columns.len()) {
                        let message = format!(
                            "block for result {} at {} has rows of {} columns, expected {}",
                            id,
                            offset,
                            row.len(),
                            self.columns.len()
                        );
                        return Err(self.invalidate(message).await);
                    }
                    got_rows = true;
                    self.received += rows.len();
                    self.buffer.extend(rows);
                }
                ResponseMessage::Error { code, message } => {
                    return Err(MapiError::Server { code, message, sql: Some(command.to_string()) });
                }
                _ => {}
            }
        }

        if !got_rows {
            return Err(self
                .invalidate(format!("no rows received for result {}", self.header.id))
                .await);
        }
        Ok(())
    }

    /// The stream is out of step with the cursor; drop the connection
    async fn invalidate(&self, message: String) -> MapiError {
        let _ = self.channel.close().await;
        MapiError::Protocol(message)
    }

    fn convert(&self, raw: RawRow) -> Result<Row> {
        let values = self
            .columns
            .iter()
            .zip(raw.iter())
            .map(|(column, cell)| Value::from_cell(&column.column_type, cell.as_deref(), self.type_cast))
            .collect::<Result<Vec<_>>>()?;
        Ok(Row::new(Arc::clone(&self.columns), values))
    }
}

impl Drop for ResultCursor {
    fn drop(&mut self) {
        if self.state == CursorState::Open {
            let close = self.is_incomplete().then_some(self.header.id);
            self.channel.release_cursor(self.token, close);
        }
    }
}

fn check_errors(messages: Vec<ResponseMessage>) -> Result<()> {
    for message in messages {
        if let ResponseMessage::Error { code, message } = message {
            return Err(MapiError::Server { code, message, sql: None });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::StatementResult;
    use crate::testing::{connect_to, test_params, FakeServer};

    async fn select(
        server: FakeServer,
        reply_size: i64,
    ) -> (crate::session::Session, crate::testing::ServerLog, ResultCursor) {
        let (mut session, log) = connect_to(server, test_params().with_reply_size(reply_size)).await;
        let cursor = match session.query("SELECT * FROM numbers").await.unwrap() {
            StatementResult::Rows(cursor) => cursor,
            other => panic!("Expected rows, got {:?}", other),
        };
        (session, log, cursor)
    }

    #[tokio::test]
    async fn test_metadata_before_fetch() {
        let server = FakeServer::new().with_table(
            "numbers",
            &[("id", "int"), ("label", "varchar")],
            vec![vec![Some("1".to_string()), Some("one".to_string())]],
        );
        let (_session, _log, cursor) = select(server, 100).await;

        assert_eq!(cursor.name_fields(), vec!["id", "label"]);
        assert_eq!(cursor.type_fields(), vec!["int", "varchar"]);
        assert_eq!(cursor.num_fields(), 2);
        assert_eq!(cursor.num_rows(), 1);
        assert_eq!(cursor.columns()[0].table, "sys.numbers");
        assert_eq!(cursor.kind(), ResultKind::Query);
        assert_eq!(cursor.position(), 0);
    }

    #[tokio::test]
    async fn test_counts_match_fetched_rows() {
        let (_session, _log, mut cursor) = select(FakeServer::new().with_numbers("numbers", 7), 100).await;

        let mut fetched = 0;
        while let Some(row) = cursor.fetch().await.unwrap() {
            assert_eq!(row.len(), cursor.num_fields());
            fetched += 1;
        }
        assert_eq!(fetched, cursor.num_rows());
    }

    #[tokio::test]
    async fn test_fetch_after_end_is_repeatable() {
        let (_session, _log, mut cursor) = select(FakeServer::new().with_numbers("numbers", 1), 100).await;

        assert!(cursor.fetch().await.unwrap().is_some());
        assert!(cursor.fetch().await.unwrap().is_none());
        assert!(cursor.fetch().await.unwrap().is_none());
        assert!(cursor.fetch_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pagination_with_export() {
        let (_session, log, mut cursor) = select(FakeServer::new().with_numbers("numbers", 25), 10).await;

        let rows = cursor.fetch_all().await.unwrap();
        let ids: Vec<i64> = rows.iter().map(|r| r[0].as_i64().unwrap()).collect();
        assert_eq!(ids, (1..=25).collect::<Vec<i64>>());

        let id = cursor.query_id();
        assert!(log.received(&format!("Xexport {} 10 10", id)));
        assert!(log.received(&format!("Xexport {} 20 5", id)));
    }

    #[tokio::test]
    async fn test_fetch_hash() {
        let server = FakeServer::new().with_table(
            "numbers",
            &[("id", "int"), ("label", "varchar")],
            vec![
                vec![Some("1".to_string()), Some("one".to_string())],
                vec![Some("2".to_string()), None],
            ],
        );
        let (_session, _log, mut cursor) = select(server, 100).await;

        let first = cursor.fetch_hash().await.unwrap().unwrap();
        assert_eq!(first["id"], Value::Integer(1));
        assert_eq!(first["label"], Value::Text("one".to_string()));

        let second = cursor.fetch_hash().await.unwrap().unwrap();
        assert!(second["label"].is_null());
        assert!(cursor.fetch_hash().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fetch_all_hash() {
        let server = FakeServer::new().with_table(
            "numbers",
            &[("id", "int"), ("label", "varchar")],
            vec![
                vec![Some("1".to_string()), Some("one".to_string())],
                vec![Some("2".to_string()), Some("two".to_string())],
                vec![Some("3".to_string()), Some("three".to_string())],
            ],
        );
        let (_session, _log, mut cursor) = select(server, 2).await;

        let hash = cursor.fetch_all_hash().await.unwrap();
        assert_eq!(hash.len(), 2);
        assert_eq!(
            hash["id"],
            vec![Value::Integer(1), Value::Integer(2), Value::Integer(3)]
        );
        assert_eq!(hash["label"][2], Value::Text("three".to_string()));
    }

    #[tokio::test]
    async fn test_free_is_idempotent() {
        let (mut session, log, mut cursor) = select(FakeServer::new().with_numbers("numbers", 30), 10).await;
        let id = cursor.query_id();

        cursor.free().await.unwrap();
        cursor.free().await.unwrap();
        assert_eq!(cursor.state(), CursorState::Freed);

        let closes = log
            .requests()
            .iter()
            .filter(|r| **r == format!("Xclose {}", id))
            .count();
        assert_eq!(closes, 1);

        assert!(matches!(cursor.fetch().await, Err(MapiError::State(_))));

        // The statement slot is free again
        assert!(matches!(
            session.query("SELECT * FROM numbers").await.unwrap(),
            StatementResult::Rows(_)
        ));
    }

    #[tokio::test]
    async fn test_free_complete_result_sends_nothing() {
        let (_session, log, mut cursor) = select(FakeServer::new().with_numbers("numbers", 3), 100).await;
        let before = log.requests().len();

        cursor.free().await.unwrap();
        assert_eq!(log.requests().len(), before);
    }

    #[tokio::test]
    async fn test_dropped_cursor_closes_lazily() {
        let (mut session, log, cursor) = select(FakeServer::new().with_numbers("numbers", 30), 10).await;
        let id = cursor.query_id();
        drop(cursor);

        assert!(!log.received(&format!("Xclose {}", id)));
        session.query("DROP TABLE numbers").await.unwrap();
        assert!(log.received(&format!("Xclose {}", id)));
    }

    #[tokio::test]
    async fn test_fetch_after_session_close() {
        let (mut session, _log, mut cursor) = select(FakeServer::new().with_numbers("numbers", 3), 100).await;
        session.close().await.unwrap();

        assert!(matches!(cursor.fetch().await, Err(MapiError::ConnectionClosed)));
        // Freeing an aborted cursor is not an error
        cursor.free().await.unwrap();
    }

    #[tokio::test]
    async fn test_untyped_cells() {
        let (mut session, _log) = connect_to(
            FakeServer::new().with_numbers("numbers", 2),
            test_params().with_type_cast(false),
        )
        .await;
        let mut cursor = match session.query("SELECT * FROM numbers").await.unwrap() {
            StatementResult::Rows(cursor) => cursor,
            other => panic!("Expected rows, got {:?}", other),
        };

        let row = cursor.fetch().await.unwrap().unwrap();
        assert_eq!(row[0], Value::Text("1".to_string()));
    }

    #[tokio::test]
    async fn test_short_rows_in_block_are_protocol_error() {
        use crate::transport::Transport;
        use bytes::Bytes;
        use futures_util::{SinkExt, StreamExt};
        use mapi_core::protocol::{decode_response, BlockCodec};
        use tokio_util::codec::Framed;

        let response = "&1 0 2 2 1\n\
% sys.pairs,\tsys.pairs # table_name\n\
% a,\tb # name\n\
% int,\tint # type\n\
% 1,\t1 # length\n\
[ 1,\t2\t]\n";
        let (header, rows) = match decode_response(response.as_bytes()).unwrap().remove(0) {
            ResponseMessage::RowSet { header, rows } => (header, rows),
            other => panic!("Expected a result set, got {:?}", other),
        };

        let (client, server) = tokio::io::duplex(4096);
        let channel = Channel::new(Transport::from_stream(client, "test", None));
        let token = channel.acquire_cursor().unwrap();
        let mut cursor = ResultCursor::new(channel.clone(), token, header, rows, 100, true);

        let server = tokio::spawn(async move {
            let mut framed = Framed::new(server, BlockCodec::new());
            let request = framed.next().await.unwrap().unwrap();
            assert_eq!(&request[..], b"Xexport 0 1 1");
            // One cell where the header declared two
            framed.send(Bytes::from_static(b"&6 0 1 1 1\n[ 2\t]\n")).await.unwrap();
        });

        assert!(cursor.fetch().await.unwrap().is_some());
        match cursor.fetch_all_hash().await {
            Err(MapiError::Protocol(message)) => assert!(message.contains("expected 2")),
            other => panic!("Expected protocol error, got {:?}", other),
        }
        assert!(channel.is_closed());
        server.await.unwrap();
    }
}
