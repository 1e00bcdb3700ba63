//! Client session
//!
//! A [`Session`] owns one logged-in connection. It runs statements, keeps
//! track of the auto-commit mode and savepoints, and hands out at most one
//! [`ResultCursor`] at a time.

use log::{debug, info};
use mapi_core::config::Language;
use mapi_core::error::{MapiError, Result};
use mapi_core::protocol::{encode_statement, Command, RawRow, ResponseMessage, ResultHeader};
use mapi_core::ConnectionParams;

use crate::auth;
use crate::channel::Channel;
use crate::cursor::ResultCursor;
use crate::transaction::{TransactionState, TransactionTracker};
use crate::transport::{MapiStream, Transport};

/// Outcome of a statement
#[derive(Debug)]
pub enum StatementResult {
    /// Rows of a query
    Rows(ResultCursor),

    /// Rows changed by a data modification
    Affected {
        /// Number of affected rows
        count: i64,

        /// Last generated identity value, if any
        last_id: Option<i64>,
    },

    /// Schema change acknowledged
    SchemaChanged,

    /// Transaction status reported by the server
    Transaction {
        /// Whether the server is in auto-commit mode
        auto_commit: bool,
    },

    /// Statement completed without a result
    Done,
}

impl StatementResult {
    /// The cursor, if the statement produced rows
    pub fn into_cursor(self) -> Option<ResultCursor> {
        match self {
            StatementResult::Rows(cursor) => Some(cursor),
            _ => None,
        }
    }

    /// Affected row count, if the statement modified data
    pub fn affected_rows(&self) -> Option<i64> {
        match self {
            StatementResult::Affected { count, .. } => Some(*count),
            _ => None,
        }
    }
}

/// A logged-in connection to the server
#[derive(Debug)]
pub struct Session {
    params: ConnectionParams,
    channel: Channel,
    tracker: TransactionTracker,
    reply_size: i64,
}

impl Session {
    /// Connect over TCP and log in
    pub async fn connect(params: ConnectionParams) -> Result<Self> {
        params.validate()?;
        let transport = Transport::connect(&params).await?;
        Self::establish(transport, params).await
    }

    /// Log in over an already open stream
    pub async fn connect_with_stream<S: MapiStream + 'static>(
        stream: S,
        params: ConnectionParams,
    ) -> Result<Self> {
        params.validate()?;
        let transport = Transport::from_stream(stream, &params.address(), params.read_timeout());
        let transport = auth::authenticate(transport, &params).await?;
        Self::establish(transport, params).await
    }

    async fn establish(transport: Transport, params: ConnectionParams) -> Result<Self> {
        let mut session = Self {
            reply_size: params.reply_size,
            params,
            channel: Channel::new(transport),
            tracker: TransactionTracker::new(),
        };

        if session.params.language == Language::Sql {
            session.command(Command::ReplySize(session.reply_size)).await?;
        }
        info!(
            "Session open on {} (database {})",
            session.params.address(),
            session.params.database
        );
        Ok(session)
    }

    /// Run a statement
    ///
    /// The text is sent verbatim; transaction bookkeeping is not touched,
    /// even for `COMMIT` or `SAVEPOINT` statements. Fails with a state error
    /// while a result cursor from an earlier statement is still open.
    pub async fn query(&mut self, sql: &str) -> Result<StatementResult> {
        self.channel.ensure_idle()?;
        debug!("Executing: {}", sql);

        let payload = encode_statement(self.params.language, sql);
        let messages = self
            .channel
            .request(payload)
            .await
            .map_err(|e| e.with_sql(sql))?;
        self.interpret(messages).map_err(|e| e.with_sql(sql))
    }

    /// Turn auto-commit on or off
    ///
    /// Turning it on commits any open transaction and forgets all savepoints.
    pub async fn auto_commit(&mut self, on: bool) -> Result<()> {
        self.command(Command::AutoCommit(on)).await?;
        self.tracker.set_auto_commit(on);
        Ok(())
    }

    /// Whether every statement commits on its own
    pub fn is_auto_commit(&self) -> bool {
        self.tracker.is_auto_commit()
    }

    /// Current transaction state
    pub fn transaction_state(&self) -> TransactionState {
        self.tracker.state()
    }

    /// Push a savepoint and return its name
    ///
    /// Inside a transaction this also issues `SAVEPOINT <name>`. In
    /// auto-commit mode only the name is recorded.
    pub async fn save(&mut self) -> Result<String> {
        if self.tracker.is_auto_commit() {
            return Ok(self.tracker.push_savepoint());
        }
        self.begin_savepoint().await
    }

    /// Pop the most recent savepoint without sending anything
    pub fn release(&mut self) -> Result<String> {
        self.tracker.pop_savepoint()
    }

    /// Create a savepoint inside the current transaction
    pub async fn begin_savepoint(&mut self) -> Result<String> {
        if self.tracker.is_auto_commit() {
            return Err(MapiError::State(
                "savepoints need a transaction; turn auto-commit off first".to_string(),
            ));
        }
        let name = self.tracker.next_savepoint();
        self.execute(&format!("SAVEPOINT {}", name)).await?;
        Ok(self.tracker.push_savepoint())
    }

    /// Commit the current transaction
    pub async fn commit(&mut self) -> Result<()> {
        self.execute("COMMIT").await?;
        self.tracker.clear_savepoints();
        Ok(())
    }

    /// Roll the current transaction back
    pub async fn rollback(&mut self) -> Result<()> {
        self.execute("ROLLBACK").await?;
        self.tracker.clear_savepoints();
        Ok(())
    }

    /// Roll back to the most recent savepoint, which stays open
    pub async fn rollback_to(&mut self) -> Result<()> {
        let name = self
            .tracker
            .current_savepoint()
            .ok_or_else(|| MapiError::State("no savepoint to roll back to".to_string()))?
            .to_string();
        self.execute(&format!("ROLLBACK TO SAVEPOINT {}", name)).await
    }

    /// Release the most recent savepoint on the server and pop it
    pub async fn release_savepoint(&mut self) -> Result<String> {
        let name = self
            .tracker
            .current_savepoint()
            .ok_or_else(|| MapiError::State("no savepoint to release".to_string()))?
            .to_string();
        self.execute(&format!("RELEASE SAVEPOINT {}", name)).await?;
        self.tracker.pop_savepoint()
    }

    /// Number of open savepoints
    pub fn transactions(&self) -> usize {
        self.tracker.depth()
    }

    /// Name of the most recent savepoint
    pub fn savepoint(&self) -> Option<&str> {
        self.tracker.current_savepoint()
    }

    /// Change the number of rows the server sends per block
    pub async fn set_reply_size(&mut self, reply_size: i64) -> Result<()> {
        if reply_size == 0 || reply_size < -1 {
            return Err(MapiError::State(format!(
                "reply size must be positive or -1, got {}",
                reply_size
            )));
        }
        self.command(Command::ReplySize(reply_size)).await?;
        self.reply_size = reply_size;
        Ok(())
    }

    /// Rows per block currently requested from the server
    pub fn reply_size(&self) -> i64 {
        self.reply_size
    }

    /// Parameters the session was opened with
    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }

    /// Whether the session was closed or invalidated by a fatal error
    pub fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }

    /// Close the session. Open cursors fail with `ConnectionClosed`
    /// afterwards. Calling this again has no effect.
    pub async fn close(&mut self) -> Result<()> {
        if !self.channel.is_closed() {
            info!("Closing session on {}", self.params.address());
        }
        self.channel.close().await
    }

    /// Run a control statement, discarding any rows
    async fn execute(&mut self, sql: &str) -> Result<()> {
        if let StatementResult::Rows(mut cursor) = self.query(sql).await? {
            cursor.free().await?;
        }
        Ok(())
    }

    async fn command(&mut self, command: Command) -> Result<()> {
        self.channel.ensure_idle()?;
        debug!("Sending command: {}", command);
        let messages = self.channel.request(command.encode()).await?;
        for message in messages {
            if let ResponseMessage::Error { code, message } = message {
                return Err(MapiError::Server {
                    code,
                    message,
                    sql: Some(format!("X{}", command)),
                });
            }
        }
        Ok(())
    }

    /// Turn the messages of one response into a statement result.
    ///
    /// An error anywhere wins. Otherwise the last result counts; result sets
    /// before it are closed on the server.
    fn interpret(&mut self, messages: Vec<ResponseMessage>) -> Result<StatementResult> {
        let mut error = None;
        let mut result = None;

        for message in messages {
            let next = match message {
                ResponseMessage::Error { code, message } => {
                    if error.is_none() {
                        error = Some(MapiError::Server { code, message, sql: None });
                    }
                    continue;
                }
                ResponseMessage::RowSet { header, rows } => PendingResult::Rows(header, rows),
                ResponseMessage::AffectedCount { count, last_id } => {
                    PendingResult::Ready(StatementResult::Affected { count, last_id })
                }
                ResponseMessage::SchemaChange => PendingResult::Ready(StatementResult::SchemaChanged),
                ResponseMessage::Transaction { auto_commit } => {
                    PendingResult::Ready(StatementResult::Transaction { auto_commit })
                }
                ResponseMessage::RowBlock { id, .. } => {
                    return Err(MapiError::Protocol(format!(
                        "unsolicited row block for result {}",
                        id
                    )))
                }
                ResponseMessage::Redirect(url) => {
                    return Err(MapiError::Protocol(format!("unexpected redirect to {}", url)))
                }
                ResponseMessage::Info(text) => {
                    debug!("Server info: {}", text);
                    continue;
                }
                ResponseMessage::EndOfResults => continue,
            };

            if let Some(PendingResult::Rows(previous, _)) = result.replace(next) {
                if previous.is_paginated() {
                    self.channel.defer_close(previous.id);
                }
            }
        }

        if let Some(error) = error {
            if let Some(PendingResult::Rows(header, _)) = result {
                if header.is_paginated() {
                    self.channel.defer_close(header.id);
                }
            }
            return Err(error);
        }

        match result {
            Some(PendingResult::Rows(header, rows)) => {
                let token = self.channel.acquire_cursor()?;
                Ok(StatementResult::Rows(ResultCursor::new(
                    self.channel.clone(),
                    token,
                    header,
                    rows,
                    self.reply_size,
                    self.params.type_cast,
                )))
            }
            Some(PendingResult::Ready(result)) => Ok(result),
            None => Ok(StatementResult::Done),
        }
    }
}

enum PendingResult {
    Rows(ResultHeader, Vec<RawRow>),
    Ready(StatementResult),
}
