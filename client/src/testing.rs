//! Scripted in-process MAPI server used by the unit tests
//!
//! It performs the real login handshake (verifying the hashed password) and
//! runs a tiny table engine that understands enough SQL for transaction,
//! savepoint and pagination tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use mapi_core::protocol::BlockCodec;
use mapi_core::{ConnectionParams, DigestAlgorithm};
use tokio::io::{duplex, AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use crate::session::Session;

pub(crate) const SALT: &str = "PwQ8Lp0s";

/// How the server behaves during login
#[derive(Debug, Clone)]
pub(crate) enum Handshake {
    /// Protocol 9 with a SHA512 password hash
    Protocol9,

    /// Legacy protocol 8 (plain password hashed with the salt)
    Protocol8,

    /// Answer with this many merovingian proxy redirects before accepting
    Proxied(usize),

    /// Redirect to another server after checking the credentials
    Redirect(String),
}

#[derive(Debug, Default)]
struct LogInner {
    logins: Vec<String>,
    requests: Vec<String>,
}

/// Everything the server saw, shared with the test
#[derive(Debug, Clone, Default)]
pub(crate) struct ServerLog {
    inner: Arc<Mutex<LogInner>>,
}

impl ServerLog {
    /// Accepted logins as `user@database`
    pub(crate) fn logins(&self) -> Vec<String> {
        self.inner.lock().unwrap().logins.clone()
    }

    /// Requests received after login, verbatim
    pub(crate) fn requests(&self) -> Vec<String> {
        self.inner.lock().unwrap().requests.clone()
    }

    /// Whether a request equal to `text` was received
    pub(crate) fn received(&self, text: &str) -> bool {
        self.requests().iter().any(|r| r == text)
    }

    fn record_login(&self, login: String) {
        self.inner.lock().unwrap().logins.push(login);
    }

    fn record_request(&self, request: String) {
        self.inner.lock().unwrap().requests.push(request);
    }
}

#[derive(Debug, Clone, Default)]
struct Table {
    columns: Vec<(String, String)>,
    rows: Vec<Vec<Option<String>>>,
}

type Tables = HashMap<String, Table>;

enum Reply {
    Message(String),
    Hangup,
}

#[derive(Debug, Default)]
struct Engine {
    committed: Tables,
    working: Tables,
    auto_commit: bool,
    savepoints: Vec<(String, Tables)>,
    reply_size: i64,
    results: HashMap<i64, Table>,
    next_result: i64,
}

/// Fake server configuration
pub(crate) struct FakeServer {
    handshake: Handshake,
    hashes: String,
    password: String,
    log: ServerLog,
    engine: Engine,
}

impl FakeServer {
    pub(crate) fn new() -> Self {
        Self {
            handshake: Handshake::Protocol9,
            hashes: "SHA512,SHA384,SHA256,SHA224,SHA1,MD5".to_string(),
            password: "monetdb".to_string(),
            log: ServerLog::default(),
            engine: Engine {
                auto_commit: true,
                reply_size: 100,
                ..Default::default()
            },
        }
    }

    pub(crate) fn with_handshake(mut self, handshake: Handshake) -> Self {
        self.handshake = handshake;
        self
    }

    pub(crate) fn with_hashes(mut self, hashes: &str) -> Self {
        self.hashes = hashes.to_string();
        self
    }

    /// Create a committed table
    pub(crate) fn with_table(
        mut self,
        name: &str,
        columns: &[(&str, &str)],
        rows: Vec<Vec<Option<String>>>,
    ) -> Self {
        let table = Table {
            columns: columns
                .iter()
                .map(|(n, t)| (n.to_string(), t.to_string()))
                .collect(),
            rows,
        };
        self.engine.committed.insert(name.to_string(), table.clone());
        self.engine.working.insert(name.to_string(), table);
        self
    }

    /// Create a table with a single `int` column holding `1..=count`
    pub(crate) fn with_numbers(self, name: &str, count: usize) -> Self {
        let rows = (1..=count).map(|i| vec![Some(i.to_string())]).collect();
        self.with_table(name, &[("id", "int")], rows)
    }

    pub(crate) fn log(&self) -> ServerLog {
        self.log.clone()
    }

    /// Serve one client connection until it goes away
    pub(crate) async fn serve<S: AsyncRead + AsyncWrite + Unpin>(mut self, stream: S) {
        let mut framed = Framed::new(stream, BlockCodec::new());
        if !self.login(&mut framed).await {
            return;
        }

        while let Some(Ok(request)) = framed.next().await {
            let text = String::from_utf8_lossy(&request).to_string();
            self.log.record_request(text.clone());
            let reply = match self.engine.handle(&text) {
                Reply::Message(reply) => reply,
                Reply::Hangup => return,
            };
            if framed.send(Bytes::from(reply)).await.is_err() {
                return;
            }
        }
    }

    async fn login<S: AsyncRead + AsyncWrite + Unpin>(
        &mut self,
        framed: &mut Framed<S, BlockCodec>,
    ) -> bool {
        let protocol = match self.handshake {
            Handshake::Protocol8 => 8,
            _ => 9,
        };
        let mut hops = 0;

        loop {
            let challenge = match protocol {
                8 => format!("{}:mserver:8:{}:LIT:", SALT, self.hashes),
                _ => format!("{}:mserver:9:{}:LIT:SHA512:", SALT, self.hashes),
            };
            if framed.send(Bytes::from(challenge)).await.is_err() {
                return false;
            }

            let response = match framed.next().await {
                Some(Ok(response)) => String::from_utf8_lossy(&response).to_string(),
                _ => return false,
            };

            match self.check_credentials(&response, protocol) {
                Ok(login) => self.log.record_login(login),
                Err(message) => {
                    let _ = framed.send(Bytes::from(format!("!{}\n", message))).await;
                    return false;
                }
            }

            let reply = match &self.handshake {
                Handshake::Proxied(count) if hops < *count => {
                    hops += 1;
                    "^mapi:merovingian://proxy?database=demo\n".to_string()
                }
                Handshake::Redirect(url) => format!("^{}\n", url),
                _ => String::new(),
            };
            let accepted = reply.is_empty();
            let redirected = matches!(self.handshake, Handshake::Redirect(_));
            if framed.send(Bytes::from(reply)).await.is_err() {
                return false;
            }
            if accepted {
                return true;
            }
            if redirected {
                // The client reconnects elsewhere
                let _ = framed.next().await;
                return false;
            }
        }
    }

    fn check_credentials(&self, response: &str, protocol: u32) -> Result<String, String> {
        let fields: Vec<&str> = response.split(':').collect();
        if fields.len() < 5 {
            return Err("InvalidCredentialsException:checkCredentials:malformed login".to_string());
        }
        let (user, hashed, database) = (fields[1], fields[2], fields[4]);

        let (algorithm, hash) = hashed
            .strip_prefix('{')
            .and_then(|rest| rest.split_once('}'))
            .ok_or_else(|| "InvalidCredentialsException:checkCredentials:malformed hash".to_string())?;
        if !self.hashes.split(',').any(|h| h == algorithm) {
            return Err(format!("MALException:checkCredentials:unsupported hash {}", algorithm));
        }
        let digest: DigestAlgorithm = algorithm.parse().map_err(|_| "unknown hash".to_string())?;

        let secret = match protocol {
            8 => self.password.clone(),
            _ => DigestAlgorithm::Sha512.hash_hex(self.password.as_bytes()),
        };
        if digest.salted_hex(&secret, SALT) != hash {
            return Err(format!(
                "InvalidCredentialsException:checkCredentials:invalid credentials for user '{}'",
                user
            ));
        }
        Ok(format!("{}@{}", user, database))
    }
}

impl Engine {
    fn handle(&mut self, request: &str) -> Reply {
        if let Some(command) = request.strip_prefix('X') {
            return Reply::Message(self.command(command));
        }
        match request.strip_prefix('s') {
            Some(sql) => self.statement(sql),
            None => Reply::Message("!42000!only SQL is supported\n".to_string()),
        }
    }

    fn command(&mut self, command: &str) -> String {
        let parts: Vec<&str> = command.split_whitespace().collect();
        let number = |i: usize| parts.get(i).and_then(|p| p.parse::<i64>().ok());

        match parts.first().copied() {
            Some("auto_commit") => {
                let on = number(1) == Some(1);
                if on && !self.auto_commit {
                    self.committed = self.working.clone();
                    self.savepoints.clear();
                }
                self.auto_commit = on;
                String::new()
            }
            Some("reply_size") => {
                self.reply_size = number(1).unwrap_or(100);
                String::new()
            }
            Some("export") => {
                let (Some(id), Some(offset), Some(count)) = (number(1), number(2), number(3)) else {
                    return "!42000!malformed export\n".to_string();
                };
                let Some(table) = self.results.get(&id) else {
                    return format!("!42000!no such result {}\n", id);
                };
                let offset = offset as usize;
                let end = (offset + count as usize).min(table.rows.len());
                let mut out = format!(
                    "&6 {} {} {} {}\n",
                    id,
                    table.columns.len(),
                    end.saturating_sub(offset),
                    offset
                );
                for row in table.rows.get(offset..end).unwrap_or_default() {
                    out.push_str(&format_tuple(&table.columns, row));
                }
                out
            }
            Some("close") => {
                if let Some(id) = number(1) {
                    self.results.remove(&id);
                }
                String::new()
            }
            _ => format!("!42000!unknown command {}\n", command),
        }
    }

    fn statement(&mut self, sql: &str) -> Reply {
        let sql = sql.trim_end_matches(|c: char| c == ';' || c.is_whitespace()).trim();
        let upper = sql.to_uppercase();

        let reply = if upper == "CALL SYS.HANGUP()" {
            return Reply::Hangup;
        } else if upper == "CALL SYS.GARBAGE()" {
            "?this is not mapi\n".to_string()
        } else if upper.starts_with("CREATE TABLE ") {
            self.create_table(&sql["CREATE TABLE ".len()..])
        } else if upper.starts_with("DROP TABLE ") {
            let name = table_name(&sql["DROP TABLE ".len()..]);
            match self.working.remove(&name) {
                Some(_) => {
                    self.after_write();
                    "&3 1 0\n".to_string()
                }
                None => format!("!42S02!DROP TABLE: no such table '{}'\n", name),
            }
        } else if upper.starts_with("INSERT INTO ") {
            self.insert(&sql["INSERT INTO ".len()..])
        } else if upper.starts_with("SELECT * FROM ") {
            let name = table_name(&sql["SELECT * FROM ".len()..]);
            match self.working.get(&name).cloned() {
                Some(table) => self.result_set(&name, table),
                None => format!("!42S02!SELECT: no such table '{}'\n", name),
            }
        } else if upper.starts_with("ROLLBACK TO SAVEPOINT ") {
            let name = sql["ROLLBACK TO SAVEPOINT ".len()..].trim();
            match self.savepoints.iter().rposition(|(n, _)| n == name) {
                Some(i) => {
                    self.working = self.savepoints[i].1.clone();
                    self.savepoints.truncate(i + 1);
                    "&4 f\n".to_string()
                }
                None => format!("!3B001!ROLLBACK TO SAVEPOINT: no such savepoint '{}'\n", name),
            }
        } else if upper.starts_with("RELEASE SAVEPOINT ") {
            let name = sql["RELEASE SAVEPOINT ".len()..].trim();
            match self.savepoints.iter().rposition(|(n, _)| n == name) {
                Some(i) => {
                    self.savepoints.truncate(i);
                    "&4 f\n".to_string()
                }
                None => format!("!3B001!RELEASE SAVEPOINT: no such savepoint '{}'\n", name),
            }
        } else if upper.starts_with("SAVEPOINT ") {
            if self.auto_commit {
                "!3BM30!SAVEPOINT: not allowed in auto commit mode\n".to_string()
            } else {
                let name = sql["SAVEPOINT ".len()..].trim().to_string();
                self.savepoints.retain(|(n, _)| *n != name);
                self.savepoints.push((name, self.working.clone()));
                "&4 f\n".to_string()
            }
        } else if upper == "COMMIT" {
            if self.auto_commit {
                "!2DM30!COMMIT: not allowed in auto commit mode\n".to_string()
            } else {
                self.committed = self.working.clone();
                self.savepoints.clear();
                "&4 f\n".to_string()
            }
        } else if upper == "ROLLBACK" {
            if self.auto_commit {
                "!2DM30!ROLLBACK: not allowed in auto commit mode\n".to_string()
            } else {
                self.working = self.committed.clone();
                self.savepoints.clear();
                "&4 f\n".to_string()
            }
        } else {
            format!("!42000!syntax error, unexpected IDENT in: \"{}\"\n", sql)
        };
        Reply::Message(reply)
    }

    fn after_write(&mut self) {
        if self.auto_commit {
            self.committed = self.working.clone();
        }
    }

    fn create_table(&mut self, definition: &str) -> String {
        let (Some(open), Some(close)) = (definition.find('('), definition.rfind(')')) else {
            return "!42000!CREATE TABLE: missing column list\n".to_string();
        };
        let name = table_name(&definition[..open]);
        if self.working.contains_key(&name) {
            return format!("!42S01!CREATE TABLE: name '{}' already in use\n", name);
        }

        let columns = split_top_level(&definition[open + 1..close])
            .iter()
            .filter_map(|column| {
                let mut parts = column.split_whitespace();
                let name = parts.next()?.trim_matches('"').to_lowercase();
                let type_name = parts.next()?.to_lowercase();
                let type_name = type_name.split('(').next().unwrap_or_default().to_string();
                Some((name, type_name))
            })
            .collect();

        self.working.insert(name, Table { columns, rows: Vec::new() });
        self.after_write();
        "&3 1 0\n".to_string()
    }

    fn insert(&mut self, rest: &str) -> String {
        let Some(values_at) = rest.to_uppercase().find("VALUES") else {
            return "!42000!INSERT INTO: missing VALUES\n".to_string();
        };
        let name = table_name(&rest[..values_at]);
        let values = rest[values_at + "VALUES".len()..].trim();
        let values = values
            .strip_prefix('(')
            .and_then(|v| v.strip_suffix(')'))
            .unwrap_or(values);
        let row: Vec<Option<String>> = split_top_level(values)
            .iter()
            .map(|value| parse_literal(value))
            .collect();

        let Some(table) = self.working.get_mut(&name) else {
            return format!("!42S02!INSERT INTO: no such table '{}'\n", name);
        };
        if row.len() != table.columns.len() {
            return format!(
                "!21S01!INSERT INTO: number of values doesn't match number of columns of table '{}'\n",
                name
            );
        }
        table.rows.push(row);
        self.after_write();
        "&2 1 -1\n".to_string()
    }

    fn result_set(&mut self, name: &str, table: Table) -> String {
        let id = self.next_result;
        self.next_result += 1;

        let total = table.rows.len();
        let first = if self.reply_size < 0 {
            total
        } else {
            total.min(self.reply_size as usize)
        };
        let join = |f: &dyn Fn(&(String, String)) -> String| {
            table.columns.iter().map(f).collect::<Vec<_>>().join(",\t")
        };

        let mut out = format!("&1 {} {} {} {}\n", id, total, table.columns.len(), first);
        out.push_str(&format!("% {} # table_name\n", join(&|_| format!("sys.{}", name))));
        out.push_str(&format!("% {} # name\n", join(&|(n, _)| n.clone())));
        out.push_str(&format!("% {} # type\n", join(&|(_, t)| t.clone())));
        out.push_str(&format!("% {} # length\n", join(&|_| "0".to_string())));
        for row in &table.rows[..first] {
            out.push_str(&format_tuple(&table.columns, row));
        }

        if first < total {
            self.results.insert(id, table);
        }
        out
    }
}

fn table_name(text: &str) -> String {
    text.trim().trim_matches('"').to_lowercase()
}

/// Split on commas outside of parentheses and quotes
fn split_top_level(text: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0;
    let mut quoted = false;

    for c in text.chars() {
        match c {
            '\'' => quoted = !quoted,
            '(' if !quoted => depth += 1,
            ')' if !quoted => depth -= 1,
            ',' if !quoted && depth == 0 => {
                parts.push(current.trim().to_string());
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

fn parse_literal(value: &str) -> Option<String> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("NULL") {
        return None;
    }
    match value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')) {
        Some(text) => Some(text.replace("''", "'")),
        None => Some(value.to_string()),
    }
}

fn format_tuple(columns: &[(String, String)], row: &[Option<String>]) -> String {
    let cells: Vec<String> = columns
        .iter()
        .zip(row)
        .map(|((_, type_name), cell)| match cell {
            None => "NULL".to_string(),
            Some(text) if matches!(type_name.as_str(), "varchar" | "char" | "clob" | "string") => {
                let escaped = text
                    .replace('\\', "\\\\")
                    .replace('"', "\\\"")
                    .replace('\n', "\\n")
                    .replace('\t', "\\t");
                format!("\"{}\"", escaped)
            }
            Some(text) => text.clone(),
        })
        .collect();
    format!("[ {}\t]\n", cells.join(",\t"))
}

/// Parameters matching the fake server's credentials
pub(crate) fn test_params() -> ConnectionParams {
    ConnectionParams::new("localhost", 50000, "demo", "monetdb", "monetdb")
}

/// Start `server` on an in-memory stream and log in to it
pub(crate) async fn connect_to(server: FakeServer, params: ConnectionParams) -> (Session, ServerLog) {
    let log = server.log();
    let (client, stream) = duplex(256 * 1024);
    tokio::spawn(server.serve(stream));
    let session = Session::connect_with_stream(client, params)
        .await
        .expect("login to fake server");
    (session, log)
}
