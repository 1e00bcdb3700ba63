//! Request encoding
//!
//! Statements are sent as text prefixed with a language marker; session
//! control commands use the `X` prefix.

use std::fmt;

use bytes::Bytes;

use crate::config::Language;

/// Encode a statement for the given language
pub fn encode_statement(language: Language, text: &str) -> Bytes {
    match language {
        // The trailing newline keeps a final `--` comment from eating the `;`
        Language::Sql => Bytes::from(format!("{}{}\n;", language.statement_prefix(), text)),
        Language::Mal => Bytes::from(format!("{}\n", text)),
    }
}

/// Session control command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Turn auto-commit on or off
    AutoCommit(bool),

    /// Rows per result block (-1 for all)
    ReplySize(i64),

    /// Request `count` rows of result `id` starting at `offset`
    Export {
        /// Result id
        id: i64,

        /// First row to send
        offset: usize,

        /// Number of rows
        count: usize,
    },

    /// Release server-side resources of result `id`
    Close(i64),
}

impl Command {
    /// Encode the command for the wire
    pub fn encode(&self) -> Bytes {
        Bytes::from(format!("X{}", self))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::AutoCommit(on) => write!(f, "auto_commit {}", u8::from(*on)),
            Command::ReplySize(size) => write!(f, "reply_size {}", size),
            Command::Export { id, offset, count } => write!(f, "export {} {} {}", id, offset, count),
            Command::Close(id) => write!(f, "close {}", id),
        }
    }
}
