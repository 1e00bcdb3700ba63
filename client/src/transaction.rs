//! Transaction tracker
//!
//! Pure bookkeeping of the auto-commit mode and the savepoint stack. The
//! tracker never inspects SQL text; the session updates it only through its
//! typed operations.

use log::debug;
use mapi_core::error::{MapiError, Result};

/// Prefix of generated savepoint names
pub const SAVEPOINT_PREFIX: &str = "monetdbsp";

/// Transaction state
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TransactionState {
    /// Every statement commits on its own
    AutoCommit,

    /// Statements accumulate until an explicit commit or rollback
    InTransaction,
}

impl Default for TransactionState {
    fn default() -> Self {
        TransactionState::AutoCommit
    }
}

/// Transaction tracker
#[derive(Debug, Default)]
pub struct TransactionTracker {
    /// Current state
    state: TransactionState,

    /// Open savepoints, innermost last
    savepoints: Vec<String>,

    /// Savepoints created so far; numbers the next name
    counter: u64,
}

impl TransactionTracker {
    /// Create a new transaction tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the current transaction state
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Whether every statement commits on its own
    pub fn is_auto_commit(&self) -> bool {
        self.state == TransactionState::AutoCommit
    }

    /// Record a change of the auto-commit mode.
    ///
    /// Turning auto-commit on commits whatever was open, so the savepoint
    /// stack is cleared.
    pub fn set_auto_commit(&mut self, on: bool) {
        self.state = if on {
            self.savepoints.clear();
            TransactionState::AutoCommit
        } else {
            TransactionState::InTransaction
        };
        debug!("Transaction state is now {:?}", self.state);
    }

    /// Name the next savepoint would get
    pub fn next_savepoint(&self) -> String {
        format!("{}{}", SAVEPOINT_PREFIX, self.counter)
    }

    /// Push a new savepoint and return its name
    pub fn push_savepoint(&mut self) -> String {
        let name = self.next_savepoint();
        self.counter += 1;
        self.savepoints.push(name.clone());
        name
    }

    /// Pop the most recent savepoint
    pub fn pop_savepoint(&mut self) -> Result<String> {
        self.savepoints
            .pop()
            .ok_or_else(|| MapiError::State("no savepoint to release".to_string()))
    }

    /// Most recent savepoint
    pub fn current_savepoint(&self) -> Option<&str> {
        self.savepoints.last().map(String::as_str)
    }

    /// Number of open savepoints
    pub fn depth(&self) -> usize {
        self.savepoints.len()
    }

    /// Forget all savepoints (after a commit or a full rollback)
    pub fn clear_savepoints(&mut self) {
        if !self.savepoints.is_empty() {
            debug!("Dropping {} savepoint(s)", self.savepoints.len());
        }
        self.savepoints.clear();
    }
}
