//! Command-line shell for MonetDB
//!
//! Resolves connection parameters from a config file, the environment and
//! flags, then runs SQL statements and prints their results.

pub mod config;
pub mod script;

pub use config::{load_params, Overrides};
pub use script::{format_row, run_statement, split_statements};
