//! Statement scripts
//!
//! Splits input into statements and prints their results as tab separated
//! text.

use std::io::Write;

use anyhow::Result;
use log::{debug, info};
use mapi_client::{Session, StatementResult};
use mapi_core::Value;

/// Split a script into statements.
///
/// A statement ends at a line whose last non-blank character is `;`. Blank
/// lines and `--` comment lines between statements are skipped. Trailing
/// text without a terminator is returned as a final statement.
pub fn split_statements(input: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();

    for line in input.lines() {
        let trimmed = line.trim();
        if current.is_empty() && (trimmed.is_empty() || trimmed.starts_with("--")) {
            continue;
        }

        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line.trim_end());

        if trimmed.ends_with(';') {
            statements.push(std::mem::take(&mut current));
        }
    }

    if !current.trim().is_empty() {
        statements.push(current);
    }
    statements
}

/// Render one row of values
pub fn format_row(values: &[Value]) -> String {
    values
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\t")
}

/// Run a statement and print its result
pub async fn run_statement<W: Write>(session: &mut Session, sql: &str, out: &mut W) -> Result<()> {
    debug!("Running statement: {}", sql);

    match session.query(sql).await? {
        StatementResult::Rows(mut cursor) => {
            writeln!(out, "{}", cursor.name_fields().join("\t"))?;
            let mut count = 0usize;
            while let Some(row) = cursor.fetch().await? {
                writeln!(out, "{}", format_row(row.values()))?;
                count += 1;
            }
            cursor.free().await?;
            info!("{} row(s) returned", count);
        }
        StatementResult::Affected { count, last_id } => {
            match last_id {
                Some(id) => writeln!(out, "{} affected row(s), last id {}", count, id)?,
                None => writeln!(out, "{} affected row(s)", count)?,
            }
        }
        StatementResult::SchemaChanged => writeln!(out, "operation successful")?,
        StatementResult::Transaction { auto_commit } => {
            writeln!(out, "auto commit {}", if auto_commit { "on" } else { "off" })?
        }
        StatementResult::Done => {}
    }
    Ok(())
}
