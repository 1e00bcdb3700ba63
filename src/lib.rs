/// MonetDB MAPI - a client for the MonetDB wire protocol
///
/// This is the root crate that provides workspace-level documentation.
/// Actual implementation is in the subcrates:
/// - `mapi-core`: Wire codec, digests, typed values and connection parameters
/// - `mapi-client`: Transport, sessions, transactions and result cursors
/// - `mapi-shell`: Command-line shell for running statements

/// Returns the version of the package.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
