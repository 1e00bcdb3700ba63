//! # MAPI Core
//!
//! Wire protocol, digests, connection parameters and typed values for the
//! MonetDB MAPI client. This crate does no I/O of its own; the socket side
//! lives in `mapi-client`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod config;
pub mod digest;
pub mod error;
pub mod protocol;
pub mod value;

/// Re-export common types for ease of use
pub use config::{ConnectionParams, Language, MapiUrl};
pub use digest::DigestAlgorithm;
pub use error::{MapiError, Result};
pub use value::{Column, ColumnType, Row, Value};

/// Version of the core crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
