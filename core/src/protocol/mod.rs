//! MAPI wire protocol
//!
//! This module provides block framing, request encoding, response decoding
//! and the login challenge exchange.

pub mod block;
pub mod challenge;
pub mod response;
pub mod statement;
pub mod tuple;

pub use block::{BlockCodec, MAX_BLOCK_SIZE};
pub use challenge::{client_endian, Challenge};
pub use response::{decode_response, ResponseMessage, ResultHeader, ResultKind};
pub use statement::{encode_statement, Command};
pub use tuple::{parse_tuple, RawRow};
