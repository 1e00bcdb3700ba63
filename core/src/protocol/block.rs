//! Block framing
//!
//! Every MAPI message travels as a sequence of blocks. Each block starts
//! with a 2-byte little-endian header holding `(length << 1) | last`; the
//! message ends with the first block whose `last` bit is set.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::trace;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{MapiError, Result};

/// Largest payload written into a single block
pub const MAX_BLOCK_SIZE: usize = 8190;

/// Default upper bound on a reassembled message
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 512 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Header,
    Body { len: usize, last: bool },
}

/// Codec turning a byte stream into whole MAPI messages and back
#[derive(Debug)]
pub struct BlockCodec {
    state: DecodeState,
    message: BytesMut,
    max_block_size: usize,
    max_message_size: usize,
}

impl Default for BlockCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockCodec {
    /// Create a codec with the standard block size
    pub fn new() -> Self {
        Self {
            state: DecodeState::Header,
            message: BytesMut::new(),
            max_block_size: MAX_BLOCK_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    /// Limit the size of a reassembled message
    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    /// Use a different block size when encoding
    pub fn with_max_block_size(mut self, max_block_size: usize) -> Self {
        self.max_block_size = max_block_size.clamp(1, MAX_BLOCK_SIZE);
        self
    }
}

impl Decoder for BlockCodec {
    type Item = Bytes;
    type Error = MapiError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        loop {
            match self.state {
                DecodeState::Header => {
                    if src.len() < 2 {
                        return Ok(None);
                    }
                    let header = src.get_u16_le();
                    let len = (header >> 1) as usize;
                    let last = header & 1 == 1;
                    src.reserve(len);
                    self.state = DecodeState::Body { len, last };
                }

                DecodeState::Body { len, last } => {
                    if src.len() < len {
                        return Ok(None);
                    }
                    if self.message.len() + len > self.max_message_size {
                        return Err(MapiError::Protocol(format!(
                            "message larger than {} bytes",
                            self.max_message_size
                        )));
                    }
                    let chunk = src.split_to(len);
                    self.message.extend_from_slice(&chunk);
                    self.state = DecodeState::Header;
                    trace!("received block of {} bytes (last: {})", len, last);

                    if last {
                        return Ok(Some(self.message.split().freeze()));
                    }
                }
            }
        }
    }
}

impl Encoder<Bytes> for BlockCodec {
    type Error = MapiError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<()> {
        if payload.is_empty() {
            dst.put_u16_le(1);
            return Ok(());
        }

        let mut chunks = payload.chunks(self.max_block_size).peekable();
        dst.reserve(payload.len() + 2 * (payload.len() / self.max_block_size + 1));
        while let Some(chunk) = chunks.next() {
            let last = chunks.peek().is_none();
            let header = ((chunk.len() as u16) << 1) | last as u16;
            dst.put_u16_le(header);
            dst.put_slice(chunk);
        }
        Ok(())
    }
}
