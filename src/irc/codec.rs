//! S2S line codec. Frames the link byte stream into [`Message`]s.
//!
//! UnrealIRCd terminates lines with `\r\n`, but bare `\n` is accepted on
//! input as well. Blank lines are skipped. Outgoing messages are always
//! written with `\r\n`.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::message::{Message, ParseError};

/// Maximum line length (including the terminator).
/// RFC 2812 says 512 bytes; S2S lines carrying tags can be much longer.
const MAX_LINE_LENGTH: usize = 8191;

/// Framing failures. Any of them ends the link.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("line exceeds maximum length ({MAX_LINE_LENGTH} bytes)")]
    LineTooLong,
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A tokio codec that frames S2S messages on line boundaries.
#[derive(Debug, Default)]
pub struct IrcCodec;

impl Decoder for IrcCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(pos) = src.iter().position(|b| *b == b'\n') else {
                if src.len() > MAX_LINE_LENGTH {
                    return Err(CodecError::LineTooLong);
                }
                return Ok(None);
            };

            if pos > MAX_LINE_LENGTH {
                return Err(CodecError::LineTooLong);
            }

            let line_bytes = src.split_to(pos);
            src.advance(1); // skip \n

            // Nicks and realnames are not guaranteed to be UTF-8 on older networks.
            let line = String::from_utf8_lossy(&line_bytes);
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }

            return Ok(Some(Message::parse(line)?));
        }
    }
}

impl Encoder<Message> for IrcCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = format!("{item}\r\n");
        dst.extend_from_slice(line.as_bytes());
        Ok(())
    }
}
