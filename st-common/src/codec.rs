//! Framing of [`Event`]s over byte streams.
//!
//! Two framings are supported. Internal transports (sockets, ssh pipes) use a
//! 4-byte big-endian length prefix; human facing channels use one JSON object
//! per line. Both carry the same JSON [`Envelope`].

use crate::errors::{ErrorKind, Result, StError};
use crate::protocol::{Envelope, Event};
use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Largest frame accepted in either framing.
pub const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

/// How envelopes are delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    /// One JSON object per `\n` terminated line.
    JsonLines,
    /// Length prefixed JSON payloads.
    #[default]
    LengthDelimited,
}

/// `tokio_util` codec turning bytes into events and back.
///
/// Not shared between producers; the owning connection serializes access.
#[derive(Debug)]
pub struct EventCodec {
    framing: Framing,
    length: LengthDelimitedCodec,
}

impl EventCodec {
    pub fn new(framing: Framing) -> Self {
        let length = LengthDelimitedCodec::builder()
            .max_frame_length(MAX_FRAME_LENGTH)
            .new_codec();
        Self { framing, length }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Encode an envelope, rejecting envelopes that do not hold exactly one event.
    pub fn encode_envelope(&mut self, envelope: &Envelope, dst: &mut BytesMut) -> Result<()> {
        envelope.validate()?;
        let payload = serde_json::to_vec(envelope)?;
        match self.framing {
            Framing::LengthDelimited => self.length.encode(Bytes::from(payload), dst)?,
            Framing::JsonLines => {
                dst.reserve(payload.len() + 1);
                dst.put_slice(&payload);
                dst.put_u8(b'\n');
            }
        }
        Ok(())
    }

    fn next_line(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>> {
        loop {
            let Some(pos) = src.iter().position(|b| *b == b'\n') else {
                if src.len() > MAX_FRAME_LENGTH {
                    return Err(StError::with_message(
                        ErrorKind::InvalidMessageType,
                        format!("line exceeds {MAX_FRAME_LENGTH} bytes"),
                    ));
                }
                return Ok(None);
            };
            let mut line = src.split_to(pos + 1);
            line.truncate(pos);
            if line.last() == Some(&b'\r') {
                line.truncate(pos - 1);
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Ok(Some(line));
        }
    }
}

impl Default for EventCodec {
    fn default() -> Self {
        Self::new(Framing::default())
    }
}

fn parse_frame(frame: &[u8]) -> Result<Event> {
    let envelope: Envelope = serde_json::from_slice(frame)?;
    envelope.into_event()
}

impl Decoder for EventCodec {
    type Item = Event;
    type Error = StError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Event>> {
        let frame = match self.framing {
            Framing::LengthDelimited => self.length.decode(src)?,
            Framing::JsonLines => self.next_line(src)?,
        };
        frame.map(|frame| parse_frame(&frame)).transpose()
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Event>> {
        if let Some(event) = self.decode(src)? {
            return Ok(Some(event));
        }
        if src.is_empty() {
            return Ok(None);
        }
        match self.framing {
            // A final line without its terminator is still a message.
            Framing::JsonLines => {
                let rest = src.split();
                if rest.iter().all(u8::is_ascii_whitespace) {
                    return Ok(None);
                }
                parse_frame(&rest).map(Some)
            }
            Framing::LengthDelimited => Err(StError::with_message(
                ErrorKind::ConnectionFailed,
                format!("stream closed with {} bytes of a partial frame", src.len()),
            )),
        }
    }
}

impl Encoder<Event> for EventCodec {
    type Error = StError;

    fn encode(&mut self, event: Event, dst: &mut BytesMut) -> Result<()> {
        self.encode_envelope(&Envelope::from(event), dst)
    }
}
