use crate::framing::header::{RmwHeader, MAX_AUDIT_MESSAGE_LENGTH, RMW_HEADER_SIZE, RMW_MAGIC};
use crate::framing::{FramingError, RmwMessageKind};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

/// A binary envelope with an owned payload
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct Envelope {
    pub header: RmwHeader,
    pub payload: Bytes,
}

impl Envelope {
    pub fn new(kind: RmwMessageKind, sequence: u32, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        Self {
            header: RmwHeader {
                version: 0,
                message_version: 0,
                kind,
                len: payload.len() as u32,
                sequence,
            },
            payload,
        }
    }

    pub fn heartbeat(sequence: u32) -> Self {
        Self::new(RmwMessageKind::Heartbeat, sequence, Bytes::new())
    }
}

/// Binary envelope framing for [`Framed`](tokio_util::codec::Framed) streams.
///
/// This is the remote agent's view of the protocol: it only speaks envelopes,
/// the legacy text framing is only understood by the listener's [`Reassembler`](super::Reassembler).
#[derive(Debug, Clone)]
pub struct EnvelopeCodec {
    max_payload: usize,
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self {
            max_payload: MAX_AUDIT_MESSAGE_LENGTH,
        }
    }

    pub fn with_max_payload(max_payload: usize) -> Self {
        Self { max_payload }
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < RMW_HEADER_SIZE {
            src.reserve(RMW_HEADER_SIZE - src.len());
            return Ok(None);
        }
        if !RmwHeader::is_magic(src) {
            let magic = (&src[..4]).get_u32();
            return Err(FramingError::BadMagic(magic, RMW_MAGIC));
        }
        let header = RmwHeader::decode(src)?;
        let frame_len = match header.frame_len() {
            Some(len) if len - RMW_HEADER_SIZE <= self.max_payload => len,
            _ => return Err(FramingError::Oversized(header.len, self.max_payload)),
        };
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(frame_len);
        frame.advance(RMW_HEADER_SIZE);
        trace!(
            "Decoded {} envelope seq {} with {:#x} bytes payload",
            header.kind,
            header.sequence,
            frame.len()
        );
        Ok(Some(Envelope {
            header,
            payload: frame.freeze(),
        }))
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = FramingError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = item.payload.len();
        if len > self.max_payload {
            return Err(FramingError::Oversized(
                u32::try_from(len).unwrap_or(u32::MAX),
                self.max_payload,
            ));
        }
        let header = RmwHeader {
            len: len as u32,
            ..item.header
        };
        dst.reserve(RMW_HEADER_SIZE + len);
        dst.put_slice(&header.to_bytes());
        dst.put_slice(&item.payload);
        Ok(())
    }
}
