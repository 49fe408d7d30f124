//! Wire-level framing of the remote audit logging protocol.
//!
//! Remote agents write one of two framings on the same TCP stream:
//! - Binary envelopes: a 16 byte big endian [`RmwHeader`](header::RmwHeader) that starts with a magic word,
//!   followed by the number of payload bytes the header announces.
//! - Legacy records: raw text terminated by a line feed.
//!
//! The [`Reassembler`] turns bytes as they arrive from non-blocking reads into complete [`Frame`]s,
//! re-probing the magic on every pass, so both framings may be mixed on one stream.
//! The [`EnvelopeCodec`] is the async Stream/Sink view of the binary framing, for remote senders.

mod codec;
pub mod header;
mod msg_kind;
mod reassembler;

pub use codec::{Envelope, EnvelopeCodec};
pub use header::{RmwHeader, MAX_AUDIT_MESSAGE_LENGTH, RMW_HEADER_SIZE, RMW_MAGIC};
pub use msg_kind::RmwMessageKind;
pub use reassembler::{Frame, Reassembler, RECEIVE_BUFFER_CAPACITY};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FramingError {
    #[error("Bad envelope magic {0:#x}, expected {1:#x}")]
    BadMagic(u32, u32),
    #[error("Short envelope header, got {0:#x} bytes, expected {1:#x}")]
    ShortHeader(usize, usize),
    #[error("Envelope announces {0:#x} payload bytes, at most {1:#x} fit")]
    Oversized(u32, usize),
    #[error("Legacy record fills all {0:#x} bytes of the receive buffer without a line feed")]
    LineTooLong(usize),
    #[error("Framing IO error")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

/// Drops one trailing line feed, if any
pub(crate) fn trim_line_feed(payload: &[u8]) -> &[u8] {
    match payload.split_last() {
        Some((b'\n', rest)) => rest,
        _ => payload,
    }
}
