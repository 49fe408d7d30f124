use crate::framing::{FramingError, RmwMessageKind};
use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use std::io::Cursor;

/// Size of the fixed binary envelope header
pub const RMW_HEADER_SIZE: usize = 16;
/// Leading word of every binary envelope.
/// Not printable ASCII, so it can't be mistaken for the start of a legacy text record.
pub const RMW_MAGIC: u32 = 0xff00_00fe;
/// Header format version written by this implementation
pub const RMW_VERSION: u8 = 0;
/// Largest audit record a remote agent may send
pub const MAX_AUDIT_MESSAGE_LENGTH: usize = 8970;

const MAGIC_LEN: usize = std::mem::size_of::<u32>();

/// The header in front of every binary envelope.
///
/// Wire layout, big endian: magic (u32), header version (u8), message version (u8),
/// type (u16), payload length (u32), sequence number (u32).
#[derive(Eq, PartialEq, Debug, Copy, Clone)]
pub struct RmwHeader {
    pub version: u8,
    pub message_version: u8,
    pub kind: RmwMessageKind,
    /// Number of payload bytes following the header
    pub len: u32,
    pub sequence: u32,
}

impl RmwHeader {
    /// Acknowledgement for a heartbeat with sequence number `sequence`
    pub fn ack(sequence: u32) -> Self {
        Self {
            version: RMW_VERSION,
            message_version: 0,
            kind: RmwMessageKind::Ack,
            len: 0,
            sequence,
        }
    }

    /// Whether `buf` starts with the envelope magic. Needs at least 4 bytes to say yes.
    pub fn is_magic(buf: &[u8]) -> bool {
        buf.len() >= MAGIC_LEN && buf[..MAGIC_LEN] == RMW_MAGIC.to_be_bytes()
    }

    /// Whether `buf` could still turn into the envelope magic once more bytes arrive
    pub(crate) fn is_magic_prefix(buf: &[u8]) -> bool {
        let magic = RMW_MAGIC.to_be_bytes();
        let n = buf.len().min(MAGIC_LEN);
        n > 0 && buf[..n] == magic[..n]
    }

    /// Decodes the header at the start of `buf`. The magic is assumed to have been probed already.
    pub fn decode(buf: &[u8]) -> Result<Self, FramingError> {
        if buf.len() < RMW_HEADER_SIZE {
            return Err(FramingError::ShortHeader(buf.len(), RMW_HEADER_SIZE));
        }
        let mut reader = Cursor::new(&buf[MAGIC_LEN..RMW_HEADER_SIZE]);
        let version = reader.read_u8()?;
        let message_version = reader.read_u8()?;
        let kind = reader.read_u16::<BE>()?.into();
        let len = reader.read_u32::<BE>()?;
        let sequence = reader.read_u32::<BE>()?;
        Ok(Self {
            version,
            message_version,
            kind,
            len,
            sequence,
        })
    }

    /// Writes the 16 header bytes, magic included, into `buf`
    pub fn encode_into(&self, buf: &mut [u8; RMW_HEADER_SIZE]) {
        let mut writer = Cursor::new(&mut buf[..]);
        // Writes into a fixed array of exactly the header size can't run out of room
        let _ = writer.write_u32::<BE>(RMW_MAGIC);
        let _ = writer.write_u8(self.version);
        let _ = writer.write_u8(self.message_version);
        let _ = writer.write_u16::<BE>(self.kind.into());
        let _ = writer.write_u32::<BE>(self.len);
        let _ = writer.write_u32::<BE>(self.sequence);
    }

    pub fn to_bytes(&self) -> [u8; RMW_HEADER_SIZE] {
        let mut buf = [0; RMW_HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Total envelope size announced by this header, or `None` if it doesn't fit in a `usize`
    pub fn frame_len(&self) -> Option<usize> {
        usize::try_from(self.len).ok()?.checked_add(RMW_HEADER_SIZE)
    }
}
