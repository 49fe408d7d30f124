use crate::framing::header::{RmwHeader, MAX_AUDIT_MESSAGE_LENGTH, RMW_HEADER_SIZE};
use crate::framing::FramingError;
use std::collections::TryReserveError;
use tracing::{trace, warn};

/// Room for the largest audit record plus its envelope header
pub const RECEIVE_BUFFER_CAPACITY: usize = MAX_AUDIT_MESSAGE_LENGTH + RMW_HEADER_SIZE;

/// End of the frame at the front of the buffer, line feed included for legacy records
enum Boundary {
    Envelope(RmwHeader, usize),
    Line(usize),
}

/// One complete message found in the receive buffer
#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum Frame<'a> {
    /// A binary envelope. The payload is exactly the announced length, header excluded.
    Envelope {
        header: RmwHeader,
        payload: &'a [u8],
    },
    /// A legacy record, line feed excluded
    Line(&'a [u8]),
}

/// Per-connection receive buffer that splits a byte stream into [`Frame`]s.
///
/// Bytes are read by the caller into [`spare_mut`](Self::spare_mut), then handed over
/// with [`commit`](Self::commit), which reports every complete frame and keeps the
/// unconsumed tail contiguous at the front of the buffer.
/// Reads are never asked for more than the free space, and a frame that can't fit
/// in the buffer is an error rather than a reason to grow it.
pub struct Reassembler {
    buffer: Box<[u8]>,
    /// Valid, unconsumed bytes at the front of `buffer`
    fill: usize,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::with_capacity(RECEIVE_BUFFER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: vec![0; capacity].into_boxed_slice(),
            fill: 0,
        }
    }

    /// Like [`new`](Self::new), but reports allocation failure instead of aborting
    pub fn try_new() -> Result<Self, TryReserveError> {
        let mut buffer = Vec::new();
        buffer.try_reserve_exact(RECEIVE_BUFFER_CAPACITY)?;
        buffer.resize(RECEIVE_BUFFER_CAPACITY, 0);
        Ok(Self {
            buffer: buffer.into_boxed_slice(),
            fill: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Bytes received but not yet part of a complete frame
    pub fn buffered(&self) -> usize {
        self.fill
    }

    /// The free space right after the buffered bytes, where the next read must land
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[self.fill..]
    }

    /// Accounts for `count` new bytes written at the start of [`spare_mut`](Self::spare_mut)
    /// and calls `on_frame` for every frame they complete, in stream order.
    ///
    /// Returns the number of frames found. On error the connection is beyond repair,
    /// the buffer contents are left as they were when the error was detected.
    pub fn commit<F>(&mut self, count: usize, mut on_frame: F) -> Result<usize, FramingError>
    where
        F: FnMut(Frame<'_>),
    {
        let mut new = count.min(self.buffer.len() - self.fill);
        let mut frames = 0;
        loop {
            let consumed = match self.next_boundary(new)? {
                Some(Boundary::Envelope(header, len)) => {
                    on_frame(Frame::Envelope {
                        header,
                        payload: &self.buffer[RMW_HEADER_SIZE..len],
                    });
                    len
                }
                Some(Boundary::Line(len)) => {
                    on_frame(Frame::Line(&self.buffer[..len - 1]));
                    len
                }
                None => return Ok(frames),
            };
            frames += 1;

            self.buffer.copy_within(consumed..self.fill, 0);
            self.fill -= consumed;
            if self.fill == 0 {
                return Ok(frames);
            }
            // Whatever follows is probed again from scratch, it may use the other framing
            new = self.fill;
            self.fill = 0;
        }
    }

    /// Copies `data` through the buffer as if it arrived by successive reads
    pub fn feed<F>(&mut self, mut data: &[u8], mut on_frame: F) -> Result<usize, FramingError>
    where
        F: FnMut(Frame<'_>),
    {
        let mut frames = 0;
        while !data.is_empty() {
            let spare = self.spare_mut();
            let n = spare.len().min(data.len());
            spare[..n].copy_from_slice(&data[..n]);
            data = &data[n..];
            frames += self.commit(n, &mut on_frame)?;
        }
        Ok(frames)
    }

    /// Empties the buffer when the stream ends.
    ///
    /// Leftover text is a final legacy record that never got its line feed.
    /// Leftover envelope bytes are a truncated envelope and are dropped.
    pub fn finish(&mut self) -> Option<Frame<'_>> {
        let len = self.fill;
        self.fill = 0;
        if len == 0 {
            return None;
        }
        let residual = &self.buffer[..len];
        if RmwHeader::is_magic_prefix(residual) {
            warn!("Dropping truncated envelope ({:#x} bytes) at end of stream", len);
            return None;
        }
        trace!("Flushing unterminated record: {}", hex::encode(residual));
        Some(Frame::Line(residual))
    }

    /// Where the frame at the front of the buffer ends once `new` more bytes are counted,
    /// or `None` while it's still incomplete
    fn next_boundary(&mut self, new: usize) -> Result<Option<Boundary>, FramingError> {
        let total = self.fill + new;
        if RmwHeader::is_magic(&self.buffer[..total]) {
            self.fill = total;
            if total < RMW_HEADER_SIZE {
                return Ok(None);
            }
            let header = RmwHeader::decode(&self.buffer[..total])?;
            let frame_len = match header.frame_len() {
                Some(len) if len <= self.buffer.len() => len,
                _ => {
                    return Err(FramingError::Oversized(
                        header.len,
                        self.buffer.len() - RMW_HEADER_SIZE,
                    ))
                }
            };
            if total < frame_len {
                return Ok(None);
            }
            Ok(Some(Boundary::Envelope(header, frame_len)))
        } else {
            // The first `fill` bytes were already scanned on an earlier pass
            let scan_from = self.fill;
            self.fill = total;
            match self.buffer[scan_from..total].iter().position(|&b| b == b'\n') {
                Some(pos) => Ok(Some(Boundary::Line(scan_from + pos + 1))),
                None if total == self.buffer.len() => {
                    Err(FramingError::LineTooLong(self.buffer.len()))
                }
                None => Ok(None),
            }
        }
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}
