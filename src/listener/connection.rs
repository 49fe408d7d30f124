use crate::delivery::{AuditMessage, MessageSink};
use crate::framing::{trim_line_feed, Frame, FramingError, Reassembler, RmwHeader, RmwMessageKind};
use crate::listener::ConnectionId;
use std::collections::TryReserveError;
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

/// Socket operations that return [`WouldBlock`](ErrorKind::WouldBlock) instead of waiting
pub trait NonBlockingIo {
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize>;
    fn try_write(&self, buf: &[u8]) -> io::Result<usize>;
}

impl NonBlockingIo for TcpStream {
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        TcpStream::try_read(self, buf)
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        TcpStream::try_write(self, buf)
    }
}

/// What a readiness event left the connection in
#[derive(Debug)]
pub enum ReadStatus {
    /// Nothing more to read right now, wait for the next event
    Open,
    /// The connection is finished and must be dropped
    Closed(CloseReason),
}

#[derive(Debug)]
pub enum CloseReason {
    /// Orderly shutdown by the peer
    PeerClosed,
    /// The socket failed
    Error(io::Error),
    /// The peer sent something that can't be framed
    Malformed(FramingError),
}

/// One accepted remote agent
pub struct Connection<IO = TcpStream> {
    id: ConnectionId,
    peer: SocketAddr,
    io: Arc<IO>,
    reassembler: Reassembler,
    /// Set by every read, cleared by each idle scan
    active: bool,
}

impl<IO: NonBlockingIo> Connection<IO> {
    /// Fails only if the receive buffer can't be allocated
    pub fn new(id: ConnectionId, peer: SocketAddr, io: IO) -> Result<Self, TryReserveError> {
        Ok(Self {
            id,
            peer,
            io: Arc::new(io),
            reassembler: Reassembler::try_new()?,
            active: true,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub(crate) fn io(&self) -> &Arc<IO> {
        &self.io
    }

    /// Clears the activity flag, returning whether it was set
    pub(crate) fn take_activity(&mut self) -> bool {
        std::mem::replace(&mut self.active, false)
    }

    /// Drains the socket after a readiness event, delivering every complete message to `sink`.
    ///
    /// Keeps reading until the socket would block, so an edge triggered reactor never
    /// leaves queued bytes behind. An end of stream seen after data in the same call is
    /// left for the next event, which will read it again with nothing before it.
    pub fn on_readable<S: MessageSink>(&mut self, sink: &mut S) -> ReadStatus {
        self.active = true;
        let mut total_this_call = 0;

        loop {
            let read = match self.io.try_read(self.reassembler.spare_mut()) {
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return ReadStatus::Open,
                Err(e) => {
                    warn!("client {} socket closed unexpectedly: {}", self.peer, e);
                    self.flush_residual(sink);
                    return ReadStatus::Closed(CloseReason::Error(e));
                }
            };

            if read == 0 {
                if total_this_call > 0 {
                    return ReadStatus::Open;
                }
                debug!("client {} closed the connection", self.peer);
                self.flush_residual(sink);
                return ReadStatus::Closed(CloseReason::PeerClosed);
            }
            total_this_call += read;

            let (id, peer, io) = (self.id, self.peer, &self.io);
            let res = self
                .reassembler
                .commit(read, |frame| dispatch(id, peer, io.as_ref(), frame, &mut *sink));
            if let Err(e) = res {
                warn!("client {} sent a malformed message: {}", self.peer, e);
                return ReadStatus::Closed(CloseReason::Malformed(e));
            }
        }
    }

    /// A legacy record cut short by the end of the stream is still a record
    fn flush_residual<S: MessageSink>(&mut self, sink: &mut S) {
        if let Some(Frame::Line(line)) = self.reassembler.finish() {
            sink.deliver(AuditMessage::legacy(line));
        }
    }
}

fn dispatch<IO: NonBlockingIo, S: MessageSink>(
    id: ConnectionId,
    peer: SocketAddr,
    io: &IO,
    frame: Frame<'_>,
    sink: &mut S,
) {
    match frame {
        Frame::Envelope { header, .. } if header.kind == RmwMessageKind::Heartbeat => {
            trace!("Heartbeat seq {} from {}, sending ACK", header.sequence, peer);
            let ack = RmwHeader::ack(header.sequence).to_bytes();
            match write_nonblocking(io, &ack) {
                Ok(n) if n == ack.len() => {}
                Ok(n) => warn!("client {} took only {} of {} ACK bytes", peer, n, ack.len()),
                // The next read will tell what happened to the connection
                Err(e) => warn!("Failed to ACK heartbeat from {}: {}", peer, e),
            }
        }
        Frame::Envelope { header, payload } => {
            trace!(
                "Received {} seq {} from {}: {}",
                header.kind,
                header.sequence,
                peer,
                hex::encode(payload)
            );
            sink.deliver(AuditMessage::envelope(
                id,
                header.kind,
                header.sequence,
                trim_line_feed(payload),
            ));
        }
        Frame::Line(line) => {
            trace!("Received legacy record from {}: {}", peer, hex::encode(line));
            sink.deliver(AuditMessage::legacy(line));
        }
    }
}

/// Writes as much of `buf` as the socket takes, retrying partial writes.
/// Stops early if the socket accepts zero bytes.
fn write_nonblocking<IO: NonBlockingIo>(io: &IO, mut buf: &[u8]) -> io::Result<usize> {
    let mut written = 0;
    while !buf.is_empty() {
        match io.try_write(buf) {
            Ok(0) => break,
            Ok(n) => {
                written += n;
                buf = &buf[n..];
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(written)
}

#[cfg(test)]
pub(crate) mod test_io {
    use super::NonBlockingIo;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::io::{self, ErrorKind};

    /// Plays back a list of read results, then would-block forever.
    /// An empty chunk is an end of stream.
    #[derive(Default)]
    pub(crate) struct ScriptedIo {
        pub(crate) reads: RefCell<VecDeque<io::Result<Vec<u8>>>>,
        pub(crate) written: RefCell<Vec<u8>>,
        /// Largest write accepted at once, 0 for unlimited
        pub(crate) write_chunk: usize,
        pub(crate) write_error: Option<ErrorKind>,
    }

    impl ScriptedIo {
        pub(crate) fn push_read(&self, data: &[u8]) {
            self.reads.borrow_mut().push_back(Ok(data.to_vec()));
        }

        pub(crate) fn push_would_block(&self) {
            self.reads
                .borrow_mut()
                .push_back(Err(ErrorKind::WouldBlock.into()));
        }

        pub(crate) fn push_eof(&self) {
            self.push_read(b"");
        }

        pub(crate) fn push_error(&self, kind: ErrorKind) {
            self.reads.borrow_mut().push_back(Err(kind.into()));
        }
    }

    impl NonBlockingIo for ScriptedIo {
        fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
            let mut reads = self.reads.borrow_mut();
            match reads.pop_front() {
                None => Err(ErrorKind::WouldBlock.into()),
                Some(Err(e)) => Err(e),
                Some(Ok(mut data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    if n < data.len() {
                        reads.push_front(Ok(data.split_off(n)));
                    }
                    Ok(n)
                }
            }
        }

        fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
            if let Some(kind) = self.write_error {
                return Err(kind.into());
            }
            let n = match self.write_chunk {
                0 => buf.len(),
                chunk => chunk.min(buf.len()),
            };
            self.written.borrow_mut().extend_from_slice(&buf[..n]);
            Ok(n)
        }
    }
}
