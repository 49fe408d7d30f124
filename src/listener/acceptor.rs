use crate::audit::{AuditRecord, AuditSink};
use crate::listener::access::{AccessController, Admission};
use crate::listener::ListenerError;
use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{error, warn};

/// Owns the listening socket and decides who gets to stay connected
pub struct Acceptor {
    listener: TcpListener,
    access: AccessController,
}

impl Acceptor {
    /// Binds and listens on `addr`. Must run inside a tokio runtime.
    pub(crate) fn bind(
        addr: SocketAddr,
        backlog: u32,
        access: AccessController,
    ) -> Result<Self, ListenerError> {
        // Sockets created by tokio are already close-on-exec
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(ListenerError::Socket)?;
        // Lets a restarted daemon rebind while old connections linger in TIME_WAIT
        socket.set_reuseaddr(true).map_err(ListenerError::Socket)?;
        // Inherited by accepted sockets
        socket.set_keepalive(true).map_err(ListenerError::Socket)?;
        socket
            .bind(addr)
            .map_err(|source| ListenerError::Bind { addr, source })?;
        let listener = socket
            .listen(backlog)
            .map_err(|source| ListenerError::Bind { addr, source })?;
        Ok(Self { listener, access })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn access_mut(&mut self) -> &mut AccessController {
        &mut self.access
    }

    /// Takes exactly one pending connection off the backlog
    pub(crate) async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.listener.accept().await
    }

    /// Runs admission for a freshly accepted peer.
    ///
    /// A refused peer is disconnected right away and audited here.
    /// An admitted one comes back configured for low latency replies.
    pub(crate) fn admit<A: AuditSink>(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        audit: &mut A,
    ) -> Option<TcpStream> {
        if let Admission::Deny(reason) = self.access.admit(&peer) {
            drop(stream);
            error!("TCP connection from {} rejected: {:?}", peer, reason);
            audit.record(&AuditRecord::refused(peer));
            return None;
        }
        if let Err(e) = configure_socket(&stream) {
            warn!("Cannot set socket options for {}: {}", peer, e);
        }
        Some(stream)
    }
}

/// No Nagle delay, heartbeat ACKs leave immediately.
/// Accepted tokio streams are already non-blocking and close-on-exec.
fn configure_socket(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    Ok(())
}
