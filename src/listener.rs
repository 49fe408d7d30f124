//! The TCP side: admission of remote agents, per-connection reassembly and lifecycle.
//!
//! An [`AuditListener`] is a single owned context. It holds the listening socket, the
//! [`ConnectionRegistry`], the downstream [`MessageSink`] and the [`AuditSink`], and is driven by
//! one task: either [`run`](AuditListener::run), or another reactor calling
//! [`accept_one`](AuditListener::accept_one), [`handle_readable`](AuditListener::handle_readable)
//! and [`check_idle`](AuditListener::check_idle) itself. Handlers never block and never hold
//! on to a connection between events, so no locking is involved.

mod access;
mod acceptor;
mod connection;
mod registry;

pub use access::{AccessController, Admission, AllowAllHosts, DenyReason, HostAllowList, HostPolicy, PortRange};
pub use acceptor::Acceptor;
pub use connection::{CloseReason, Connection, NonBlockingIo, ReadStatus};
pub use registry::{ConnectionId, ConnectionRegistry};

use crate::audit::{AuditRecord, AuditSink, TracingAuditSink};
use crate::config::{ConfigError, ListenerConfig};
use crate::delivery::MessageSink;
use futures_util::future::BoxFuture;
use futures_util::stream::FuturesUnordered;
use futures_util::{FutureExt, StreamExt};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum ListenerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Cannot create tcp listener socket")]
    Socket(#[source] io::Error),
    #[error("Cannot bind tcp listener socket to {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

type Readiness = BoxFuture<'static, (ConnectionId, io::Result<()>)>;

enum LoopEvent {
    Shutdown,
    Accepted(io::Result<(TcpStream, SocketAddr)>),
    Readable(ConnectionId, io::Result<()>),
    IdleTick,
}

/// Accepts remote agents and turns what they send into [`AuditMessage`](crate::delivery::AuditMessage)s
pub struct AuditListener<M, A = TracingAuditSink> {
    /// `None` when disabled by configuration, or once stopped
    acceptor: Option<Acceptor>,
    registry: ConnectionRegistry,
    sink: M,
    audit: A,
    idle_check: Option<Duration>,
}

impl<M: MessageSink, A: AuditSink> AuditListener<M, A> {
    /// Starts listening on all interfaces as configured.
    ///
    /// A listen port of 0 is not an error: the listener is created disabled and never accepts.
    /// Must be called from within a tokio runtime.
    pub fn start(config: &ListenerConfig, sink: M, audit: A) -> Result<Self, ListenerError> {
        config.validate()?;
        if !config.is_enabled() {
            debug!("TCP listen port not set, remote logging disabled");
            return Ok(Self {
                acceptor: None,
                registry: ConnectionRegistry::new(),
                sink,
                audit,
                idle_check: None,
            });
        }
        Self::bind(config.listen_addr(), config, sink, audit)
    }

    /// Starts listening on an explicit address, ignoring the configured port.
    /// Port 0 here picks any free port.
    pub fn bind(
        addr: SocketAddr,
        config: &ListenerConfig,
        sink: M,
        audit: A,
    ) -> Result<Self, ListenerError> {
        config.validate()?;
        let access = AccessController::new(config.allowed_ports());
        let acceptor = Acceptor::bind(addr, config.tcp_listen_queue, access).map_err(|e| {
            error!("{}", e);
            e
        })?;
        if let Ok(local) = acceptor.local_addr() {
            debug!(
                "Listening on TCP {}, client ports {}",
                local,
                config.allowed_ports()
            );
        }
        Ok(Self {
            acceptor: Some(acceptor),
            registry: ConnectionRegistry::new(),
            sink,
            audit,
            idle_check: config.idle_check_interval(),
        })
    }

    /// Replaces the host based admission rules (everyone is allowed by default)
    pub fn set_host_policy(&mut self, policy: impl HostPolicy + Send + 'static) {
        if let Some(acceptor) = &mut self.acceptor {
            acceptor.access_mut().set_policy(policy);
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.acceptor.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.acceptor.as_ref()?.local_addr().ok()
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn sink(&self) -> &M {
        &self.sink
    }

    pub fn audit_sink(&self) -> &A {
        &self.audit
    }

    /// Serves until `shutdown` completes, then [`stop`](Self::stop)s.
    ///
    /// Every event is handled to completion on the calling task before the next one is
    /// picked: one pending connection, one readable connection, or one idle scan.
    pub async fn run<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        if self.acceptor.is_none() {
            shutdown.await;
            return;
        }

        let mut pending: FuturesUnordered<Readiness> = self
            .registry
            .iter()
            .map(|conn| readiness(conn.id(), conn.io().clone()))
            .collect();
        let mut idle = self.idle_check.map(|period| {
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            let event = {
                let acceptor = match &self.acceptor {
                    Some(acceptor) => acceptor,
                    None => break,
                };
                tokio::select! {
                    _ = &mut shutdown => LoopEvent::Shutdown,
                    accepted = acceptor.accept() => LoopEvent::Accepted(accepted),
                    Some((id, ready)) = pending.next() => LoopEvent::Readable(id, ready),
                    _ = next_tick(&mut idle) => LoopEvent::IdleTick,
                }
            };

            match event {
                LoopEvent::Shutdown => break,
                LoopEvent::Accepted(accepted) => {
                    if let Some(id) = self.on_accepted(accepted) {
                        if let Some(conn) = self.registry.get(id) {
                            pending.push(readiness(id, conn.io().clone()));
                        }
                    }
                }
                LoopEvent::Readable(id, Ok(())) => {
                    if self.handle_readable(id) {
                        if let Some(conn) = self.registry.get(id) {
                            pending.push(readiness(id, conn.io().clone()));
                        }
                    }
                }
                LoopEvent::Readable(id, Err(e)) => {
                    self.close_connection(id, &CloseReason::Error(e));
                }
                LoopEvent::IdleTick => {
                    self.check_idle();
                }
            }
        }

        // Readiness futures hold their socket open, drop them before closing connections
        drop(pending);
        self.stop();
    }

    /// Waits for one pending connection, then admits and registers it or turns it away
    pub async fn accept_one(&mut self) -> Option<ConnectionId> {
        let accepted = match &self.acceptor {
            Some(acceptor) => acceptor.accept().await,
            None => return None,
        };
        self.on_accepted(accepted)
    }

    fn on_accepted(
        &mut self,
        accepted: io::Result<(TcpStream, SocketAddr)>,
    ) -> Option<ConnectionId> {
        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                // The listener stays up, the next readiness event retries
                error!("Unable to accept TCP connection: {}", e);
                return None;
            }
        };
        let acceptor = self.acceptor.as_ref()?;
        let stream = acceptor.admit(stream, peer, &mut self.audit)?;

        let id = self.registry.next_id();
        let conn = match Connection::new(id, peer, stream) {
            Ok(conn) => conn,
            Err(e) => {
                error!(critical = true, "Unable to allocate TCP client data for {}: {}", peer, e);
                self.audit.record(&AuditRecord::refused(peer));
                return None;
            }
        };
        self.registry.insert(conn);
        info!("TCP connection {} from {} accepted", id, peer);
        self.audit.record(&AuditRecord::accepted(peer));
        Some(id)
    }

    /// Processes a readiness event for connection `id`.
    /// Returns whether the connection is still open afterwards.
    pub fn handle_readable(&mut self, id: ConnectionId) -> bool {
        let conn = match self.registry.get_mut(id) {
            Some(conn) => conn,
            None => return false,
        };
        match conn.on_readable(&mut self.sink) {
            ReadStatus::Open => true,
            ReadStatus::Closed(reason) => {
                self.close_connection(id, &reason);
                false
            }
        }
    }

    fn close_connection(&mut self, id: ConnectionId, reason: &CloseReason) {
        let conn = match self.registry.remove(id) {
            Some(conn) => conn,
            None => return,
        };
        match reason {
            CloseReason::PeerClosed => info!("TCP connection {} from {} closed", id, conn.peer()),
            CloseReason::Error(e) => {
                warn!("TCP connection {} from {} failed: {}", id, conn.peer(), e)
            }
            CloseReason::Malformed(e) => warn!(
                "TCP connection {} from {} dropped: {}",
                id,
                conn.peer(),
                e
            ),
        }
        self.audit.record(&AuditRecord::closed(conn.peer()));
    }

    /// Reports connections that sent nothing since the previous scan.
    /// Idle connections are only logged, never closed.
    pub fn check_idle(&mut self) -> Vec<ConnectionId> {
        let idle = self.registry.scan_idle();
        for id in &idle {
            if let Some(conn) = self.registry.get(*id) {
                warn!("client {} idle too long", conn.peer());
            }
        }
        idle
    }

    /// Closes the listening socket, then every connection, buffered data or not.
    /// Calling it again does nothing.
    pub fn stop(&mut self) {
        if let Some(acceptor) = self.acceptor.take() {
            if let Ok(local) = acceptor.local_addr() {
                debug!("Closing TCP listener on {}", local);
            }
        }
        for conn in self.registry.drain() {
            info!("Closing TCP connection {} from {}", conn.id(), conn.peer());
            self.audit.record(&AuditRecord::closed(conn.peer()));
        }
    }
}

fn readiness(id: ConnectionId, stream: Arc<TcpStream>) -> Readiness {
    async move {
        let ready = stream.readable().await;
        (id, ready)
    }
    .boxed()
}

async fn next_tick(idle: &mut Option<Interval>) {
    match idle {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod test {
    use super::AuditListener;
    use crate::audit::{AuditEventKind, AuditRecord};
    use crate::config::ListenerConfig;
    use crate::delivery::AuditMessage;
    use crate::framing::{Envelope, EnvelopeCodec, RmwMessageKind};
    use crate::listener::HostAllowList;
    use anyhow::Result;
    use futures_util::{SinkExt, StreamExt};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::{mpsc, oneshot};
    use tokio_util::codec::Framed;

    type Records = Vec<(AuditEventKind, String)>;

    fn open_config() -> ListenerConfig {
        ListenerConfig {
            tcp_listen_port: 60,
            tcp_client_idle_check_secs: 0,
            ..Default::default()
        }
    }

    fn loopback<M: crate::delivery::MessageSink>(
        config: &ListenerConfig,
        sink: M,
    ) -> Result<AuditListener<M, Records>> {
        Ok(AuditListener::bind(
            "127.0.0.1:0".parse()?,
            config,
            sink,
            Vec::new(),
        )?)
    }

    #[test_log::test(tokio::test)]
    async fn port_zero_disables_listener() -> Result<()> {
        let mut listener =
            AuditListener::start(&ListenerConfig::default(), Vec::<AuditMessage>::new(), Records::new())?;
        assert!(!listener.is_enabled());
        assert_eq!(listener.local_addr(), None);
        assert_eq!(listener.accept_one().await, None);
        listener.run(async {}).await;
        assert!(listener.audit_sink().is_empty());
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn end_to_end_legacy_envelope_and_heartbeat() -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut listener = loopback(&open_config(), tx)?;
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await?;
            let local = stream.local_addr()?;
            stream.write_all(b"type=SYSCALL arch=x86_64\n").await?;
            let mut framed = Framed::new(stream, EnvelopeCodec::new());
            framed
                .send(Envelope::new(RmwMessageKind::Message, 8, &b"type=EOE msg=audit(2.0:9)\n"[..]))
                .await?;
            framed.send(Envelope::heartbeat(7)).await?;
            let ack = framed.next().await.unwrap()?;

            let first = rx.recv().await.unwrap();
            let second = rx.recv().await.unwrap();
            drop(framed);
            let _ = stop_tx.send(());
            Ok::<_, anyhow::Error>((local, ack, first, second))
        });

        listener
            .run(async {
                let _ = stop_rx.await;
            })
            .await;
        let (local, ack, first, second) = client.await??;

        assert_eq!(ack.header.kind, RmwMessageKind::Ack);
        assert_eq!(ack.header.sequence, 7);
        assert!(ack.payload.is_empty());

        assert_eq!(first, AuditMessage::legacy(b"type=SYSCALL arch=x86_64"));
        assert_eq!(&second.payload[..], b"type=EOE msg=audit(2.0:9)");
        assert_eq!(second.sequence, 8);
        assert!(second.source.is_some());

        assert_eq!(listener.connection_count(), 0);
        assert!(!listener.is_enabled());
        assert_eq!(
            listener.audit_sink(),
            &vec![
                (AuditEventKind::DaemonAccept, AuditRecord::accepted(local).to_string()),
                (AuditEventKind::DaemonClose, AuditRecord::closed(local).to_string()),
            ]
        );
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn source_port_outside_range_is_refused() -> Result<()> {
        let config = ListenerConfig {
            tcp_client_min_port: 1,
            tcp_client_max_port: 1023,
            ..open_config()
        };
        let mut listener = loopback(&config, Vec::<AuditMessage>::new())?;
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let client = tokio::spawn(async move {
            // Unprivileged clients get an ephemeral port well above 1023
            let mut stream = TcpStream::connect(addr).await?;
            let local = stream.local_addr()?;
            let _ = stream.write_all(b"type=SYSCALL\n").await;
            let mut rest = Vec::new();
            let _ = stream.read_to_end(&mut rest).await;
            let _ = stop_tx.send(());
            Ok::<_, anyhow::Error>(local)
        });

        listener
            .run(async {
                let _ = stop_rx.await;
            })
            .await;
        let local = client.await??;
        assert!(local.port() > 1023);

        assert!(listener.sink().is_empty());
        assert_eq!(
            listener.audit_sink(),
            &vec![(
                AuditEventKind::DaemonAccept,
                format!("addr={} port={} res=no", local, local.port())
            )]
        );
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn host_policy_refusal() -> Result<()> {
        let mut listener = loopback(&open_config(), Vec::<AuditMessage>::new())?;
        listener.set_host_policy(HostAllowList(vec!["192.0.2.1".parse()?]));
        let addr = listener.local_addr().unwrap();

        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept_one());
        let mut client = client?;
        assert_eq!(accepted, None);
        assert_eq!(listener.connection_count(), 0);

        let mut rest = Vec::new();
        assert_eq!(client.read_to_end(&mut rest).await?, 0);
        let records = listener.audit_sink();
        assert_eq!(records.len(), 1);
        assert!(records[0].1.ends_with("res=no"));
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn idle_scan_and_forced_stop() -> Result<()> {
        let mut listener = loopback(&open_config(), Vec::<AuditMessage>::new())?;
        let addr = listener.local_addr().unwrap();

        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept_one());
        let mut client = client?;
        let id = accepted.unwrap();
        assert_eq!(listener.connection_count(), 1);

        // Freshly accepted counts as active for the first interval
        assert!(listener.check_idle().is_empty());
        assert_eq!(listener.check_idle(), vec![id]);

        client.write_all(b"type=LOGIN\n").await?;
        let stream = listener.registry.get(id).unwrap().io().clone();
        stream.readable().await?;
        assert!(listener.handle_readable(id));
        assert_eq!(listener.sink(), &vec![AuditMessage::legacy(b"type=LOGIN")]);
        assert!(listener.check_idle().is_empty());
        drop(stream);

        // Unterminated data is discarded by a forced stop
        client.write_all(b"type=PARTIAL").await?;
        listener.stop();
        listener.stop();
        assert_eq!(listener.connection_count(), 0);
        let mut rest = Vec::new();
        let _ = client.read_to_end(&mut rest).await;
        assert!(rest.is_empty());

        let records = listener.audit_sink();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].0, AuditEventKind::DaemonClose);
        assert!(records[1].1.ends_with("res=success"));
        assert_eq!(listener.sink().len(), 1);
        Ok(())
    }
}
