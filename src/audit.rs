//! Audit trail of connection admission and teardown.
//!
//! Every accepted, rejected or closed connection produces exactly one record,
//! handed to an [`AuditSink`] owned by the surrounding daemon.

use std::fmt;
use std::net::SocketAddr;
use strum_macros::Display;
use tracing::info;

/// Which daemon event a record describes
#[derive(Eq, PartialEq, Copy, Clone, Debug, Display)]
pub enum AuditEventKind {
    /// A remote connection was accepted or refused
    DaemonAccept,
    /// A remote connection went away
    DaemonClose,
}

impl From<AuditEventKind> for u16 {
    fn from(kind: AuditEventKind) -> Self {
        match kind {
            AuditEventKind::DaemonAccept => 1224,
            AuditEventKind::DaemonClose => 1225,
        }
    }
}

#[derive(Eq, PartialEq, Copy, Clone, Debug)]
pub enum AuditOutcome {
    Success,
    Failure,
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditOutcome::Success => f.write_str("success"),
            AuditOutcome::Failure => f.write_str("no"),
        }
    }
}

/// One audit record about a remote peer.
///
/// Its `Display` form is the record text: `addr=<ip>:<port> port=<port> res=<success|no>`
#[derive(Eq, PartialEq, Copy, Clone, Debug)]
pub struct AuditRecord {
    pub kind: AuditEventKind,
    pub peer: SocketAddr,
    pub outcome: AuditOutcome,
}

impl AuditRecord {
    pub fn accepted(peer: SocketAddr) -> Self {
        Self {
            kind: AuditEventKind::DaemonAccept,
            peer,
            outcome: AuditOutcome::Success,
        }
    }

    pub fn refused(peer: SocketAddr) -> Self {
        Self {
            kind: AuditEventKind::DaemonAccept,
            peer,
            outcome: AuditOutcome::Failure,
        }
    }

    pub fn closed(peer: SocketAddr) -> Self {
        Self {
            kind: AuditEventKind::DaemonClose,
            peer,
            outcome: AuditOutcome::Success,
        }
    }
}

impl fmt::Display for AuditRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "addr={} port={} res={}",
            self.peer,
            self.peer.port(),
            self.outcome
        )
    }
}

/// Destination of audit records
pub trait AuditSink {
    fn emit(&mut self, kind: AuditEventKind, message: &str);

    fn record(&mut self, record: &AuditRecord) {
        self.emit(record.kind, &record.to_string());
    }
}

/// Writes audit records to the `auditd_listen::audit` tracing target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&mut self, kind: AuditEventKind, message: &str) {
        info!(target: "auditd_listen::audit", kind = %kind, code = u16::from(kind), "{}", message);
    }
}

/// Keeps records in memory, mostly useful in tests
impl AuditSink for Vec<(AuditEventKind, String)> {
    fn emit(&mut self, kind: AuditEventKind, message: &str) {
        self.push((kind, message.to_owned()));
    }
}
