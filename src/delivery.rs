//! Hand-off of complete audit messages to the downstream queue.

use crate::framing::RmwMessageKind;
use crate::listener::ConnectionId;
use bytes::Bytes;
use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

/// A complete message, framing removed
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct AuditMessage {
    /// The record text, without envelope header or trailing line feed
    pub payload: Bytes,
    /// Connection a binary envelope arrived on. Legacy records carry no source.
    pub source: Option<ConnectionId>,
    /// Envelope sequence number, 0 for legacy records
    pub sequence: u32,
    /// Envelope type, `None` for legacy records
    pub kind: Option<RmwMessageKind>,
}

impl AuditMessage {
    pub fn legacy(payload: &[u8]) -> Self {
        Self {
            payload: Bytes::copy_from_slice(payload),
            source: None,
            sequence: 0,
            kind: None,
        }
    }

    pub fn envelope(
        source: ConnectionId,
        kind: RmwMessageKind,
        sequence: u32,
        payload: &[u8],
    ) -> Self {
        Self {
            payload: Bytes::copy_from_slice(payload),
            source: Some(source),
            sequence,
            kind: Some(kind),
        }
    }
}

/// The downstream consumer of complete messages.
///
/// Called from the listener's event loop, so it must not block.
pub trait MessageSink {
    fn deliver(&mut self, message: AuditMessage);
}

impl MessageSink for UnboundedSender<AuditMessage> {
    fn deliver(&mut self, message: AuditMessage) {
        if let Err(e) = self.send(message) {
            warn!(
                "Downstream queue is closed, dropping message seq {}",
                e.0.sequence
            );
        }
    }
}

impl MessageSink for Vec<AuditMessage> {
    fn deliver(&mut self, message: AuditMessage) {
        self.push(message);
    }
}
