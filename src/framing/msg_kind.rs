use strum_macros::Display;

/// The `type` field of a binary envelope header
#[derive(Eq, PartialEq, Copy, Clone, Debug, Display)]
#[cfg_attr(test, derive(strum_macros::EnumCount))]
pub enum RmwMessageKind {
    /// An audit record, forwarded to the downstream queue
    Message,
    /// Liveness probe from the remote agent, answered with an [`Ack`](Self::Ack) and never forwarded
    Heartbeat,
    /// Reply to a heartbeat, carrying the heartbeat's sequence number
    Ack,
    /// The remote agent is shutting down
    Ending,
    /// The remote agent's local disk is running low
    DiskLow,
    DiskFull,
    DiskError,
    /// Types this listener doesn't know about are still carried through
    Other(u16),
}

impl From<RmwMessageKind> for u16 {
    fn from(kind: RmwMessageKind) -> Self {
        match kind {
            RmwMessageKind::Message => 0,
            RmwMessageKind::Heartbeat => 1,
            RmwMessageKind::Ack => 2,
            RmwMessageKind::Ending => 3,
            RmwMessageKind::DiskLow => 4,
            RmwMessageKind::DiskFull => 5,
            RmwMessageKind::DiskError => 6,
            RmwMessageKind::Other(x) => x,
        }
    }
}

impl From<&RmwMessageKind> for u16 {
    fn from(kind: &RmwMessageKind) -> Self {
        u16::from(*kind)
    }
}

impl From<u16> for RmwMessageKind {
    fn from(value: u16) -> Self {
        match value {
            x if x == Self::Message => Self::Message,
            x if x == Self::Heartbeat => Self::Heartbeat,
            x if x == Self::Ack => Self::Ack,
            x if x == Self::Ending => Self::Ending,
            x if x == Self::DiskLow => Self::DiskLow,
            x if x == Self::DiskFull => Self::DiskFull,
            x if x == Self::DiskError => Self::DiskError,
            x => Self::Other(x),
        }
    }
}

impl PartialEq<u16> for RmwMessageKind {
    fn eq(&self, other: &u16) -> bool {
        u16::from(self) == *other
    }
}

impl PartialEq<RmwMessageKind> for u16 {
    fn eq(&self, other: &RmwMessageKind) -> bool {
        u16::from(other) == *self
    }
}

impl std::fmt::LowerHex for RmwMessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let val: u16 = self.into();
        std::fmt::LowerHex::fmt(&val, f)
    }
}
