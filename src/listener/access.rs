use std::fmt;
use std::net::SocketAddr;

/// Host based admission rules, consulted once per accepted connection
pub trait HostPolicy {
    fn permits(&self, peer: &SocketAddr) -> bool;
}

/// Used when no host based rules are configured
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAllHosts;

impl HostPolicy for AllowAllHosts {
    fn permits(&self, _peer: &SocketAddr) -> bool {
        true
    }
}

/// Only the listed addresses may connect, whatever their source port
#[derive(Debug, Default, Clone)]
pub struct HostAllowList(pub Vec<std::net::IpAddr>);

impl HostPolicy for HostAllowList {
    fn permits(&self, peer: &SocketAddr) -> bool {
        self.0.contains(&peer.ip())
    }
}

/// Inclusive range of source ports remote agents may connect from
#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PortRange {
    pub fn new(min: u16, max: u16) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, port: u16) -> bool {
        self.min <= port && port <= self.max
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}

#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum Admission {
    Allow,
    Deny(DenyReason),
}

#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum DenyReason {
    /// The host policy refused the peer address
    HostPolicy,
    /// The peer's source port is outside the allowed range
    SourcePort(u16),
}

/// Decides whether a freshly accepted peer may stay connected.
///
/// Both the host policy and the source port range must agree.
pub struct AccessController {
    policy: Box<dyn HostPolicy + Send>,
    ports: PortRange,
}

impl AccessController {
    pub fn new(ports: PortRange) -> Self {
        Self {
            policy: Box::new(AllowAllHosts),
            ports,
        }
    }

    pub fn with_policy(ports: PortRange, policy: impl HostPolicy + Send + 'static) -> Self {
        Self {
            policy: Box::new(policy),
            ports,
        }
    }

    pub fn set_policy(&mut self, policy: impl HostPolicy + Send + 'static) {
        self.policy = Box::new(policy);
    }

    pub fn allowed_ports(&self) -> PortRange {
        self.ports
    }

    pub fn admit(&self, peer: &SocketAddr) -> Admission {
        if !self.policy.permits(peer) {
            return Admission::Deny(DenyReason::HostPolicy);
        }
        if !self.ports.contains(peer.port()) {
            return Admission::Deny(DenyReason::SourcePort(peer.port()));
        }
        Admission::Allow
    }
}
