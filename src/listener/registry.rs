use crate::listener::connection::{Connection, NonBlockingIo};
use std::collections::HashMap;
use std::fmt;
use tokio::net::TcpStream;

/// Stable handle of a connection, unique for the lifetime of a listener
#[derive(Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Clone, Copy)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Live connections, keyed by their [`ConnectionId`].
///
/// The registry is the only owner of a [`Connection`]. Handlers look a connection up
/// for the duration of one event and never keep it, so removing any entry,
/// including the one a scan is currently looking at, never leaves a dangling reference.
pub struct ConnectionRegistry<IO = TcpStream> {
    connections: HashMap<ConnectionId, Connection<IO>>,
    next_id: u64,
}

impl<IO: NonBlockingIo> ConnectionRegistry<IO> {
    pub fn new() -> Self {
        Self {
            connections: HashMap::new(),
            next_id: 1,
        }
    }

    /// Reserves the handle for the next connection
    pub fn next_id(&mut self) -> ConnectionId {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn insert(&mut self, conn: Connection<IO>) {
        self.connections.insert(conn.id(), conn);
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection<IO>> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection<IO>> {
        self.connections.get_mut(&id)
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection<IO>> {
        self.connections.remove(&id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection<IO>> {
        self.connections.values()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }

    /// Returns the connections that received nothing since the previous scan,
    /// and starts a new interval for all of them
    pub fn scan_idle(&mut self) -> Vec<ConnectionId> {
        let mut idle: Vec<_> = self
            .connections
            .values_mut()
            .filter_map(|conn| (!conn.take_activity()).then(|| conn.id()))
            .collect();
        idle.sort();
        idle
    }

    /// Removes every connection, in no particular order
    pub fn drain(&mut self) -> impl Iterator<Item = Connection<IO>> + '_ {
        self.connections.drain().map(|(_, conn)| conn)
    }
}

impl<IO: NonBlockingIo> Default for ConnectionRegistry<IO> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::ConnectionRegistry;
    use crate::listener::connection::test_io::ScriptedIo;
    use crate::delivery::AuditMessage;
    use crate::listener::connection::Connection;

    fn registry_with(n: usize) -> ConnectionRegistry<ScriptedIo> {
        let mut registry = ConnectionRegistry::new();
        for port in 0..n {
            let id = registry.next_id();
            let peer = format!("127.0.0.1:{}", 600 + port).parse().unwrap();
            registry.insert(Connection::new(id, peer, ScriptedIo::default()).unwrap());
        }
        registry
    }

    #[test]
    fn ids_are_unique_and_removal_is_by_handle() {
        let mut registry = registry_with(3);
        let ids = {
            let mut ids = registry.ids();
            ids.sort();
            ids
        };
        assert_eq!(ids.len(), 3);
        assert!(ids.windows(2).all(|w| w[0] != w[1]));

        let removed = registry.remove(ids[1]).unwrap();
        assert_eq!(removed.id(), ids[1]);
        assert!(!registry.contains(ids[1]));
        assert!(registry.remove(ids[1]).is_none());
        assert_eq!(registry.len(), 2);

        // A fresh connection never reuses a handle
        let next = registry.next_id();
        assert!(ids.iter().all(|id| *id != next));
    }

    #[test]
    fn idle_scan_reports_silent_connections_once_per_interval() {
        let mut registry = registry_with(2);
        // New connections count as active for their first interval
        assert!(registry.scan_idle().is_empty());
        assert_eq!(registry.scan_idle().len(), 2);

        let ids = registry.ids();
        let busy = ids[0];
        let mut sink: Vec<AuditMessage> = Vec::new();
        let conn = registry.get_mut(busy).unwrap();
        conn.io().push_read(b"type=EOE\n");
        conn.on_readable(&mut sink);
        assert_eq!(registry.scan_idle(), vec![ids[1]]);
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn removing_while_walking_is_safe() {
        let mut registry = registry_with(4);
        for id in registry.ids() {
            if id.0 % 2 == 0 {
                registry.remove(id);
            }
        }
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.drain().count(), 2);
        assert!(registry.is_empty());
    }
}
