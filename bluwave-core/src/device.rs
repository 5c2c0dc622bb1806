//! Device bookkeeping: known/connected registry, connection cap, session record.

use std::collections::HashMap;

use uuid::Uuid;

use crate::crypto::DeviceId;
use crate::message::now_millis;

/// Hard cap on simultaneously connected peers, enforced at accept-time.
pub const MAX_CONNECTIONS: usize = 6;

/// Which side of the star topology this engine plays.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Role {
    Host,
    Client,
}

/// A device we have discovered or connected to. Identity is the id; the rest
/// are mutable attributes.
#[derive(Debug, Clone)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub connected: bool,
    pub is_host: bool,
    pub last_seen_ms: u64,
}

impl Device {
    pub fn new(id: DeviceId, name: String, is_host: bool) -> Self {
        Self {
            id,
            name,
            connected: false,
            is_host,
            last_seen_ms: now_millis(),
        }
    }
}

/// One chat session per running engine. `active` flips off when the last
/// connection drops.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: Uuid,
    pub role: Role,
    pub active: bool,
}

impl Session {
    pub fn new(role: Role) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            role,
            active: false,
        }
    }
}

/// Known/connected device bookkeeping. Devices are never removed from the
/// known map; disconnection only flips `connected` off. Connection order is
/// preserved for the connected list.
#[derive(Default)]
pub struct DeviceRegistry {
    known: HashMap<DeviceId, Device>,
    connected: Vec<DeviceId>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connected_count(&self) -> usize {
        self.connected.len()
    }

    pub fn is_full(&self) -> bool {
        self.connected.len() >= MAX_CONNECTIONS
    }

    pub fn is_connected(&self, id: DeviceId) -> bool {
        self.connected.contains(&id)
    }

    /// Record a device as discovered (not connected). Refreshes name/last-seen
    /// on an existing entry.
    pub fn observe(&mut self, id: DeviceId, name: &str, is_host: bool) {
        let entry = self
            .known
            .entry(id)
            .or_insert_with(|| Device::new(id, name.to_string(), is_host));
        entry.name = name.to_string();
        entry.is_host = is_host;
        entry.last_seen_ms = now_millis();
    }

    /// Register a connection. Returns `Ok(true)` if a live connection with the
    /// same id was displaced — the caller must close the old connection.
    /// Fails when the cap is reached (a duplicate does not count against it).
    pub fn connect(&mut self, id: DeviceId, name: &str, is_host: bool) -> Result<bool, RegistryFull> {
        let displaced = self.connected.contains(&id);
        if !displaced && self.connected.len() >= MAX_CONNECTIONS {
            return Err(RegistryFull);
        }
        self.observe(id, name, is_host);
        if let Some(dev) = self.known.get_mut(&id) {
            dev.connected = true;
        }
        if !displaced {
            self.connected.push(id);
        }
        Ok(displaced)
    }

    /// Drop a connection. Returns false if the device was not connected, so a
    /// racing disconnect path runs its side effects exactly once. The known
    /// entry stays.
    pub fn disconnect(&mut self, id: DeviceId) -> bool {
        let Some(pos) = self.connected.iter().position(|c| *c == id) else {
            return false;
        };
        self.connected.remove(pos);
        if let Some(dev) = self.known.get_mut(&id) {
            dev.connected = false;
            dev.last_seen_ms = now_millis();
        }
        true
    }

    pub fn device(&self, id: DeviceId) -> Option<&Device> {
        self.known.get(&id)
    }

    /// Connected devices in connection order.
    pub fn connected_devices(&self) -> Vec<Device> {
        self.connected
            .iter()
            .filter_map(|id| self.known.get(id).cloned())
            .collect()
    }

    /// Connected ids in connection order.
    pub fn connected_ids(&self) -> Vec<DeviceId> {
        self.connected.clone()
    }

    /// Every device ever seen, connected or not.
    pub fn known_devices(&self) -> Vec<Device> {
        self.known.values().cloned().collect()
    }

    /// Forget connections (shutdown). Known entries stay, marked disconnected.
    pub fn clear_connections(&mut self) {
        for id in std::mem::take(&mut self.connected) {
            if let Some(dev) = self.known.get_mut(&id) {
                dev.connected = false;
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("connection cap reached")]
pub struct RegistryFull;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;

    fn id() -> DeviceId {
        Keypair::generate().device_id()
    }

    #[test]
    fn cap_enforced_at_connect() {
        let mut reg = DeviceRegistry::new();
        for i in 0..MAX_CONNECTIONS {
            assert!(reg.connect(id(), &format!("dev{i}"), false).is_ok());
        }
        assert!(reg.is_full());
        assert!(reg.connect(id(), "one too many", false).is_err());
        assert_eq!(reg.connected_count(), MAX_CONNECTIONS);
    }

    #[test]
    fn duplicate_connect_displaces_not_duplicates() {
        let mut reg = DeviceRegistry::new();
        let dup = id();
        assert_eq!(reg.connect(dup, "first", false).unwrap(), false);
        assert_eq!(reg.connect(dup, "again", false).unwrap(), true);
        assert_eq!(reg.connected_count(), 1);
        assert_eq!(reg.device(dup).unwrap().name, "again");
    }

    #[test]
    fn duplicate_allowed_at_cap() {
        let mut reg = DeviceRegistry::new();
        let first = id();
        reg.connect(first, "first", false).unwrap();
        for i in 1..MAX_CONNECTIONS {
            reg.connect(id(), &format!("dev{i}"), false).unwrap();
        }
        // Re-connecting a known device replaces; it is not a seventh peer.
        assert_eq!(reg.connect(first, "first", false).unwrap(), true);
        assert_eq!(reg.connected_count(), MAX_CONNECTIONS);
    }

    #[test]
    fn disconnect_keeps_known_entry_and_runs_once() {
        let mut reg = DeviceRegistry::new();
        let a = id();
        reg.connect(a, "ada", false).unwrap();
        assert!(reg.disconnect(a));
        assert!(!reg.disconnect(a));
        assert_eq!(reg.connected_count(), 0);
        let dev = reg.device(a).unwrap();
        assert!(!dev.connected);
        assert_eq!(dev.name, "ada");
        assert_eq!(reg.known_devices().len(), 1);
    }

    #[test]
    fn connection_order_preserved() {
        let mut reg = DeviceRegistry::new();
        let (a, b, c) = (id(), id(), id());
        reg.connect(a, "a", false).unwrap();
        reg.connect(b, "b", false).unwrap();
        reg.connect(c, "c", false).unwrap();
        reg.disconnect(b);
        let order: Vec<DeviceId> = reg.connected_devices().iter().map(|d| d.id).collect();
        assert_eq!(order, vec![a, c]);
    }

    #[test]
    fn clear_connections_is_idempotent() {
        let mut reg = DeviceRegistry::new();
        reg.connect(id(), "a", false).unwrap();
        reg.clear_connections();
        reg.clear_connections();
        assert_eq!(reg.connected_count(), 0);
        assert_eq!(reg.known_devices().len(), 1);
    }
}
