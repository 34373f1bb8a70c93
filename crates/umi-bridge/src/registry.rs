//! Process-wide registry of connected devices.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::SystemTime;
use tokio::sync::Notify;
use umi_types::SessionState;
use uuid::Uuid;

/// Point-in-time view of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEntry {
    pub connection_id: Uuid,
    pub remote_addr: Option<SocketAddr>,
    /// Stable identity announced in `device_info`, if any.
    pub device_id: Option<String>,
    pub state: SessionState,
    pub session_id: Option<String>,
    pub connected_at: SystemTime,
}

struct Slot {
    entry: DeviceEntry,
    evict: Arc<Notify>,
}

/// Maps connection identity to device session metadata.
///
/// Uses `std::sync::RwLock` intentionally: every acquisition is a brief
/// HashMap operation that never spans an `.await`, and entries must be
/// removable from `Drop`.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    slots: Arc<RwLock<HashMap<Uuid, Slot>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock cannot leave a half-written map entry,
    // so poisoning is ignored.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<Uuid, Slot>> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Uuid, Slot>> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a new idle connection. The entry lives as long as the
    /// returned guard.
    pub fn register(&self, remote_addr: Option<SocketAddr>) -> Registration {
        let connection_id = Uuid::new_v4();
        let evict = Arc::new(Notify::new());
        let entry = DeviceEntry {
            connection_id,
            remote_addr,
            device_id: None,
            state: SessionState::Idle,
            session_id: None,
            connected_at: SystemTime::now(),
        };
        self.write().insert(
            connection_id,
            Slot {
                entry,
                evict: evict.clone(),
            },
        );
        Registration {
            connection_id,
            registry: self.clone(),
            evict,
        }
    }

    /// Records the device identity for a connection and evicts every other
    /// connection that claimed the same identity.
    ///
    /// Returns the number of connections evicted.
    pub fn set_device_id(&self, connection_id: Uuid, device_id: &str) -> usize {
        let mut slots = self.write();
        let mut evicted = 0;
        for (id, slot) in slots.iter() {
            if *id != connection_id && slot.entry.device_id.as_deref() == Some(device_id) {
                slot.evict.notify_one();
                evicted += 1;
            }
        }
        if let Some(slot) = slots.get_mut(&connection_id) {
            slot.entry.device_id = Some(device_id.to_string());
        }
        evicted
    }

    pub fn update_session(
        &self,
        connection_id: Uuid,
        state: SessionState,
        session_id: Option<&str>,
    ) {
        if let Some(slot) = self.write().get_mut(&connection_id) {
            slot.entry.state = state;
            slot.entry.session_id = session_id.map(str::to_string);
        }
    }

    pub fn get(&self, connection_id: Uuid) -> Option<DeviceEntry> {
        self.read()
            .get(&connection_id)
            .map(|slot| slot.entry.clone())
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Connections whose session is not idle.
    pub fn active_sessions(&self) -> usize {
        self.read()
            .values()
            .filter(|slot| slot.entry.state.holds_room())
            .count()
    }

    pub fn snapshot(&self) -> Vec<DeviceEntry> {
        self.read().values().map(|slot| slot.entry.clone()).collect()
    }

    fn remove(&self, connection_id: Uuid) {
        self.write().remove(&connection_id);
    }
}

/// Ownership of one registry entry. Dropping it removes the entry.
pub struct Registration {
    connection_id: Uuid,
    registry: ConnectionRegistry,
    evict: Arc<Notify>,
}

impl Registration {
    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Signalled when another connection claims this connection's device id.
    pub fn evict_signal(&self) -> Arc<Notify> {
        self.evict.clone()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(self.connection_id);
        tracing::debug!(connection_id = %self.connection_id, "removed registry entry");
    }
}
