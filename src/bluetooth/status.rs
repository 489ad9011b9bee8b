//! Cached adapter status and its single write path.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;
use utoipa::ToSchema;

use crate::cache::TtlCache;

/// Cache key of the adapter status record.
pub const STATUS_KEY: &str = "bluetooth.status";

/// Cache shared by the backends, keyed by record name.
pub type StatusCache = TtlCache<String, AdapterStatus>;

/// A device the adapter knows about (paired or seen).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct KnownDevice {
    /// Object path on the bus
    pub path: String,
    /// Hardware address
    pub address: String,
    /// Display name
    pub name: String,
    pub connected: bool,
    pub trusted: bool,
    pub paired: bool,
}

/// Snapshot of the adapter as last observed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct AdapterStatus {
    /// Adapter object path (empty until the backend has probed one)
    pub adapter: String,
    pub powered: bool,
    pub discoverable: bool,
    pub pairable: bool,
    /// Whether a pairing session is accepting devices
    pub pairing_active: bool,
    /// When the current pairing session expires
    pub pairing_until: Option<DateTime<Utc>>,
    pub known_devices: Vec<KnownDevice>,
}

impl AdapterStatus {
    /// Clear every flag that only makes sense while powered.
    pub fn mark_powered_off(&mut self) {
        self.powered = false;
        self.discoverable = false;
        self.pairable = false;
        self.end_pairing();
        for device in &mut self.known_devices {
            device.connected = false;
        }
    }

    /// Return to the non-pairing state.
    pub fn end_pairing(&mut self) {
        self.discoverable = false;
        self.pairable = false;
        self.pairing_active = false;
        self.pairing_until = None;
    }

    /// `pairing_active ⇒ discoverable ∧ pairable` and
    /// `¬powered ⇒ ¬discoverable ∧ ¬pairable ∧ ¬pairing_active`.
    pub fn is_consistent(&self) -> bool {
        let pairing_ok = !self.pairing_active || (self.discoverable && self.pairable);
        let power_ok =
            self.powered || !(self.discoverable || self.pairable || self.pairing_active);
        pairing_ok && power_ok
    }

    pub fn connected_devices(&self) -> usize {
        self.known_devices.iter().filter(|d| d.connected).count()
    }
}

/// Read-modify-write access to the cached [`AdapterStatus`].
///
/// Readers get copies; all writers go through [`StatusStore::update`],
/// which serializes concurrent updates.
pub struct StatusStore {
    cache: Arc<StatusCache>,
    write_lock: Mutex<()>,
}

impl StatusStore {
    pub fn new(cache: Arc<StatusCache>) -> Self {
        Self {
            cache,
            write_lock: Mutex::new(()),
        }
    }

    /// Current status, or the zero value if nothing has been recorded.
    pub fn snapshot(&self) -> AdapterStatus {
        self.cache.get(&STATUS_KEY.to_string()).unwrap_or_default()
    }

    /// Apply `f` to the current status and store the result.
    pub fn update<F>(&self, f: F) -> AdapterStatus
    where
        F: FnOnce(&mut AdapterStatus),
    {
        let _guard = self.write_lock.lock();
        let mut status = self.snapshot();
        f(&mut status);
        if !status.is_consistent() {
            warn!("Storing inconsistent adapter status: {:?}", status);
        }
        self.cache.set(STATUS_KEY.to_string(), status.clone());
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> StatusStore {
        StatusStore::new(Arc::new(StatusCache::new()))
    }

    #[test]
    fn test_zero_value_snapshot() {
        let status = store().snapshot();
        assert!(!status.powered);
        assert!(status.known_devices.is_empty());
        assert!(status.pairing_until.is_none());
    }

    #[test]
    fn test_update_is_visible_to_readers() {
        let store = store();
        let returned = store.update(|s| {
            s.powered = true;
            s.known_devices.push(KnownDevice {
                path: "/org/bluez/hci0/dev_AA".into(),
                connected: true,
                ..Default::default()
            });
        });

        let snapshot = store.snapshot();
        assert_eq!(snapshot, returned);
        assert_eq!(snapshot.connected_devices(), 1);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let store = store();
        store.update(|s| s.powered = true);
        let mut copy = store.snapshot();
        copy.powered = false;
        assert!(store.snapshot().powered);
    }

    #[test]
    fn test_mark_powered_off_clears_flags() {
        let mut status = AdapterStatus {
            powered: true,
            discoverable: true,
            pairable: true,
            pairing_active: true,
            pairing_until: Some(Utc::now()),
            known_devices: vec![KnownDevice {
                connected: true,
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(status.is_consistent());

        status.mark_powered_off();
        assert!(status.is_consistent());
        assert!(!status.pairing_active);
        assert!(status.pairing_until.is_none());
        assert_eq!(status.connected_devices(), 0);
    }

    #[test]
    fn test_inconsistent_update_is_stored() {
        let store = store();
        let status = store.update(|s| s.pairing_active = true);
        assert!(!status.is_consistent());
        assert!(store.snapshot().pairing_active);
    }

    #[test]
    fn test_inconsistent_states() {
        let pairing_without_flags = AdapterStatus {
            powered: true,
            pairing_active: true,
            ..Default::default()
        };
        assert!(!pairing_without_flags.is_consistent());

        let discoverable_while_off = AdapterStatus {
            discoverable: true,
            ..Default::default()
        };
        assert!(!discoverable_while_off.is_consistent());
    }
}
