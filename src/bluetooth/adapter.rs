//! Adapter power lifecycle and known-device enumeration.

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::idle::IdleWatcher;
use super::listener::SignalListener;
use super::status::{AdapterStatus, KnownDevice};
use super::{BluetoothError, Inner, ADAPTER_IFACE, BLUEZ_SERVICE, DEVICE_IFACE};
use crate::bus::{BusError, ManagedObject, Value};

/// Build a [`KnownDevice`] from an object carrying `Device1`.
fn known_device(object: &ManagedObject) -> Option<KnownDevice> {
    let props = object.interfaces.get(DEVICE_IFACE)?;
    let flag = |name: &str| props.get(name).and_then(Value::as_bool).unwrap_or(false);
    let text = |name: &str| props.get(name).and_then(Value::as_str).map(str::to_string);

    let address = text("Address").unwrap_or_else(|| {
        object
            .path
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string()
    });
    let name = text("Alias")
        .or_else(|| text("Name"))
        .unwrap_or_else(|| address.clone());

    Some(KnownDevice {
        path: object.path.clone(),
        address,
        name,
        connected: flag("Connected"),
        trusted: flag("Trusted"),
        paired: flag("Paired"),
    })
}

impl Inner {
    async fn set_adapter_property(&self, name: &str, value: Value) -> Result<(), BusError> {
        self.gateway
            .set_property(BLUEZ_SERVICE, &self.adapter_path, ADAPTER_IFACE, name, value)
            .await
    }

    pub(super) async fn set_adapter_flag(&self, name: &str, on: bool) -> Result<(), BusError> {
        self.set_adapter_property(name, Value::Bool(on)).await
    }

    pub(super) async fn set_adapter_timeout(&self, name: &str, secs: u32) -> Result<(), BusError> {
        self.set_adapter_property(name, Value::U32(secs)).await
    }

    async fn adapter_flag(&self, name: &str) -> Result<bool, BusError> {
        self.gateway
            .get_bool(BLUEZ_SERVICE, &self.adapter_path, ADAPTER_IFACE, name)
            .await
    }

    /// Read `Powered`; a failed read counts as off.
    pub(super) async fn is_adapter_on(&self) -> bool {
        match self.adapter_flag("Powered").await {
            Ok(on) => on,
            Err(e) => {
                warn!("Reading adapter power state failed, assuming off: {}", e);
                false
            }
        }
    }

    /// Devices below this adapter, ordered by object path.
    async fn list_devices(&self) -> Result<Vec<KnownDevice>, BusError> {
        let prefix = format!("{}/", self.adapter_path);
        let mut devices: Vec<KnownDevice> = self
            .gateway
            .managed_objects(BLUEZ_SERVICE)
            .await?
            .iter()
            .filter(|object| object.path.starts_with(&prefix))
            .filter_map(known_device)
            .collect();
        devices.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(devices)
    }

    /// Replace the cached device list with a fresh enumeration.
    pub(super) async fn refresh_known_devices(&self) -> Result<(), BusError> {
        let devices = self.list_devices().await?;
        debug!("Refreshed {} known devices", devices.len());
        self.status.update(|s| s.known_devices = devices);
        Ok(())
    }

    pub(super) async fn any_device_connected(&self) -> Result<bool, BusError> {
        Ok(self.list_devices().await?.iter().any(|d| d.connected))
    }

    /// Mark a device as allowed to reconnect without pairing again.
    pub(super) async fn trust_device(&self, device: &str) -> Result<(), BusError> {
        self.gateway
            .set_property(
                BLUEZ_SERVICE,
                device,
                DEVICE_IFACE,
                "Trusted",
                Value::Bool(true),
            )
            .await?;
        info!("Trusted device {}", device);
        Ok(())
    }

    /// Initial status from the live adapter; fails if there is no adapter.
    pub(super) async fn sync_from_adapter(&self) -> Result<AdapterStatus, BusError> {
        let powered = self.adapter_flag("Powered").await?;
        let discoverable = powered && self.adapter_flag("Discoverable").await.unwrap_or(false);
        let pairable = powered && self.adapter_flag("Pairable").await.unwrap_or(false);
        let devices = match self.list_devices().await {
            Ok(devices) => devices,
            Err(e) => {
                warn!("Could not enumerate devices: {}", e);
                Vec::new()
            }
        };

        let adapter = self.adapter_path.clone();
        Ok(self.status.update(move |s| {
            *s = AdapterStatus {
                adapter,
                powered,
                discoverable,
                pairable,
                known_devices: devices,
                ..AdapterStatus::default()
            };
        }))
    }

    pub(super) async fn power_up(self: &Arc<Self>) -> Result<(), BluetoothError> {
        if self.is_adapter_on().await {
            debug!("Adapter already powered");
            self.status.update(|s| s.powered = true);
            self.ensure_idle_monitor().await;
            return Ok(());
        }

        self.set_adapter_flag("Powered", true).await?;
        self.set_adapter_flag("Discoverable", false).await?;
        self.set_adapter_flag("Pairable", false).await?;
        self.status.update(|s| {
            s.powered = true;
            s.end_pairing();
        });
        info!("Adapter {} powered on", self.adapter_path);

        if let Err(e) = self.refresh_known_devices().await {
            warn!("Could not refresh known devices after power-up: {}", e);
        }
        self.ensure_idle_monitor().await;
        Ok(())
    }

    pub(super) async fn power_down(&self) -> Result<(), BluetoothError> {
        if !self.status.snapshot().powered {
            debug!("Adapter already off");
            return Ok(());
        }
        self.power_off_adapter().await?;
        Ok(())
    }

    /// Power off unconditionally and stop everything that needs power,
    /// including an open pairing session.
    pub(super) async fn power_off_adapter(&self) -> Result<(), BusError> {
        self.set_adapter_flag("Powered", false).await?;
        self.idle_timer.cancel();
        self.stop_idle_monitor();

        let mut session = None;
        self.status.update(|s| {
            s.mark_powered_off();
            session = self.pairing_session.lock().take();
        });
        info!("Adapter {} powered off", self.adapter_path);

        self.cancel_pairing_session(session).await;
        Ok(())
    }

    /// Start the idle monitor unless disabled or already running.
    pub(super) async fn ensure_idle_monitor(self: &Arc<Self>) {
        if self.settings.idle_timeout.is_none() {
            return;
        }
        let running = self
            .idle_monitor
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished());
        if running {
            return;
        }

        let listener = SignalListener::new(
            "idle",
            self.gateway.clone(),
            &self.shutdown,
            self.device_rule(),
            IdleWatcher::new(Arc::downgrade(self)),
        );
        let handle = match listener.start().await {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Idle monitor could not subscribe: {}", e);
                return;
            }
        };

        {
            let mut slot = self.idle_monitor.lock();
            if slot.as_ref().is_some_and(|h| !h.is_finished()) {
                // Lost a race with a concurrent power-up
                handle.stop();
                return;
            }
            *slot = Some(handle);
        }
        debug!("Idle monitor started");

        // Nothing connected yet: start counting right away
        self.schedule_idle_power_down().await;
    }

    pub(super) fn stop_idle_monitor(&self) {
        if let Some(handle) = self.idle_monitor.lock().take() {
            handle.stop();
            debug!("Idle monitor stopped");
        }
    }
}
