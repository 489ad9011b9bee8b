//! Bluetooth adapter control through BlueZ.
//!
//! Adapter power lifecycle, exclusive pairing sessions, and idle power-down.
//!
//! # States
//!
//! ```text
//!            PowerUp                    NewPairing
//!   ┌─────┐ ────────> ┌────────┐ ─────────────────────> ┌───────────┐
//!   │ Off │           │ OnIdle │                        │ OnPairing │
//!   └─────┘ <──────── └────────┘ <───────────────────── └───────────┘
//!      ^    PowerDown      │      deadline or paired=true     │
//!      └──────────────────────────────────────────────────────┘
//!                  PowerDown / idle timeout
//! ```
//!
//! Two listeners may run at once: the idle monitor for as long as the
//! adapter is on, and one pairing listener per session. Both watch
//! `Device1` property changes below the adapter path.

mod adapter;
mod agent;
mod idle;
pub mod listener;
mod pairing;
pub mod status;

pub use listener::{Flow, SignalHandler, SignalListener};
pub use status::{AdapterStatus, KnownDevice, StatusCache, StatusStore};

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::{BusClient, BusError, Gateway, MatchRule};
use crate::config::BluetoothConfig;
use idle::IdleTimer;
use listener::ListenerHandle;

/// BlueZ bus name.
pub const BLUEZ_SERVICE: &str = "org.bluez";
pub const ADAPTER_IFACE: &str = "org.bluez.Adapter1";
pub const DEVICE_IFACE: &str = "org.bluez.Device1";
pub const AGENT_MANAGER_IFACE: &str = "org.bluez.AgentManager1";
pub const AGENT_MANAGER_PATH: &str = "/org/bluez";

/// Where the pairing agent is exported.
pub const AGENT_PATH: &str = "/org/deskctl/agent";

/// Headless agents can neither show nor enter codes.
pub const AGENT_CAPABILITY: &str = "NoInputNoOutput";

/// Returned by `RegisterAgent` when the agent is already registered.
pub const ERROR_ALREADY_EXISTS: &str = "org.bluez.Error.AlreadyExists";

pub const DEFAULT_PIN: &str = "0000";
pub const DEFAULT_PASSKEY: u32 = 0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BluetoothError {
    #[error("Bluetooth backend is disabled")]
    Disabled,

    #[error("Bluetooth backend is shut down")]
    Closed,

    #[error("Adapter was powered off before the pairing session opened")]
    PoweredOff,

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
}

/// Runtime settings derived from [`BluetoothConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct BluetoothSettings {
    /// Adapter name, e.g. `hci0`
    pub adapter: String,
    pub call_timeout: Duration,
    pub pairing_timeout: Duration,
    /// `None` disables idle power-down
    pub idle_timeout: Option<Duration>,
    /// Peer-side discoverable timeout, seconds
    pub discoverable_timeout: u32,
    /// Peer-side pairable timeout, seconds
    pub pairable_timeout: u32,
}

impl From<&BluetoothConfig> for BluetoothSettings {
    fn from(config: &BluetoothConfig) -> Self {
        let safety = config.pairing_timeout_secs.saturating_add(10);
        let or_safety = |secs: u32| if secs == 0 { safety } else { secs };

        Self {
            adapter: config.adapter.clone(),
            call_timeout: Duration::from_secs(u64::from(config.call_timeout_secs)),
            pairing_timeout: Duration::from_secs(u64::from(config.pairing_timeout_secs)),
            idle_timeout: (config.idle_timeout_secs > 0)
                .then(|| Duration::from_secs(u64::from(config.idle_timeout_secs))),
            discoverable_timeout: or_safety(config.discoverable_timeout_secs),
            pairable_timeout: or_safety(config.pairable_timeout_secs),
        }
    }
}

/// State shared between the public backend, listeners, timers and the agent.
pub(crate) struct Inner {
    gateway: Gateway,
    adapter_path: String,
    settings: BluetoothSettings,
    status: StatusStore,
    /// Held for the whole lifetime of a pairing session.
    pairing_lock: Arc<tokio::sync::Mutex<()>>,
    /// Cancels the open pairing session. Set and taken only inside status
    /// updates, together with `pairing_active`.
    pairing_session: Mutex<Option<CancellationToken>>,
    idle_timer: IdleTimer,
    idle_monitor: Mutex<Option<ListenerHandle>>,
    agent_registered: tokio::sync::Mutex<bool>,
    /// Parent of every listener token.
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl Inner {
    fn new(gateway: Gateway, settings: BluetoothSettings, cache: Arc<StatusCache>) -> Self {
        Self {
            gateway,
            adapter_path: format!("/org/bluez/{}", settings.adapter),
            settings,
            status: StatusStore::new(cache),
            pairing_lock: Arc::new(tokio::sync::Mutex::new(())),
            pairing_session: Mutex::new(None),
            idle_timer: IdleTimer::new(),
            idle_monitor: Mutex::new(None),
            agent_registered: tokio::sync::Mutex::new(false),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// `PropertiesChanged` on any device below this adapter.
    fn device_rule(&self) -> MatchRule {
        MatchRule::properties_changed(BLUEZ_SERVICE, &self.adapter_path, DEVICE_IFACE)
    }

    fn ensure_open(&self) -> Result<(), BluetoothError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BluetoothError::Closed)
        } else {
            Ok(())
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down Bluetooth backend");

        self.shutdown.cancel();
        self.idle_timer.cancel();
        self.stop_idle_monitor();
        self.unregister_agent().await;

        if let Err(e) = self.power_off_adapter().await {
            warn!("Failed to power off adapter on shutdown: {}", e);
        }
        self.gateway.disconnect().await;
    }
}

/// Bluetooth backend handle used by the HTTP layer.
///
/// A backend without an adapter is *disabled*: status reads return the zero
/// value and control operations fail with [`BluetoothError::Disabled`].
pub struct BluetoothBackend {
    inner: Option<Arc<Inner>>,
}

impl BluetoothBackend {
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    /// Connect the backend to the configured adapter.
    ///
    /// Never fails: a disabled config or a missing adapter yields a disabled
    /// backend so the rest of the daemon can still start.
    pub async fn probe(
        client: Arc<dyn BusClient>,
        cache: Arc<StatusCache>,
        config: &BluetoothConfig,
    ) -> Self {
        if !config.enabled {
            info!("Bluetooth backend disabled in config");
            return Self::disabled();
        }

        let settings = BluetoothSettings::from(config);
        let gateway = Gateway::new(client, settings.call_timeout);
        let inner = Arc::new(Inner::new(gateway, settings, cache));

        match inner.sync_from_adapter().await {
            Ok(status) => {
                info!(
                    "Bluetooth adapter {} ready (powered: {}, {} known devices)",
                    status.adapter,
                    status.powered,
                    status.known_devices.len()
                );
                Self { inner: Some(inner) }
            }
            Err(e) => {
                warn!(
                    "No usable Bluetooth adapter at {}: {}; backend disabled",
                    inner.adapter_path, e
                );
                Self::disabled()
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    fn inner(&self) -> Result<&Arc<Inner>, BluetoothError> {
        let inner = self.inner.as_ref().ok_or(BluetoothError::Disabled)?;
        inner.ensure_open()?;
        Ok(inner)
    }

    /// Power the adapter on. No-op if it already is.
    pub async fn power_up(&self) -> Result<(), BluetoothError> {
        self.inner()?.power_up().await
    }

    /// Power the adapter off. No-op if it already is.
    pub async fn power_down(&self) -> Result<(), BluetoothError> {
        self.inner()?.power_down().await
    }

    /// Start a pairing session.
    ///
    /// Returns `Ok` without doing anything when a session is already active.
    pub async fn new_pairing(&self) -> Result<(), BluetoothError> {
        self.inner()?.new_pairing().await
    }

    /// Current status snapshot; the zero value if nothing is known yet.
    pub fn status(&self) -> AdapterStatus {
        self.inner
            .as_ref()
            .map(|inner| inner.status.snapshot())
            .unwrap_or_default()
    }

    /// Unregister the agent, power the adapter down and release the bus.
    ///
    /// Safe to call more than once.
    pub async fn close(&self) {
        if let Some(inner) = &self.inner {
            inner.close().await;
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::bus::fake::FakeBus;
    use crate::bus::Value;

    #[test]
    fn test_settings_from_config() {
        let settings = BluetoothSettings::from(&config(60, 0));
        assert_eq!(settings.pairing_timeout, Duration::from_secs(60));
        assert_eq!(settings.idle_timeout, None);
        assert_eq!(settings.discoverable_timeout, 70);
        assert_eq!(settings.pairable_timeout, 70);

        let explicit = BluetoothConfig {
            idle_timeout_secs: 300,
            discoverable_timeout_secs: 120,
            ..BluetoothConfig::default()
        };
        let settings = BluetoothSettings::from(&explicit);
        assert_eq!(settings.idle_timeout, Some(Duration::from_secs(300)));
        assert_eq!(settings.discoverable_timeout, 120);
    }

    #[tokio::test]
    async fn test_status_before_any_operation() {
        let bus = adapter_bus();
        let backend = backend(&bus, &config(60, 0)).await;

        let status = backend.status();
        assert!(!status.powered);
        assert!(status.known_devices.is_empty());
        assert_eq!(status.adapter, ADAPTER);
    }

    #[tokio::test]
    async fn test_disabled_backend() {
        let backend = BluetoothBackend::disabled();
        assert_eq!(backend.status(), AdapterStatus::default());
        assert_eq!(backend.power_up().await, Err(BluetoothError::Disabled));
        assert_eq!(backend.new_pairing().await, Err(BluetoothError::Disabled));
        backend.close().await;
    }

    #[tokio::test]
    async fn test_missing_adapter_disables_backend() {
        let bus = FakeBus::new();
        let backend =
            BluetoothBackend::probe(bus.clone(), Arc::new(StatusCache::new()), &config(60, 0))
                .await;
        assert!(!backend.is_enabled());
        assert!(!backend.status().powered);
    }

    #[tokio::test]
    async fn test_disabled_in_config_issues_no_calls() {
        let bus = adapter_bus();
        let config = BluetoothConfig {
            enabled: false,
            ..BluetoothConfig::default()
        };
        let backend =
            BluetoothBackend::probe(bus.clone(), Arc::new(StatusCache::new()), &config).await;
        assert!(!backend.is_enabled());
        assert_eq!(bus.call_count(), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let bus = adapter_bus();
        let backend = backend(&bus, &config(60, 30)).await;
        backend.power_up().await.unwrap();
        backend.new_pairing().await.unwrap();
        assert!(bus.agent().is_some());

        backend.close().await;
        settle().await;
        let calls_after_first = bus.call_count();
        backend.close().await;

        assert_eq!(bus.call_count(), calls_after_first);
        assert!(bus.is_disconnected());
        assert!(bus.agent().is_none());
        assert_eq!(bus.calls_to("UnregisterAgent").len(), 1);
        assert_eq!(
            bus.get(ADAPTER, ADAPTER_IFACE, "Powered"),
            Some(Value::Bool(false))
        );
        assert!(!backend.status().powered);
        assert_eq!(backend.power_up().await, Err(BluetoothError::Closed));
        assert_eq!(bus.active_subscriptions(), 0);
    }
}
