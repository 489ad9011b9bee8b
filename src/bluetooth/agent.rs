//! Headless pairing agent.
//!
//! Registered with capability `NoInputNoOutput`, so peers fall back to
//! "just works" pairing. Every request is accepted and the device is
//! trusted right away.

use async_trait::async_trait;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use super::{
    BluetoothError, Inner, AGENT_CAPABILITY, AGENT_MANAGER_IFACE, AGENT_MANAGER_PATH,
    AGENT_PATH, BLUEZ_SERVICE, DEFAULT_PASSKEY, DEFAULT_PIN, ERROR_ALREADY_EXISTS,
};
use crate::bus::{AgentHandler, BusError, Value};

pub(super) struct PairingAgent {
    inner: Weak<Inner>,
}

impl PairingAgent {
    /// Trust `device` and refresh the cached device list.
    async fn accept(&self, device: &str) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        if let Err(e) = inner.trust_device(device).await {
            warn!("Accepting {} without trust: {}", device, e);
        }
        if let Err(e) = inner.refresh_known_devices().await {
            warn!("Could not refresh known devices: {}", e);
        }
    }
}

#[async_trait]
impl AgentHandler for PairingAgent {
    async fn request_pin_code(&self, device: &str) -> Result<String, BusError> {
        debug!("PIN code requested by {}", device);
        self.accept(device).await;
        Ok(DEFAULT_PIN.to_string())
    }

    async fn display_pin_code(&self, device: &str, pin_code: &str) {
        debug!("PIN code for {}: {}", device, pin_code);
    }

    async fn request_passkey(&self, device: &str) -> Result<u32, BusError> {
        debug!("Passkey requested by {}", device);
        self.accept(device).await;
        Ok(DEFAULT_PASSKEY)
    }

    async fn display_passkey(&self, device: &str, passkey: u32, entered: u16) {
        debug!("Passkey for {}: {:06} ({} entered)", device, passkey, entered);
    }

    async fn request_confirmation(&self, device: &str, passkey: u32) -> Result<(), BusError> {
        debug!("Confirming passkey {:06} for {}", passkey, device);
        self.accept(device).await;
        Ok(())
    }

    async fn request_authorization(&self, device: &str) -> Result<(), BusError> {
        debug!("Authorizing {}", device);
        self.accept(device).await;
        Ok(())
    }

    async fn authorize_service(&self, device: &str, uuid: &str) -> Result<(), BusError> {
        debug!("Authorizing service {} for {}", uuid, device);
        self.accept(device).await;
        Ok(())
    }

    async fn release(&self) {
        info!("Pairing agent released by bluetoothd");
        if let Some(inner) = self.inner.upgrade() {
            *inner.agent_registered.lock().await = false;
        }
    }

    async fn cancel(&self) {
        debug!("Pairing request cancelled");
    }
}

impl Inner {
    /// Export the agent and register it as the default. No-op when already
    /// registered.
    pub(super) async fn register_agent(self: &Arc<Self>) -> Result<(), BluetoothError> {
        let mut registered = self.agent_registered.lock().await;
        if *registered {
            return Ok(());
        }

        let agent = Arc::new(PairingAgent {
            inner: Arc::downgrade(self),
        });
        self.gateway.export_agent(AGENT_PATH, agent).await?;

        let args = vec![
            Value::ObjectPath(AGENT_PATH.to_string()),
            Value::Str(AGENT_CAPABILITY.to_string()),
        ];
        match self
            .gateway
            .call(BLUEZ_SERVICE, AGENT_MANAGER_PATH, AGENT_MANAGER_IFACE, "RegisterAgent", args)
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_rejection(ERROR_ALREADY_EXISTS) => {
                debug!("Agent already registered with bluetoothd");
            }
            Err(e) => {
                if let Err(unexport) = self.gateway.unexport_agent(AGENT_PATH).await {
                    warn!("Failed to unexport agent: {}", unexport);
                }
                return Err(e.into());
            }
        }

        let default = vec![Value::ObjectPath(AGENT_PATH.to_string())];
        if let Err(e) = self
            .gateway
            .call(
                BLUEZ_SERVICE,
                AGENT_MANAGER_PATH,
                AGENT_MANAGER_IFACE,
                "RequestDefaultAgent",
                default,
            )
            .await
        {
            warn!("Could not become the default agent: {}", e);
        }

        *registered = true;
        info!("Pairing agent registered at {} ({})", AGENT_PATH, AGENT_CAPABILITY);
        Ok(())
    }

    /// Unregister and unexport the agent if it is registered.
    pub(super) async fn unregister_agent(&self) {
        let mut registered = self.agent_registered.lock().await;
        if !*registered {
            return;
        }
        *registered = false;

        let args = vec![Value::ObjectPath(AGENT_PATH.to_string())];
        if let Err(e) = self
            .gateway
            .call(BLUEZ_SERVICE, AGENT_MANAGER_PATH, AGENT_MANAGER_IFACE, "UnregisterAgent", args)
            .await
        {
            warn!("Failed to unregister agent: {}", e);
        }
        if let Err(e) = self.gateway.unexport_agent(AGENT_PATH).await {
            warn!("Failed to unexport agent: {}", e);
        }
        debug!("Pairing agent unregistered");
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::DEVICE_IFACE;
    use super::*;

    #[tokio::test]
    async fn test_register_once() {
        let bus = adapter_bus();
        let backend = backend(&bus, &config(60, 0)).await;
        let inner = backend.inner().unwrap();

        inner.register_agent().await.unwrap();
        inner.register_agent().await.unwrap();

        let calls = bus.calls_to("RegisterAgent");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].path, AGENT_MANAGER_PATH);
        assert_eq!(
            calls[0].args,
            vec![
                Value::ObjectPath(AGENT_PATH.into()),
                Value::Str("NoInputNoOutput".into())
            ]
        );
        assert_eq!(bus.calls_to("RequestDefaultAgent").len(), 1);
        assert_eq!(bus.agent().map(|(path, _)| path), Some(AGENT_PATH.to_string()));
    }

    #[tokio::test]
    async fn test_already_exists_is_success() {
        let bus = adapter_bus();
        let backend = backend(&bus, &config(60, 0)).await;
        bus.fail_on(
            "RegisterAgent",
            BusError::Rejected {
                name: ERROR_ALREADY_EXISTS.into(),
                message: "Already Exists".into(),
            },
        );

        backend.inner().unwrap().register_agent().await.unwrap();
        assert!(bus.agent().is_some());
    }

    #[tokio::test]
    async fn test_default_agent_failure_is_tolerated() {
        let bus = adapter_bus();
        let backend = backend(&bus, &config(60, 0)).await;
        bus.fail_on("RequestDefaultAgent", BusError::Transport("gone".into()));

        backend.inner().unwrap().register_agent().await.unwrap();
        assert!(bus.agent().is_some());
    }

    #[tokio::test]
    async fn test_agent_accepts_and_trusts() {
        let bus = adapter_bus();
        let dev = device("AA");
        bus.add_device(&dev, "AA", false, false);
        let backend = backend(&bus, &config(60, 0)).await;
        backend.inner().unwrap().register_agent().await.unwrap();
        let (_, agent) = bus.agent().unwrap();

        assert_eq!(agent.request_pin_code(&dev).await.unwrap(), "0000");
        assert_eq!(agent.request_passkey(&dev).await.unwrap(), 0);
        agent.request_confirmation(&dev, 123456).await.unwrap();
        agent.request_authorization(&dev).await.unwrap();
        agent.authorize_service(&dev, "0000110b-0000-1000-8000-00805f9b34fb").await.unwrap();

        assert_eq!(
            bus.get(&dev, DEVICE_IFACE, "Trusted"),
            Some(Value::Bool(true))
        );
        assert!(backend.status().known_devices[0].trusted);
    }

    #[tokio::test]
    async fn test_service_authorization_trusts_device() {
        let bus = adapter_bus();
        let dev = device("BB");
        bus.add_device(&dev, "BB", true, true);
        let backend = backend(&bus, &config(60, 0)).await;
        backend.inner().unwrap().register_agent().await.unwrap();
        let (_, agent) = bus.agent().unwrap();

        agent
            .authorize_service(&dev, "0000110b-0000-1000-8000-00805f9b34fb")
            .await
            .unwrap();

        assert_eq!(bus.property_sets(DEVICE_IFACE, "Trusted"), vec![Value::Bool(true)]);
        assert!(backend.status().known_devices[0].trusted);
    }

    #[tokio::test]
    async fn test_trust_failure_still_accepts() {
        let bus = adapter_bus();
        let dev = device("AA");
        bus.add_device(&dev, "AA", false, false);
        let backend = backend(&bus, &config(60, 0)).await;
        backend.inner().unwrap().register_agent().await.unwrap();
        let (_, agent) = bus.agent().unwrap();
        bus.fail_on("Set:Trusted", BusError::Transport("gone".into()));

        agent.request_confirmation(&dev, 1).await.unwrap();
        assert!(!backend.status().known_devices[0].trusted);
    }

    #[tokio::test]
    async fn test_release_forces_reregistration() {
        let bus = adapter_bus();
        let backend = backend(&bus, &config(60, 0)).await;
        let inner = backend.inner().unwrap();
        inner.register_agent().await.unwrap();
        let (_, agent) = bus.agent().unwrap();

        agent.release().await;
        inner.register_agent().await.unwrap();
        assert_eq!(bus.calls_to("RegisterAgent").len(), 2);
    }

    #[tokio::test]
    async fn test_release_waits_for_registration_lock() {
        let bus = adapter_bus();
        let backend = backend(&bus, &config(60, 0)).await;
        let inner = backend.inner().unwrap();
        inner.register_agent().await.unwrap();
        let (_, agent) = bus.agent().unwrap();

        let held = inner.agent_registered.lock().await;
        let release = tokio::spawn(async move { agent.release().await });
        settle().await;
        assert!(!release.is_finished());

        drop(held);
        release.await.unwrap();
        assert!(!*inner.agent_registered.lock().await);

        inner.register_agent().await.unwrap();
        assert_eq!(bus.calls_to("RegisterAgent").len(), 2);
    }

    #[tokio::test]
    async fn test_unregister() {
        let bus = adapter_bus();
        let backend = backend(&bus, &config(60, 0)).await;
        let inner = backend.inner().unwrap();

        // Nothing registered yet
        inner.unregister_agent().await;
        assert!(bus.calls_to("UnregisterAgent").is_empty());

        inner.register_agent().await.unwrap();
        inner.unregister_agent().await;
        assert_eq!(bus.calls_to("UnregisterAgent").len(), 1);
        assert!(bus.agent().is_none());
    }
}
