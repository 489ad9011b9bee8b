//! Exclusive, time-limited pairing sessions.
//!
//! Only one session may exist at a time. The session lock is taken with a
//! non-blocking attempt; whoever gets it moves the guard into the background
//! task that watches for a newly paired device, and that task releases it
//! after resetting the adapter flags.
//!
//! A power-down cancels the open session and waits for that task to let go
//! of the lock, so the next request after powering back up starts a fresh
//! session.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::listener::{Flow, SignalHandler, SignalListener};
use super::{BluetoothError, Inner};
use crate::bus::Signal;

impl Inner {
    pub(super) async fn new_pairing(self: &Arc<Self>) -> Result<(), BluetoothError> {
        let session = match Arc::clone(&self.pairing_lock).try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                info!("Pairing session already active, ignoring request");
                return Ok(());
            }
        };

        // Returning early drops `session`, which frees the lock
        self.register_agent().await?;
        self.power_up().await?;
        self.open_adapter_for_pairing().await?;

        let timeout = self.settings.pairing_timeout;
        let until = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d));
        let cancel = self.shutdown.child_token();

        // A power-down may have run since power_up returned
        let mut opened = false;
        self.status.update(|s| {
            if !s.powered {
                return;
            }
            s.discoverable = true;
            s.pairable = true;
            s.pairing_active = true;
            s.pairing_until = until;
            *self.pairing_session.lock() = Some(cancel.clone());
            opened = true;
        });
        if !opened {
            warn!("Adapter powered off while opening the pairing session");
            self.close_adapter_for_pairing().await;
            return Err(BluetoothError::PoweredOff);
        }
        info!("Pairing session open for {:?}", timeout);

        let listener = SignalListener::new(
            "pairing",
            self.gateway.clone(),
            &cancel,
            self.device_rule(),
            PairingWatcher {
                inner: Arc::clone(self),
            },
        )
        .with_deadline(Instant::now() + timeout);

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.run_pairing_session(listener, session).await;
        });
        Ok(())
    }

    async fn open_adapter_for_pairing(&self) -> Result<(), BluetoothError> {
        self.set_adapter_timeout("DiscoverableTimeout", self.settings.discoverable_timeout)
            .await?;
        self.set_adapter_timeout("PairableTimeout", self.settings.pairable_timeout)
            .await?;

        let opened = async {
            self.set_adapter_flag("Discoverable", true).await?;
            self.set_adapter_flag("Pairable", true).await
        };
        if let Err(e) = opened.await {
            warn!("Could not open adapter for pairing: {}", e);
            self.close_adapter_for_pairing().await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Best-effort reset of the pairing flags.
    async fn close_adapter_for_pairing(&self) {
        for flag in ["Discoverable", "Pairable"] {
            if let Err(e) = self.set_adapter_flag(flag, false).await {
                warn!("Failed to clear {}: {}", flag, e);
            }
        }
    }

    /// Own the session until it ends, then clean up exactly once.
    async fn run_pairing_session(
        self: &Arc<Self>,
        listener: SignalListener<PairingWatcher>,
        session: OwnedMutexGuard<()>,
    ) {
        match listener.start().await {
            Ok(handle) => {
                let reason = handle.join().await;
                debug!("Pairing listener ended: {:?}", reason);
            }
            Err(e) => warn!("Pairing listener could not subscribe: {}", e),
        }

        self.finish_pairing().await;
        drop(session);
    }

    async fn finish_pairing(self: &Arc<Self>) {
        // Powered off meanwhile: the power-down already cleared everything
        if self.status.snapshot().powered {
            self.close_adapter_for_pairing().await;
        }
        let mut powered = false;
        self.status.update(|s| {
            s.end_pairing();
            self.pairing_session.lock().take();
            powered = s.powered;
        });
        info!("Pairing session closed");

        if powered && !self.closed.load(Ordering::SeqCst) {
            self.schedule_idle_power_down().await;
        }
    }

    /// End the open session, if any, and wait until its task has cleaned up
    /// and released the session lock.
    pub(super) async fn cancel_pairing_session(&self, session: Option<CancellationToken>) {
        let Some(session) = session else {
            return;
        };
        session.cancel();
        drop(self.pairing_lock.lock().await);
        debug!("Pairing session cancelled");
    }
}

/// Ends the session once a device reports `Paired=true`.
struct PairingWatcher {
    inner: Arc<Inner>,
}

#[async_trait]
impl SignalHandler for PairingWatcher {
    async fn handle(&mut self, signal: Signal) -> Flow {
        if signal.changed_bool("Paired") != Some(true) {
            return Flow::Continue;
        }

        info!("Device {} paired", signal.path);
        if let Err(e) = self.inner.trust_device(&signal.path).await {
            warn!("Could not trust {}: {}", signal.path, e);
        }
        if let Err(e) = self.inner.refresh_known_devices().await {
            warn!("Could not refresh known devices: {}", e);
        }
        Flow::Stop
    }
}
