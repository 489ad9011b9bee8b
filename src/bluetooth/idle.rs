//! Idle power-down: switch the adapter off after a stretch with no
//! connected device.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::listener::{Flow, SignalHandler};
use super::Inner;
use crate::bus::Signal;

struct Armed {
    id: u64,
    task: JoinHandle<()>,
}

/// At most one pending delayed action.
///
/// The slot has its own lock, separate from the status lock. A fired timer
/// claims the slot before running its action, so a concurrent
/// [`IdleTimer::cancel`] either aborts it or finds nothing to cancel.
///
/// Arming is tied to an activity count read before the caller decided the
/// adapter is idle. Activity reported in between refuses the arm, so a
/// decision based on a stale device query never outlives a connection.
pub(crate) struct IdleTimer {
    slot: Arc<Mutex<Option<Armed>>>,
    next_id: AtomicU64,
    activity: AtomicU64,
}

impl IdleTimer {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(1),
            activity: AtomicU64::new(0),
        }
    }

    /// Activity count to pass to [`IdleTimer::arm`].
    pub fn activity(&self) -> u64 {
        self.activity.load(Ordering::SeqCst)
    }

    /// Record activity and disarm; returns whether a timer was pending.
    pub fn note_activity(&self) -> bool {
        self.activity.fetch_add(1, Ordering::SeqCst);
        self.cancel()
    }

    pub fn is_armed(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Disarm; returns whether a timer was pending.
    pub fn cancel(&self) -> bool {
        match self.slot.lock().take() {
            Some(armed) => {
                armed.task.abort();
                true
            }
            None => false,
        }
    }

    /// Run `action` after `after` unless cancelled first.
    ///
    /// Returns `false` and does nothing if a timer is already pending or if
    /// activity was noted since `seen` was read.
    pub fn arm<F, Fut>(&self, after: Duration, seen: u64, action: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.slot.lock();
        if slot.is_some() || self.activity() != seen {
            return false;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::clone(&self.slot);
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            {
                let mut slot = shared.lock();
                if slot.as_ref().map(|armed| armed.id) != Some(id) {
                    return;
                }
                slot.take();
            }
            action().await;
        });
        *slot = Some(Armed { id, task });
        true
    }
}

impl Inner {
    /// Arm the idle timer if idle power-down is on and nothing is connected.
    pub(super) async fn schedule_idle_power_down(self: &Arc<Self>) {
        let Some(after) = self.settings.idle_timeout else {
            return;
        };
        if self.idle_timer.is_armed() {
            return;
        }
        let seen = self.idle_timer.activity();
        match self.any_device_connected().await {
            Ok(false) => {}
            Ok(true) => return,
            Err(e) => {
                warn!("Could not check connected devices: {}", e);
                return;
            }
        }

        let weak = Arc::downgrade(self);
        let armed = self.idle_timer.arm(after, seen, move || async move {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            // Re-armed when the session ends
            if inner.status.snapshot().pairing_active {
                debug!("Pairing in progress, idle power-down deferred");
                return;
            }
            info!("No device connected for {:?}, powering adapter off", after);
            if let Err(e) = inner.power_down().await {
                warn!("Idle power-down failed: {}", e);
            }
        });
        if armed {
            debug!("Idle timer armed for {:?}", after);
        } else {
            debug!("Idle timer left unarmed");
        }
    }
}

/// Reacts to device connection changes while the adapter is on.
pub(super) struct IdleWatcher {
    inner: Weak<Inner>,
}

impl IdleWatcher {
    pub fn new(inner: Weak<Inner>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl SignalHandler for IdleWatcher {
    async fn handle(&mut self, signal: Signal) -> Flow {
        let Some(inner) = self.inner.upgrade() else {
            return Flow::Stop;
        };

        match signal.changed_bool("Connected") {
            Some(true) => {
                if inner.idle_timer.note_activity() {
                    debug!("{} connected, idle timer cancelled", signal.path);
                }
                inner.status.update(|s| {
                    let device = s.known_devices.iter_mut().find(|d| d.path == signal.path);
                    if let Some(device) = device {
                        device.connected = true;
                    }
                });
            }
            Some(false) => {
                inner.status.update(|s| {
                    let device = s.known_devices.iter_mut().find(|d| d.path == signal.path);
                    if let Some(device) = device {
                        device.connected = false;
                    }
                });
                inner.schedule_idle_power_down().await;
            }
            None => {}
        }
        Flow::Continue
    }
}
