//! Generic subscribe/dispatch loop for bus notifications.
//!
//! A [`SignalListener`] owns one match rule and one [`SignalHandler`]. It is
//! single-use: [`SignalListener::start`] subscribes and spawns the dispatch
//! loop, which ends when the handler returns [`Flow::Stop`], the notification
//! channel closes, the deadline passes, or the cancellation token fires.
//! The subscription is removed on every exit path.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::{BusError, Gateway, MatchRule, Signal, SubscriptionId};

/// Notifications buffered while the handler runs.
pub const QUEUE_CAPACITY: usize = 16;

/// What the dispatch loop does after a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Per-notification callback.
///
/// Errors are the handler's business: it logs and returns
/// [`Flow::Continue`] for notifications it cannot use.
#[async_trait]
pub trait SignalHandler: Send + 'static {
    async fn handle(&mut self, signal: Signal) -> Flow;
}

/// Why a dispatch loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Completed,
    Cancelled,
    Expired,
    ChannelClosed,
}

pub struct SignalListener<H> {
    name: &'static str,
    gateway: Gateway,
    rule: MatchRule,
    handler: H,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl<H: SignalHandler> SignalListener<H> {
    /// Create a listener whose lifetime is bounded by `parent`.
    pub fn new(
        name: &'static str,
        gateway: Gateway,
        parent: &CancellationToken,
        rule: MatchRule,
        handler: H,
    ) -> Self {
        Self {
            name,
            gateway,
            rule,
            handler,
            cancel: parent.child_token(),
            deadline: None,
        }
    }

    /// Stop dispatching at `deadline`.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Subscribe and launch the dispatch loop.
    pub async fn start(self) -> Result<ListenerHandle, BusError> {
        let subscription = self
            .gateway
            .add_match(&self.rule, QUEUE_CAPACITY)
            .await?;
        debug!("{} listener subscribed: {}", self.name, self.rule);

        let cancel = self.cancel.clone();
        let task = tokio::spawn(self.run(subscription.id, subscription.signals));
        Ok(ListenerHandle { cancel, task })
    }

    async fn run(mut self, id: SubscriptionId, mut signals: mpsc::Receiver<Signal>) -> ExitReason {
        let deadline = self.deadline;
        let expiry = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(expiry);

        let reason = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break ExitReason::Cancelled,
                _ = &mut expiry => break ExitReason::Expired,
                received = signals.recv() => match received {
                    Some(signal) => {
                        if self.handler.handle(signal).await == Flow::Stop {
                            break ExitReason::Completed;
                        }
                    }
                    None => break ExitReason::ChannelClosed,
                },
            }
        };

        if let Err(e) = self.gateway.remove_match(id).await {
            warn!("{} listener: failed to remove match: {}", self.name, e);
        }
        drop(signals);
        debug!("{} listener stopped ({:?})", self.name, reason);
        reason
    }
}

/// Handle to a running dispatch loop.
#[derive(Debug)]
pub struct ListenerHandle {
    cancel: CancellationToken,
    task: JoinHandle<ExitReason>,
}

impl ListenerHandle {
    /// Ask the loop to exit; takes effect within one dispatch cycle.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the loop to exit.
    pub async fn join(self) -> ExitReason {
        match self.task.await {
            Ok(reason) => reason,
            Err(e) => {
                warn!("Listener task failed: {}", e);
                ExitReason::Cancelled
            }
        }
    }

    /// Stop and wait for the loop to exit.
    pub async fn shutdown(self) -> ExitReason {
        self.stop();
        self.join().await
    }
}
