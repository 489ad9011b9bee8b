//! System bus abstraction used by the desktop backends.
//!
//! Backends never talk to `zbus` directly. They go through [`BusClient`],
//! which covers exactly what they need from the bus: method calls, signal
//! subscriptions by match rule, and exporting an agent object that a peer
//! daemon calls back into. Every outbound round-trip is additionally bounded
//! by the [`Gateway`].
//!
//! ```text
//! ┌──────────────┐   Gateway (timeout)   ┌────────────┐   system bus   ┌───────────┐
//! │  Bluetooth   │──────────────────────>│ BusClient  │───────────────>│ bluetoothd│
//! │  backend     │<──── Signal stream ───│ (ZbusClient)│<──────────────│           │
//! └──────────────┘                       └────────────┘                └───────────┘
//! ```

#[cfg(test)]
pub(crate) mod fake;
pub mod gateway;
#[cfg(target_os = "linux")]
mod zbus_client;

pub use gateway::Gateway;
#[cfg(target_os = "linux")]
pub use zbus_client::ZbusClient;

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Standard properties interface.
pub const PROPERTIES_IFACE: &str = "org.freedesktop.DBus.Properties";

/// Standard object manager interface.
pub const OBJECT_MANAGER_IFACE: &str = "org.freedesktop.DBus.ObjectManager";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BusError {
    #[error("{method} timed out after {after:?}")]
    Timeout { method: String, after: Duration },

    #[error("Unexpected payload: {0}")]
    Protocol(String),

    #[error("Peer rejected call: {name}: {message}")]
    Rejected { name: String, message: String },

    #[error("Not supported: {0}")]
    Unsupported(String),

    #[error("Bus transport error: {0}")]
    Transport(String),
}

impl BusError {
    /// Whether the peer answered with the given D-Bus error name.
    pub fn is_rejection(&self, error_name: &str) -> bool {
        matches!(self, BusError::Rejected { name, .. } if name == error_name)
    }
}

/// Owned bus value, independent of the transport's variant type.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Str(String),
    U32(u32),
    ObjectPath(String),
    /// A value wrapped in a variant (`v`), as `Properties.Set` expects.
    Variant(Box<Value>),
}

impl Value {
    /// Strip any variant wrapping.
    pub fn into_inner(self) -> Value {
        match self {
            Value::Variant(inner) => inner.into_inner(),
            other => other,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Variant(inner) => inner.as_bool(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::ObjectPath(s) => Some(s),
            Value::Variant(inner) => inner.as_str(),
            _ => None,
        }
    }

    pub fn variant(value: Value) -> Value {
        Value::Variant(Box::new(value))
    }
}

/// Subscription filter for asynchronous notifications.
///
/// Only the fields the backends use are modelled. Renders to the standard
/// match rule string via [`fmt::Display`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchRule {
    pub sender: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub path_namespace: Option<String>,
    pub arg0: Option<String>,
}

impl MatchRule {
    /// `PropertiesChanged` for `changed_iface` on any object below `namespace`.
    pub fn properties_changed(sender: &str, namespace: &str, changed_iface: &str) -> Self {
        Self {
            sender: Some(sender.to_string()),
            interface: Some(PROPERTIES_IFACE.to_string()),
            member: Some("PropertiesChanged".to_string()),
            path_namespace: Some(namespace.to_string()),
            arg0: Some(changed_iface.to_string()),
        }
    }

    /// Client-side check of the parts of the rule a [`Signal`] carries.
    pub fn matches(&self, signal: &Signal) -> bool {
        if let Some(ref ns) = self.path_namespace {
            let inside = signal.path == *ns
                || (signal.path.starts_with(ns.as_str())
                    && signal.path[ns.len()..].starts_with('/'));
            if !inside {
                return false;
            }
        }
        match self.arg0 {
            Some(ref iface) => signal.interface == *iface,
            None => true,
        }
    }
}

impl fmt::Display for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "type='signal'")?;
        let parts = [
            ("sender", &self.sender),
            ("interface", &self.interface),
            ("member", &self.member),
            ("path_namespace", &self.path_namespace),
            ("arg0", &self.arg0),
        ];
        for (key, value) in parts {
            if let Some(v) = value {
                write!(f, ",{}='{}'", key, v)?;
            }
        }
        Ok(())
    }
}

/// One `PropertiesChanged` notification.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    /// Object path that emitted the notification.
    pub path: String,
    /// Interface whose properties changed.
    pub interface: String,
    /// Changed property name to new value.
    pub changed: HashMap<String, Value>,
}

impl Signal {
    /// The new boolean value of `property`, if this notification carries one.
    pub fn changed_bool(&self, property: &str) -> Option<bool> {
        self.changed.get(property).and_then(Value::as_bool)
    }
}

/// Identifies one active subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Handle returned by [`BusClient::add_match`].
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub signals: mpsc::Receiver<Signal>,
}

/// An object exposed by the peer's object manager.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManagedObject {
    pub path: String,
    pub interfaces: HashMap<String, HashMap<String, Value>>,
}

/// Callback surface of an authentication agent exported on the bus.
///
/// Device arguments are object paths.
#[async_trait]
pub trait AgentHandler: Send + Sync {
    async fn request_pin_code(&self, device: &str) -> Result<String, BusError>;
    async fn display_pin_code(&self, device: &str, pin_code: &str);
    async fn request_passkey(&self, device: &str) -> Result<u32, BusError>;
    async fn display_passkey(&self, device: &str, passkey: u32, entered: u16);
    async fn request_confirmation(&self, device: &str, passkey: u32) -> Result<(), BusError>;
    async fn request_authorization(&self, device: &str) -> Result<(), BusError>;
    async fn authorize_service(&self, device: &str, uuid: &str) -> Result<(), BusError>;
    async fn release(&self);
    async fn cancel(&self);
}

/// A connected bus client.
#[async_trait]
pub trait BusClient: Send + Sync {
    /// Call `iface.method` on `path` at `destination`.
    async fn call_method(
        &self,
        destination: &str,
        path: &str,
        iface: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Vec<Value>, BusError>;

    /// Enumerate all objects exposed by `destination`.
    async fn managed_objects(&self, destination: &str) -> Result<Vec<ManagedObject>, BusError>;

    /// Subscribe to signals matching `rule` (peer-side `AddMatch`).
    ///
    /// At most `capacity` notifications are buffered.
    async fn add_match(&self, rule: &MatchRule, capacity: usize)
        -> Result<Subscription, BusError>;

    /// Drop a subscription (peer-side `RemoveMatch`).
    async fn remove_match(&self, id: SubscriptionId) -> Result<(), BusError>;

    /// Export an agent object at `path`.
    async fn export_agent(&self, path: &str, handler: Arc<dyn AgentHandler>)
        -> Result<(), BusError>;

    /// Remove the agent object at `path`.
    async fn unexport_agent(&self, path: &str) -> Result<(), BusError>;

    /// Release the connection.
    async fn disconnect(&self);
}
