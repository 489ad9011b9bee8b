//! Timeout-bounded access to a [`BusClient`].
//!
//! A peer that never replies must not stall the caller, so every round-trip
//! is raced against the configured call timeout. No retries happen here.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{
    AgentHandler, BusClient, BusError, ManagedObject, MatchRule, Subscription, SubscriptionId,
    Value, PROPERTIES_IFACE,
};

/// Bus client wrapper that turns "never replies" into [`BusError::Timeout`].
#[derive(Clone)]
pub struct Gateway {
    client: Arc<dyn BusClient>,
    timeout: Duration,
}

impl Gateway {
    pub fn new(client: Arc<dyn BusClient>, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Call a method on a peer object.
    pub async fn call(
        &self,
        destination: &str,
        path: &str,
        iface: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Vec<Value>, BusError> {
        debug!("bus call {}.{} on {}", iface, method, path);
        self.bounded(
            method,
            self.client
                .call_method(destination, path, iface, method, args),
        )
        .await
    }

    /// `org.freedesktop.DBus.Properties.Get`.
    pub async fn get_property(
        &self,
        destination: &str,
        path: &str,
        iface: &str,
        name: &str,
    ) -> Result<Value, BusError> {
        let reply = self
            .call(
                destination,
                path,
                PROPERTIES_IFACE,
                "Get",
                vec![Value::Str(iface.to_string()), Value::Str(name.to_string())],
            )
            .await?;

        reply
            .into_iter()
            .next()
            .map(Value::into_inner)
            .ok_or_else(|| BusError::Protocol(format!("empty reply reading {}.{}", iface, name)))
    }

    /// Read a boolean property.
    pub async fn get_bool(
        &self,
        destination: &str,
        path: &str,
        iface: &str,
        name: &str,
    ) -> Result<bool, BusError> {
        let value = self.get_property(destination, path, iface, name).await?;
        value.as_bool().ok_or_else(|| {
            BusError::Protocol(format!("{}.{} is not a boolean: {:?}", iface, name, value))
        })
    }

    /// `org.freedesktop.DBus.Properties.Set`.
    pub async fn set_property(
        &self,
        destination: &str,
        path: &str,
        iface: &str,
        name: &str,
        value: Value,
    ) -> Result<(), BusError> {
        self.call(
            destination,
            path,
            PROPERTIES_IFACE,
            "Set",
            vec![
                Value::Str(iface.to_string()),
                Value::Str(name.to_string()),
                Value::variant(value),
            ],
        )
        .await
        .map(|_| ())
    }

    pub async fn managed_objects(&self, destination: &str) -> Result<Vec<ManagedObject>, BusError> {
        self.bounded(
            "GetManagedObjects",
            self.client.managed_objects(destination),
        )
        .await
    }

    pub async fn add_match(
        &self,
        rule: &MatchRule,
        capacity: usize,
    ) -> Result<Subscription, BusError> {
        self.bounded("AddMatch", self.client.add_match(rule, capacity))
            .await
    }

    pub async fn remove_match(&self, id: SubscriptionId) -> Result<(), BusError> {
        self.bounded("RemoveMatch", self.client.remove_match(id))
            .await
    }

    pub async fn export_agent(
        &self,
        path: &str,
        handler: Arc<dyn AgentHandler>,
    ) -> Result<(), BusError> {
        self.client.export_agent(path, handler).await
    }

    pub async fn unexport_agent(&self, path: &str) -> Result<(), BusError> {
        self.client.unexport_agent(path).await
    }

    pub async fn disconnect(&self) {
        self.client.disconnect().await
    }

    async fn bounded<T, F>(&self, method: &str, fut: F) -> Result<T, BusError>
    where
        F: Future<Output = Result<T, BusError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(BusError::Timeout {
                method: method.to_string(),
                after: self.timeout,
            }),
        }
    }
}
